//! `Config`/`Timing` (the constants of §4.1, made overridable) and the CLI
//! surface of §6, parsed with `clap`'s derive API — the idiomatic choice for
//! a handful of flags, used the same way across the retrieval pack (e.g.
//! `maidsafe-temp_safe_network`'s `sn_cli`/`safenode`/`sn_node`).

use std::time::Duration;

use clap::Parser;

use crate::order::NodeId;

/// All wall-clock constants from §4.1, exposed so integration tests can
/// shrink them (SPEC_FULL §2, "Test tooling").
#[derive(Debug, Clone, Copy)]
pub struct Timing {
    pub ackwait_timeout: Duration,
    pub retransmit_max: u32,
    pub place_again_increment: Duration,
    pub place_giveup_tries: u32,
    pub other_giveup: Duration,
    pub sweep_idle: Duration,
    pub heartbeat_period: Duration,
    pub heartbeat_timeout: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            ackwait_timeout: Duration::from_secs(2),
            retransmit_max: 5,
            place_again_increment: Duration::from_secs(10),
            place_giveup_tries: 3,
            other_giveup: Duration::from_secs(40),
            sweep_idle: Duration::from_secs(10),
            heartbeat_period: Duration::from_millis(500),
            heartbeat_timeout: Duration::from_millis(2500),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub node_id: NodeId,
    /// host:port of the elevator hardware server; opaque to this core,
    /// carried only so the host binary can wire up the (out-of-scope)
    /// elevator FSM collaborator.
    pub elevator_addr: String,
    pub broadcast_port: u16,
    pub timing: Timing,
}

/// CLI surface of the host process (§6): `--id` required, `--addr` for the
/// elevator hardware server, `--bport` for the broadcast port.
#[derive(Debug, Parser)]
#[command(name = "elevator-node", about = "Distributed elevator order coordinator")]
pub struct Cli {
    /// Identifier for this node.
    #[arg(long)]
    pub id: Option<String>,

    /// host:port for the elevator hardware server.
    #[arg(long, default_value = "localhost:15657")]
    pub addr: String,

    /// UDP port shared by all peers for broadcast traffic.
    #[arg(long, default_value_t = 20010)]
    pub bport: u16,
}

impl Cli {
    /// §6: "Exit 1 on missing id." — the caller maps this `Err` to
    /// `std::process::exit(1)`; the core itself never calls `exit`.
    pub fn into_config(self) -> anyhow::Result<Config> {
        let node_id = self.id.ok_or_else(|| anyhow::anyhow!("missing required --id"))?;
        Ok(Config {
            node_id,
            elevator_addr: self.addr,
            broadcast_port: self.bport,
            timing: Timing::default(),
        })
    }
}
