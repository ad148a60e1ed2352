//! Peer presence collaborator (§4.4): periodic heartbeat broadcast plus
//! liveness tracking, producing `PeerUpdate` events for the FSM driver.
//! Behavior inferred from `original_source/src/network/network.go`'s
//! `peerUpdateCh` handling, since the Go `peers` package itself wasn't kept
//! in the retrieval pack (§9's heartbeat-cadence open question); the
//! collaborator shape — a standalone task ticking on its own timer,
//! independent of the order table — follows the teacher's per-concern task
//! split (`worker::SpawnExecutor`'s own select loop, `net::session`'s own
//! read/write tasks).

use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use tracing::{debug, info};

use crate::{
    event::{OnEvent, SendEvent, Session, Timer},
    net::{Broadcast, Udp},
    order::{Heartbeat, Message, NodeId},
};

fn schedule_tick(session: &mut Session<Event>, period: Duration) -> anyhow::Result<()> {
    Timer::set_internal(session, period, Event::Tick)?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct PeerUpdate {
    pub live_peers: Vec<Heartbeat>,
    pub newly_joined: Vec<NodeId>,
    pub newly_lost: Vec<Heartbeat>,
}

#[derive(Debug, Clone)]
pub enum Event {
    /// Periodic snapshot from the local FSM collaborator (`local-status`,
    /// §6), cached and resent on every tick.
    LocalStatus(Heartbeat),
    /// A heartbeat envelope arrived from the network.
    Recv(Heartbeat),
    /// Self-rescheduling tick: broadcast the cached local heartbeat,
    /// re-evaluate liveness.
    Tick,
}

struct PeerEntry {
    last_seen: Instant,
    heartbeat: Heartbeat,
}

pub struct PeerPresence<U> {
    node_id: NodeId,
    heartbeat_period: Duration,
    heartbeat_timeout: Duration,
    broadcast_addr: Broadcast,
    net: U,
    local_heartbeat: Option<Heartbeat>,
    peers: FxHashMap<NodeId, PeerEntry>,
    live: Vec<NodeId>,
    update_sender: Box<dyn SendEvent<PeerUpdate> + Send>,
}

impl<U> PeerPresence<U> {
    pub fn new(
        node_id: NodeId,
        heartbeat_period: Duration,
        heartbeat_timeout: Duration,
        broadcast_addr: Broadcast,
        net: U,
        update_sender: impl SendEvent<PeerUpdate> + Send + 'static,
    ) -> Self {
        Self {
            node_id,
            heartbeat_period,
            heartbeat_timeout,
            broadcast_addr,
            net,
            local_heartbeat: None,
            peers: Default::default(),
            live: Default::default(),
            update_sender: Box::new(update_sender),
        }
    }

    pub async fn run(&mut self, session: &mut Session<Event>) -> anyhow::Result<()>
    where
        Self: OnEvent<Event>,
    {
        schedule_tick(session, self.heartbeat_period)?;
        loop {
            let event = session.recv().await?;
            self.on_event(event, session)?
        }
    }
}

impl<U: AsRef<Udp>> OnEvent<Event> for PeerPresence<U> {
    fn on_event(
        &mut self,
        event: Event,
        timer: &mut dyn Timer<Event>,
    ) -> anyhow::Result<()> {
        match event {
            Event::LocalStatus(heartbeat) => {
                self.local_heartbeat = Some(heartbeat);
                Ok(())
            }
            Event::Recv(heartbeat) => self.on_recv(heartbeat),
            Event::Tick => self.on_tick(timer),
        }
    }
}

impl<U: AsRef<Udp>> PeerPresence<U> {
    fn on_recv(&mut self, heartbeat: Heartbeat) -> anyhow::Result<()> {
        if heartbeat.sender_id == self.node_id {
            return Ok(()); // echo of our own broadcast
        }
        debug!(peer = %heartbeat.sender_id, "recv heartbeat");
        self.peers.insert(
            heartbeat.sender_id.clone(),
            PeerEntry {
                last_seen: Instant::now(),
                heartbeat,
            },
        );
        Ok(())
    }

    fn on_tick(&mut self, timer: &mut dyn Timer<Event>) -> anyhow::Result<()> {
        timer.set(self.heartbeat_period, Event::Tick)?;
        if let Some(heartbeat) = &self.local_heartbeat {
            self.net
                .as_ref()
                .send_broadcast(self.broadcast_addr, &Message::Heartbeat(heartbeat.clone()));
        }

        let now = Instant::now();
        let current_live: Vec<NodeId> = self
            .peers
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.last_seen) <= self.heartbeat_timeout)
            .map(|(id, _)| id.clone())
            .collect();

        let newly_joined: Vec<NodeId> = current_live
            .iter()
            .filter(|id| !self.live.contains(id))
            .cloned()
            .collect();
        let newly_lost_ids: Vec<NodeId> = self
            .live
            .iter()
            .filter(|id| !current_live.contains(id))
            .cloned()
            .collect();

        if newly_joined.is_empty() && newly_lost_ids.is_empty() {
            return Ok(());
        }

        let newly_lost: Vec<Heartbeat> = newly_lost_ids
            .iter()
            .filter_map(|id| self.peers.get(id).map(|entry| entry.heartbeat.clone()))
            .collect();
        for id in &newly_lost_ids {
            info!(peer = %id, "peer lost");
            self.peers.remove(id);
        }
        for id in &newly_joined {
            info!(peer = %id, "peer joined");
        }

        let live_peers = current_live
            .iter()
            .filter_map(|id| self.peers.get(id).map(|entry| entry.heartbeat.clone()))
            .collect();
        self.live = current_live;

        self.update_sender.send(PeerUpdate {
            live_peers,
            newly_joined,
            newly_lost,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Void;
    use crate::order::{Direction, ElevatorStatus};

    fn heartbeat(id: &str) -> Heartbeat {
        Heartbeat {
            sender_id: id.into(),
            elevator_status: ElevatorStatus {
                floor: Some(0),
                direction: Direction::Idle,
            },
            accepted_orders: vec![],
            chosen_elevator_for_orders: vec![],
            taken_orders: vec![],
        }
    }

    #[test]
    fn recv_from_self_is_ignored() {
        let mut presence = test_presence();
        presence.on_recv(heartbeat("a")).unwrap();
        assert!(presence.peers.is_empty());
    }

    #[test]
    fn recv_from_peer_is_recorded() {
        let mut presence = test_presence();
        presence.on_recv(heartbeat("b")).unwrap();
        assert!(presence.peers.contains_key("b"));
    }

    fn test_presence() -> PeerPresence<NoopUdp> {
        PeerPresence::new(
            "a".into(),
            Duration::from_millis(1),
            Duration::from_millis(1),
            Broadcast("127.0.0.1:0".parse().unwrap()),
            NoopUdp,
            Void,
        )
    }

    struct NoopUdp;
    impl AsRef<Udp> for NoopUdp {
        fn as_ref(&self) -> &Udp {
            unreachable!("tests in this module never send")
        }
    }
}
