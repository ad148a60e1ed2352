//! Host wiring: binds the shared UDP socket, builds the FSM driver and the
//! peer-presence collaborator, and spawns the three long-lived tasks behind
//! a startup rendezvous (§5). Mirrors the shape of the teacher's
//! `bin/boson_mutex` session wiring — sessions built up front, tasks spawned
//! last, `anyhow::Result` joined at the end — generalized from the teacher's
//! single dispatch+processor pair to this crate's driver/transport/presence
//! trio.

use std::sync::Arc;

use tokio::sync::{
    mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    Barrier,
};
use tracing::info;

use crate::{
    config::Config,
    driver::{self, Driver},
    event::{SendEvent, Session},
    net::{Broadcast, Udp},
    order::{Heartbeat, Message, Order, OrderEnvelope},
    presence::{self, PeerPresence, PeerUpdate},
};

/// The collaborator-facing channel surface of §6: inbound senders the order
/// handler / elevator FSM drives, outbound receivers it polls.
pub struct Handles {
    pub placed_by_local: UnboundedSender<Order>,
    pub broadcast_take: UnboundedSender<OrderEnvelope>,
    pub completed_by_local: UnboundedSender<Order>,
    pub local_status: UnboundedSender<Heartbeat>,

    pub safe_order: UnboundedReceiver<OrderEnvelope>,
    pub take_order_this: UnboundedReceiver<OrderEnvelope>,
    pub completed_by_peer: UnboundedReceiver<Order>,
    pub live_peers: UnboundedReceiver<Vec<Heartbeat>>,
    pub downed_peers: UnboundedReceiver<Vec<Heartbeat>>,
}

/// Adapts a peer-update into the driver's event type; the driver and the
/// presence collaborator have distinct event enums, so a `PeerUpdate` can't
/// reach the driver through the identity `SendEvent` impls alone.
struct PeerUpdateSink(crate::event::SessionSender<driver::Event>);

impl SendEvent<PeerUpdate> for PeerUpdateSink {
    fn send(&mut self, update: PeerUpdate) -> anyhow::Result<()> {
        self.0.send(driver::Event::PeerUpdate(update))
    }
}

/// Binds the broadcast socket, builds every collaborator, and spawns the
/// three rendezvous-synchronised tasks plus the thin forwarding tasks that
/// translate collaborator-facing mpsc channels into driver/presence events.
/// Returns immediately once the tasks are spawned; task failures surface
/// only as closed channels on the returned `Handles` (the tasks themselves
/// are not joined here, matching §5's "termination is process-wide").
pub async fn spawn(config: Config) -> anyhow::Result<Handles> {
    let bind_addr = format!("0.0.0.0:{}", config.broadcast_port).parse()?;
    let broadcast_addr = Broadcast(format!("255.255.255.255:{}", config.broadcast_port).parse()?);
    let net = Udp::bind(bind_addr).await?;
    info!(node_id = %config.node_id, addr = %net.local_addr()?, "bound broadcast socket");

    let (placed_tx, mut placed_rx) = unbounded_channel::<Order>();
    let (take_tx, mut take_rx) = unbounded_channel::<OrderEnvelope>();
    let (completed_tx, mut completed_rx) = unbounded_channel::<Order>();
    let (status_tx, mut status_rx) = unbounded_channel::<Heartbeat>();

    let (safe_order_tx, safe_order_rx) = unbounded_channel::<OrderEnvelope>();
    let (take_order_this_tx, take_order_this_rx) = unbounded_channel::<OrderEnvelope>();
    let (completed_by_peer_tx, completed_by_peer_rx) = unbounded_channel::<Order>();
    let (live_peers_tx, live_peers_rx) = unbounded_channel::<Vec<Heartbeat>>();
    let (downed_peers_tx, downed_peers_rx) = unbounded_channel::<Vec<Heartbeat>>();

    let mut driver_session = Session::<driver::Event>::new();
    let mut presence_session = Session::<presence::Event>::new();

    // grab every sender clone the forwarding/transport tasks need before the
    // sessions themselves are moved into their owning tasks below
    let driver_sender_for_presence = driver_session.sender();
    let driver_sender_for_transport = driver_session.sender();
    let driver_sender_for_placed = driver_session.sender();
    let driver_sender_for_take = driver_session.sender();
    let driver_sender_for_completed = driver_session.sender();
    let presence_sender_for_transport = presence_session.sender();
    let presence_sender_for_status = presence_session.sender();

    let mut driver = Driver::new(
        config.node_id.clone(),
        config.timing,
        net.clone(),
        broadcast_addr,
        safe_order_tx,
        take_order_this_tx,
        completed_by_peer_tx,
        live_peers_tx,
        downed_peers_tx,
    );
    let mut presence = PeerPresence::new(
        config.node_id.clone(),
        config.timing.heartbeat_period,
        config.timing.heartbeat_timeout,
        broadcast_addr,
        net.clone(),
        PeerUpdateSink(driver_sender_for_presence),
    );

    let barrier = Arc::new(Barrier::new(3));

    {
        let barrier = barrier.clone();
        tokio::spawn(async move {
            barrier.wait().await;
            driver.run(&mut driver_session).await
        });
    }
    {
        let barrier = barrier.clone();
        tokio::spawn(async move {
            barrier.wait().await;
            presence.run(&mut presence_session).await
        });
    }
    {
        let net = net.clone();
        let mut driver_sender = driver_sender_for_transport;
        let mut presence_sender = presence_sender_for_transport;
        let barrier = barrier.clone();
        tokio::spawn(async move {
            barrier.wait().await;
            net.recv_session(move |message| match message {
                Message::Heartbeat(heartbeat) => presence_sender.send(presence::Event::Recv(heartbeat)),
                other => match driver::Event::from_message(other) {
                    Some(event) => driver_sender.send(event),
                    None => Ok(()),
                },
            })
            .await
        });
    }

    {
        let mut sender = driver_sender_for_placed;
        tokio::spawn(async move {
            while let Some(order) = placed_rx.recv().await {
                if sender.send(driver::Event::PlaceLocal(order)).is_err() {
                    break;
                }
            }
        });
    }
    {
        let mut sender = driver_sender_for_take;
        tokio::spawn(async move {
            while let Some(envelope) = take_rx.recv().await {
                if sender.send(driver::Event::DispatchTake(envelope)).is_err() {
                    break;
                }
            }
        });
    }
    {
        let mut sender = driver_sender_for_completed;
        tokio::spawn(async move {
            while let Some(order) = completed_rx.recv().await {
                if sender.send(driver::Event::CompleteLocal(order)).is_err() {
                    break;
                }
            }
        });
    }
    {
        let mut sender = presence_sender_for_status;
        tokio::spawn(async move {
            while let Some(heartbeat) = status_rx.recv().await {
                if sender.send(presence::Event::LocalStatus(heartbeat)).is_err() {
                    break;
                }
            }
        });
    }

    Ok(Handles {
        placed_by_local: placed_tx,
        broadcast_take: take_tx,
        completed_by_local: completed_tx,
        local_status: status_tx,
        safe_order: safe_order_rx,
        take_order_this: take_order_this_rx,
        completed_by_peer: completed_by_peer_rx,
        live_peers: live_peers_rx,
        downed_peers: downed_peers_rx,
    })
}
