//! The order FSM driver (§4.1–§4.3): owns the order table, applies every
//! transition in the state table, and runs the periodic sweep that drives
//! retransmission and give-up. Grounded on `original_source/src/commhandler/
//! commhandler.go`'s `handleEvents` select loop and its `checkAndRetransmit`
//! sweep, restructured around the teacher's `OnEvent`/`Timer`/`Session`
//! plumbing the way `lamport_mutex::Processor` is driven by its own session.

use std::time::{Duration, Instant};

use tracing::debug;

use crate::{
    config::Timing,
    event::{OnEvent, SendEvent, Session, Timer},
    net::{Broadcast, Udp},
    order::{Message, NodeId, Order, OrderEnvelope, OrderId},
    presence::PeerUpdate,
    table::{OrderState, OrderTable, StampedOrder},
};

/// Inbound event set: six envelope kinds off the wire, three local inputs
/// from the order handler (§6), peer liveness updates, and the driver's own
/// sweep tick.
#[derive(Debug, Clone)]
pub enum Event {
    PlaceLocal(Order),
    CompleteLocal(Order),
    DispatchTake(OrderEnvelope),
    RecvPlaced(OrderEnvelope),
    RecvPlacedAck(OrderEnvelope),
    RecvTake(OrderEnvelope),
    RecvTakeAck(OrderEnvelope),
    RecvComplete(OrderEnvelope),
    RecvCompleteAck(OrderEnvelope),
    PeerUpdate(PeerUpdate),
    SweepTick,
}

impl Event {
    /// Routes a decoded wire `Message` to the matching driver event; `None`
    /// for `Heartbeat`, which belongs to the presence collaborator instead
    /// (§4.5's socket is shared between the two).
    pub fn from_message(message: Message) -> Option<Self> {
        match message {
            Message::Placed(e) => Some(Event::RecvPlaced(e)),
            Message::PlacedAck(e) => Some(Event::RecvPlacedAck(e)),
            Message::Take(e) => Some(Event::RecvTake(e)),
            Message::TakeAck(e) => Some(Event::RecvTakeAck(e)),
            Message::Complete(e) => Some(Event::RecvComplete(e)),
            Message::CompleteAck(e) => Some(Event::RecvCompleteAck(e)),
            Message::Heartbeat(_) => None,
        }
    }
}

pub struct Driver<U> {
    node_id: NodeId,
    timing: Timing,
    net: U,
    broadcast_addr: Broadcast,
    table: OrderTable,
    safe_order: Box<dyn SendEvent<OrderEnvelope> + Send>,
    take_order_this: Box<dyn SendEvent<OrderEnvelope> + Send>,
    completed_by_peer: Box<dyn SendEvent<Order> + Send>,
    live_peers: Box<dyn SendEvent<Vec<crate::order::Heartbeat>> + Send>,
    downed_peers: Box<dyn SendEvent<Vec<crate::order::Heartbeat>> + Send>,
}

impl<U> Driver<U> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: NodeId,
        timing: Timing,
        net: U,
        broadcast_addr: Broadcast,
        safe_order: impl SendEvent<OrderEnvelope> + Send + 'static,
        take_order_this: impl SendEvent<OrderEnvelope> + Send + 'static,
        completed_by_peer: impl SendEvent<Order> + Send + 'static,
        live_peers: impl SendEvent<Vec<crate::order::Heartbeat>> + Send + 'static,
        downed_peers: impl SendEvent<Vec<crate::order::Heartbeat>> + Send + 'static,
    ) -> Self {
        Self {
            node_id,
            timing,
            net,
            broadcast_addr,
            table: OrderTable::new(),
            safe_order: Box::new(safe_order),
            take_order_this: Box::new(take_order_this),
            completed_by_peer: Box::new(completed_by_peer),
            live_peers: Box::new(live_peers),
            downed_peers: Box::new(downed_peers),
        }
    }

    pub async fn run(&mut self, session: &mut Session<Event>) -> anyhow::Result<()>
    where
        Self: OnEvent<Event>,
    {
        Timer::set_internal(session, self.timing.sweep_idle, Event::SweepTick)?;
        loop {
            let event = session.recv().await?;
            self.on_event(event, session)?
        }
    }

    /// Read-only introspection of a single record's state, for tests and
    /// operational tooling; the table itself stays private (§3: "only the
    /// FSM driver mutates the table").
    pub fn order_state(&self, order_id: OrderId) -> Option<OrderState> {
        self.table.lookup(order_id).map(|record| record.state)
    }
}

impl<U: AsRef<Udp>> OnEvent<Event> for Driver<U> {
    fn on_event(&mut self, event: Event, timer: &mut dyn Timer<Event>) -> anyhow::Result<()> {
        match event {
            Event::PlaceLocal(order) => self.on_place_local(order)?,
            Event::CompleteLocal(order) => self.on_complete_local(order)?,
            Event::DispatchTake(envelope) => self.on_dispatch_take(envelope)?,
            Event::RecvPlaced(e) => self.on_recv_placed(e)?,
            Event::RecvPlacedAck(e) => self.on_recv_placed_ack(e)?,
            Event::RecvTake(e) => self.on_recv_take(e)?,
            Event::RecvTakeAck(e) => self.on_recv_take_ack(e)?,
            Event::RecvComplete(e) => self.on_recv_complete(e)?,
            Event::RecvCompleteAck(e) => self.on_recv_complete_ack(e)?,
            Event::PeerUpdate(update) => self.on_peer_update(update)?,
            Event::SweepTick => {
                timer.set(self.timing.sweep_idle, Event::SweepTick)?;
            }
        }
        self.sweep()
    }
}

impl<U: AsRef<Udp>> Driver<U> {
    fn send_broadcast(&self, message: Message) {
        self.net.as_ref().send_broadcast(self.broadcast_addr, &message)
    }

    /// §4.1, local place: a re-press while still `AckwaitPlaced` bumps
    /// `placed_count` and resets the retransmit clock; a re-press of an
    /// order already past that state leaves the table untouched. Either way
    /// the placed envelope goes out again, matching `commhandler.go`'s
    /// unconditional send after the state check.
    fn on_place_local(&mut self, order: Order) -> anyhow::Result<()> {
        let now = Instant::now();
        let id = order.order_id;
        match self.table.lookup_mut(id) {
            Some(record) if record.state == OrderState::AckwaitPlaced => {
                record.placed_count += 1;
                record.timestamp = now;
                record.transmit_count = 1;
                debug!(order_id = id, placed_count = record.placed_count, "re-placed unacked order");
            }
            Some(_) => {
                debug!(order_id = id, "re-placed order already past ackwait-placed, table unchanged");
            }
            None => {
                self.table.insert_or_replace(
                    id,
                    StampedOrder::new(order.clone(), self.node_id.clone(), OrderState::AckwaitPlaced, now),
                );
            }
        }
        self.send_broadcast(Message::Placed(OrderEnvelope::broadcast(self.node_id.clone(), order)));
        Ok(())
    }

    fn on_complete_local(&mut self, order: Order) -> anyhow::Result<()> {
        let id = order.order_id;
        let Some(record) = self.table.lookup_mut(id) else {
            debug!(order_id = id, "completed unknown order, dropped");
            return Ok(());
        };
        let now = Instant::now();
        record.transition(OrderState::AckwaitComplete, now);
        self.send_broadcast(Message::Complete(OrderEnvelope::broadcast(self.node_id.clone(), order)));
        Ok(())
    }

    /// §4.1, broadcast-take: the order handler has picked peer `P` for a
    /// `Safe` order; the driver stamps `AckwaitTake` and sends a directed
    /// `Take` (filtered by `receiver_id` at every other party, §4.5).
    fn on_dispatch_take(&mut self, mut envelope: OrderEnvelope) -> anyhow::Result<()> {
        envelope.sender_id = self.node_id.clone();
        let id = envelope.order.order_id;
        let now = Instant::now();
        let mut record = StampedOrder::new(envelope.order.clone(), self.node_id.clone(), OrderState::AckwaitTake, now);
        record.receiver_id = envelope.receiver_id.clone();
        self.table.insert_or_replace(id, record);
        self.send_broadcast(Message::Take(envelope));
        Ok(())
    }

    /// §4.1: a remote placed envelope unconditionally (re)creates a `Safe`
    /// record and answers with a directed ack, even for an id already past
    /// `Safe` locally — matching `commhandler.go`'s unconditional
    /// `allOrders[...] = createStampedOrder(..., SAFE)` on every reception.
    fn on_recv_placed(&mut self, envelope: OrderEnvelope) -> anyhow::Result<()> {
        if envelope.sender_id == self.node_id {
            return Ok(()); // echo of our own broadcast
        }
        let id = envelope.order.order_id;
        let now = Instant::now();
        let mut record = StampedOrder::new(envelope.order.clone(), envelope.sender_id.clone(), OrderState::Safe, now);
        record.receiver_id = Some(self.node_id.clone());
        self.table.insert_or_replace(id, record);

        let ack = OrderEnvelope::directed(self.node_id.clone(), envelope.sender_id, envelope.order);
        self.send_broadcast(Message::PlacedAck(ack));
        Ok(())
    }

    fn on_recv_placed_ack(&mut self, envelope: OrderEnvelope) -> anyhow::Result<()> {
        if envelope.receiver_id.as_deref() != Some(self.node_id.as_str()) {
            return Ok(());
        }
        let id = envelope.order.order_id;
        let Some(record) = self.table.lookup_mut(id) else {
            debug!(order_id = id, "placed-ack for unknown order, discarded");
            return Ok(());
        };
        if record.state != OrderState::AckwaitPlaced {
            debug!(order_id = id, state = ?record.state, "placed-ack not awaiting place, discarded");
            return Ok(());
        }
        record.transition(OrderState::Safe, Instant::now());
        self.safe_order
            .send(OrderEnvelope::directed(self.node_id.clone(), self.node_id.clone(), envelope.order))
    }

    fn on_recv_take(&mut self, envelope: OrderEnvelope) -> anyhow::Result<()> {
        if envelope.receiver_id.as_deref() != Some(self.node_id.as_str()) {
            return Ok(());
        }
        let id = envelope.order.order_id;
        let now = Instant::now();
        let mut record = StampedOrder::new(envelope.order.clone(), envelope.sender_id.clone(), OrderState::Serving, now);
        record.receiver_id = Some(self.node_id.clone());
        self.table.insert_or_replace(id, record);

        self.take_order_this.send(OrderEnvelope::directed(
            envelope.sender_id.clone(),
            self.node_id.clone(),
            envelope.order.clone(),
        ))?;
        let ack = OrderEnvelope::directed(self.node_id.clone(), envelope.sender_id, envelope.order);
        self.send_broadcast(Message::TakeAck(ack));
        Ok(())
    }

    /// Open question (a): a take-ack only transitions an order that is
    /// still `AckwaitTake`; anything else (already `Serving` from a prior
    /// duplicate ack, or unknown) is discarded.
    fn on_recv_take_ack(&mut self, envelope: OrderEnvelope) -> anyhow::Result<()> {
        if envelope.receiver_id.as_deref() != Some(self.node_id.as_str()) {
            return Ok(());
        }
        let id = envelope.order.order_id;
        let Some(record) = self.table.lookup_mut(id) else {
            return Ok(());
        };
        if record.state != OrderState::AckwaitTake {
            debug!(order_id = id, state = ?record.state, "take-ack not awaiting take, discarded");
            return Ok(());
        }
        record.transition(OrderState::Serving, Instant::now());
        Ok(())
    }

    fn on_recv_complete(&mut self, envelope: OrderEnvelope) -> anyhow::Result<()> {
        if envelope.sender_id == self.node_id {
            return Ok(()); // echo
        }
        let ack = OrderEnvelope::directed(self.node_id.clone(), envelope.sender_id.clone(), envelope.order.clone());
        self.send_broadcast(Message::CompleteAck(ack));
        self.completed_by_peer.send(envelope.order.clone())?;
        self.table.delete(envelope.order.order_id);
        Ok(())
    }

    fn on_recv_complete_ack(&mut self, envelope: OrderEnvelope) -> anyhow::Result<()> {
        if envelope.sender_id == self.node_id {
            return Ok(());
        }
        self.table.delete(envelope.order.order_id);
        Ok(())
    }

    fn on_peer_update(&mut self, update: PeerUpdate) -> anyhow::Result<()> {
        if !update.newly_lost.is_empty() {
            self.downed_peers.send(update.newly_lost)?;
        }
        self.live_peers.send(update.live_peers)
    }

    pub fn sweep(&mut self) -> anyhow::Result<()> {
        self.sweep_at(Instant::now())
    }

    /// §4.3's three-step sweep, run over every order once with the same
    /// `now`. Split out from `sweep` so tests can drive it deterministically
    /// against a fixed clock instead of the real one.
    fn sweep_at(&mut self, now: Instant) -> anyhow::Result<()> {
        let ids = self.table.ids();
        for id in ids {
            self.sweep_one(id, now)?;
        }
        Ok(())
    }

    fn sweep_one(&mut self, id: OrderId, now: Instant) -> anyhow::Result<()> {
        let node_id = self.node_id.clone();
        let timing = self.timing;
        let mut retransmit = None;
        let mut escalate_safe = None;
        let mut escalate_take_this = None;
        let mut delete = false;

        if let Some(record) = self.table.lookup_mut(id) {
            let effects = apply_retransmit_or_giveup(record, &timing, now, &node_id);
            retransmit = effects.retransmit;
            escalate_safe = effects.escalate_safe;
            escalate_take_this = effects.escalate_take_this;

            if record.state == OrderState::AckwaitPlaced {
                let place_again = timing.place_again_increment * record.placed_count;
                if now.duration_since(record.timestamp) > place_again {
                    delete = true;
                }
            }

            if !delete {
                if let Some(order) = apply_other_giveup(record, &timing, now) {
                    escalate_take_this = Some(order);
                }
            }
        } else {
            return Ok(());
        }

        if delete {
            self.table.delete(id);
            debug!(order_id = id, "dropped unacknowledged placed order past give-up window");
            return Ok(());
        }

        if let Some((state, envelope)) = retransmit {
            self.send_broadcast(message_for_retransmit(state, envelope));
        }
        if let Some(order) = escalate_safe {
            self.safe_order
                .send(OrderEnvelope::directed(node_id.clone(), node_id.clone(), order))?;
        }
        if let Some(order) = escalate_take_this {
            self.take_order_this
                .send(OrderEnvelope::directed(node_id.clone(), node_id, order))?;
        }
        Ok(())
    }
}

#[derive(Default)]
struct SweepEffects {
    retransmit: Option<(OrderState, OrderEnvelope)>,
    escalate_safe: Option<Order>,
    escalate_take_this: Option<Order>,
}

fn apply_retransmit_or_giveup(
    record: &mut StampedOrder,
    timing: &Timing,
    now: Instant,
    node_id: &NodeId,
) -> SweepEffects {
    let mut effects = SweepEffects::default();
    if !record.state.retransmits() {
        return effects;
    }
    let due = record.timestamp + timing.ackwait_timeout * record.transmit_count;
    if now <= due {
        return effects;
    }

    if record.transmit_count <= timing.retransmit_max {
        record.transmit_count += 1;
        let envelope = match record.state {
            OrderState::AckwaitPlaced => OrderEnvelope::broadcast(node_id.clone(), record.order.clone()),
            OrderState::AckwaitTake => OrderEnvelope::directed(
                node_id.clone(),
                record.receiver_id.clone().unwrap_or_else(|| node_id.clone()),
                record.order.clone(),
            ),
            OrderState::AckwaitComplete => OrderEnvelope::broadcast(node_id.clone(), record.order.clone()),
            OrderState::Safe | OrderState::Serving => unreachable!("retransmits() guards these out"),
        };
        effects.retransmit = Some((record.state, envelope));
        return effects;
    }

    match record.state {
        OrderState::AckwaitPlaced => {
            if record.placed_count >= timing.place_giveup_tries {
                let order = record.order.clone();
                record.transition(OrderState::Serving, now);
                effects.escalate_safe = Some(order);
            }
        }
        OrderState::AckwaitTake => {
            let order = record.order.clone();
            record.transition(OrderState::Serving, now);
            effects.escalate_take_this = Some(order);
        }
        // no give-up action for a retransmit-exhausted AckwaitComplete: the
        // original switch has no case for it either. OTHER_GIVEUP reclaims
        // it eventually.
        OrderState::AckwaitComplete => {}
        OrderState::Safe | OrderState::Serving => {}
    }
    effects
}

/// §4.3's per-order safety net: any order stuck in `AckwaitTake`, `Serving`
/// or `AckwaitComplete` (open question (b) excludes `Safe`, and
/// `AckwaitPlaced` already has its own place-again/give-up path above) for
/// longer than `other_giveup` is forced back to `Serving` and re-announced
/// locally.
fn apply_other_giveup(record: &mut StampedOrder, timing: &Timing, now: Instant) -> Option<Order> {
    if !matches!(
        record.state,
        OrderState::AckwaitTake | OrderState::Serving | OrderState::AckwaitComplete
    ) {
        return None;
    }
    if now.duration_since(record.timestamp) <= timing.other_giveup {
        return None;
    }
    let order = record.order.clone();
    record.transition(OrderState::Serving, now);
    Some(order)
}

fn message_for_retransmit(state: OrderState, envelope: OrderEnvelope) -> Message {
    match state {
        OrderState::AckwaitPlaced => Message::Placed(envelope),
        OrderState::AckwaitTake => Message::Take(envelope),
        OrderState::AckwaitComplete => Message::Complete(envelope),
        OrderState::Safe | OrderState::Serving => unreachable!("retransmits() guards these out"),
    }
}
