//! The order table: a keyed store of per-order stamped records (§3.2).
//! Single-owner by construction — only the FSM driver ever holds a `&mut
//! OrderTable`, mirroring the teacher's single-owner maps (e.g.
//! `lamport_mutex::Processor::latests`) and `commhandler.go`'s `allOrders`.

use std::time::Instant;

use rustc_hash::FxHashMap;

use crate::order::{NodeId, Order, OrderId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderState {
    AckwaitPlaced,
    Safe,
    AckwaitTake,
    Serving,
    AckwaitComplete,
}

impl OrderState {
    /// §4.1: Safe and Serving have no retransmission; the other three do.
    pub fn retransmits(self) -> bool {
        matches!(
            self,
            OrderState::AckwaitPlaced | OrderState::AckwaitTake | OrderState::AckwaitComplete
        )
    }
}

#[derive(Debug, Clone)]
pub struct StampedOrder {
    pub order: Order,
    pub sender_id: NodeId,
    pub receiver_id: Option<NodeId>,
    pub state: OrderState,
    pub timestamp: Instant,
    pub transmit_count: u32,
    pub placed_count: u32,
}

impl StampedOrder {
    pub fn new(order: Order, sender_id: NodeId, state: OrderState, now: Instant) -> Self {
        Self {
            order,
            sender_id,
            receiver_id: None,
            state,
            timestamp: now,
            transmit_count: 1,
            placed_count: 1,
        }
    }

    /// Invariant (§3): `transmit_count` resets to 1 and `timestamp` becomes
    /// `now` on every state change.
    pub fn transition(&mut self, state: OrderState, now: Instant) {
        self.state = state;
        self.timestamp = now;
        self.transmit_count = 1;
    }
}

/// `insert_or_replace`, `lookup`, `delete`, `for_each` — §4.2. Backed by
/// `FxHashMap` the way the teacher reaches for `rustc-hash` on hot-path maps;
/// `order_id` is a plain integer key with no adversarial-input concern here.
#[derive(Debug, Default)]
pub struct OrderTable {
    orders: FxHashMap<OrderId, StampedOrder>,
}

impl OrderTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_or_replace(&mut self, order_id: OrderId, record: StampedOrder) {
        self.orders.insert(order_id, record);
    }

    pub fn lookup(&self, order_id: OrderId) -> Option<&StampedOrder> {
        self.orders.get(&order_id)
    }

    pub fn lookup_mut(&mut self, order_id: OrderId) -> Option<&mut StampedOrder> {
        self.orders.get_mut(&order_id)
    }

    pub fn delete(&mut self, order_id: OrderId) -> Option<StampedOrder> {
        self.orders.remove(&order_id)
    }

    pub fn for_each(&self, mut f: impl FnMut(OrderId, &StampedOrder)) {
        for (id, record) in &self.orders {
            f(*id, record)
        }
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    /// All ids currently in the table, snapshotted so a caller can mutate
    /// or delete records while iterating the logical contents.
    pub fn ids(&self) -> Vec<OrderId> {
        self.orders.keys().copied().collect()
    }
}
