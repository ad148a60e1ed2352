//! Wire-level data model: `Order`, the envelopes that carry it between
//! peers, and the heartbeat payload. Field names and shapes follow
//! `original_source/src/msgs/msgs.go`, translated into an internally-tagged
//! serde enum for the single-socket wire protocol (spec §6).

use serde::{Deserialize, Serialize};

pub type NodeId = String;
pub type OrderId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallType {
    HallUp,
    HallDown,
    Cab,
}

/// Immutable once created (§3): an order is identified by `order_id` alone,
/// minted by the node that placed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: OrderId,
    pub master_id: NodeId,
    pub floor: u32,
    pub call_type: CallType,
}

/// `{sender_id, receiver_id, order}`. `receiver_id` is `None` for
/// broadcast-targeted envelopes (placed, complete) and `Some` for directed
/// envelopes (take, all acks) — see §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderEnvelope {
    pub sender_id: NodeId,
    pub receiver_id: Option<NodeId>,
    pub order: Order,
}

impl OrderEnvelope {
    pub fn broadcast(sender_id: NodeId, order: Order) -> Self {
        Self {
            sender_id,
            receiver_id: None,
            order,
        }
    }

    pub fn directed(sender_id: NodeId, receiver_id: NodeId, order: Order) -> Self {
        Self {
            sender_id,
            receiver_id: Some(receiver_id),
            order,
        }
    }
}

/// Periodic liveness + work snapshot, broadcast by the presence
/// collaborator (§4.4) and fanned out to the order handler as `live-peers`
/// / `downed-peers` (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub sender_id: NodeId,
    pub elevator_status: ElevatorStatus,
    pub accepted_orders: Vec<Order>,
    pub chosen_elevator_for_orders: Vec<(OrderId, NodeId)>,
    pub taken_orders: Vec<Order>,
}

/// Opaque from this core's point of view — it is produced and consumed by
/// the elevator FSM collaborator (out of scope, §1), carried here only so it
/// can ride along inside a `Heartbeat`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElevatorStatus {
    pub floor: Option<u32>,
    pub direction: Direction,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    Idle,
    Up,
    Down,
}

/// One envelope per datagram, self-describing via the `kind` discriminator
/// (§4.5, §6). This is the only type that ever touches the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Message {
    Placed(OrderEnvelope),
    PlacedAck(OrderEnvelope),
    Take(OrderEnvelope),
    TakeAck(OrderEnvelope),
    Complete(OrderEnvelope),
    CompleteAck(OrderEnvelope),
    Heartbeat(Heartbeat),
}
