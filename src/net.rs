//! Broadcast transport collaborator (§4.5): one UDP socket, six envelope
//! types plus heartbeat in and out, best-effort delivery. Grounded on the
//! teacher's `net::session::Udp` — an `Arc`-shared socket handle with a
//! fire-and-forget `send_to` and a blocking `recv_from` loop — generalized
//! from a generic payload buffer to this crate's single `order::Message`
//! wire type.

use std::{net::SocketAddr, sync::Arc};

use tokio::net::UdpSocket;
use tracing::warn;

use crate::order::Message;

/// The shared-port broadcast address every envelope — including directed
/// takes and acks — is actually sent to (§1). The wire medium has no unicast
/// path of its own; a directed envelope still goes out to this address and
/// is filtered by `receiver_id` on arrival, the same way the original
/// broadcast datagram is filtered by `sender_id` for echoes.
#[derive(Debug, Clone, Copy)]
pub struct Broadcast(pub SocketAddr);

#[derive(Debug, Clone)]
pub struct Udp(Arc<UdpSocket>);

impl AsRef<Udp> for Udp {
    fn as_ref(&self) -> &Udp {
        self
    }
}

impl Udp {
    pub async fn bind(bind_addr: SocketAddr) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.set_broadcast(true)?;
        Ok(Self(Arc::new(socket)))
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.0.local_addr()?)
    }

    /// Fire-and-forget send: a failed `send_to` is logged and never
    /// propagated to the FSM driver (§7, "collaborator channel slow" path —
    /// the broadcast medium is unreliable by design, so a local send failure
    /// is just another instance of loss the retransmit policy already
    /// covers).
    pub fn send(&self, dest: SocketAddr, message: &Message) {
        let buf = match serde_json::to_vec(message) {
            Ok(buf) => buf,
            Err(err) => {
                warn!("failed to encode outgoing message: {err}");
                return;
            }
        };
        let socket = self.0.clone();
        tokio::spawn(async move {
            if let Err(err) = socket.send_to(&buf, dest).await {
                warn!(">>> {dest} {err}");
            }
        });
    }

    pub fn send_broadcast(&self, dest: Broadcast, message: &Message) {
        self.send(dest.0, message)
    }

    /// Receive loop: decode failures are logged and dropped here, never
    /// reaching the driver (§7, "malformed envelope").
    pub async fn recv_session(
        &self,
        mut on_message: impl FnMut(Message) -> anyhow::Result<()>,
    ) -> anyhow::Result<()> {
        let mut buf = vec![0; 1 << 16];
        loop {
            let (len, from) = self.0.recv_from(&mut buf).await?;
            match serde_json::from_slice::<Message>(&buf[..len]) {
                Ok(message) => on_message(message)?,
                Err(err) => warn!("<<< {from} malformed envelope: {err}"),
            }
        }
    }
}
