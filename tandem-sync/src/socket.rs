//! Outbound seam between the engine and whatever transport hosts it.
//!
//! The server never speaks a wire protocol directly; each session holds
//! a [`SessionSocket`] and the hosting process adapts it to its
//! transport. Sends are fire-and-forget: outbound flow control is the
//! transport adapter's problem, and a dead peer must never stall the
//! engine.
//!
//! [`ChannelSocket`] is the in-process implementation used by tests,
//! demos, and same-process embedding.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::protocol::ServerMsg;

/// Close code for a normal session end.
pub const CLOSE_NORMAL: u16 = 1000;

/// Close code for a session superseded by a newer session speaking as
/// the same actor.
pub const CLOSE_KICKED: u16 = 4001;

/// Outbound half of one session.
pub trait SessionSocket: Send + Sync {
    /// Queue one message toward the peer. Never blocks, never fails;
    /// a dead transport logs and drops.
    fn send(&self, msg: ServerMsg);

    /// Tear the transport down with a close code and reason.
    fn close(&self, code: u16, reason: &str);
}

/// What a [`ChannelSocket`]'s receiver half observes.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    /// One server message.
    Message(ServerMsg),
    /// The session was closed from the server side.
    Closed {
        /// Close code (`CLOSE_NORMAL`, `CLOSE_KICKED`, or caller-chosen).
        code: u16,
        /// Human-readable close reason.
        reason: String,
    },
}

/// In-process [`SessionSocket`] over an unbounded channel.
pub struct ChannelSocket {
    tx: mpsc::UnboundedSender<SocketEvent>,
}

impl ChannelSocket {
    /// Build a socket and the receiver that observes it.
    pub fn pair() -> (Arc<Self>, mpsc::UnboundedReceiver<SocketEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl SessionSocket for ChannelSocket {
    fn send(&self, msg: ServerMsg) {
        if self.tx.send(SocketEvent::Message(msg)).is_err() {
            log::warn!("session receiver dropped; discarding outbound message");
        }
    }

    fn close(&self, code: u16, reason: &str) {
        // A receiver that already went away has nothing left to observe.
        let _ = self.tx.send(SocketEvent::Closed {
            code,
            reason: reason.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::OpId;

    #[tokio::test]
    async fn test_channel_socket_delivers_in_order() {
        let (socket, mut rx) = ChannelSocket::pair();
        socket.send(ServerMsg::first(1, "k", 0));
        socket.send(ServerMsg::empty_ack(0, OpId::new(1, 1)));
        socket.close(CLOSE_NORMAL, "done");

        assert_eq!(
            rx.recv().await,
            Some(SocketEvent::Message(ServerMsg::first(1, "k", 0)))
        );
        assert_eq!(
            rx.recv().await,
            Some(SocketEvent::Message(ServerMsg::empty_ack(0, OpId::new(1, 1))))
        );
        assert_eq!(
            rx.recv().await,
            Some(SocketEvent::Closed {
                code: CLOSE_NORMAL,
                reason: "done".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_send_after_receiver_drop_is_silent() {
        let (socket, rx) = ChannelSocket::pair();
        drop(rx);
        socket.send(ServerMsg::first(1, "k", 0));
        socket.close(CLOSE_NORMAL, "late");
    }
}
