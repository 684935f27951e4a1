//! Server-initiated pushes to every live session.

use tracing::debug;

use ruflet_core::Value;
use ruflet_core::protocol::{Action, Message};

use crate::state::ServerState;

/// Queue `[action, payload]` on every tracked connection.
///
/// The connection table is snapshotted under its lock and the sends happen
/// outside it. Returns how many connections accepted the message.
pub fn broadcast(state: &ServerState, action: Action, payload: Value) -> usize {
    let connections = state.snapshot_connections();
    let mut sent = 0;
    for conn in &connections {
        let message = Message::new(action, payload.clone());
        if conn.outbox.send(message).is_ok() {
            sent += 1;
        } else {
            debug!(conn = %conn.conn_key, "Broadcast to closed connection skipped");
        }
    }
    sent
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::state::{ConnectionState, make_app};
    use ruflet_core::config::Config;

    fn conn(key: &str) -> (ConnectionState, mpsc::UnboundedReceiver<Message>) {
        let (outbox, rx) = mpsc::unbounded_channel();
        let conn = ConnectionState {
            conn_key: key.into(),
            outbox,
            cancel: CancellationToken::new(),
        };
        (conn, rx)
    }

    #[tokio::test]
    async fn test_broadcast_counts_live_connections() {
        let state = ServerState::new(Arc::new(Config::default()), make_app(|_| Ok(())));
        let (a, mut rx_a) = conn("a");
        let (b, rx_b) = conn("b");
        state.add_connection(a);
        state.add_connection(b);
        drop(rx_b);

        let sent = broadcast(&state, Action::PatchControl, Value::map());
        assert_eq!(sent, 1);
        let msg = rx_a.try_recv().unwrap();
        assert_eq!(msg.action, Action::PatchControl);
    }

    #[tokio::test]
    async fn test_broadcast_without_connections() {
        let state = ServerState::new(Arc::new(Config::default()), make_app(|_| Ok(())));
        assert_eq!(broadcast(&state, Action::PatchControl, Value::Nil), 0);
    }
}
