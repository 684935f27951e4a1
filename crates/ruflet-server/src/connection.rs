//! Connection lifecycle: handshake, read loop, message dispatch, cleanup.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use ruflet_core::Page;
use ruflet_core::error::{Result, RufletError};
use ruflet_core::page::Outbox;
use ruflet_core::protocol::{
    self, Action, ControlEvent, ControlUpdate, Message, RegisterRequest,
};

use crate::frame::{self, FrameReader, FrameWriter};
use crate::state::{ConnectionState, ServerState};

/// How long queued messages may take to drain after the read loop ends.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Serve one accepted stream until the client leaves or the server stops.
///
/// A failed handshake drops the stream without a response.
pub async fn handle_connection<S>(state: Arc<ServerState>, stream: S, peer: String)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut reader = BufReader::new(stream);
    let request = match frame::read_upgrade_request(&mut reader).await {
        Ok(request) => request,
        Err(e) => {
            warn!(peer = %peer, error = %e, "Handshake failed");
            return;
        }
    };
    let key = match request.validate(&state.config.ws_path()) {
        Ok(key) => key.to_string(),
        Err(e) => {
            warn!(peer = %peer, error = %e, "Handshake rejected");
            return;
        }
    };
    if let Err(e) = frame::write_upgrade_response(reader.get_mut(), &key).await {
        warn!(peer = %peer, error = %e, "Failed to write handshake response");
        return;
    }

    let conn_key = Uuid::new_v4().to_string();
    info!(conn = %conn_key, peer = %peer, "New WebSocket connection");

    let (read_half, write_half) = tokio::io::split(reader);
    let writer = Arc::new(FrameWriter::new(write_half));
    let mut frames = FrameReader::new(read_half);
    let cancel = state.shutdown_token().child_token();
    let (outbox, mut outbox_rx) = mpsc::unbounded_channel::<Message>();

    state.add_connection(ConnectionState {
        conn_key: conn_key.clone(),
        outbox: outbox.clone(),
        cancel: cancel.clone(),
    });

    // Drain the outbox in order; this is the only place application messages are written.
    let send_writer = writer.clone();
    let send_cancel = cancel.clone();
    let send_task = tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                biased;
                message = outbox_rx.recv() => message,
                _ = send_cancel.cancelled() => None,
            };
            let Some(message) = message else { break };
            if let Err(e) = send_writer.send_binary(&message.encode()).await {
                debug!(error = %e, "Send failed, stopping writer");
                break;
            }
        }
    });

    if let Err(e) = read_loop(&state, &conn_key, &mut frames, &writer, &outbox, &cancel).await {
        if e.is_codec() {
            warn!(conn = %conn_key, error = %e, "Undecodable message, closing connection");
        } else {
            warn!(conn = %conn_key, error = %e, "Session crashed");
        }
        let _ = outbox.send(protocol::session_crashed(&e.to_string()));
    }

    cleanup_connection(&state, &conn_key);
    drop(outbox);
    finish_send_task(send_task, &cancel).await;
    writer.close().await;
}

/// Let queued messages drain, unless the connection is cancelled or the
/// peer stops reading. An aborted write releases the writer lock.
async fn finish_send_task(mut send_task: JoinHandle<()>, cancel: &CancellationToken) {
    tokio::select! {
        _ = &mut send_task => return,
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(DRAIN_TIMEOUT) => debug!("Outbox drain timed out"),
    }
    send_task.abort();
    let _ = send_task.await;
}

async fn read_loop<R>(
    state: &ServerState,
    conn_key: &str,
    frames: &mut FrameReader<R>,
    writer: &FrameWriter,
    outbox: &Outbox,
    cancel: &CancellationToken,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    loop {
        let payload = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            payload = frames.read_message(writer) => payload?,
        };
        let Some(payload) = payload else {
            return Ok(());
        };
        let message = Message::decode(&payload)?;
        debug!(conn = %conn_key, action = ?message.action, "Incoming message");
        handle_message(state, conn_key, outbox, message)?;
    }
}

/// Route one decoded message. Handlers run synchronously on the worker.
pub fn handle_message(
    state: &ServerState,
    conn_key: &str,
    outbox: &Outbox,
    message: Message,
) -> Result<()> {
    match message.action {
        Action::RegisterClient => on_register_client(state, conn_key, outbox, &message.payload),
        Action::ControlEvent => {
            let Some(event) = ControlEvent::from_payload(&message.payload) else {
                debug!(conn = %conn_key, "Control event without target or name ignored");
                return Ok(());
            };
            let page = fetch_page(state, conn_key)?;
            let mut page = page.lock().unwrap_or_else(|e| e.into_inner());
            page.dispatch_event(&event.target, &event.name, event.data)
                .map_err(|e| RufletError::Handler(format!("{e:#}")))
        }
        Action::UpdateControl => {
            let Some(update) = ControlUpdate::from_payload(&message.payload) else {
                return Ok(());
            };
            let page = fetch_page(state, conn_key)?;
            let mut page = page.lock().unwrap_or_else(|e| e.into_inner());
            page.apply_client_update(&update.id, update.props);
            Ok(())
        }
        other => Err(RufletError::UnknownAction(format!("{other:?}"))),
    }
}

fn on_register_client(
    state: &ServerState,
    conn_key: &str,
    outbox: &Outbox,
    payload: &ruflet_core::Value,
) -> Result<()> {
    let request = RegisterRequest::from_payload(payload);
    let session_id = request
        .session_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let mut page = Page::new(session_id.clone(), request.details(), outbox.clone())
        .with_icons(state.icons().clone());
    page.set_title(state.config.app_title());

    let page = Arc::new(Mutex::new(page));
    state.set_session(conn_key, page.clone());

    let _ = outbox.send(protocol::register_response(&session_id));
    info!(conn = %conn_key, session_id = %session_id, page_name = %request.page_name, "Session registered");

    let mut page = page.lock().unwrap_or_else(|e| e.into_inner());
    (state.app())(&mut *page).map_err(|e| RufletError::Handler(format!("{e:#}")))?;
    page.refresh();
    Ok(())
}

fn fetch_page(state: &ServerState, conn_key: &str) -> Result<Arc<Mutex<Page>>> {
    state
        .session(conn_key)
        .ok_or_else(|| RufletError::Protocol("Session not found".into()))
}

/// Remove a connection and its session from the shared tables.
fn cleanup_connection(state: &ServerState, conn_key: &str) {
    state.remove_connection(conn_key);
    info!(conn = %conn_key, "WebSocket connection closed");
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use ruflet_core::config::Config;
    use ruflet_core::props::IconLookup;
    use ruflet_core::{Control, Value, value_map};

    use crate::frame::apply_mask;
    use crate::state::make_app;

    const UPGRADE: &[u8] = b"GET /ws HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n";

    /// Masked binary client frame for a short payload.
    fn client_frame(payload: &[u8]) -> Vec<u8> {
        assert!(payload.len() < 126);
        let key = [0x11, 0x22, 0x33, 0x44];
        let mut out = vec![0x82, 0x80 | payload.len() as u8];
        out.extend_from_slice(&key);
        let mut body = payload.to_vec();
        apply_mask(&mut body, key);
        out.extend_from_slice(&body);
        out
    }

    struct MaterialIcons;

    impl IconLookup for MaterialIcons {
        fn codepoint_for(&self, name: &str) -> Option<i64> {
            (name == "add").then_some(0xe145)
        }
    }

    fn test_state() -> ServerState {
        ServerState::new(
            Arc::new(Config::default()),
            make_app(|page| {
                let button = Control::new("button").with_id("go").on("click", |page, _| {
                    page.update("status", [("value", "clicked")]);
                    Ok(())
                });
                let broken = Control::new("button")
                    .with_id("broken")
                    .on("click", |_, _| anyhow::bail!("handler failed"));
                page.add(vec![Control::new("text").with_id("status"), button, broken]);
                Ok(())
            }),
        )
    }

    fn register(state: &ServerState, outbox: &Outbox, session_id: Value) {
        let msg = Message::new(
            Action::RegisterClient,
            value_map! {"session_id" => session_id, "page_name" => "", "page" => value_map! {"route" => "/"}},
        );
        handle_message(state, "c1", outbox, msg).unwrap();
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn test_register_generates_session_id() {
        let state = test_state();
        let (outbox, mut rx) = mpsc::unbounded_channel();
        register(&state, &outbox, Value::Nil);

        let msgs = drain(&mut rx);
        assert_eq!(msgs[0].action, Action::RegisterClient);
        let session_id = msgs[0].payload.get("session_id").and_then(Value::as_str).unwrap();
        assert!(!session_id.is_empty());
        assert_eq!(msgs[0].payload.get("page_patch"), Some(&Value::map()));
        assert!(msgs[1..].iter().all(|m| m.action == Action::PatchControl));
        assert!(state.session("c1").is_some());
    }

    #[test]
    fn test_register_keeps_client_session_id() {
        let state = test_state();
        let (outbox, mut rx) = mpsc::unbounded_channel();
        register(&state, &outbox, Value::from("abc"));
        let msgs = drain(&mut rx);
        assert_eq!(msgs[0].payload.get("session_id"), Some(&Value::from("abc")));
        let page = state.session("c1").unwrap();
        assert_eq!(page.lock().unwrap().title(), Some("Ruflet App"));
    }

    #[test]
    fn test_control_event_routes_to_handler() {
        let state = test_state();
        let (outbox, mut rx) = mpsc::unbounded_channel();
        register(&state, &outbox, Value::Nil);
        drain(&mut rx);

        let button_id = {
            let page = state.session("c1").unwrap();
            let page = page.lock().unwrap();
            page.control("go").unwrap().wire_id().unwrap()
        };
        let msg = Message::new(
            Action::ControlEvent,
            value_map! {"target" => button_id, "name" => "click", "data" => Value::Nil},
        );
        handle_message(&state, "c1", &outbox, msg).unwrap();
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn test_handler_error_surfaces() {
        let state = test_state();
        let (outbox, _rx) = mpsc::unbounded_channel();
        register(&state, &outbox, Value::Nil);
        let msg = Message::new(
            Action::ControlEvent,
            value_map! {"target" => "broken", "name" => "click"},
        );
        let err = handle_message(&state, "c1", &outbox, msg).unwrap_err();
        assert!(matches!(err, RufletError::Handler(ref m) if m == "handler failed"));
    }

    #[test]
    fn test_event_before_register_is_error() {
        let state = test_state();
        let (outbox, _rx) = mpsc::unbounded_channel();
        let msg = Message::new(Action::ControlEvent, value_map! {"target" => 100, "name" => "click"});
        assert!(handle_message(&state, "c1", &outbox, msg).is_err());
    }

    #[test]
    fn test_outbound_actions_rejected_inbound() {
        let state = test_state();
        let (outbox, _rx) = mpsc::unbounded_channel();
        let msg = Message::new(Action::InvokeControlMethod, Value::map());
        assert!(matches!(
            handle_message(&state, "c1", &outbox, msg),
            Err(RufletError::UnknownAction(_))
        ));
    }

    #[test]
    fn test_update_control_is_silent() {
        let state = test_state();
        let (outbox, mut rx) = mpsc::unbounded_channel();
        register(&state, &outbox, Value::Nil);
        drain(&mut rx);

        let msg = Message::new(
            Action::UpdateControl,
            value_map! {"id" => "status", "props" => value_map! {"value" => "typed"}},
        );
        handle_message(&state, "c1", &outbox, msg).unwrap();
        assert!(drain(&mut rx).is_empty());
        let page = state.session("c1").unwrap();
        let status = page.lock().unwrap().control("status").unwrap();
        assert_eq!(status.value("value"), Some(Value::from("typed")));
    }

    #[test]
    fn test_served_page_uses_server_icons() {
        let state = ServerState::new(
            Arc::new(Config::default()),
            make_app(|page| {
                page.add(vec![Control::new("icon").with_id("glyph")]);
                page.update("glyph", [("icon", "add")]);
                Ok(())
            }),
        )
        .with_icons(Arc::new(MaterialIcons));
        let (outbox, _rx) = mpsc::unbounded_channel();
        register(&state, &outbox, Value::Nil);

        let page = state.session("c1").unwrap();
        let glyph = page.lock().unwrap().control("glyph").unwrap();
        assert_eq!(glyph.value("icon"), Some(Value::Int(0xe145)));
    }

    #[tokio::test]
    async fn test_close_all_releases_stalled_connection() {
        let state = Arc::new(ServerState::new(
            Arc::new(Config::default()),
            make_app(|page| {
                page.add(vec![Control::new("text").with_prop("value", "x".repeat(20_000))]);
                Ok(())
            }),
        ));
        // The client never reads, so the server's writes fill the pipe.
        let (mut client, server) = tokio::io::duplex(512);
        let worker = tokio::spawn(handle_connection(state.clone(), server, "stalled".into()));

        client.write_all(UPGRADE).await.unwrap();
        let register = Message::new(
            Action::RegisterClient,
            value_map! {"session_id" => Value::Nil, "page" => value_map! {"route" => "/"}},
        );
        client.write_all(&client_frame(&register.encode())).await.unwrap();

        for _ in 0..100 {
            if state.session_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(state.session_count(), 1);

        state.close_all();
        tokio::time::timeout(Duration::from_secs(3), worker)
            .await
            .expect("worker still running after close_all")
            .unwrap();
        assert_eq!(state.connection_count(), 0);
        drop(client);
    }

    #[tokio::test]
    async fn test_bad_handshake_drops_stream() {
        let state = Arc::new(test_state());
        let (mut client, server) = tokio::io::duplex(1024);
        let worker = tokio::spawn(handle_connection(state.clone(), server, "test".into()));

        client
            .write_all(b"GET /elsewhere HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: k\r\n\r\n")
            .await
            .unwrap();
        worker.await.unwrap();

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        assert!(out.is_empty());
        assert_eq!(state.connection_count(), 0);
    }
}
