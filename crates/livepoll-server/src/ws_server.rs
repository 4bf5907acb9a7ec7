// WebSocket transport for browser participants.
//
// Each accepted socket becomes one connection: a reader that forwards text
// frames to the poll loop, and a writer that drains the connection's outbound
// queue into JSON text frames. The poll loop never sees a socket.

use std::fmt::Display;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use livepoll_core::protocol::{ConnectionId, ServerMessage};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::gateway::Outbound;

/// Events emitted by the WebSocket server to the poll loop.
#[derive(Debug)]
pub enum WsEvent {
    /// A client completed the handshake. `outbound` feeds its writer.
    Connected {
        conn: ConnectionId,
        addr: String,
        outbound: Outbound,
    },
    /// The client's socket closed.
    Disconnected { conn: ConnectionId },
    /// A text frame from the client (raw JSON string).
    Message { conn: ConnectionId, text: String },
}

/// TCP listener that upgrades accepted sockets to WebSockets.
pub struct TungsteniteListener {
    listener: TcpListener,
}

impl TungsteniteListener {
    pub async fn bind(addr: &str) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(TungsteniteListener { listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

/// Pause after a failed accept so a persistent error such as running out of
/// file descriptors does not spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Accept connections forever, serving each on its own task and forwarding
/// events through `tx`. Returns once the poll loop has gone away.
pub async fn run(
    listener: TungsteniteListener,
    tx: mpsc::Sender<WsEvent>,
    outbound_buffer: usize,
) -> anyhow::Result<()> {
    info!("WebSocket server listening on {}", listener.local_addr()?);

    let mut next_conn: ConnectionId = 0;
    loop {
        let (stream, addr) = match listener.listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Failed to accept connection: {}", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };
        if tx.is_closed() {
            break;
        }
        next_conn += 1;
        let conn = next_conn;
        debug!("Accepted TCP connection {} from {}", conn, addr);

        let tx = tx.clone();
        tokio::spawn(async move {
            serve_connection(stream, addr.to_string(), conn, tx, outbound_buffer).await;
        });
    }

    info!("Poll loop closed, WebSocket server stopping");
    Ok(())
}

/// Handshake, then pump frames in both directions until the client leaves or
/// the gateway closes the connection's outbound queue.
async fn serve_connection(
    stream: TcpStream,
    addr: String,
    conn: ConnectionId,
    tx: mpsc::Sender<WsEvent>,
    outbound_buffer: usize,
) {
    let ws_stream = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake failed for {addr}: {e}");
            return;
        }
    };

    let (write, read) = ws_stream.split();
    let (out_tx, out_rx) = mpsc::channel(outbound_buffer);

    if tx
        .send(WsEvent::Connected {
            conn,
            addr: addr.clone(),
            outbound: out_tx,
        })
        .await
        .is_err()
    {
        return;
    }

    let mut writer = tokio::spawn(forward_outbound(write, out_rx, conn));

    let loop_gone = tokio::select! {
        result = process_message_stream(read, &tx, conn, &addr) => result.is_err(),
        _ = &mut writer => {
            info!("Outbound side of connection {conn} ({addr}) closed, dropping socket");
            false
        }
    };
    writer.abort();

    if !loop_gone {
        let _ = tx.send(WsEvent::Disconnected { conn }).await;
    }
}

/// Serialize queued [`ServerMessage`]s onto `sink` as JSON text frames until
/// the queue closes or the sink fails, then close the sink.
pub async fn forward_outbound<Si>(
    mut sink: Si,
    mut rx: mpsc::Receiver<ServerMessage>,
    conn: ConnectionId,
) where
    Si: Sink<Message> + Unpin,
    Si::Error: Display,
{
    while let Some(msg) = rx.recv().await {
        let json = match serde_json::to_string(&msg) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to serialize event for connection {conn}: {e}");
                continue;
            }
        };
        if let Err(e) = sink.send(Message::Text(json.into())).await {
            debug!("Send to connection {conn} failed, stopping writer: {e}");
            return;
        }
    }
    if let Err(e) = sink.close().await {
        debug!("Closing connection {conn} failed: {e}");
    }
}

/// Process raw WebSocket [`Message`] items from any [`Stream`], forwarding
/// text payloads through `tx`. Returns `Err(())` if the channel is closed
/// (receiver dropped), signalling the caller to stop.
///
/// Generic over the stream so it can be tested without opening TCP ports.
pub async fn process_message_stream<St>(
    mut stream: St,
    tx: &mpsc::Sender<WsEvent>,
    conn: ConnectionId,
    addr: &str,
) -> Result<(), ()>
where
    St: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(msg_result) = stream.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                let event = WsEvent::Message {
                    conn,
                    text: text.to_string(),
                };
                if tx.send(event).await.is_err() {
                    return Err(());
                }
            }
            Ok(Message::Close(_)) => {
                info!("Client {addr} sent close frame");
                break;
            }
            Err(e) => {
                warn!("WebSocket error from {addr}: {e}");
                break;
            }
            _ => {
                // Ignore Binary, Ping, Pong, Frame variants.
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use livepoll_core::protocol::{RejectedPayload, RequestKind};
    use tokio_tungstenite::tungstenite::Error as WsError;

    fn frames(
        messages: Vec<Result<Message, WsError>>,
    ) -> impl Stream<Item = Result<Message, WsError>> + Unpin {
        stream::iter(messages)
    }

    fn text_frame(s: &str) -> Result<Message, WsError> {
        Ok(Message::Text(s.into()))
    }

    fn collect(rx: &mut mpsc::Receiver<WsEvent>) -> Vec<(ConnectionId, String)> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            match event {
                WsEvent::Message { conn, text } => out.push((conn, text)),
                other => panic!("expected Message, got {other:?}"),
            }
        }
        out
    }

    /// A sink that hands every frame it is given to an unbounded channel.
    fn channel_sink(
        frame_tx: mpsc::UnboundedSender<Message>,
    ) -> impl Sink<Message, Error = String> + Unpin {
        Box::pin(futures_util::sink::unfold(
            frame_tx,
            |frame_tx, frame: Message| async move {
                match frame_tx.send(frame) {
                    Ok(()) => Ok(frame_tx),
                    Err(e) => Err(e.to_string()),
                }
            },
        ))
    }

    #[tokio::test]
    async fn concurrent_connections_keep_their_own_ids_and_order() {
        let (tx, mut rx) = mpsc::channel(64);
        let three = frames(vec![text_frame("3:first"), text_frame("3:second"), text_frame("3:third")]);
        let eight = frames(vec![text_frame("8:first"), text_frame("8:second")]);

        let (a, b) = tokio::join!(
            process_message_stream(three, &tx, 3, "peer-3"),
            process_message_stream(eight, &tx, 8, "peer-8"),
        );
        assert!(a.is_ok() && b.is_ok());

        let events = collect(&mut rx);
        assert_eq!(events.len(), 5);
        for (conn, text) in &events {
            assert!(text.starts_with(&format!("{conn}:")), "{conn} carried {text}");
        }
        let three: Vec<_> = events
            .iter()
            .filter(|(c, _)| *c == 3)
            .map(|(_, t)| t.as_str())
            .collect();
        assert_eq!(three, vec!["3:first", "3:second", "3:third"]);
    }

    #[tokio::test]
    async fn close_frame_ends_only_the_closing_connection() {
        let (tx, mut rx) = mpsc::channel(64);
        let leaving = frames(vec![
            text_frame("1:hello"),
            Ok(Message::Close(None)),
            text_frame("1:after close"),
        ]);
        let staying = frames(vec![text_frame("2:hello"), text_frame("2:still here")]);

        let (a, b) = tokio::join!(
            process_message_stream(leaving, &tx, 1, "peer-1"),
            process_message_stream(staying, &tx, 2, "peer-2"),
        );
        assert!(a.is_ok() && b.is_ok());

        let events = collect(&mut rx);
        assert!(events.contains(&(1, "1:hello".to_string())));
        assert!(!events.iter().any(|(_, t)| t == "1:after close"));
        assert!(events.contains(&(2, "2:still here".to_string())));
    }

    #[tokio::test]
    async fn only_text_frames_reach_the_poll_loop_and_errors_end_the_stream() {
        let (tx, mut rx) = mpsc::channel(64);
        let messages = frames(vec![
            Ok(Message::Binary(vec![1, 2, 3].into())),
            Ok(Message::Ping(vec![].into())),
            text_frame(r#"{"event":"announce"}"#),
            Ok(Message::Pong(vec![].into())),
            Err(WsError::ConnectionClosed),
            text_frame("never read"),
        ]);

        process_message_stream(messages, &tx, 5, "peer-5")
            .await
            .unwrap();

        assert_eq!(
            collect(&mut rx),
            vec![(5, r#"{"event":"announce"}"#.to_string())]
        );
    }

    #[tokio::test]
    async fn stops_reading_once_the_poll_loop_is_gone() {
        let (tx, rx) = mpsc::channel(64);
        drop(rx);

        let result =
            process_message_stream(frames(vec![text_frame("orphan")]), &tx, 1, "peer-1").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn outbound_events_become_json_text_frames() {
        let (out_tx, out_rx) = mpsc::channel(4);
        let (frame_tx, mut frame_rx) = mpsc::unbounded_channel();
        let msg = ServerMessage::Rejected(RejectedPayload {
            request: RequestKind::CreatePoll,
            reason: "a poll is already active".into(),
        });
        out_tx.send(msg.clone()).await.unwrap();
        drop(out_tx);

        forward_outbound(channel_sink(frame_tx), out_rx, 1).await;

        let Some(Message::Text(json)) = frame_rx.recv().await else {
            panic!("expected a text frame");
        };
        let decoded: ServerMessage = serde_json::from_str(json.as_str()).unwrap();
        assert_eq!(decoded, msg);
        assert!(frame_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn writer_stops_when_the_socket_is_gone() {
        let (out_tx, out_rx) = mpsc::channel(4);
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        drop(frame_rx);
        out_tx
            .send(ServerMessage::Rejected(RejectedPayload {
                request: RequestKind::Unknown,
                reason: "x".into(),
            }))
            .await
            .unwrap();

        // Returns even though the queue is still open.
        tokio::time::timeout(
            Duration::from_secs(1),
            forward_outbound(channel_sink(frame_tx), out_rx, 1),
        )
        .await
        .expect("writer should stop after a failed send");
        drop(out_tx);
    }
}
