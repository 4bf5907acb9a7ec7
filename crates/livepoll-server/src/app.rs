// Poll session orchestration.
//
// One task owns the session registry, the poll state machine, the broadcast
// gateway and the expiry timer. Connection events and timer expiries arrive as
// messages on two channels, so every read-modify-write of poll state is
// serialized without locks.

use livepoll_core::config::PollConfig;
use livepoll_core::poll::{PollMachine, Rejection};
use livepoll_core::protocol::{
    AnnouncePayload, ClientMessage, ConnectionId, CreatePollPayload, RejectedPayload,
    RequestKind, ServerMessage, SubmitAnswerPayload,
};
use livepoll_core::registry::SessionRegistry;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::gateway::BroadcastGateway;
use crate::ws_server::WsEvent;

/// Posted by the expiry timer when a poll's deadline passes. Carries the
/// sequence number the timer was scheduled for so a late timer cannot end a
/// newer poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollExpiry {
    pub sequence_number: u64,
}

// ---------------------------------------------------------------------------
// AppState
// ---------------------------------------------------------------------------

pub struct AppState {
    pub registry: SessionRegistry,
    pub machine: PollMachine,
    pub gateway: BroadcastGateway,
    /// Sleeping timer for the active poll, if any. Aborted on early
    /// completion.
    expiry_task: Option<JoinHandle<()>>,
    /// Cloned into each timer task.
    timer_tx: mpsc::Sender<PollExpiry>,
}

impl AppState {
    pub fn new(poll: &PollConfig, timer_tx: mpsc::Sender<PollExpiry>) -> Self {
        AppState {
            registry: SessionRegistry::new(),
            machine: PollMachine::new(poll.default_duration_ms),
            gateway: BroadcastGateway::new(),
            expiry_task: None,
            timer_tx,
        }
    }

    /// Whether an expiry timer is currently scheduled.
    pub fn has_expiry_timer(&self) -> bool {
        self.expiry_task.is_some()
    }

    pub fn handle_ws_event(&mut self, event: WsEvent) {
        match event {
            WsEvent::Connected {
                conn,
                addr,
                outbound,
            } => {
                info!("Connection {} opened from {}", conn, addr);
                self.registry.on_connect(conn);
                self.gateway.register(conn, outbound);
            }
            WsEvent::Disconnected { conn } => {
                self.gateway.unregister(conn);
                match self.registry.on_disconnect(conn) {
                    Some(p) => info!(
                        "Connection {} closed ({} {}), {} students in {} connections remain",
                        conn,
                        p.role.map_or_else(|| "unannounced".to_string(), |r| r.to_string()),
                        p.display_name.as_deref().unwrap_or("-"),
                        self.registry.student_count(),
                        self.registry.connection_count()
                    ),
                    None => debug!("Disconnect for unknown connection {}", conn),
                }
            }
            WsEvent::Message { conn, text } => self.handle_message(conn, &text),
        }
    }

    /// Parse and dispatch one inbound frame.
    pub fn handle_message(&mut self, conn: ConnectionId, text: &str) {
        let msg: ClientMessage = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => {
                warn!("Failed to parse message from connection {}: {}", conn, e);
                self.gateway.send_to(
                    conn,
                    ServerMessage::Rejected(RejectedPayload {
                        request: RequestKind::Unknown,
                        reason: format!("malformed message: {e}"),
                    }),
                );
                return;
            }
        };

        let kind = msg.kind();
        let result = match msg {
            ClientMessage::Announce(payload) => {
                self.handle_announce(conn, payload);
                Ok(())
            }
            ClientMessage::CreatePoll(payload) => self.handle_create_poll(conn, payload),
            ClientMessage::SubmitAnswer(payload) => self.handle_submit_answer(payload),
        };

        if let Err(rejection) = result {
            debug!("Rejected {:?} from connection {}: {}", kind, conn, rejection);
            self.gateway.send_to(
                conn,
                ServerMessage::Rejected(RejectedPayload {
                    request: kind,
                    reason: rejection.to_string(),
                }),
            );
        }
    }

    /// Record the participant and, if a poll is running, bring it up to date.
    fn handle_announce(&mut self, conn: ConnectionId, payload: AnnouncePayload) {
        info!(
            "Connection {} announced as {} ({})",
            conn, payload.display_name, payload.role
        );
        self.registry
            .announce(conn, payload.display_name, payload.role);

        if let Some((started, tally)) = self.machine.snapshot(Instant::now()) {
            debug!(
                "Resyncing connection {} to poll #{} ({} answers)",
                conn,
                started.sequence_number,
                tally.answers.len()
            );
            self.gateway.send_to(conn, ServerMessage::PollStarted(started));
            self.gateway.send_to(conn, ServerMessage::TallyUpdated(tally));
        }
    }

    fn handle_create_poll(
        &mut self,
        conn: ConnectionId,
        payload: CreatePollPayload,
    ) -> Result<(), Rejection> {
        let started = self.machine.create_poll(payload, Instant::now())?;
        info!(
            "Connection {} started poll #{}",
            conn, started.sequence_number
        );

        if let Some(poll) = self.machine.active_poll() {
            let deadline = poll.deadline();
            self.schedule_expiry(started.sequence_number, deadline);
        }

        let delivered = self
            .gateway
            .broadcast_all(&ServerMessage::PollStarted(started));
        debug!(
            "pollStarted delivered to {} of {} connections",
            delivered,
            self.gateway.connection_count()
        );
        Ok(())
    }

    fn handle_submit_answer(&mut self, payload: SubmitAnswerPayload) -> Result<(), Rejection> {
        let outcome = self
            .machine
            .submit_answer(&payload, self.registry.student_count())?;

        debug!(
            "Poll #{} tally: {} answers",
            outcome.tally.sequence_number,
            outcome.tally.answers.len()
        );
        self.gateway
            .broadcast_all(&ServerMessage::TallyUpdated(outcome.tally));

        if let Some(ended) = outcome.ended {
            self.cancel_expiry();
            self.gateway.broadcast_all(&ServerMessage::PollEnded(ended));
        }
        Ok(())
    }

    /// Timer message. Stale timers (already-completed or older polls) are
    /// ignored by the machine.
    pub fn handle_expiry(&mut self, expiry: PollExpiry) {
        if let Some(ended) = self.machine.expire(expiry.sequence_number) {
            self.expiry_task = None;
            self.gateway.broadcast_all(&ServerMessage::PollEnded(ended));
        }
    }

    fn schedule_expiry(&mut self, sequence_number: u64, deadline: Instant) {
        self.cancel_expiry();
        let tx = self.timer_tx.clone();
        self.expiry_task = Some(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let _ = tx.send(PollExpiry { sequence_number }).await;
        }));
    }

    pub fn cancel_expiry(&mut self) {
        if let Some(handle) = self.expiry_task.take() {
            handle.abort();
            debug!("Cancelled expiry timer");
        }
    }
}

// ---------------------------------------------------------------------------
// Main event loop
// ---------------------------------------------------------------------------

/// Run the poll loop until the WebSocket event channel closes.
///
/// Listens on two channels using `tokio::select!`:
/// 1. Connection events from the WebSocket server
/// 2. Expiry messages from poll timers
pub async fn run(
    mut ws_rx: mpsc::Receiver<WsEvent>,
    mut timer_rx: mpsc::Receiver<PollExpiry>,
    mut state: AppState,
) -> anyhow::Result<()> {
    info!("Poll event loop started");

    loop {
        tokio::select! {
            ws_event = ws_rx.recv() => {
                match ws_event {
                    Some(event) => state.handle_ws_event(event),
                    None => {
                        info!("WebSocket channel closed, shutting down");
                        break;
                    }
                }
            }

            Some(expiry) = timer_rx.recv() => {
                state.handle_expiry(expiry);
            }
        }
    }

    state.cancel_expiry();
    info!("Poll event loop exiting");
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
