use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use super::{BridgeStats, Command, ConnId, Connected};
use crate::attachments::AttachmentStore;
use crate::auth::Principal;
use crate::broker::EventBroker;
use crate::classifier;
use crate::protocol::ServerEvent;
use crate::ratelimit::RateLimiter;
use crate::registry::SessionRegistry;
use crate::sanitize::InputSanitizer;
use crate::session::PtyEvent;

pub(super) struct Coordinator {
    pub(super) registry: SessionRegistry,
    pub(super) limiter: RateLimiter<ConnId>,
    pub(super) broker: EventBroker,
    pub(super) sanitizer: Arc<dyn InputSanitizer>,
    pub(super) attachments: Arc<dyn AttachmentStore>,
    pub(super) connections: HashMap<ConnId, Principal>,
    pub(super) next_conn: ConnId,
    pub(super) max_upload_bytes: usize,
}

pub(super) async fn run(
    mut coord: Coordinator,
    mut cmd_rx: mpsc::Receiver<Command>,
    mut pty_rx: mpsc::Receiver<PtyEvent>,
    sweep_interval: Duration,
) {
    let mut sweep = tokio::time::interval(sweep_interval);
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(cmd) => {
                        if !coord.handle_command(cmd).await {
                            return;
                        }
                    }
                    None => {
                        // Every handle dropped without an explicit shutdown.
                        coord.registry.drain().await;
                        return;
                    }
                }
            }

            Some(event) = pty_rx.recv() => {
                match event {
                    PtyEvent::Output { session_id, data } => coord.on_output(&session_id, data).await,
                    PtyEvent::Exited { session_id, code } => coord.on_exit(&session_id, code).await,
                }
            }

            _ = sweep.tick() => {
                let evicted = coord.limiter.sweep();
                if evicted > 0 {
                    tracing::debug!(evicted, "swept expired rate-limit windows");
                }
            }
        }
    }
}

impl Coordinator {
    /// Returns `false` once the coordinator should stop.
    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Connect { principal, reply } => {
                let connected = self.connect(principal).await;
                let _ = reply.send(connected);
            }
            Command::Dispatch {
                conn,
                message,
                reply,
            } => {
                let events = self.dispatch(conn, message).await;
                let _ = reply.send(events);
            }
            Command::Disconnect { conn } => {
                self.limiter.remove(&conn);
                if let Some(principal) = self.connections.remove(&conn) {
                    tracing::info!(conn, device = %principal.device, "client disconnected");
                }
            }
            Command::Stats { reply } => {
                let _ = reply.send(BridgeStats {
                    sessions: self.registry.live_count(),
                    connections: self.connections.len(),
                });
            }
            Command::Shutdown { reply } => {
                let drained = self.registry.drain().await;
                tracing::info!(drained, "bridge shut down");
                let _ = reply.send(drained);
                return false;
            }
        }
        true
    }

    /// Subscribe and snapshot in one step: no PTY event can be processed in
    /// between, so the replay and the live stream join exactly.
    async fn connect(&mut self, principal: Principal) -> Connected {
        let conn = self.next_conn;
        self.next_conn += 1;

        let events = self.broker.subscribe();
        let sessions = match self.registry.list_active().await {
            Ok(sessions) => sessions,
            Err(e) => {
                tracing::error!(?e, "failed to list sessions for new connection");
                Vec::new()
            }
        };

        let mut initial = Vec::with_capacity(sessions.len() + 1);
        let replay: Vec<ServerEvent> = sessions
            .iter()
            .filter_map(|record| self.replay_event(&record.id))
            .collect();
        initial.push(ServerEvent::SessionList(sessions));
        initial.extend(replay);

        tracing::info!(conn, user = %principal.user_id, device = %principal.device, "client connected");
        self.connections.insert(conn, principal);

        Connected {
            conn,
            initial,
            events,
        }
    }

    /// Buffered output of a live session as one event, if there is any.
    pub(super) fn replay_event(&self, session_id: &str) -> Option<ServerEvent> {
        let buffered = self.registry.get(session_id)?.buffered_output();
        if buffered.is_empty() {
            return None;
        }
        Some(ServerEvent::output(
            session_id,
            String::from_utf8_lossy(&buffered).into_owned(),
        ))
    }

    async fn on_output(&mut self, session_id: &str, data: Bytes) {
        let Some(session) = self.registry.get_mut(session_id) else {
            tracing::trace!(%session_id, "output for torn-down session dropped");
            return;
        };
        session.record_output(data.clone());

        let text = String::from_utf8_lossy(&data).into_owned();
        let status = classifier::classify(&text);
        let cost = classifier::extract_cost(&text);

        self.broker.publish(ServerEvent::output(session_id, text));

        if let Some(status) = status {
            self.broker.publish(ServerEvent::status(session_id, status));
        }

        if let Some(cost) = cost {
            self.registry.update_cost(session_id, cost).await;
            self.broker.publish(ServerEvent::cost(session_id, cost));
        }

        self.registry.update_activity(session_id).await;
    }

    async fn on_exit(&mut self, session_id: &str, code: Option<u32>) {
        let Some(record) = self.registry.handle_exit(session_id).await else {
            return;
        };
        tracing::info!(%session_id, ?code, "session ended");
        self.broker.publish(ServerEvent::SessionUpdated(record));
        self.publish_session_list().await;
    }

    pub(super) async fn publish_session_list(&self) {
        match self.registry.list_active().await {
            Ok(sessions) => self.broker.publish(ServerEvent::SessionList(sessions)),
            Err(e) => tracing::error!(?e, "failed to list sessions"),
        }
    }
}
