//! The session bridge coordinator.
//!
//! One task owns the registry, every process session and the rate limiter.
//! Connections talk to it through the cloneable [`Bridge`] handle: commands
//! go in over an mpsc channel, sender-directed replies come back on oneshot
//! channels, and everything meant for all clients is published on the
//! [`EventBroker`].

mod commands;
mod task;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::attachments::AttachmentStore;
use crate::auth::Principal;
use crate::broker::EventBroker;
use crate::error::BridgeError;
use crate::protocol::{ClientMessage, ServerEvent};
use crate::ratelimit::{RateLimiter, DEFAULT_MAX_PER_WINDOW, DEFAULT_WINDOW};
use crate::registry::{SessionRegistry, DEFAULT_MAX_SESSIONS};
use crate::sanitize::InputSanitizer;
use crate::session::{PtyEvent, SpawnOptions};
use crate::store::SessionStore;

/// Bounded so a stalled coordinator pushes back on PTY readers.
const PTY_EVENT_CAPACITY: usize = 256;
const COMMAND_CAPACITY: usize = 64;

/// Default maximum decoded photo size.
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

/// Identity of one client connection, assigned on connect.
pub type ConnId = u64;

/// Tunables for the coordinator.
#[derive(Debug, Clone)]
pub struct BridgeOptions {
    pub spawn: SpawnOptions,
    pub max_sessions: usize,
    pub rate_limit_max: u32,
    pub rate_limit_window: Duration,
    pub max_upload_bytes: usize,
    pub sweep_interval: Duration,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            spawn: SpawnOptions::default(),
            max_sessions: DEFAULT_MAX_SESSIONS,
            rate_limit_max: DEFAULT_MAX_PER_WINDOW,
            rate_limit_window: DEFAULT_WINDOW,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Collaborators reached through narrow interfaces.
#[derive(Clone)]
pub struct BridgeDeps {
    pub store: Arc<dyn SessionStore>,
    pub sanitizer: Arc<dyn InputSanitizer>,
    pub attachments: Arc<dyn AttachmentStore>,
}

/// Result of a successful connect.
///
/// `initial` holds the session list and replay snapshot; `events` is
/// subscribed at the same point, so nothing is missed or seen twice.
#[derive(Debug)]
pub struct Connected {
    pub conn: ConnId,
    pub initial: Vec<ServerEvent>,
    pub events: broadcast::Receiver<Arc<ServerEvent>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeStats {
    pub sessions: usize,
    pub connections: usize,
}

pub(crate) enum Command {
    Connect {
        principal: Principal,
        reply: oneshot::Sender<Connected>,
    },
    Dispatch {
        conn: ConnId,
        message: ClientMessage,
        reply: oneshot::Sender<Vec<ServerEvent>>,
    },
    Disconnect {
        conn: ConnId,
    },
    Stats {
        reply: oneshot::Sender<BridgeStats>,
    },
    Shutdown {
        reply: oneshot::Sender<usize>,
    },
}

#[derive(Clone)]
pub struct Bridge {
    cmd_tx: mpsc::Sender<Command>,
}

impl Bridge {
    /// Reconcile persisted state and start the coordinator task.
    pub async fn spawn(options: BridgeOptions, deps: BridgeDeps) -> Result<Self, BridgeError> {
        let (pty_tx, pty_rx) = mpsc::channel::<PtyEvent>(PTY_EVENT_CAPACITY);
        let mut registry = SessionRegistry::new(
            deps.store,
            options.spawn.clone(),
            pty_tx,
            options.max_sessions,
        );
        let repaired = registry.reconcile().await?;
        if repaired > 0 {
            tracing::info!(repaired, "reconciled stale session records");
        }

        let coordinator = task::Coordinator {
            registry,
            limiter: RateLimiter::new(options.rate_limit_max, options.rate_limit_window),
            broker: EventBroker::new(),
            sanitizer: deps.sanitizer,
            attachments: deps.attachments,
            connections: Default::default(),
            next_conn: 1,
            max_upload_bytes: options.max_upload_bytes,
        };

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CAPACITY);
        let sweep_interval = options.sweep_interval;
        tokio::spawn(async move {
            let result = AssertUnwindSafe(task::run(coordinator, cmd_rx, pty_rx, sweep_interval))
                .catch_unwind()
                .await;
            match result {
                Ok(()) => tracing::debug!("bridge coordinator stopped"),
                Err(e) => tracing::error!("bridge coordinator panicked: {:?}", e),
            }
        });

        Ok(Self { cmd_tx })
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, BridgeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(build(tx))
            .await
            .map_err(|_| BridgeError::CoordinatorGone)?;
        rx.await.map_err(|_| BridgeError::CoordinatorGone)
    }

    /// Register an authenticated connection.
    pub async fn connect(&self, principal: Principal) -> Result<Connected, BridgeError> {
        self.request(|reply| Command::Connect { principal, reply }).await
    }

    /// Run one client command. Returns the events meant for the sender only.
    pub async fn dispatch(
        &self,
        conn: ConnId,
        message: ClientMessage,
    ) -> Result<Vec<ServerEvent>, BridgeError> {
        self.request(|reply| Command::Dispatch {
            conn,
            message,
            reply,
        })
        .await
    }

    pub async fn disconnect(&self, conn: ConnId) {
        let _ = self.cmd_tx.send(Command::Disconnect { conn }).await;
    }

    pub async fn stats(&self) -> Result<BridgeStats, BridgeError> {
        self.request(|reply| Command::Stats { reply }).await
    }

    /// Kill every live session and stop the coordinator. Returns how many
    /// sessions were terminated.
    pub async fn shutdown(&self) -> Result<usize, BridgeError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

#[cfg(test)]
mod tests;
