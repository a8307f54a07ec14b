use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use portable_pty::ChildKiller;
use tokio::sync::mpsc;

use crate::error::BridgeError;
use crate::history::OutputHistory;
use crate::pty::{CliCommand, Pty, PtyError};

/// Ctrl+C.
const INTERRUPT: u8 = 0x03;

/// How long the exit monitor waits for the reader to hit EOF once the child
/// is reaped. Bounded because a background grandchild can hold the PTY open.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Events raised by a session's I/O threads, consumed by the coordinator.
#[derive(Debug)]
pub enum PtyEvent {
    Output { session_id: String, data: Bytes },
    Exited { session_id: String, code: Option<u32> },
}

/// Options applied to every spawned session.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    pub command: CliCommand,
    pub rows: u16,
    pub cols: u16,
    pub history_chunks: usize,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self {
            command: CliCommand::default(),
            rows: crate::pty::DEFAULT_ROWS,
            cols: crate::pty::DEFAULT_COLS,
            history_chunks: crate::history::DEFAULT_HISTORY_CHUNKS,
        }
    }
}

/// One interactive process running in a PTY, plus its output history.
///
/// Owned by the `SessionRegistry`. The PTY reader and the child-exit monitor
/// run on blocking threads and report back through the `PtyEvent` channel;
/// everything else happens on the owner's task.
pub struct ProcessSession {
    id: String,
    pid: Option<u32>,
    cwd: PathBuf,
    pty: parking_lot::Mutex<Pty>,
    input_tx: mpsc::UnboundedSender<Bytes>,
    history: OutputHistory,
    killer: Box<dyn ChildKiller + Send + Sync>,
    /// Set by the exit monitor once `wait()` returns. Checked before
    /// signalling so a recycled PID is never hit.
    exited: Arc<AtomicBool>,
    killed: bool,
}

impl std::fmt::Debug for ProcessSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSession")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("cwd", &self.cwd)
            .finish_non_exhaustive()
    }
}

impl ProcessSession {
    /// Spawn the configured command in a new PTY rooted at `cwd`.
    ///
    /// Must be called from within a tokio runtime: the reader, writer and
    /// exit monitor are started on the blocking pool.
    pub fn spawn(
        id: String,
        cwd: &Path,
        options: &SpawnOptions,
        events_tx: mpsc::Sender<PtyEvent>,
    ) -> Result<Self, PtyError> {
        let mut pty = Pty::spawn(&options.command, cwd, options.rows, options.cols)?;
        let reader = pty.take_reader()?;
        let writer = pty.take_writer()?;
        let mut child = pty
            .take_child()
            .ok_or_else(|| PtyError::SpawnCommand(anyhow::anyhow!("child handle unavailable")))?;
        let pid = child.process_id();
        let killer = child.clone_killer();
        let exited = Arc::new(AtomicBool::new(false));

        // The reader signals EOF so that `Exited` is only sent after the last
        // output chunk is queued on the same channel.
        let (eof_tx, eof_rx) = std::sync::mpsc::sync_channel::<()>(1);

        {
            let session_id = id.clone();
            let exited = exited.clone();
            let events_tx = events_tx.clone();
            tokio::task::spawn_blocking(move || {
                let code = match child.wait() {
                    Ok(status) => {
                        tracing::debug!(%session_id, ?status, "session child exited");
                        Some(status.exit_code())
                    }
                    Err(e) => {
                        tracing::error!(%session_id, ?e, "error waiting for session child");
                        None
                    }
                };
                exited.store(true, Ordering::Release);
                if let Err(RecvTimeoutError::Timeout) = eof_rx.recv_timeout(OUTPUT_DRAIN_TIMEOUT) {
                    tracing::debug!(%session_id, "pty still open after child exit");
                }
                let _ = events_tx.blocking_send(PtyEvent::Exited { session_id, code });
            });
        }

        {
            let session_id = id.clone();
            tokio::task::spawn_blocking(move || {
                read_output(session_id, reader, events_tx);
                let _ = eof_tx.send(());
            });
        }

        let (input_tx, mut input_rx) = mpsc::unbounded_channel::<Bytes>();
        tokio::task::spawn_blocking(move || {
            let mut writer = writer;
            while let Some(data) = input_rx.blocking_recv() {
                if writer.write_all(&data).is_err() {
                    break;
                }
                let _ = writer.flush();
            }
        });

        tracing::info!(session_id = %id, cwd = %cwd.display(), ?pid, "process session spawned");

        Ok(Self {
            id,
            pid,
            cwd: cwd.to_path_buf(),
            pty: parking_lot::Mutex::new(pty),
            input_tx,
            history: OutputHistory::new(options.history_chunks),
            killer,
            exited,
            killed: false,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub fn is_alive(&self) -> bool {
        !self.killed && !self.exited.load(Ordering::Acquire)
    }

    /// Forward raw bytes to the process input, verbatim.
    pub fn write(&self, data: impl Into<Bytes>) -> Result<(), BridgeError> {
        if !self.is_alive() {
            return Err(BridgeError::SessionNotFound(self.id.clone()));
        }
        self.input_tx
            .send(data.into())
            .map_err(|_| BridgeError::SessionNotFound(self.id.clone()))
    }

    /// Best effort; ignored once the process has gone.
    pub fn resize(&self, cols: u16, rows: u16) {
        if !self.is_alive() {
            return;
        }
        if let Err(e) = self.pty.lock().resize(rows, cols) {
            tracing::debug!(session_id = %self.id, ?e, "resize failed");
        }
    }

    pub fn interrupt(&self) -> Result<(), BridgeError> {
        self.write(Bytes::from_static(&[INTERRUPT]))
    }

    /// SIGKILL the process group. Calling this more than once is a no-op.
    pub fn kill(&mut self) {
        if self.killed {
            return;
        }
        self.killed = true;
        if self.exited.load(Ordering::Acquire) {
            tracing::debug!(session_id = %self.id, "child already exited, skipping kill");
            return;
        }

        if let Some(pid) = self.pid {
            if kill_process_group(pid) {
                return;
            }
        }

        if let Err(e) = self.killer.kill() {
            tracing::debug!(session_id = %self.id, ?e, "child killer failed");
        }
    }

    /// Append a chunk to the bounded history.
    pub fn record_output(&mut self, chunk: Bytes) {
        self.history.push(chunk);
    }

    pub fn buffered_output(&self) -> Bytes {
        self.history.concat()
    }
}

impl Drop for ProcessSession {
    fn drop(&mut self) {
        self.kill();
    }
}

/// SIGKILL the whole process group led by `pid`.
///
/// portable_pty calls setsid() when spawning, so the child leads its own
/// process group and the negative PID reaches everything it started.
#[cfg(unix)]
fn kill_process_group(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        tracing::warn!(pid, "PID is 0 or exceeds i32::MAX, cannot send signal");
        return false;
    }
    unsafe {
        libc::kill(-(pid as i32), libc::SIGKILL);
    }
    true
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) -> bool {
    false
}

/// Pump PTY output to the coordinator, splitting only on UTF-8 boundaries.
fn read_output(
    session_id: String,
    mut reader: Box<dyn Read + Send>,
    events_tx: mpsc::Sender<PtyEvent>,
) {
    let mut buf = [0u8; 4096];
    let mut pending = BytesMut::new();
    loop {
        match reader.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                let cut = complete_prefix_len(&pending);
                if cut == 0 {
                    continue;
                }
                let data = pending.split_to(cut).freeze();
                // Blocks when the coordinator is behind, which pushes back on
                // the child through the kernel PTY buffer.
                if events_tx
                    .blocking_send(PtyEvent::Output {
                        session_id: session_id.clone(),
                        data,
                    })
                    .is_err()
                {
                    return;
                }
            }
        }
    }
    if !pending.is_empty() {
        let _ = events_tx.blocking_send(PtyEvent::Output {
            session_id,
            data: pending.freeze(),
        });
    }
}

/// Length of the longest prefix that does not end inside a UTF-8 sequence.
///
/// Only the tail matters: invalid bytes earlier in the buffer are passed
/// through, but a lead byte near the end still waits for its continuation.
fn complete_prefix_len(buf: &[u8]) -> usize {
    let len = buf.len();
    for back in 1..=len.min(4) {
        let byte = buf[len - back];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let needed = match byte {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        return if back < needed { len - back } else { len };
    }
    len
}
