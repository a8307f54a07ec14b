use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use std::io::{Read, Write};
use std::path::Path;
use thiserror::Error;

/// Default PTY geometry for new sessions.
pub const DEFAULT_COLS: u16 = 120;
pub const DEFAULT_ROWS: u16 = 40;

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("working directory does not exist: {0}")]
    MissingCwd(String),

    #[error("failed to open pty: {0}")]
    OpenPty(#[source] anyhow::Error),

    #[error("failed to spawn command: {0}")]
    SpawnCommand(#[source] anyhow::Error),

    #[error("failed to clone reader: {0}")]
    CloneReader(#[source] anyhow::Error),

    #[error("failed to take writer: {0}")]
    TakeWriter(#[source] anyhow::Error),

    #[error("failed to resize pty: {0}")]
    Resize(#[source] anyhow::Error),
}

/// What to run inside a session's PTY: `<shell> -c <program>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliCommand {
    pub shell: String,
    pub program: String,
}

impl Default for CliCommand {
    fn default() -> Self {
        Self {
            shell: std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string()),
            program: "claude".to_string(),
        }
    }
}

impl CliCommand {
    fn build(&self, cwd: &Path) -> CommandBuilder {
        let mut cmd = CommandBuilder::new(&self.shell);
        cmd.arg("-c");
        cmd.arg(&self.program);
        cmd.cwd(cwd);
        cmd.env("TERM", "xterm-256color");
        cmd.env("FORCE_COLOR", "1");
        cmd
    }
}

/// The host side of a spawned PTY.
///
/// The slave end is dropped right after spawning so that the reader sees EOF
/// once the child and everything it spawned have exited.
pub struct Pty {
    master: Box<dyn MasterPty + Send>,
    child: Option<Box<dyn Child + Send + Sync>>,
}

impl Pty {
    pub fn spawn(command: &CliCommand, cwd: &Path, rows: u16, cols: u16) -> Result<Self, PtyError> {
        if !cwd.is_dir() {
            return Err(PtyError::MissingCwd(cwd.display().to_string()));
        }

        let pair = native_pty_system()
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(PtyError::OpenPty)?;

        let child = pair
            .slave
            .spawn_command(command.build(cwd))
            .map_err(PtyError::SpawnCommand)?;
        drop(pair.slave);

        Ok(Self {
            master: pair.master,
            child: Some(child),
        })
    }

    pub fn take_reader(&self) -> Result<Box<dyn Read + Send>, PtyError> {
        self.master.try_clone_reader().map_err(PtyError::CloneReader)
    }

    pub fn take_writer(&self) -> Result<Box<dyn Write + Send>, PtyError> {
        self.master.take_writer().map_err(PtyError::TakeWriter)
    }

    /// Take ownership of the child handle. Returns `None` on the second call.
    pub fn take_child(&mut self) -> Option<Box<dyn Child + Send + Sync>> {
        self.child.take()
    }

    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), PtyError> {
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(PtyError::Resize)
    }
}
