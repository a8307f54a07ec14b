use std::path::PathBuf;

use base64::Engine;
use bytes::Bytes;

use super::task::Coordinator;
use super::ConnId;
use crate::error::BridgeError;
use crate::protocol::{
    ClientMessage, CreateSessionParams, InputParams, PhotoParams, ResizeParams, ServerEvent,
};
use crate::session::ProcessSession;

const INVALID_PHOTO: &str = "Invalid or oversized photo";

impl Coordinator {
    /// Rate-limit and run one client command. Failures become a `cc:error`
    /// for the sender; nothing propagates out of the coordinator.
    pub(super) async fn dispatch(&mut self, conn: ConnId, message: ClientMessage) -> Vec<ServerEvent> {
        if !self.limiter.check(&conn) {
            tracing::warn!(conn, event = message.event_name(), "rate limit exceeded");
            return vec![ServerEvent::error(BridgeError::RateLimitExceeded.to_string())];
        }

        let event = message.event_name();
        match self.handle(conn, message).await {
            Ok(events) => events,
            Err(e) => {
                tracing::debug!(conn, event, error = %e, "command failed");
                vec![ServerEvent::error(e.to_string())]
            }
        }
    }

    async fn handle(&mut self, conn: ConnId, message: ClientMessage) -> Result<Vec<ServerEvent>, BridgeError> {
        match message {
            ClientMessage::CreateSession(params) => self.create_session(conn, params).await,
            ClientMessage::KillSession(target) => {
                if let Some(record) = self.registry.kill(&target.session_id).await? {
                    tracing::info!(conn, session_id = %record.id, "session killed by client");
                    self.broker.publish(ServerEvent::SessionUpdated(record));
                    self.publish_session_list().await;
                }
                Ok(vec![])
            }
            ClientMessage::ListSessions => {
                Ok(vec![ServerEvent::SessionList(self.registry.list_active().await?)])
            }
            ClientMessage::ResumeSession(target) => {
                self.live_session(&target.session_id)?;
                Ok(self.replay_event(&target.session_id).into_iter().collect())
            }
            ClientMessage::Input(params) => self.input(params).await,
            ClientMessage::Approve(target) => {
                self.live_session(&target.session_id)?
                    .write(Bytes::from_static(b"y\r"))?;
                self.registry.update_activity(&target.session_id).await;
                tracing::info!(conn, session_id = %target.session_id, "action approved");
                Ok(vec![])
            }
            ClientMessage::Reject(target) => {
                self.live_session(&target.session_id)?
                    .write(Bytes::from_static(b"n\r"))?;
                self.registry.update_activity(&target.session_id).await;
                tracing::info!(conn, session_id = %target.session_id, "action rejected");
                Ok(vec![])
            }
            ClientMessage::Interrupt(target) => {
                self.live_session(&target.session_id)?.interrupt()?;
                tracing::info!(conn, session_id = %target.session_id, "session interrupted");
                Ok(vec![])
            }
            ClientMessage::Resize(params) => {
                self.resize(params);
                Ok(vec![])
            }
            ClientMessage::Photo(params) => self.photo(conn, params).await,
        }
    }

    fn live_session(&self, id: &str) -> Result<&ProcessSession, BridgeError> {
        self.registry
            .get(id)
            .ok_or_else(|| BridgeError::SessionNotFound(id.to_string()))
    }

    async fn create_session(
        &mut self,
        conn: ConnId,
        params: CreateSessionParams,
    ) -> Result<Vec<ServerEvent>, BridgeError> {
        let name = self.sanitizer.sanitize_name(&params.name);
        let cwd = self.sanitizer.sanitize_path(&params.cwd);
        if name.is_empty() || cwd.is_empty() {
            return Err(BridgeError::validation("Invalid session name or directory"));
        }
        let cwd = PathBuf::from(cwd);
        if !cwd.is_dir() {
            return Err(BridgeError::validation(format!(
                "Directory does not exist: {}",
                cwd.display()
            )));
        }

        let record = self.registry.create(&name, &cwd).await?;
        tracing::info!(conn, session_id = %record.id, %name, cwd = %cwd.display(), "session created by client");
        self.broker.publish(ServerEvent::SessionCreated(record));
        self.publish_session_list().await;
        Ok(vec![])
    }

    async fn input(&mut self, params: InputParams) -> Result<Vec<ServerEvent>, BridgeError> {
        let text = self.sanitizer.sanitize_text(&params.text);
        if text.is_empty() {
            return Ok(vec![]);
        }
        self.live_session(&params.session_id)?
            .write(format!("{text}\r"))?;
        self.registry.update_activity(&params.session_id).await;
        Ok(vec![])
    }

    fn resize(&self, params: ResizeParams) {
        if params.cols == 0 || params.rows == 0 {
            return;
        }
        if let Some(session) = self.registry.get(&params.session_id) {
            session.resize(params.cols, params.rows);
        }
    }

    async fn photo(&mut self, conn: ConnId, params: PhotoParams) -> Result<Vec<ServerEvent>, BridgeError> {
        self.live_session(&params.session_id)?;

        // Base64 inflates by 4/3; refuse before decoding anything oversized.
        if params.base64.len() > self.max_upload_bytes.div_ceil(3) * 4 + 4 {
            return Err(BridgeError::validation(INVALID_PHOTO));
        }
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(params.base64.trim())
            .map_err(|_| BridgeError::validation(INVALID_PHOTO))?;
        if !self.sanitizer.is_valid_image_payload(&bytes, self.max_upload_bytes) {
            return Err(BridgeError::validation(INVALID_PHOTO));
        }

        let filename = self.sanitizer.sanitize_filename(&params.filename);
        let path = self.attachments.store(&filename, &bytes).await?;

        self.live_session(&params.session_id)?
            .write(format!("[Photo uploaded: {}]\r", path.display()))?;
        tracing::info!(conn, session_id = %params.session_id, path = %path.display(), size = bytes.len(), "photo uploaded");
        Ok(vec![])
    }
}
