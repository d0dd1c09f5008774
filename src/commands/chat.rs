//! Chat command: one inbound message, one full turn.

use serde::Deserialize;

use super::session::parse_session_id;
use crate::agent_core::{DeskError, TurnResponse};
use crate::AppState;

/// Default user id when the caller does not identify one.
const ANONYMOUS_USER: &str = "anonymous";

#[derive(Debug, Clone, Deserialize)]
pub struct SendMessageRequest {
    /// Omit to start a new session.
    #[serde(default)]
    pub session_id: Option<String>,
    pub text: String,
    #[serde(default)]
    pub user_id: Option<String>,
}

/// Run one turn and return the reply, flow state and transparency report.
pub async fn send_message(state: &AppState, request: SendMessageRequest) -> Result<TurnResponse, DeskError> {
    let session_id = request
        .session_id
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .map(parse_session_id)
        .transpose()?;
    let user_id = request.user_id.as_deref().unwrap_or(ANONYMOUS_USER);

    state
        .orchestrator
        .handle_message(session_id, &request.text, user_id)
        .await
}
