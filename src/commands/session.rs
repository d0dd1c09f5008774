//! Session management commands.
//!
//! Start a session, read its history and reports, close it.

use serde::Serialize;

use crate::agent_core::types::{FlowState, Message, SessionId, TransparencyReport};
use crate::agent_core::DeskError;
use crate::AppState;

// ─── Response Types ─────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct StartSessionResponse {
    pub session_id: SessionId,
}

/// Full message history of a session.
#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub session_id: SessionId,
    pub flow_state: FlowState,
    pub closed: bool,
    pub turns: u32,
    pub messages: Vec<Message>,
}

#[derive(Debug, Serialize)]
pub struct CloseSessionResponse {
    pub ok: bool,
}

#[derive(Debug, Serialize)]
pub struct ReportsResponse {
    pub session_id: SessionId,
    pub reports: Vec<TransparencyReport>,
}

// ─── Commands ───────────────────────────────────────────────────────────────

pub fn start_session(state: &AppState) -> Result<StartSessionResponse, DeskError> {
    let session_id = state.orchestrator.store().create_session()?;
    Ok(StartSessionResponse { session_id })
}

pub fn get_history(state: &AppState, session_id: &str) -> Result<HistoryResponse, DeskError> {
    let session = state.orchestrator.store().get(parse_session_id(session_id)?)?;
    Ok(HistoryResponse {
        session_id: session.id,
        flow_state: session.flow_state,
        closed: session.closed,
        turns: session.turns,
        messages: session.messages,
    })
}

/// Close a session. Waits for an in-flight turn; closing twice is a no-op.
pub async fn close_session(state: &AppState, session_id: &str) -> Result<CloseSessionResponse, DeskError> {
    state.orchestrator.store().close(parse_session_id(session_id)?).await?;
    Ok(CloseSessionResponse { ok: true })
}

/// Transparency reports of every turn, oldest first.
pub fn list_reports(state: &AppState, session_id: &str) -> Result<ReportsResponse, DeskError> {
    let id = parse_session_id(session_id)?;
    let reports = state.orchestrator.store().list_reports(id)?;
    Ok(ReportsResponse {
        session_id: id,
        reports,
    })
}

pub(crate) fn parse_session_id(raw: &str) -> Result<SessionId, DeskError> {
    raw.parse().map_err(|e| DeskError::Validation {
        reason: format!("invalid session id '{raw}': {e}"),
    })
}
