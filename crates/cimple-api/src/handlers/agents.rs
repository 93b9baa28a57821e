//! Agent handlers.

use axum::{Json, extract::State, http::StatusCode};
use cimple_scheduler::AgentSnapshot;
use serde::Serialize;
use std::sync::Arc;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct AgentResponse {
    pub id: String,
    pub hostname: Option<String>,
    pub connected_date: String,
    pub busy: bool,
}

impl From<&AgentSnapshot> for AgentResponse {
    fn from(agent: &AgentSnapshot) -> Self {
        Self {
            id: agent.id.as_uuid().to_string(),
            hostname: agent.hostname.clone(),
            connected_date: agent.connected_at.to_rfc3339(),
            busy: agent.busy,
        }
    }
}

pub async fn list_agents(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<AgentResponse>>, (StatusCode, String)> {
    let agents = state
        .agents
        .list()
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(Json(agents.iter().map(AgentResponse::from).collect()))
}
