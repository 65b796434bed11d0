use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{ApiError, ApiResult, AppState, CollectionQuery};
use crate::integrations::openai::ChatMessage;
use crate::lightrag::{QueryMode, QueryParam};

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    #[serde(default)]
    pub mode: QueryMode,
    #[serde(default)]
    pub only_need_context: bool,
    #[serde(default)]
    pub only_need_prompt: bool,
    pub response_type: Option<String>,
    pub top_k: Option<usize>,
    pub chunk_top_k: Option<usize>,
    pub max_entity_tokens: Option<usize>,
    pub max_relation_tokens: Option<usize>,
    pub max_total_tokens: Option<usize>,
    #[serde(default)]
    pub conversation_history: Vec<ChatMessage>,
    pub history_turns: Option<usize>,
    pub user_prompt: Option<String>,
    pub enable_rerank: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct QueryResponse {
    pub response: String,
}

impl QueryRequest {
    /// Validate and convert into engine parameters plus the trimmed query.
    fn into_param(self) -> ApiResult<(String, QueryParam)> {
        let query = self.query.trim().to_string();
        if query.is_empty() {
            return Err(ApiError::unprocessable("query must contain at least 1 character"));
        }
        let limits = [
            ("top_k", self.top_k),
            ("chunk_top_k", self.chunk_top_k),
            ("max_entity_tokens", self.max_entity_tokens),
            ("max_relation_tokens", self.max_relation_tokens),
            ("max_total_tokens", self.max_total_tokens),
        ];
        if let Some((name, _)) = limits.iter().find(|(_, v)| *v == Some(0)) {
            return Err(ApiError::unprocessable(format!("{name} must be greater than or equal to 1")));
        }
        if self
            .conversation_history
            .iter()
            .any(|m| m.role != "user" && m.role != "assistant")
        {
            return Err(ApiError::unprocessable(
                "Each message must have a 'role' key with value 'user' or 'assistant'.",
            ));
        }

        let param = QueryParam {
            mode: self.mode,
            only_need_context: self.only_need_context,
            only_need_prompt: self.only_need_prompt,
            response_type: self.response_type,
            top_k: self.top_k,
            chunk_top_k: self.chunk_top_k,
            max_entity_tokens: self.max_entity_tokens,
            max_relation_tokens: self.max_relation_tokens,
            max_total_tokens: self.max_total_tokens,
            conversation_history: self.conversation_history,
            history_turns: self.history_turns,
            user_prompt: self.user_prompt,
            enable_rerank: self.enable_rerank,
        };
        Ok((query, param))
    }
}

pub async fn query(
    State(state): State<AppState>,
    Query(q): Query<CollectionQuery>,
    Json(req): Json<QueryRequest>,
) -> ApiResult<Json<QueryResponse>> {
    let (text, param) = req.into_param()?;
    let rag = state.collection(&q.collection_id).await?;
    info!(collection_id = %q.collection_id, mode = %param.mode, "Query received");
    let result = rag.query(&text, &param).await?;
    Ok(Json(QueryResponse {
        response: result.into_text(),
    }))
}
