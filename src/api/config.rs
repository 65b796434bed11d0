use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::{success, success_data, ApiError, ApiResult, AppState, GenericResponse};
use crate::config::{
    AppConfig, ConfigSection, EmbeddingConfig, EmbeddingConfigPayload, LlmConfig,
    LlmConfigPayload, RerankConfig, RerankConfigPayload,
};
use crate::integrations::{Embedder, LlmBackend, RerankClient};

const DEFAULT_LLM_PROMPT: &str = "你好";
const DEFAULT_EMBEDDING_TEXT: &str = "Test embedding";
const DEFAULT_RERANK_QUERY: &str = "什么是机器学习？";
const DEFAULT_RERANK_DOCUMENTS: [&str; 3] = [
    "机器学习是人工智能的一个重要分支。",
    "深度学习是机器学习的子集。",
    "神经网络是深度学习的基础。",
];

type Reply<T> = ApiResult<Json<GenericResponse<T>>>;

/// Rebuild the model clients after a config change; the saved config stays either way.
async fn refresh(state: &AppState) {
    if let Err(err) = state.manager.refresh_clients().await {
        warn!("Config saved but model clients were not rebuilt: {err}");
    }
}

pub async fn get_config(State(state): State<AppState>) -> Reply<AppConfig> {
    let config = state.manager.config().reload().await?;
    Ok(success_data(config))
}

pub async fn update_llm(
    State(state): State<AppState>,
    Json(payload): Json<LlmConfigPayload>,
) -> Reply<LlmConfig> {
    let llm = state.manager.config().update_llm(payload).await?;
    refresh(&state).await;
    Ok(success("LLM config updated", llm))
}

pub async fn update_embedding(
    State(state): State<AppState>,
    Json(payload): Json<EmbeddingConfigPayload>,
) -> Reply<EmbeddingConfig> {
    let embedding = state.manager.config().update_embedding(payload).await?;
    refresh(&state).await;
    Ok(success("Embedding config updated", embedding))
}

pub async fn update_rerank(
    State(state): State<AppState>,
    Json(payload): Json<RerankConfigPayload>,
) -> Reply<RerankConfig> {
    let rerank = state.manager.config().update_rerank(payload).await?;
    refresh(&state).await;
    Ok(success("Rerank config updated", rerank))
}

#[derive(Debug, Deserialize)]
pub struct TestPayload {
    #[serde(default)]
    pub target: String,
    pub message: Option<String>,
    pub documents: Option<Vec<String>>,
}

fn test_failure(err: impl std::fmt::Display) -> ApiError {
    ApiError::internal(err.to_string())
}

/// Exercise one provider with the stored configuration.
pub async fn test_config(
    State(state): State<AppState>,
    Json(payload): Json<TestPayload>,
) -> Reply<Value> {
    let target = payload.target.trim().to_ascii_lowercase();
    if !matches!(target.as_str(), "llm" | "embedding" | "rerank") {
        return Err(ApiError::bad_request(
            "Unsupported test target. Use 'llm', 'embedding' or 'rerank'.",
        ));
    }
    let config = state.manager.config().get().await?;
    info!(target = %target, "Testing provider connection");

    match target.as_str() {
        "llm" => {
            let llm = LlmBackend::from_config(&config.llm_config)
                .map_err(test_failure)?
                .ok_or_else(|| test_failure("LLM binding is not configured"))?;
            llm.check_available().await.map_err(test_failure)?;
            let prompt = payload.message.as_deref().unwrap_or(DEFAULT_LLM_PROMPT);
            let result = llm.complete(None, &[], prompt).await.map_err(test_failure)?;
            Ok(success("LLM test succeeded", json!({"result": result})))
        }
        "embedding" => {
            let embedder = Embedder::from_config(&config.embedding_config).map_err(test_failure)?;
            let text = payload
                .message
                .unwrap_or_else(|| DEFAULT_EMBEDDING_TEXT.to_string());
            let result = embedder.embed(&[text]).await.map_err(test_failure)?;
            Ok(success("Embedding test succeeded", json!({"result": result})))
        }
        _ => {
            let reranker = RerankClient::from_config(&config.rerank_config)
                .map_err(test_failure)?
                .ok_or_else(|| test_failure("Rerank binding is not configured"))?;
            let query = payload.message.as_deref().unwrap_or(DEFAULT_RERANK_QUERY);
            let documents = payload.documents.unwrap_or_else(|| {
                DEFAULT_RERANK_DOCUMENTS.iter().map(|d| d.to_string()).collect()
            });
            let ranked = reranker
                .rerank(query, &documents, Some(documents.len()))
                .await
                .map_err(test_failure)?;
            let result: Vec<Value> = ranked
                .iter()
                .map(|r| {
                    json!({
                        "index": r.index,
                        "relevance_score": r.relevance_score,
                        "document": documents.get(r.index),
                    })
                })
                .collect();
            Ok(success(
                format!("Rerank test succeeded (using {} provider)", reranker.binding()),
                json!({"result": result}),
            ))
        }
    }
}

pub async fn info(State(state): State<AppState>) -> Reply<Value> {
    let info = state.manager.config().store().info();
    Ok(success("Config info retrieved", json!(info)))
}

pub async fn backups(State(state): State<AppState>) -> Reply<Value> {
    let backups = state.manager.config().store().list_backups();
    let total = backups.len();
    Ok(success(
        format!("Found {total} config backups"),
        json!({"backups": backups, "total_backups": total}),
    ))
}

#[derive(Debug, Default, Deserialize)]
pub struct RestoreRequest {
    pub backup_file: Option<String>,
}

pub async fn restore(
    State(state): State<AppState>,
    Json(req): Json<RestoreRequest>,
) -> Reply<AppConfig> {
    let config = state
        .manager
        .config()
        .restore(req.backup_file.as_deref())
        .await?;
    refresh(&state).await;
    Ok(success("Config restored from backup", config))
}

#[derive(Debug, Deserialize)]
pub struct ResetRequest {
    pub config_type: String,
}

pub async fn reset(
    State(state): State<AppState>,
    Json(req): Json<ResetRequest>,
) -> Reply<AppConfig> {
    let section: ConfigSection = req.config_type.parse()?;
    let config = state.manager.config().reset(section).await?;
    refresh(&state).await;
    Ok(success(
        format!("Config '{}' reset to defaults", req.config_type.trim().to_ascii_lowercase()),
        config,
    ))
}
