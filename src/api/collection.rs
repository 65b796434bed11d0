use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use super::{success, ApiError, ApiResult, AppState, CollectionQuery, GenericResponse};
use crate::manager::CollectionEntry;

#[derive(Debug, Serialize)]
pub struct CollectionInfo {
    pub collection_id: String,
    pub documents: Vec<Value>,
}

/// Raw doc-status entries with the listing defaults applied.
fn collection_info(entry: CollectionEntry) -> CollectionInfo {
    let documents = entry
        .doc_status
        .into_iter()
        .map(|(doc_id, status)| {
            let field = |key: &str, default: Value| {
                status.get(key).filter(|v| !v.is_null()).cloned().unwrap_or(default)
            };
            json!({
                "doc_id": doc_id,
                "status": field("status", json!("unknown")),
                "chunks_count": field("chunks_count", json!(0)),
                "chunks_list": field("chunks_list", json!([])),
                "content_summary": field("content_summary", Value::Null),
                "content_length": field("content_length", Value::Null),
                "created_at": field("created_at", Value::Null),
                "updated_at": field("updated_at", Value::Null),
                "file_path": field("file_path", Value::Null),
                "track_id": field("track_id", Value::Null),
                "metadata": field("metadata", json!({})),
                "error_msg": field("error_msg", Value::Null),
            })
        })
        .collect();
    CollectionInfo {
        collection_id: entry.collection_id,
        documents,
    }
}

pub async fn list_collections(
    State(state): State<AppState>,
) -> ApiResult<Json<GenericResponse<Value>>> {
    let collections: Vec<CollectionInfo> = state
        .manager
        .list_collections()
        .await?
        .into_iter()
        .map(collection_info)
        .collect();
    let total = collections.len();
    Ok(success(
        format!("Found {total} collections"),
        json!({"collections": collections, "total_collections": total}),
    ))
}

pub async fn create_collection(
    State(state): State<AppState>,
    Query(q): Query<CollectionQuery>,
) -> ApiResult<Json<GenericResponse<Value>>> {
    state.manager.create_rag_instance(&q.collection_id).await?;
    info!(collection_id = %q.collection_id, "Collection created");
    Ok(success(
        format!("Collection '{}' created successfully.", q.collection_id),
        json!({"collection_id": q.collection_id, "created_at": super::timestamp()}),
    ))
}

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    pub collection_ids: Vec<String>,
}

pub async fn batch_collections(
    State(state): State<AppState>,
    Json(req): Json<BatchRequest>,
) -> ApiResult<Json<GenericResponse<Value>>> {
    let listed = state.manager.list_collections().await?;
    let mut found = Vec::new();
    let mut missing = Vec::new();
    for id in &req.collection_ids {
        match listed.iter().find(|c| &c.collection_id == id) {
            Some(entry) => found.push(collection_info(entry.clone())),
            None => missing.push(id.clone()),
        }
    }
    let (found_count, requested) = (found.len(), req.collection_ids.len());
    Ok(success(
        format!("Found {found_count} out of {requested} requested collections"),
        json!({
            "collections": found,
            "found_count": found_count,
            "requested_count": requested,
            "missing_collections": missing,
        }),
    ))
}

pub async fn delete_collection(
    State(state): State<AppState>,
    Query(q): Query<CollectionQuery>,
) -> ApiResult<Json<GenericResponse<Value>>> {
    let id = q.collection_id;
    if !state.manager.collection_exists(&id).await? {
        return Err(ApiError::collection_not_found());
    }
    if let Some(rag) = state.manager.clear_rag_instance(&id).await {
        if rag.pipeline().lock().await.busy {
            warn!(collection_id = %id, "Deleting collection while its pipeline is busy");
        }
    }

    let deleted = state.manager.input_manager(&id)?.clear()?;
    let inputs = state.manager.layout().inputs_dir().join(&id);
    if inputs.is_dir() {
        std::fs::remove_dir_all(&inputs).map_err(crate::Error::from)?;
    }
    let workspace = state.manager.collection_dir(&id).await?;
    let workspace_cleared = match std::fs::remove_dir_all(&workspace) {
        Ok(()) => true,
        Err(err) => {
            warn!(collection_id = %id, "Failed to remove workspace: {err}");
            false
        }
    };
    info!(collection_id = %id, deleted, "Collection cleared");
    Ok(success(
        format!("All documents in collection '{id}' have been cleared."),
        json!({
            "collection_id": id,
            "deleted_documents_count": deleted,
            "workspace_cleared": workspace_cleared,
        }),
    ))
}
