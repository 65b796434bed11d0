use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use axum::extract::{Multipart, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::{success, timestamp, ApiError, ApiResult, AppState, CollectionQuery, GenericResponse};
use crate::background::{background_delete_documents, pipeline_index_file, run_scanning_process};
use crate::documents::{dotted_extension, sanitize_filename};
use crate::lightrag::utils::generate_track_id;
use crate::lightrag::DocProcessingStatus;

type Reply = ApiResult<Json<GenericResponse<Value>>>;

fn document_json(id: &str, collection_id: &str, doc: &DocProcessingStatus) -> Value {
    let file_path = if doc.file_path.is_empty() {
        "no-file-path"
    } else {
        doc.file_path.as_str()
    };
    json!({
        "id": id,
        "collection_id": collection_id,
        "content_summary": doc.content_summary,
        "content_length": doc.content_length,
        "status": doc.status,
        "created_at": doc.created_at,
        "updated_at": doc.updated_at,
        "track_id": doc.track_id,
        "chunks_count": doc.chunks_count,
        "error_msg": doc.error_msg,
        "metadata": doc.metadata,
        "file_path": file_path,
    })
}

pub async fn list_documents(State(state): State<AppState>, Query(q): Query<CollectionQuery>) -> Reply {
    let rag = state.collection(&q.collection_id).await?;
    let documents: Vec<Value> = rag
        .doc_status()
        .all()?
        .iter()
        .map(|(id, doc)| document_json(id, &q.collection_id, doc))
        .collect();
    let total = documents.len();
    let status_counts = rag.doc_status().status_counts()?;
    Ok(success(
        format!("Found {total} documents in collection '{}'", q.collection_id),
        json!({
            "documents": documents,
            "total_documents": total,
            "status_counts": status_counts,
            "collection_id": q.collection_id,
        }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct ChunkQuery {
    pub collection_id: String,
    pub doc_id: String,
    #[serde(default = "default_chunk_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

fn default_chunk_limit() -> usize {
    10
}

pub async fn document_chunks(State(state): State<AppState>, Query(q): Query<ChunkQuery>) -> Reply {
    let rag = state.collection(&q.collection_id).await?;
    let all = rag.chunks_by_doc_id(&q.doc_id)?;
    let total = all.len();
    let chunks: Vec<Value> = all
        .into_iter()
        .skip(q.offset)
        .take(q.limit)
        .enumerate()
        .map(|(i, (id, chunk))| {
            let id = if id.is_empty() {
                format!("{}_chunk_{i}", q.doc_id)
            } else {
                id
            };
            json!({
                "id": id,
                "content": chunk.get("content").cloned().unwrap_or(json!("")),
                "document_id": q.doc_id,
                "chunk_index": q.offset + i,
                "metadata": {
                    "tokens": chunk.get("tokens").cloned().unwrap_or(Value::Null),
                    "chunk_order_index": chunk.get("chunk_order_index").cloned().unwrap_or(Value::Null),
                    "file_path": chunk.get("file_path").cloned().unwrap_or(Value::Null),
                },
            })
        })
        .collect();
    Ok(success(
        format!("Found {total} chunks for document '{}'", q.doc_id),
        json!({
            "doc_id": q.doc_id,
            "chunks": chunks,
            "total_chunks": total,
            "limit": q.limit,
            "offset": q.offset,
        }),
    ))
}

pub async fn upload(
    State(state): State<AppState>,
    Query(q): Query<CollectionQuery>,
    mut multipart: Multipart,
) -> Reply {
    let mut upload = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("Invalid multipart body: {e}")))?
    {
        if field.name() == Some("file") {
            let name = field.file_name().unwrap_or_default().to_string();
            let bytes = field
                .bytes()
                .await
                .map_err(|e| ApiError::bad_request(format!("Failed to read upload: {e}")))?;
            upload = Some((name, bytes));
            break;
        }
    }
    let Some((raw_name, bytes)) = upload else {
        return Err(ApiError::unprocessable("Field 'file' is required"));
    };

    let rag = state.manager.create_rag_instance(&q.collection_id).await?;
    let docs = state.manager.input_manager(&q.collection_id)?;
    let filename = sanitize_filename(&raw_name, docs.input_dir())?;
    if !docs.is_supported_file(&filename) {
        return Err(ApiError::bad_request(format!(
            "Unsupported file type. Supported types: {}",
            docs.supported_extensions_display()
        )));
    }

    let target = docs.input_dir().join(&filename);
    if target.exists() {
        return Ok(success(
            "File duplicate check completed",
            json!({
                "filename": filename,
                "upload_status": "duplicated",
                "message": format!("File '{filename}' already exists in the input directory."),
                "track_id": "",
                "processing_started": false,
                "timestamp": timestamp(),
            }),
        ));
    }

    tokio::fs::write(&target, &bytes)
        .await
        .map_err(crate::Error::from)?;
    let track_id = generate_track_id("upload");
    info!(collection_id = %q.collection_id, file = %filename, %track_id, "File uploaded");

    let task_track = track_id.clone();
    let task_rag = Arc::clone(&rag);
    state.service.spawn_task("index_file", async move {
        pipeline_index_file(task_rag, &target, &task_track).await;
    });

    Ok(success(
        "File uploaded successfully",
        json!({
            "filename": filename,
            "file_size": bytes.len(),
            "file_type": dotted_extension(std::path::Path::new(&filename)),
            "upload_status": "success",
            "message": format!("File '{filename}' uploaded successfully. Processing will continue in background."),
            "track_id": track_id,
            "processing_started": true,
            "timestamp": timestamp(),
        }),
    ))
}

/// Index whatever was dropped into the collection's input directory.
pub async fn scan(State(state): State<AppState>, Query(q): Query<CollectionQuery>) -> Reply {
    let rag = state.manager.create_rag_instance(&q.collection_id).await?;
    let docs = state.manager.input_manager(&q.collection_id)?;
    let track_id = generate_track_id("scan");
    info!(collection_id = %q.collection_id, %track_id, "Scanning input directory");

    let task_track = track_id.clone();
    state.service.spawn_task("scan_inputs", async move {
        run_scanning_process(rag, docs, &task_track).await;
    });

    Ok(success(
        "Scanning started",
        json!({
            "status": "scanning_started",
            "message": "Scanning process has been initiated in the background",
            "track_id": track_id,
        }),
    ))
}

pub async fn pipeline_status(State(state): State<AppState>, Query(q): Query<CollectionQuery>) -> Reply {
    let rag = state.collection(&q.collection_id).await?;
    let snapshot = rag.pipeline().lock().await.snapshot(rag.storage_namespaces());
    let mut data = serde_json::to_value(snapshot).map_err(crate::Error::from)?;
    data["timestamp"] = json!(timestamp());
    Ok(success("Pipeline status retrieved", data))
}

#[derive(Debug, Deserialize)]
pub struct TrackQuery {
    pub collection_id: String,
    #[serde(default)]
    pub track_id: String,
}

pub async fn track_status(State(state): State<AppState>, Query(q): Query<TrackQuery>) -> Reply {
    let track_id = q.track_id.trim().to_string();
    if track_id.is_empty() {
        return Err(ApiError::bad_request("Track ID cannot be empty"));
    }
    let rag = state.collection(&q.collection_id).await?;
    let docs = rag.get_docs_by_track_id(&track_id)?;
    let mut summary: BTreeMap<&str, usize> = BTreeMap::new();
    for (_, doc) in &docs {
        *summary.entry(doc.status.as_str()).or_default() += 1;
    }
    let documents: Vec<Value> = docs
        .iter()
        .map(|(id, doc)| document_json(id, &q.collection_id, doc))
        .collect();
    Ok(success(
        format!("Found {} documents for track ID '{track_id}'", documents.len()),
        json!({
            "track_id": track_id,
            "total_count": documents.len(),
            "documents": documents,
            "status_summary": summary,
            "timestamp": timestamp(),
        }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct DeleteRequest {
    pub doc_ids: Vec<String>,
    #[serde(default)]
    pub delete_file: bool,
}

/// Trimmed, non-empty, unique ids.
fn validate_doc_ids(ids: &[String]) -> ApiResult<Vec<String>> {
    if ids.is_empty() {
        return Err(ApiError::unprocessable("doc_ids cannot be empty"));
    }
    let trimmed: Vec<String> = ids.iter().map(|id| id.trim().to_string()).collect();
    if trimmed.iter().any(String::is_empty) {
        return Err(ApiError::unprocessable("doc_ids cannot contain empty strings"));
    }
    let unique: HashSet<&String> = trimmed.iter().collect();
    if unique.len() != trimmed.len() {
        return Err(ApiError::unprocessable("doc_ids must be unique"));
    }
    Ok(trimmed)
}

pub async fn delete_documents(
    State(state): State<AppState>,
    Query(q): Query<CollectionQuery>,
    Json(req): Json<DeleteRequest>,
) -> Reply {
    let doc_ids = validate_doc_ids(&req.doc_ids)?;
    let rag = state.collection(&q.collection_id).await?;
    let operation_id = chrono::Local::now().format("del_%Y%m%d_%H%M%S").to_string();
    let affected = doc_ids.len();
    let delete_file = req.delete_file;
    let files_to_delete = if delete_file { affected } else { 0 };

    let (status, message) = if !rag.enable_llm_cache_for_entity_extract() {
        (
            "not_allowed",
            "Deletion requires ENABLE_LLM_CACHE_FOR_ENTITY_EXTRACT to be enabled so affected entities can be rebuilt".to_string(),
        )
    } else if rag.pipeline().lock().await.busy {
        (
            "busy",
            "Pipeline is busy with another operation, try again later".to_string(),
        )
    } else {
        let docs = state.manager.input_manager(&q.collection_id)?;
        let ids = doc_ids.clone();
        let task_rag = Arc::clone(&rag);
        state.service.spawn_task("delete_documents", async move {
            background_delete_documents(task_rag, docs, ids, delete_file).await;
        });
        (
            "deletion_started",
            format!("Document deletion for {affected} document(s) has been initiated. Processing will continue in background."),
        )
    };
    if status != "deletion_started" {
        warn!(collection_id = %q.collection_id, status, "Document deletion refused");
    }

    Ok(success(
        message.clone(),
        json!({
            "operation_id": operation_id,
            "status": status,
            "message": message,
            "affected_documents": affected,
            "files_to_delete": files_to_delete,
            "timestamp": timestamp(),
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doc_id_validation() {
        let ids = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        assert_eq!(validate_doc_ids(&ids(&[" a ", "b"])).unwrap(), ids(&["a", "b"]));
        assert_eq!(
            validate_doc_ids(&[]).unwrap_err().message,
            "doc_ids cannot be empty"
        );
        assert_eq!(
            validate_doc_ids(&ids(&["a", " "])).unwrap_err().message,
            "doc_ids cannot contain empty strings"
        );
        assert_eq!(
            validate_doc_ids(&ids(&["a", "a "])).unwrap_err().message,
            "doc_ids must be unique"
        );
    }
}
