//! Background jobs spawned by the document routes.

use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::constants::{ENQUEUED_DIR, FILE_EXTRACTION_PREFIX};
use crate::documents::{extract_text, unique_enqueued_name, DocumentManager};
use crate::lightrag::{ErrorFile, LightRag};

fn error_file(path: &Path, description: &str, original: String, size: usize) -> ErrorFile {
    ErrorFile {
        file_path: file_name(path),
        error_description: format!("{FILE_EXTRACTION_PREFIX}{description}"),
        original_error: original,
        file_size: size,
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

async fn record_failure(rag: &LightRag, file: ErrorFile, track_id: &str) {
    warn!(
        file = %file.file_path,
        "{}: {}",
        file.error_description,
        file.original_error
    );
    if let Err(err) = rag.enqueue_error_documents(vec![file], track_id).await {
        error!("Failed to record extraction error: {err}");
    }
}

/// Read, extract and enqueue one file, then archive it under `__enqueued__`.
pub async fn pipeline_enqueue_file(rag: &LightRag, path: &Path, track_id: &str) -> bool {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) => {
            let description = match err.kind() {
                ErrorKind::PermissionDenied => "Permission denied - cannot read file",
                ErrorKind::NotFound => "File not found",
                _ => "File reading error",
            };
            record_failure(rag, error_file(path, description, err.to_string(), 0), track_id).await;
            return false;
        }
    };

    let name = file_name(path);
    let content = match extract_text(&name, &bytes) {
        Ok(text) => text,
        Err(failure) => {
            let file = ErrorFile {
                file_path: name,
                error_description: failure.description,
                original_error: failure.original_error,
                file_size: bytes.len(),
            };
            record_failure(rag, file, track_id).await;
            return false;
        }
    };

    if let Err(err) = rag.enqueue_documents(vec![(content, name.clone())], track_id).await {
        error!(file = %name, "Failed to enqueue document: {err}");
        return false;
    }

    if let Some(parent) = path.parent() {
        let archive = parent.join(ENQUEUED_DIR);
        let moved = async {
            tokio::fs::create_dir_all(&archive).await?;
            let target = archive.join(unique_enqueued_name(&archive, &name));
            tokio::fs::rename(path, &target).await?;
            Ok::<_, std::io::Error>(target)
        }
        .await;
        match moved {
            Ok(target) => info!(file = %name, target = %target.display(), "Moved file to enqueued archive"),
            Err(err) => warn!(file = %name, "Failed to move file to enqueued archive: {err}"),
        }
    }
    info!(file = %name, track_id, "Successfully enqueued file");
    true
}

/// Enqueue a file and run the pipeline when that succeeded.
pub async fn pipeline_index_file(rag: Arc<LightRag>, path: &Path, track_id: &str) {
    if pipeline_enqueue_file(&rag, path, track_id).await {
        if let Err(err) = rag.process_enqueued().await {
            error!(file = %path.display(), "Indexing failed: {err}");
        }
    }
}

/// Enqueue every new supported file in the input directory, then index them.
pub async fn run_scanning_process(rag: Arc<LightRag>, docs: DocumentManager, track_id: &str) {
    let files = docs.scan_directory_for_new_files();
    info!(collection = rag.workspace(), count = files.len(), "Found new files to index");
    if files.is_empty() {
        return;
    }
    rag.pipeline().lock().await.autoscanned = true;

    let mut enqueued = 0;
    for path in &files {
        if pipeline_enqueue_file(&rag, path, track_id).await {
            enqueued += 1;
        }
        docs.mark_as_indexed(path);
    }
    if enqueued > 0 {
        if let Err(err) = rag.process_enqueued().await {
            error!(collection = rag.workspace(), "Indexing scanned files failed: {err}");
        }
    }
}

/// Remove the uploaded file and its archived copies.
async fn delete_source_files(
    rag: &LightRag,
    docs: &DocumentManager,
    doc_id: &str,
    file_path: Option<&str>,
) {
    let Some(file_name) = file_path.filter(|f| !f.is_empty() && *f != "no-file-path") else {
        rag.pipeline()
            .lock()
            .await
            .log(format!("File deletion skipped, missing file path: {doc_id}"));
        return;
    };

    let input = docs.input_dir().join(file_name);
    let message = if input.exists() {
        match tokio::fs::remove_file(&input).await {
            Ok(()) => format!("Successfully deleted input_dir file: {file_name}"),
            Err(err) => format!("Failed to delete input_dir file {file_name}: {err}"),
        }
    } else {
        format!("File deletion skipped, missing file: {file_name}")
    };
    rag.pipeline().lock().await.log(message);

    let named = Path::new(file_name);
    let stem = named
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = named
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let Ok(mut entries) = tokio::fs::read_dir(docs.enqueued_dir()).await else {
        return;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(&stem) && name.ends_with(&ext) {
            let message = match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => format!("Successfully deleted enqueued file: {name}"),
                Err(err) => format!("Failed to delete enqueued file {name}: {err}"),
            };
            rag.pipeline().lock().await.log(message);
        }
    }
}

/// Delete documents one by one while holding the pipeline busy flag.
pub async fn background_delete_documents(
    rag: Arc<LightRag>,
    docs: DocumentManager,
    doc_ids: Vec<String>,
    delete_file: bool,
) {
    let total = doc_ids.len();
    {
        let mut pipeline = rag.pipeline().lock().await;
        if pipeline.busy {
            warn!(collection = rag.workspace(), "Pipeline busy, deletion aborted");
            return;
        }
        pipeline.begin_job(&format!("Deleting {total} Documents"), total, total);
        pipeline.log("Starting document deletion process");
    }

    let mut succeeded = 0;
    let mut failed = 0;
    for (i, doc_id) in doc_ids.iter().enumerate() {
        let n = i + 1;
        {
            let mut pipeline = rag.pipeline().lock().await;
            pipeline.cur_batch = n;
            pipeline.log(format!("Deleting document {n}/{total}: {doc_id}"));
        }
        let result = rag.delete_by_doc_id(doc_id).await;
        let file = result.file_path.clone().unwrap_or_default();
        if result.status == "success" {
            succeeded += 1;
            rag.pipeline()
                .lock()
                .await
                .log(format!("Document deleted {n}/{total}: {doc_id}[{file}]"));
            if delete_file {
                delete_source_files(&rag, &docs, doc_id, result.file_path.as_deref()).await;
            }
        } else {
            failed += 1;
            let message = if result.status_code >= 500 {
                format!("Error deleting document {n}/{total}: {doc_id}[{file}] - {}", result.message)
            } else {
                format!("Failed to delete {n}/{total}: {doc_id}[{file}] - {}", result.message)
            };
            rag.pipeline().lock().await.log(message);
        }
    }

    let pending = {
        let mut pipeline = rag.pipeline().lock().await;
        pipeline.finish(format!(
            "Deletion completed: {succeeded} successful, {failed} failed"
        ));
        std::mem::take(&mut pipeline.request_pending)
    };
    if pending {
        info!(collection = rag.workspace(), "Processing documents queued during deletion");
        if let Err(err) = rag.process_enqueued().await {
            error!("Processing after deletion failed: {err}");
        }
    }
}
