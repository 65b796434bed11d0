//! Integration tests for the lightrag_server library
//!
//! These tests verify the public API and module interactions.

use std::sync::Arc;

use tempfile::TempDir;

use lightrag_server::background::pipeline_index_file;
use lightrag_server::config::{ConfigManager, ConfigStore, LlmConfigPayload};
use lightrag_server::integrations::{ClientsHandle, ModelClients, RagSettings};
use lightrag_server::lightrag::{Chunker, DocStatus, QueryMode, QueryParam};
use lightrag_server::{Error, LightRagManager, StorageLayout};

const DOC: &str = "Alice works at Acme Corporation in Berlin. Bob manages Acme Corporation.";

fn manager(tmp: &TempDir) -> LightRagManager {
    let layout = StorageLayout::new(tmp.path());
    layout.create_all().unwrap();
    let config = ConfigManager::new(ConfigStore::new(
        layout.config_file(),
        layout.config_backups_dir(),
    ));
    let clients = ClientsHandle::new(ModelClients::local(RagSettings::default(), 128));
    LightRagManager::with_clients(layout, config, clients)
}

// ============================================================================
// Collections
// ============================================================================

#[tokio::test]
async fn test_collections_are_isolated() {
    let tmp = TempDir::new().unwrap();
    let mgr = manager(&tmp);
    let alpha = mgr.create_rag_instance("alpha").await.unwrap();
    let beta = mgr.create_rag_instance("beta").await.unwrap();

    alpha
        .enqueue_documents(vec![(DOC.to_string(), "a.txt".to_string())], "t1")
        .await
        .unwrap();
    alpha.process_enqueued().await.unwrap();

    assert_eq!(alpha.doc_status().len(), 1);
    assert!(beta.doc_status().is_empty());
    assert!(beta.graph_labels().unwrap().is_empty());

    let listed = mgr.list_collections().await.unwrap();
    let ids: Vec<&str> = listed.iter().map(|c| c.collection_id.as_str()).collect();
    assert_eq!(ids, vec!["alpha", "beta"]);
    assert_eq!(listed[0].doc_status.len(), 1);
}

#[tokio::test]
async fn test_get_instance_of_missing_collection() {
    let tmp = TempDir::new().unwrap();
    let mgr = manager(&tmp);
    assert!(mgr.get_rag_instance("ghost").await.unwrap().is_none());
    assert!(matches!(
        mgr.get_rag_instance("../escape").await,
        Err(Error::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn test_instances_are_cached() {
    let tmp = TempDir::new().unwrap();
    let mgr = manager(&tmp);
    let first = mgr.create_rag_instance("alpha").await.unwrap();
    let second = mgr.get_rag_instance("alpha").await.unwrap().unwrap();
    assert!(Arc::ptr_eq(&first, &second));
}

// ============================================================================
// Indexing, query and deletion
// ============================================================================

#[tokio::test]
async fn test_file_to_query_to_delete() {
    let tmp = TempDir::new().unwrap();
    let mgr = manager(&tmp);
    let rag = mgr.create_rag_instance("alpha").await.unwrap();
    let inputs = mgr.input_manager("alpha").unwrap();
    let file = inputs.input_dir().join("report.md");
    std::fs::write(&file, DOC).unwrap();

    pipeline_index_file(Arc::clone(&rag), &file, "track_it").await;

    let docs = rag.get_docs_by_track_id("track_it").unwrap();
    assert_eq!(docs.len(), 1);
    let (doc_id, status) = &docs[0];
    assert_eq!(status.status, DocStatus::Processed);
    assert_eq!(status.file_path, "report.md");
    assert!(!file.exists());

    let param = QueryParam {
        mode: QueryMode::Mix,
        only_need_context: true,
        ..Default::default()
    };
    let context = rag
        .query("Where does Alice work?", &param)
        .await
        .unwrap()
        .into_text();
    assert!(context.contains("Alice"));

    let deleted = rag.delete_by_doc_id(doc_id).await;
    assert_eq!(deleted.status, "success");
    assert!(rag.doc_status().is_empty());
    assert!(rag.chunks_by_doc_id(doc_id).unwrap().is_empty());
    assert!(!rag.entity_exists("Alice").unwrap().exists);
}

#[tokio::test]
async fn test_pdf_upload_is_indexed() {
    let tmp = TempDir::new().unwrap();
    let mgr = manager(&tmp);
    let rag = mgr.create_rag_instance("alpha").await.unwrap();
    let inputs = mgr.input_manager("alpha").unwrap();
    let file = inputs.input_dir().join("report.pdf");
    let fixture = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/report.pdf");
    std::fs::copy(&fixture, &file).unwrap();

    pipeline_index_file(Arc::clone(&rag), &file, "track_pdf").await;

    let docs = rag.get_docs_by_track_id("track_pdf").unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].1.status, DocStatus::Processed);
    assert!(rag.entity_exists("Alice").unwrap().exists);
}

#[tokio::test]
async fn test_corrupt_pdf_is_recorded_as_failed() {
    let tmp = TempDir::new().unwrap();
    let mgr = manager(&tmp);
    let rag = mgr.create_rag_instance("alpha").await.unwrap();
    let inputs = mgr.input_manager("alpha").unwrap();
    let file = inputs.input_dir().join("scan.pdf");
    std::fs::write(&file, b"truncated upload, not a pdf").unwrap();

    pipeline_index_file(Arc::clone(&rag), &file, "track_bad").await;

    let docs = rag.get_docs_by_track_id("track_bad").unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].1.status, DocStatus::Failed);
    assert!(docs[0].1.content_summary.starts_with("[File Extraction]"));
}

// ============================================================================
// Configuration
// ============================================================================

#[tokio::test]
async fn test_config_update_survives_new_manager() {
    let tmp = TempDir::new().unwrap();
    let layout = StorageLayout::new(tmp.path());
    let config = ConfigManager::new(ConfigStore::new(
        layout.config_file(),
        layout.config_backups_dir(),
    ));
    config
        .update_llm(LlmConfigPayload {
            llm_binding: Some("ollama".into()),
            llm_model: Some("qwen2.5".into()),
            ..Default::default()
        })
        .await
        .unwrap();

    let fresh = ConfigManager::new(ConfigStore::new(
        layout.config_file(),
        layout.config_backups_dir(),
    ));
    let loaded = fresh.get().await.unwrap();
    assert_eq!(loaded.llm_config.llm_model.as_deref(), Some("qwen2.5"));
}

// ============================================================================
// Chunking
// ============================================================================

#[test]
fn test_chunker_ids_are_content_hashes() {
    let chunker = Chunker::new(1200, 100);
    let a = chunker.chunk(DOC, "doc-1", "a.txt");
    let b = chunker.chunk(DOC, "doc-1", "b.txt");
    assert_eq!(a.len(), 1);
    assert_eq!(a[0].id, b[0].id);
    assert!(a[0].id.starts_with("chunk-"));
    assert_eq!(a[0].chunk_order_index, 0);
}
