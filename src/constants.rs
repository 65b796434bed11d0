//! Shared constants for the server and the RAG engine.

/// Separator used when several values are packed into one graph field.
pub const GRAPH_FIELD_SEP: &str = "<SEP>";

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub const DEFAULT_PORT: u16 = 9621;
pub const PORT_SEARCH_ATTEMPTS: u16 = 100;

pub const DEFAULT_SUMMARY_LANGUAGE: &str = "English";
pub const DEFAULT_RELATED_CHUNK_NUMBER: usize = 5;
pub const DEFAULT_MAX_FILE_PATH_LENGTH: usize = 32768;
pub const CONTENT_SUMMARY_CHARS: usize = 100;
pub const DEFAULT_RESPONSE_TYPE: &str = "Multiple Paragraphs";

/// Pipeline history retained in status responses.
pub const HISTORY_MESSAGES_LIMIT: usize = 1000;

pub const MAX_UPLOAD_BYTES: usize = 100 * 1024 * 1024;

/// Tasks older than this are reported as timed out.
pub const TASK_TIMEOUT_SECS: i64 = 300;
pub const SHUTDOWN_WAIT_SECS: u64 = 30;

pub const ENQUEUED_DIR: &str = "__enqueued__";
pub const FILE_EXTRACTION_PREFIX: &str = "[File Extraction]";

pub const FAIL_RESPONSE: &str =
    "Sorry, I'm not able to provide an answer to that question.[no-context]";
