//! LLM response cache on top of the `llm_response_cache` namespace.

use serde_json::{json, Value};

use super::storage::JsonKvStorage;
use super::utils::{compute_args_hash, now_rfc3339};
use crate::Result;

/// Cached answer lookup keyed by `{mode}:{cache_type}:{hash}`.
pub struct LlmCache<'a> {
    kv: &'a JsonKvStorage,
    enabled: bool,
}

impl<'a> LlmCache<'a> {
    pub fn new(kv: &'a JsonKvStorage, enabled: bool) -> Self {
        Self { kv, enabled }
    }

    pub fn key(mode: &str, cache_type: &str, parts: &[&str]) -> String {
        format!("{mode}:{cache_type}:{}", compute_args_hash(parts))
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        if !self.enabled {
            return Ok(None);
        }
        Ok(self
            .kv
            .get_by_id(key)?
            .and_then(|v| v.get("return").and_then(Value::as_str).map(str::to_string)))
    }

    pub fn put(
        &self,
        key: &str,
        answer: &str,
        cache_type: &str,
        chunk_id: Option<&str>,
        prompt: &str,
    ) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let mut entry = json!({
            "return": answer,
            "cache_type": cache_type,
            "original_prompt": prompt,
            "create_time": now_rfc3339(),
        });
        if let Some(chunk_id) = chunk_id {
            entry["chunk_id"] = Value::String(chunk_id.to_string());
        }
        self.kv.upsert([(key.to_string(), entry)])
    }

    /// Every cached extraction answer recorded for `chunk_id`.
    pub fn extraction_records(&self, chunk_id: &str) -> Result<Vec<String>> {
        Ok(self
            .kv
            .find_by_field("chunk_id", chunk_id)?
            .into_iter()
            .filter(|(_, v)| v.get("cache_type").and_then(Value::as_str) == Some("extract"))
            .filter_map(|(_, v)| v.get("return").and_then(Value::as_str).map(str::to_string))
            .collect())
    }

    /// Drop extraction entries of the given chunks. Runs even when disabled.
    pub fn drop_chunks(&self, chunk_ids: &[String]) -> Result<usize> {
        self.kv.delete_where(|v| {
            v.get("cache_type").and_then(Value::as_str) == Some("extract")
                && v.get("chunk_id")
                    .and_then(Value::as_str)
                    .is_some_and(|id| chunk_ids.iter().any(|c| c == id))
        })
    }
}
