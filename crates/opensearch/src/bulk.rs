//! Chunked bulk updates against the document store.
//!
//! Updates stream in, buffer up to a chunk threshold, and flush as a single
//! `_bulk` request. A failed chunk retries as a whole; per-item failures are
//! classified and logged but never retried, since sweeper updates are
//! idempotent and re-derived on the next run.

use futures::{
    pin_mut,
    Stream,
    TryStreamExt as _,
};
use serde_json::{
    json,
    Map,
    Value,
};

use crate::{
    retry::{
        with_retries,
        RetryPolicy,
    },
    BulkResponse,
    Client,
};
use common::knobs::SWEEPERS_BULK_CHUNK_SIZE;

/// Per-item error types that represent bad data rather than broken sweeper
/// behavior; logged as warnings.
const WARN_ERROR_TYPES: [&str; 2] = ["document_missing_exception", "mapper_parsing_exception"];

#[derive(Debug, Clone, PartialEq)]
pub struct InlineScript {
    pub source: String,
    pub params: Map<String, Value>,
}

/// One document update. Plain updates write `content` as a partial doc;
/// scripted updates run `script` server-side instead, with an empty upsert
/// when requested.
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub id: String,
    pub content: Map<String, Value>,
    pub script: Option<InlineScript>,
    pub upsert: bool,
}

impl Update {
    pub fn new(id: impl Into<String>, content: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            content,
            script: None,
            upsert: false,
        }
    }

    pub fn with_script(mut self, script: InlineScript) -> Self {
        self.script = Some(script);
        self
    }

    pub fn as_upsert(mut self) -> Self {
        self.upsert = true;
        self
    }

    /// The action/body NDJSON statement pair for this update.
    pub fn as_statements(&self) -> anyhow::Result<[String; 2]> {
        let action = json!({"update": {"_id": self.id}});
        let body = match &self.script {
            Some(script) => {
                let mut body = json!({
                    "script": {
                        "source": script.source,
                        "lang": "painless",
                        "params": script.params,
                    },
                });
                if self.upsert {
                    body["upsert"] = json!({});
                }
                body
            },
            None => {
                let mut body = json!({"doc": self.content});
                if self.upsert {
                    body["upsert"] = json!({});
                }
                body
            },
        };
        Ok([serde_json::to_string(&action)?, serde_json::to_string(&body)?])
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct WriteSummary {
    pub updates_written: u64,
    pub chunks_flushed: u64,
    pub item_warnings: u64,
    pub item_errors: u64,
}

/// Drain `updates`, writing them back in chunks of
/// `*SWEEPERS_BULK_CHUNK_SIZE*` updates apiece.
pub async fn write_updated_docs(
    client: &Client,
    index: &str,
    updates: impl Stream<Item = anyhow::Result<Update>>,
) -> anyhow::Result<WriteSummary> {
    let chunk_size = *SWEEPERS_BULK_CHUNK_SIZE;
    let policy = RetryPolicy::default();
    let mut summary = WriteSummary::default();
    let mut statements: Vec<String> = Vec::new();
    let mut buffered_updates = 0usize;

    pin_mut!(updates);
    while let Some(update) = updates.try_next().await? {
        let [action, body] = update.as_statements()?;
        statements.push(action);
        statements.push(body);
        buffered_updates += 1;
        if buffered_updates >= chunk_size {
            tracing::info!(
                "Bulk update chunk threshold reached ({chunk_size} updates), writing chunk..."
            );
            flush_chunk(client, index, policy, &mut statements, &mut summary).await?;
            buffered_updates = 0;
        }
    }
    if buffered_updates > 0 {
        tracing::info!("Writing {buffered_updates} remaining updates...");
        flush_chunk(client, index, policy, &mut statements, &mut summary).await?;
    }
    Ok(summary)
}

async fn flush_chunk(
    client: &Client,
    index: &str,
    policy: RetryPolicy,
    statements: &mut Vec<String>,
    summary: &mut WriteSummary,
) -> anyhow::Result<()> {
    let updates_in_chunk = (statements.len() / 2) as u64;
    let ndjson = {
        let mut body = statements.join("\n");
        body.push('\n');
        body
    };
    statements.clear();

    let response = with_retries(policy, "bulk update chunk", || {
        client.bulk(index, &ndjson)
    })
    .await?;

    let (warnings, errors) = classify_bulk_response(&response);
    summary.updates_written += updates_in_chunk;
    summary.chunks_flushed += 1;
    summary.item_warnings += warnings;
    summary.item_errors += errors;
    tracing::debug!("Successfully wrote bulk updates chunk ({updates_in_chunk} updates)");
    Ok(())
}

/// Walk per-item results, logging failures. Returns (warnings, errors).
fn classify_bulk_response(response: &BulkResponse) -> (u64, u64) {
    if !response.errors {
        return (0, 0);
    }
    let mut warnings = 0;
    let mut errors = 0;
    for item in &response.items {
        let Some(update_result) = item.get("update") else {
            continue;
        };
        let Some(error) = update_result.get("error") else {
            continue;
        };
        let id = update_result
            .get("_id")
            .and_then(Value::as_str)
            .unwrap_or("<unknown>");
        let error_type = error.get("type").and_then(Value::as_str).unwrap_or("");
        if WARN_ERROR_TYPES.contains(&error_type) {
            warnings += 1;
            tracing::warn!("Attempt to update document {id} failed due to {error_type}");
        } else {
            errors += 1;
            tracing::error!("Attempt to update document {id} unexpectedly failed: {error}");
        }
    }
    (warnings, errors)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn content(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_doc_update_statements() {
        let update = Update::new(
            "a:b:c:d::1.0",
            content(&[("ops:Provenance/ops:superseded_by", json!("a:b:c:d::2.0"))]),
        );
        let [action, body] = update.as_statements().unwrap();
        assert_eq!(
            serde_json::from_str::<Value>(&action).unwrap(),
            json!({"update": {"_id": "a:b:c:d::1.0"}})
        );
        assert_eq!(
            serde_json::from_str::<Value>(&body).unwrap(),
            json!({"doc": {"ops:Provenance/ops:superseded_by": "a:b:c:d::2.0"}})
        );
    }

    #[test]
    fn test_scripted_update_statements() {
        let mut params = Map::new();
        params.insert("new_items".to_string(), json!(["a:b:c:d"]));
        let update = Update::new("a:b:c:d::1.0", Map::new())
            .with_script(InlineScript {
                source: "ctx.op='none';".to_string(),
                params,
            })
            .as_upsert();
        let [_, body] = update.as_statements().unwrap();
        let body: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(body["script"]["lang"], json!("painless"));
        assert_eq!(body["script"]["source"], json!("ctx.op='none';"));
        assert_eq!(body["script"]["params"]["new_items"], json!(["a:b:c:d"]));
        assert_eq!(body["upsert"], json!({}));
        assert!(body.get("doc").is_none());
    }

    #[test]
    fn test_classify_bulk_response() {
        let response: BulkResponse = serde_json::from_value(json!({
            "errors": true,
            "items": [
                {"update": {"_id": "ok::1.0", "status": 200}},
                {"update": {"_id": "missing::1.0", "error": {"type": "document_missing_exception"}}},
                {"update": {"_id": "broken::1.0", "error": {"type": "illegal_argument_exception"}}},
            ],
        }))
        .unwrap();
        assert_eq!(classify_bulk_response(&response), (1, 1));

        let clean: BulkResponse =
            serde_json::from_value(json!({"errors": false, "items": []})).unwrap();
        assert_eq!(classify_bulk_response(&clean), (0, 0));
    }

    #[test]
    fn test_statement_pairing_preserves_order() {
        // One action line then one body line per update, in submission order.
        let updates = vec![
            Update::new("a::1.0", Map::new()),
            Update::new("b::1.0", Map::new()),
        ];
        let mut lines = Vec::new();
        for update in &updates {
            let [action, body] = update.as_statements().unwrap();
            lines.push(action);
            lines.push(body);
        }
        assert_eq!(lines.len(), 4);
        assert!(lines[0].contains("a::1.0"));
        assert!(lines[2].contains("b::1.0"));
    }
}
