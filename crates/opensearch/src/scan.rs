//! Lazy paged scans over the document store.
//!
//! Scroll mode drives full unordered scans; search-after mode drives ordered
//! scans with a unique sort tie-breaker. Both yield hits one at a time so
//! downstream consumers never hold a full result set in memory, and both run
//! each page fetch under the shared retry policy.

use std::{
    sync::Arc,
    vec,
};

use common::{
    document::SearchHit,
    knobs::{
        SWEEPERS_PAGE_SIZE,
        SWEEPERS_SCROLL_TTL_MINUTES,
    },
};
use futures::{
    stream,
    Stream,
};
use serde_json::{
    json,
    Value,
};

use crate::{
    retry::{
        with_retries,
        RetryPolicy,
    },
    Client,
};

/// `index,remote1:index,remote2:index`: one search fanning out to every
/// configured cross-cluster remote.
pub fn cross_cluster_index_path(index: &str, remotes: &[String]) -> String {
    let mut parts = vec![index.to_string()];
    parts.extend(remotes.iter().map(|remote| format!("{remote}:{index}")));
    parts.join(",")
}

/// Sort spec for search-after paging. A unique tie-breaker (`_id`) is
/// appended when absent so every page makes stable progress.
fn search_after_sort_spec(sort_fields: &[String]) -> Vec<Value> {
    let mut spec: Vec<Value> = sort_fields
        .iter()
        .map(|field| json!({field.clone(): "asc"}))
        .collect();
    if !sort_fields.iter().any(|field| field == "_id") {
        spec.push(json!({"_id": "asc"}));
    }
    spec
}

struct ScrollGuard {
    client: Arc<Client>,
    scroll_id: Option<String>,
}

impl ScrollGuard {
    fn new(client: Arc<Client>, scroll_id: String) -> Self {
        Self {
            client,
            scroll_id: Some(scroll_id),
        }
    }

    fn renew(&mut self, scroll_id: String) {
        self.scroll_id = Some(scroll_id);
    }

    async fn clear(mut self) {
        if let Some(scroll_id) = self.scroll_id.take() {
            if let Err(e) = self.client.scroll_clear(&scroll_id).await {
                tracing::warn!("Failed to clear scroll: {e}");
            }
        }
    }
}

impl Drop for ScrollGuard {
    fn drop(&mut self) {
        // Dropped without clear(): the consumer abandoned the stream early.
        // Release the server-side cursor from a detached task.
        if let Some(scroll_id) = self.scroll_id.take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let client = self.client.clone();
                handle.spawn(async move {
                    if let Err(e) = client.scroll_clear(&scroll_id).await {
                        tracing::debug!("Failed to clear abandoned scroll: {e}");
                    }
                });
            }
        }
    }
}

struct ScrollScanState {
    client: Arc<Client>,
    policy: RetryPolicy,
    index_path: String,
    ttl_minutes: u64,
    first_request: Option<Value>,
    guard: Option<ScrollGuard>,
    buffered: vec::IntoIter<SearchHit>,
    served: u64,
    total: u64,
    total_known: bool,
    last_logged_pct: u64,
    done: bool,
}

impl ScrollScanState {
    fn log_progress(&mut self) {
        if !self.total_known || self.total == 0 {
            return;
        }
        let pct = self.served * 100 / self.total;
        if pct >= self.last_logged_pct + 5 {
            self.last_logged_pct = pct;
            tracing::info!("Query progress: {pct}% ({}/{})", self.served, self.total);
        }
    }
}

/// Full scan of `index_path` in scroll mode. Finite, non-restartable, and
/// holds at most one open scroll, which is cleared on exhaustion and on
/// early drop.
pub fn scroll_documents(
    client: Arc<Client>,
    index_path: String,
    query: Value,
    source: Value,
) -> impl Stream<Item = anyhow::Result<SearchHit>> {
    let body = json!({
        "query": query,
        "_source": source,
        "size": *SWEEPERS_PAGE_SIZE,
    });
    let state = ScrollScanState {
        client,
        policy: RetryPolicy::default(),
        index_path,
        ttl_minutes: *SWEEPERS_SCROLL_TTL_MINUTES,
        first_request: Some(body),
        guard: None,
        buffered: Vec::new().into_iter(),
        served: 0,
        total: 0,
        total_known: false,
        last_logged_pct: 0,
        done: false,
    };
    stream::try_unfold(state, |mut st| async move {
        loop {
            if let Some(hit) = st.buffered.next() {
                st.served += 1;
                st.log_progress();
                return Ok(Some((hit, st)));
            }
            if st.done {
                if let Some(guard) = st.guard.take() {
                    guard.clear().await;
                }
                tracing::info!("Query complete ({} hits served)", st.served);
                return Ok(None);
            }

            let response = match st.first_request.take() {
                Some(body) => {
                    tracing::info!("Initiating scroll query against {}", st.index_path);
                    let client = st.client.clone();
                    let index_path = st.index_path.clone();
                    let ttl = st.ttl_minutes;
                    with_retries(st.policy, "begin scroll", move || {
                        let client = client.clone();
                        let index_path = index_path.clone();
                        let body = body.clone();
                        async move {
                            client
                                .search_scroll_begin(&index_path, &body, ttl)
                                .await
                        }
                    })
                    .await?
                },
                None => {
                    let scroll_id = st
                        .guard
                        .as_ref()
                        .and_then(|guard| guard.scroll_id.clone())
                        .ok_or_else(|| anyhow::anyhow!("scroll continuation without scroll id"))?;
                    let client = st.client.clone();
                    let ttl = st.ttl_minutes;
                    with_retries(st.policy, "continue scroll", move || {
                        let client = client.clone();
                        let scroll_id = scroll_id.clone();
                        async move { client.search_scroll_continue(&scroll_id, ttl).await }
                    })
                    .await?
                },
            };

            if !st.total_known {
                st.total = response.hits.total.value;
                st.total_known = true;
                tracing::debug!("Scroll scan matched {} total hits", st.total);
            }
            if let Some(scroll_id) = response.scroll_id {
                match st.guard.as_mut() {
                    Some(guard) => guard.renew(scroll_id),
                    None => st.guard = Some(ScrollGuard::new(st.client.clone(), scroll_id)),
                }
            }

            let hits = response.hits.hits;
            if hits.is_empty() {
                st.done = true;
                continue;
            }
            if st.served + hits.len() as u64 >= st.total {
                st.done = true;
            }
            st.buffered = hits.into_iter();
        }
    })
}

struct SearchAfterState {
    client: Arc<Client>,
    policy: RetryPolicy,
    index_path: String,
    query: Value,
    source: Value,
    sort_spec: Vec<Value>,
    cursor: Option<Vec<Value>>,
    page_size: usize,
    buffered: vec::IntoIter<SearchHit>,
    served: u64,
    limit: Option<u64>,
    done: bool,
}

/// Ordered scan of `index_path` by `sort_fields` (ascending), paged with
/// search-after cursors. `limit` caps the number of yielded hits.
pub fn search_after_documents(
    client: Arc<Client>,
    index_path: String,
    query: Value,
    source: Value,
    sort_fields: Vec<String>,
    limit: Option<u64>,
) -> impl Stream<Item = anyhow::Result<SearchHit>> {
    let state = SearchAfterState {
        client,
        policy: RetryPolicy::default(),
        index_path,
        query,
        source,
        sort_spec: search_after_sort_spec(&sort_fields),
        cursor: None,
        page_size: *SWEEPERS_PAGE_SIZE,
        buffered: Vec::new().into_iter(),
        served: 0,
        limit,
        done: false,
    };
    stream::try_unfold(state, |mut st| async move {
        loop {
            if let Some(limit) = st.limit {
                if st.served >= limit {
                    return Ok(None);
                }
            }
            if let Some(hit) = st.buffered.next() {
                st.served += 1;
                return Ok(Some((hit, st)));
            }
            if st.done {
                return Ok(None);
            }

            let mut body = json!({
                "query": st.query,
                "_source": st.source,
                "size": st.page_size,
                "sort": st.sort_spec,
            });
            if let Some(cursor) = &st.cursor {
                body["search_after"] = Value::Array(cursor.clone());
            }
            let first_page = st.cursor.is_none();
            let response = {
                let client = st.client.clone();
                let index_path = st.index_path.clone();
                with_retries(st.policy, "search-after page", move || {
                    let client = client.clone();
                    let index_path = index_path.clone();
                    let body = body.clone();
                    async move { client.search(&index_path, &body).await }
                })
                .await?
            };
            if first_page {
                tracing::debug!(
                    "Search-after scan matched {} total hits",
                    response.hits.total.value
                );
            }

            let hits = response.hits.hits;
            if hits.is_empty() {
                st.done = true;
                continue;
            }
            if hits.len() < st.page_size {
                st.done = true;
            }
            let last = hits.last().expect("nonempty page");
            if last.sort.is_empty() {
                anyhow::bail!(
                    "search-after response from {} is missing sort cursor values",
                    st.index_path
                );
            }
            st.cursor = Some(last.sort.clone());
            st.buffered = hits.into_iter();
        }
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_cross_cluster_index_path() {
        assert_eq!(cross_cluster_index_path("registry", &[]), "registry");
        assert_eq!(
            cross_cluster_index_path(
                "registry",
                &["remote1".to_string(), "remote2".to_string()]
            ),
            "registry,remote1:registry,remote2:registry"
        );
    }

    #[test]
    fn test_sort_spec_appends_unique_tiebreaker() {
        let spec = search_after_sort_spec(&["lidvid".to_string()]);
        assert_eq!(spec, vec![json!({"lidvid": "asc"}), json!({"_id": "asc"})]);

        let spec = search_after_sort_spec(&["_id".to_string()]);
        assert_eq!(spec, vec![json!({"_id": "asc"})]);
    }
}
