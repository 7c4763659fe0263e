//! Provenance sweeper: for every published LID, build its LIDVID history in
//! ascending version order and stamp each document with the LIDVID of its
//! immediate successor (null for the tip).

use std::collections::BTreeMap;

use common::{
    document::{
        ProductDocument,
        ARCHIVE_STATUS_KEY,
        LIDVID_KEY,
        PUBLISHED_ARCHIVE_STATUSES,
        SUPERSEDED_BY_KEY,
    },
    identifiers::{
        Lid,
        LidVid,
    },
    knobs::PROVENANCE_AGG_PAGE_SIZE,
};
use futures::{
    pin_mut,
    stream,
    TryStreamExt as _,
};
use opensearch::{
    bulk::{
        write_updated_docs,
        Update,
    },
    index_utils::{
        ensure_index_mapping,
        IndexName,
    },
    retry::{
        with_retries,
        RetryPolicy,
    },
    scan,
};
use serde_json::{
    json,
    Map,
    Value,
};

use crate::{
    context::Context,
    versioning::{
        SWEEPERS_PROVENANCE_VERSION,
        SWEEPERS_PROVENANCE_VERSION_METADATA_KEY,
    },
};

/// One link of a LID's version chain: the document as stored, and the
/// computed successor.
#[derive(Debug, Clone)]
pub struct ProvenanceRecord {
    pub document: ProductDocument,
    pub successor: Option<LidVid>,
}

impl ProvenanceRecord {
    /// A record needs no write when the stored successor already equals the
    /// computed one and the stored sweeper version is current.
    pub fn skippable(&self) -> bool {
        self.document.superseded_by == Some(self.successor.clone())
            && self
                .document
                .sweeper_version(&SWEEPERS_PROVENANCE_VERSION_METADATA_KEY)
                == Some(SWEEPERS_PROVENANCE_VERSION)
    }
}

/// Published docs that either lack the current sweeper-version stamp or lack
/// a successor field.
pub fn eligibility_query() -> Value {
    json!({
        "bool": {
            "must": [
                {"terms": {(ARCHIVE_STATUS_KEY): PUBLISHED_ARCHIVE_STATUSES}},
            ],
            "should": [
                {"bool": {"must_not": [
                    {"range": {(&*SWEEPERS_PROVENANCE_VERSION_METADATA_KEY): {"gte": SWEEPERS_PROVENANCE_VERSION}}},
                ]}},
                {"bool": {"must_not": [
                    {"exists": {"field": SUPERSEDED_BY_KEY}},
                ]}},
            ],
            "minimum_should_match": 1,
        }
    })
}

/// Group documents by LID, order each group ascending by version, and link
/// every record to its immediate successor. Duplicate LIDVIDs (e.g. the same
/// document served by multiple cross-cluster remotes) collapse to one.
pub fn group_and_link_records_into_chains(
    docs: impl IntoIterator<Item = ProductDocument>,
) -> Vec<Vec<ProvenanceRecord>> {
    let mut by_lid: BTreeMap<Lid, Vec<ProductDocument>> = BTreeMap::new();
    for doc in docs {
        by_lid
            .entry(doc.lidvid.lid().clone())
            .or_default()
            .push(doc);
    }
    let mut chains = Vec::new();
    for (_, mut chain_docs) in by_lid {
        chain_docs.sort_by(|a, b| a.lidvid.cmp(&b.lidvid));
        chain_docs.dedup_by(|a, b| a.lidvid == b.lidvid);
        let mut successors: Vec<Option<LidVid>> = chain_docs
            .iter()
            .skip(1)
            .map(|doc| Some(doc.lidvid.clone()))
            .collect();
        successors.push(None);
        chains.push(
            chain_docs
                .into_iter()
                .zip(successors)
                .map(|(document, successor)| ProvenanceRecord {
                    document,
                    successor,
                })
                .collect(),
        );
    }
    chains
}

/// The successor is always written explicitly, as a LIDVID or a null; the
/// field is never deleted.
pub fn update_from_record(record: &ProvenanceRecord) -> Update {
    let mut content = Map::new();
    content.insert(
        SUPERSEDED_BY_KEY.to_string(),
        match &record.successor {
            Some(successor) => json!(successor.to_string()),
            None => Value::Null,
        },
    );
    content.insert(
        SWEEPERS_PROVENANCE_VERSION_METADATA_KEY.clone(),
        json!(SWEEPERS_PROVENANCE_VERSION),
    );
    Update::new(record.document.lidvid.to_string(), content)
}

pub async fn run(ctx: &Context) -> anyhow::Result<()> {
    tracing::info!("Starting provenance v{SWEEPERS_PROVENANCE_VERSION} sweeper processing...");
    let registry = ctx.index(IndexName::Registry);
    let scan_path = ctx.scan_path(IndexName::Registry);
    ensure_index_mapping(
        &ctx.client,
        &registry,
        &SWEEPERS_PROVENANCE_VERSION_METADATA_KEY,
        "integer",
    )
    .await?;

    let policy = RetryPolicy::default();
    let mut processed_lids: Vec<String> = Vec::new();
    let mut updates_written = 0u64;
    let mut records_skipped = 0u64;

    loop {
        let lids = pending_lids_page(ctx, &scan_path, policy, &processed_lids).await?;
        if lids.is_empty() {
            break;
        }
        tracing::info!("Processing provenance for {} LIDs...", lids.len());

        let docs = fetch_published_docs(ctx, &scan_path, &lids).await?;
        let mut updates = Vec::new();
        for record in group_and_link_records_into_chains(docs).into_iter().flatten() {
            if record.skippable() {
                records_skipped += 1;
                continue;
            }
            updates.push(update_from_record(&record));
        }
        updates_written += updates.len() as u64;
        if !updates.is_empty() {
            write_updated_docs(
                &ctx.client,
                &registry,
                stream::iter(updates.into_iter().map(Ok)),
            )
            .await?;
        }
        processed_lids.extend(lids);
    }

    if updates_written == 0 {
        tracing::info!("All products up to date");
    }
    tracing::info!(
        "Provenance sweeper processing complete ({updates_written} updates written, \
         {records_skipped} up-to-date records skipped)"
    );
    Ok(())
}

/// One page of LIDs needing provenance work, from a terms aggregation that
/// excludes LIDs already handled by earlier pages.
async fn pending_lids_page(
    ctx: &Context,
    scan_path: &str,
    policy: RetryPolicy,
    exclude: &[String],
) -> anyhow::Result<Vec<String>> {
    let body = json!({
        "query": eligibility_query(),
        "size": 0,
        "aggs": {
            "pending_lids": {
                "terms": {
                    "field": "lid",
                    "size": *PROVENANCE_AGG_PAGE_SIZE,
                    "exclude": exclude,
                },
            },
        },
    });
    let response = with_retries(policy, "aggregate pending LIDs", || {
        ctx.client.search(scan_path, &body)
    })
    .await?;
    let buckets = response
        .aggregations
        .as_ref()
        .and_then(|aggs| aggs.get("pending_lids"))
        .and_then(|agg| agg.get("buckets"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    Ok(buckets
        .iter()
        .filter_map(|bucket| bucket.get("key").and_then(Value::as_str))
        .map(str::to_string)
        .collect())
}

async fn fetch_published_docs(
    ctx: &Context,
    scan_path: &str,
    lids: &[String],
) -> anyhow::Result<Vec<ProductDocument>> {
    let query = json!({
        "bool": {
            "must": [
                {"terms": {(ARCHIVE_STATUS_KEY): PUBLISHED_ARCHIVE_STATUSES}},
                {"terms": {"lid": lids}},
            ],
        }
    });
    let source = json!({
        "includes": [
            LIDVID_KEY,
            SUPERSEDED_BY_KEY,
            &*SWEEPERS_PROVENANCE_VERSION_METADATA_KEY,
        ],
    });
    let hits = scan::search_after_documents(
        ctx.client.clone(),
        scan_path.to_string(),
        query,
        source,
        vec![LIDVID_KEY.to_string()],
        None,
    );
    pin_mut!(hits);
    let mut docs = Vec::new();
    while let Some(hit) = hits.try_next().await? {
        match ProductDocument::from_hit(&hit) {
            Ok(doc) => docs.push(doc),
            Err(e) => tracing::warn!("Skipping unparseable document {}: {e}", hit.id),
        }
    }
    Ok(docs)
}
