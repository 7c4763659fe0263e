//! Repairkit sweeper: fix common data-shape errors on registry documents.
//!
//! New repairs are added by extending `REPAIRED_FIELD_PREFIXES` (or the
//! repair dispatch in `repair_document`) as they are discovered.

use common::document::SearchHit;
use futures::{
    Stream,
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
    scan::scroll_documents,
};
use serde_json::{
    json,
    Map,
    Value,
};

use crate::{
    context::Context,
    versioning::{
        SWEEPERS_REPAIRKIT_VERSION,
        SWEEPERS_REPAIRKIT_VERSION_METADATA_KEY,
    },
};

/// File-info fields must always be array-valued; legacy harvests wrote bare
/// scalars.
const REPAIRED_FIELD_PREFIXES: [&str; 2] = ["ops:Data_File_Info/", "ops:Label_File_Info/"];

/// The repairs (field → fixed value) for one document's source, not
/// including the version stamp. Empty when the document is already sound.
pub fn repair_document(source: &Map<String, Value>) -> Map<String, Value> {
    let mut repairs = Map::new();
    for (field, value) in source {
        if !REPAIRED_FIELD_PREFIXES
            .iter()
            .any(|prefix| field.starts_with(prefix))
        {
            continue;
        }
        if !matches!(value, Value::Array(_)) {
            repairs.insert(field.clone(), json!([value]));
        }
    }
    repairs
}

pub fn update_for_document(hit: &SearchHit) -> Update {
    let mut content = repair_document(&hit.source);
    content.insert(
        SWEEPERS_REPAIRKIT_VERSION_METADATA_KEY.clone(),
        json!(SWEEPERS_REPAIRKIT_VERSION),
    );
    Update::new(hit.id.clone(), content)
}

/// Documents lacking the current repairkit stamp; the repairkit scans the
/// whole registry, not just published products.
pub fn eligibility_query() -> Value {
    json!({
        "bool": {
            "must_not": [
                {"range": {(&*SWEEPERS_REPAIRKIT_VERSION_METADATA_KEY): {"gte": SWEEPERS_REPAIRKIT_VERSION}}},
            ],
        }
    })
}

pub async fn run(ctx: &Context) -> anyhow::Result<()> {
    tracing::info!("Starting repairkit v{SWEEPERS_REPAIRKIT_VERSION} sweeper processing...");
    let registry = ctx.index(IndexName::Registry);
    let scan_path = ctx.scan_path(IndexName::Registry);
    ensure_index_mapping(
        &ctx.client,
        &registry,
        &SWEEPERS_REPAIRKIT_VERSION_METADATA_KEY,
        "integer",
    )
    .await?;

    let updates = generate_updates(scroll_documents(
        ctx.client.clone(),
        scan_path,
        eligibility_query(),
        json!({}),
    ));
    let summary = write_updated_docs(&ctx.client, &registry, updates).await?;
    tracing::info!(
        "Repairkit sweeper processing complete ({} documents updated)",
        summary.updates_written
    );
    Ok(())
}

fn generate_updates(
    hits: impl Stream<Item = anyhow::Result<SearchHit>>,
) -> impl Stream<Item = anyhow::Result<Update>> {
    hits.map_ok(|hit| {
        tracing::debug!("Applying repairkit sweeper to document: {}", hit.id);
        update_for_document(&hit)
    })
}
