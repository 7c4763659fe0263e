//! Ancestry sweeper: compute, for every bundle, collection, and basic
//! product, the set of parent-collection and parent-bundle identifiers, and
//! publish them onto the documents.
//!
//! Bundles and collections are few and are resolved in memory. Basic-product
//! membership streams from the registry-refs index: each membership batch
//! produces partial updates immediately (safe because the server-side script
//! unions into existing fields) while running per-product totals accumulate
//! in a spill map. A deferred pass drains the spill map and writes one final,
//! version-stamped update per product.

pub mod generation;
pub mod queries;
pub mod records;
pub mod script;

use std::{
    collections::{
        BTreeMap,
        BTreeSet,
    },
    mem,
};

use common::{
    document::{
        BundleDocument,
        CollectionDocument,
        RefsBatchDocument,
        SearchHit,
        LIDVID_KEY,
    },
    identifiers::{
        Lid,
        LidVid,
        ProductRef,
    },
    knobs::{
        SWEEPERS_SPILL_PROPORTION,
        SWEEPERS_SPILL_THRESHOLD,
    },
};
use futures::{
    pin_mut,
    stream,
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
use spill_map::SpillMap;

use self::{
    generation::BundleCollectionRefs,
    records::{
        AncestryHistory,
        AncestryRecord,
    },
};
use crate::{
    context::Context,
    versioning::{
        SWEEPERS_ANCESTRY_VERSION,
        SWEEPERS_ANCESTRY_VERSION_METADATA_KEY,
    },
};

/// Collections per registry-refs terms query.
const COLLECTIONS_PER_REFS_QUERY: usize = 512;
/// LIDs per legacy-reference expansion query.
const LIDS_PER_EXPANSION_QUERY: usize = 1024;
/// Final updates buffered before each deferred-pass write.
const DEFERRED_WRITE_BATCH: usize = 5000;

pub async fn run(ctx: &Context) -> anyhow::Result<()> {
    tracing::info!("Starting ancestry v{SWEEPERS_ANCESTRY_VERSION} sweeper processing...");
    let registry = ctx.index(IndexName::Registry);
    let registry_scan = ctx.scan_path(IndexName::Registry);
    let refs_scan = ctx.scan_path(IndexName::RegistryRefs);
    ensure_index_mapping(
        &ctx.client,
        &registry,
        &SWEEPERS_ANCESTRY_VERSION_METADATA_KEY,
        "integer",
    )
    .await?;

    // Stage 1: every bundle's references, pending bundles' records.
    let bundles = collect_parsed_hits(
        scroll_documents(
            ctx.client.clone(),
            registry_scan.clone(),
            queries::all_bundles_query(),
            queries::bundle_source_fields(),
        ),
        |hit| BundleDocument::from_hit(hit, &SWEEPERS_ANCESTRY_VERSION_METADATA_KEY),
    )
    .await?;
    let bundle_refs = BundleCollectionRefs::collect(&bundles);
    let pending_bundles: Vec<BundleDocument> = bundles
        .into_iter()
        .filter(|bundle| {
            bundle
                .stored_sweeper_version
                .is_none_or(|version| version < SWEEPERS_ANCESTRY_VERSION)
        })
        .collect();
    let bundle_records = generation::bundle_ancestry_records(&pending_bundles);

    // Stage 2: pending collections gain their referencing bundles.
    let collections = collect_parsed_hits(
        scroll_documents(
            ctx.client.clone(),
            registry_scan.clone(),
            queries::pending_collections_query(),
            queries::collection_source_fields(),
        ),
        |hit| CollectionDocument::from_hit(hit, &SWEEPERS_ANCESTRY_VERSION_METADATA_KEY),
    )
    .await?;
    let collection_records = generation::collection_ancestry_records(&collections, &bundle_refs);
    tracing::info!(
        "Generated {} bundle and {} collection ancestry records",
        bundle_records.len(),
        collection_records.len(),
    );

    let aggregate_update_count = bundle_records.len() + collection_records.len();
    if aggregate_update_count > 0 {
        let updates: Vec<Update> = bundle_records
            .iter()
            .chain(collection_records.iter())
            .map(generation::update_from_record)
            .collect();
        write_updated_docs(
            &ctx.client,
            &registry,
            stream::iter(updates.into_iter().map(Ok)),
        )
        .await?;
    }

    // Stage 3: stream membership batches, emitting partials and accumulating
    // totals in the spill map.
    let spill_dir = tempfile::Builder::new()
        .prefix("ancestry-sweeper-")
        .tempdir()?;
    let mut spill: SpillMap<AncestryHistory, _> = SpillMap::open(
        spill_dir.path().join("spill.sqlite"),
        *SWEEPERS_SPILL_THRESHOLD,
        *SWEEPERS_SPILL_PROPORTION,
        AncestryHistory::merge,
    )?;
    let mut partial_update_count = 0u64;

    for chunk in collection_records.chunks(COLLECTIONS_PER_REFS_QUERY) {
        let by_lidvid: BTreeMap<String, &AncestryRecord> = chunk
            .iter()
            .map(|record| (record.lidvid.to_string(), record))
            .collect();
        let collection_lidvids: Vec<String> = by_lidvid.keys().cloned().collect();
        let batches = collect_parsed_hits(
            scroll_documents(
                ctx.client.clone(),
                refs_scan.clone(),
                queries::collection_refs_query(&collection_lidvids),
                queries::refs_source_fields(),
            ),
            RefsBatchDocument::from_hit,
        )
        .await?;

        let legacy_lids: BTreeSet<Lid> = batches
            .iter()
            .flat_map(|batch| batch.product_refs.iter())
            .filter_map(|product_ref| match product_ref {
                ProductRef::Lid(lid) => Some(lid.clone()),
                ProductRef::LidVid(_) => None,
            })
            .collect();
        let legacy_versions =
            resolve_published_lidvids(ctx, &registry_scan, &legacy_lids).await?;

        let mut partial_updates = Vec::new();
        for batch in &batches {
            let Some(collection) = by_lidvid.get(&batch.collection_lidvid.to_string()) else {
                tracing::warn!(
                    "Skipping refs batch {:?}: collection {} is not pending in this pass",
                    batch.batch_id,
                    batch.collection_lidvid,
                );
                continue;
            };
            for (product, contribution) in
                generation::batch_contributions(batch, collection, &legacy_versions)
            {
                partial_updates.push(generation::partial_update(&product, &contribution));
                spill.put(product.to_string(), contribution)?;
            }
        }
        partial_update_count += partial_updates.len() as u64;
        if !partial_updates.is_empty() {
            write_updated_docs(
                &ctx.client,
                &registry,
                stream::iter(partial_updates.into_iter().map(Ok)),
            )
            .await?;
        }
    }

    // Deferred pass: one complete, stamped update per accumulated product.
    let product_count = spill.len()?;
    tracing::info!("Generating deferred updates for {product_count} product histories...");
    let mut deferred_update_count = 0u64;
    let mut pending_writes: Vec<Update> = Vec::new();
    {
        let mut items = spill.iter();
        loop {
            let Some(item) = items.next() else { break };
            let (product_id, history) = item?;
            pending_writes.push(generation::final_update(&product_id, &history));
            if pending_writes.len() >= DEFERRED_WRITE_BATCH {
                deferred_update_count += pending_writes.len() as u64;
                let batch = mem::take(&mut pending_writes);
                write_updated_docs(
                    &ctx.client,
                    &registry,
                    stream::iter(batch.into_iter().map(Ok)),
                )
                .await?;
            }
        }
    }
    if !pending_writes.is_empty() {
        deferred_update_count += pending_writes.len() as u64;
        write_updated_docs(
            &ctx.client,
            &registry,
            stream::iter(pending_writes.into_iter().map(Ok)),
        )
        .await?;
    }
    spill.close()?;

    tracing::info!(
        "Ancestry sweeper processing complete ({aggregate_update_count} aggregate updates, \
         {partial_update_count} partial product updates, {deferred_update_count} deferred final \
         updates)"
    );
    Ok(())
}

async fn collect_parsed_hits<T>(
    hits: impl Stream<Item = anyhow::Result<SearchHit>>,
    parse: impl Fn(&SearchHit) -> anyhow::Result<T>,
) -> anyhow::Result<Vec<T>> {
    pin_mut!(hits);
    let mut parsed = Vec::new();
    while let Some(hit) = hits.try_next().await? {
        match parse(&hit) {
            Ok(value) => parsed.push(value),
            Err(e) => tracing::warn!("Skipping unparseable document {}: {e}", hit.id),
        }
    }
    Ok(parsed)
}

/// Published LIDVIDs for every LID in `lids`, for expanding legacy LID-only
/// member references.
async fn resolve_published_lidvids(
    ctx: &Context,
    registry_scan: &str,
    lids: &BTreeSet<Lid>,
) -> anyhow::Result<BTreeMap<Lid, BTreeSet<LidVid>>> {
    let mut versions: BTreeMap<Lid, BTreeSet<LidVid>> = BTreeMap::new();
    if lids.is_empty() {
        return Ok(versions);
    }
    let lid_strings: Vec<String> = lids.iter().map(ToString::to_string).collect();
    for chunk in lid_strings.chunks(LIDS_PER_EXPANSION_QUERY) {
        let hits = scroll_documents(
            ctx.client.clone(),
            registry_scan.to_string(),
            queries::published_lidvids_for_lids_query(chunk),
            queries::lidvid_only_source_fields(),
        );
        pin_mut!(hits);
        while let Some(hit) = hits.try_next().await? {
            let lidvid = match hit.str_field(LIDVID_KEY) {
                Ok(raw) => match raw.parse::<LidVid>() {
                    Ok(lidvid) => lidvid,
                    Err(e) => {
                        tracing::warn!("Skipping unparseable document {}: {e}", hit.id);
                        continue;
                    },
                },
                Err(e) => {
                    tracing::warn!("Skipping unparseable document {}: {e}", hit.id);
                    continue;
                },
            };
            versions.entry(lidvid.lid().clone()).or_default().insert(lidvid);
        }
    }
    Ok(versions)
}
