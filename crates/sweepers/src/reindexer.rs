//! Reindexer sweeper: verify that every property of every document is
//! present in the index mapping (i.e. searchable), adding missing mappings
//! and re-triggering indexation of the affected documents.
//!
//! A tested document is stamped with the sweeper-start timestamp under
//! `ops:Provenance/ops:reindexed_at`; writing the stamp is itself what
//! forces the document to reindex with the new mappings.

use std::collections::{
    BTreeMap,
    BTreeSet,
};

use chrono::{
    DateTime,
    SecondsFormat,
    Utc,
};
use common::{
    document::{
        SearchHit,
        HARVEST_TIME_KEY,
        HARVEST_VERSION_KEY,
    },
    knobs::REINDEXER_BATCH_LIMIT,
};
use futures::{
    pin_mut,
    TryStreamExt as _,
};
use opensearch::{
    bulk::{
        write_updated_docs,
        Update,
    },
    index_utils::{
        ensure_index_mapping,
        mapping_property_types,
        IndexName,
    },
    retry::{
        with_retries,
        RetryPolicy,
    },
    scan::search_after_documents,
};
use serde_json::{
    json,
    Map,
    Value,
};

use crate::{
    context::Context,
    versioning::REINDEXER_FLAG_METADATA_KEY,
};

/// Unknown properties default to `keyword`: conservative, always queryable,
/// and loud in the logs so operators can audit the choice.
const DEFAULT_MAPPING_TYPE: &str = "keyword";

/// Docs not yet tested, limited to those harvested before this sweeper
/// instance started so concurrent harvests don't starve the loop.
pub fn pending_docs_query(harvested_before: &DateTime<Utc>) -> Value {
    json!({
        "bool": {
            "must_not": [{"exists": {"field": REINDEXER_FLAG_METADATA_KEY}}],
            "must": {
                "range": {
                    (HARVEST_TIME_KEY): {
                        "lt": harvested_before.to_rfc3339_opts(SecondsFormat::Micros, true),
                    },
                },
            },
        }
    })
}

#[derive(Debug, Default)]
pub struct MissingMappingReport {
    /// Property → type to add to the index mapping.
    pub missing: BTreeMap<String, String>,
    /// Properties whose live mapping type contradicts the data dictionary.
    pub conflicting: BTreeSet<String>,
    /// Properties with no data-dictionary entry.
    pub undefined_in_dd: BTreeSet<String>,
    pub problem_docs: u64,
    pub total_docs: u64,
    pub earliest_problem_harvest: Option<String>,
    pub latest_problem_harvest: Option<String>,
    /// Harvest-tool versions seen on problem docs; points operators at the
    /// harvest release that produced the bad data.
    pub harvest_versions: BTreeSet<String>,
}

impl MissingMappingReport {
    fn log(&self) {
        tracing::info!(
            "RESULT: Detected {} docs with {} missing mappings and {} mappings conflicting with \
             the DD, out of a total of {} docs",
            self.problem_docs,
            self.missing.len(),
            self.conflicting.len(),
            self.total_docs,
        );
        if let (Some(earliest), Some(latest)) = (
            &self.earliest_problem_harvest,
            &self.latest_problem_harvest,
        ) {
            tracing::warn!(
                "RESULT: Problems were detected with docs having harvest timestamps between \
                 {earliest} and {latest}"
            );
        }
        if !self.harvest_versions.is_empty() {
            tracing::warn!(
                "RESULT: Problems were detected with docs having harvest versions {:?}",
                self.harvest_versions,
            );
        }
        if !self.missing.is_empty() {
            tracing::info!(
                "RESULT: Mappings will be added for the following properties: {:?}",
                self.missing.keys().collect::<Vec<_>>(),
            );
        }
        if !self.undefined_in_dd.is_empty() {
            tracing::info!(
                "RESULT: Mappings were not found in the DD for the following properties, and a \
                 default type will be applied: {:?}",
                self.undefined_in_dd,
            );
        }
        if !self.conflicting.is_empty() {
            tracing::error!(
                "RESULT: The following mappings have a type which does not match the data \
                 dictionary: {:?} - in-place update is not possible, affected data must be \
                 manually reindexed",
                self.conflicting,
            );
        }
    }
}

/// Streaming accumulator over one batch of documents, comparing every
/// property against the data dictionary and the live index mapping.
pub struct MappingAccumulator<'a> {
    dd_types: &'a BTreeMap<String, String>,
    mapping_types: &'a BTreeMap<String, String>,
    report: MissingMappingReport,
}

impl<'a> MappingAccumulator<'a> {
    pub fn new(
        dd_types: &'a BTreeMap<String, String>,
        mapping_types: &'a BTreeMap<String, String>,
    ) -> Self {
        Self {
            dd_types,
            mapping_types,
            report: MissingMappingReport::default(),
        }
    }

    pub fn observe(&mut self, hit: &SearchHit) {
        self.report.total_docs += 1;
        let mut problem_in_this_doc = false;
        for property in hit.source.keys() {
            let canonical_type = self.dd_types.get(property);
            let current_type = self.mapping_types.get(property);
            let mapping_missing = current_type.is_none();
            let mapping_is_bad = matches!(
                (canonical_type, current_type),
                (Some(canonical), Some(current)) if canonical != current
            );

            if canonical_type.is_none() && !self.report.undefined_in_dd.contains(property) {
                tracing::warn!(
                    "Property {property} does not have an entry in the DD index - this may \
                     indicate a problem"
                );
                self.report.undefined_in_dd.insert(property.clone());
            }
            if let (Some(canonical), Some(current)) = (canonical_type, current_type) {
                if canonical != current && !self.report.conflicting.contains(property) {
                    tracing::warn!(
                        "Property {property} is defined in the data dictionary as type \
                         {canonical:?} but exists in the index mapping as type {current:?}"
                    );
                    self.report.conflicting.insert(property.clone());
                }
            }

            if (mapping_missing || mapping_is_bad) && !problem_in_this_doc {
                problem_in_this_doc = true;
                self.report.problem_docs += 1;
                if let Some(harvested_at) = hit
                    .string_list_field(HARVEST_TIME_KEY)
                    .into_iter()
                    .next()
                {
                    let earliest = self
                        .report
                        .earliest_problem_harvest
                        .get_or_insert_with(|| harvested_at.clone());
                    if harvested_at < *earliest {
                        *earliest = harvested_at.clone();
                    }
                    let latest = self
                        .report
                        .latest_problem_harvest
                        .get_or_insert_with(|| harvested_at.clone());
                    if harvested_at > *latest {
                        *latest = harvested_at.clone();
                    }
                }
                let harvest_versions = hit.string_list_field(HARVEST_VERSION_KEY);
                if harvest_versions.is_empty() {
                    tracing::warn!("Unable to extract harvest version from document {}", hit.id);
                } else {
                    self.report.harvest_versions.extend(harvest_versions);
                }
            }

            if mapping_missing && !self.report.missing.contains_key(property) {
                match canonical_type {
                    Some(canonical) => {
                        tracing::info!(
                            "Property {property} will be mapped as type {canonical:?} from the \
                             data dictionary"
                        );
                        self.report.missing.insert(property.clone(), canonical.clone());
                    },
                    None => {
                        tracing::warn!(
                            "Property {property} is missing from the index mappings and has no \
                             data dictionary entry - defaulting to type \
                             {DEFAULT_MAPPING_TYPE:?}"
                        );
                        self.report
                            .missing
                            .insert(property.clone(), DEFAULT_MAPPING_TYPE.to_string());
                    },
                }
            }
        }
    }

    pub fn finish(self) -> MissingMappingReport {
        self.report
    }
}

/// A stamp update for a document whose fields are all mapped; `None` (skip)
/// when any field is still unmapped, so an unstamped doc is revisited by the
/// next pass.
pub fn doc_update(hit: &SearchHit, extant_mapping_keys: &BTreeSet<String>, stamp: &str) -> Option<Update> {
    let unmapped: Vec<&String> = hit
        .source
        .keys()
        .filter(|field| !extant_mapping_keys.contains(*field))
        .collect();
    if !unmapped.is_empty() {
        tracing::debug!(
            "Missing mappings {unmapped:?} detected when creating update for doc {} - skipping",
            hit.id
        );
        return None;
    }
    let mut content = Map::new();
    content.insert(REINDEXER_FLAG_METADATA_KEY.to_string(), json!(stamp));
    Some(Update::new(hit.id.clone(), content))
}

pub async fn run(ctx: &Context) -> anyhow::Result<()> {
    let sweeper_start = Utc::now();
    tracing::info!("Starting reindexer sweeper processing...");
    let registry = ctx.index(IndexName::Registry);
    let registry_scan = ctx.scan_path(IndexName::Registry);
    let policy = RetryPolicy::default();
    ensure_index_mapping(&ctx.client, &registry, REINDEXER_FLAG_METADATA_KEY, "date").await?;

    let dd_types = fetch_dd_field_types(ctx).await?;
    tracing::info!("Loaded {} data-dictionary field types", dd_types.len());

    let stamp = sweeper_start.to_rfc3339_opts(SecondsFormat::Micros, true);
    let count_body = json!({"query": pending_docs_query(&sweeper_start)});
    loop {
        let pending = with_retries(policy, "count pending documents", || {
            ctx.client.count(&registry_scan, &count_body)
        })
        .await?;
        if pending == 0 {
            break;
        }
        tracing::info!("{pending} documents pending reindex testing");

        let mapping_types = mapping_property_types(&ctx.client.get_mapping(&registry).await?);
        let mut accumulator = MappingAccumulator::new(&dd_types, &mapping_types);
        {
            let hits = batch_hits(ctx, &registry_scan, &sweeper_start);
            pin_mut!(hits);
            while let Some(hit) = hits.try_next().await? {
                accumulator.observe(&hit);
            }
        }
        let report = accumulator.finish();
        report.log();
        for (property, mapping_type) in &report.missing {
            tracing::info!(
                "Updating index {registry} with missing mapping ({property}, {mapping_type})"
            );
            ensure_index_mapping(&ctx.client, &registry, property, mapping_type).await?;
        }

        let extant_mapping_keys: BTreeSet<String> =
            mapping_property_types(&ctx.client.get_mapping(&registry).await?)
                .into_keys()
                .collect();
        let updates = batch_hits(ctx, &registry_scan, &sweeper_start)
            .try_filter_map(|hit| {
                let update = doc_update(&hit, &extant_mapping_keys, &stamp);
                async move { Ok(update) }
            });
        let summary = write_updated_docs(&ctx.client, &registry, updates).await?;

        if summary.updates_written == 0 && report.missing.is_empty() {
            tracing::warn!(
                "No further progress possible for {pending} remaining documents; manual mapping \
                 attention is required"
            );
            break;
        }
    }

    tracing::info!("Completed reindexer sweeper processing!");
    Ok(())
}

fn batch_hits(
    ctx: &Context,
    registry_scan: &str,
    sweeper_start: &DateTime<Utc>,
) -> impl futures::Stream<Item = anyhow::Result<SearchHit>> {
    // Sorting by harvest time gives a soft consistency guarantee between the
    // accumulate and update passes over the same batch.
    search_after_documents(
        ctx.client.clone(),
        registry_scan.to_string(),
        pending_docs_query(sweeper_start),
        json!({}),
        vec![HARVEST_TIME_KEY.to_string()],
        Some(*REINDEXER_BATCH_LIMIT as u64),
    )
}

async fn fetch_dd_field_types(ctx: &Context) -> anyhow::Result<BTreeMap<String, String>> {
    const NAME_KEY: &str = "es_field_name";
    const TYPE_KEY: &str = "es_data_type";
    let hits = search_after_documents(
        ctx.client.clone(),
        ctx.scan_path(IndexName::RegistryDd),
        json!({"match_all": {}}),
        json!({"includes": [NAME_KEY, TYPE_KEY]}),
        vec![NAME_KEY.to_string()],
        None,
    );
    pin_mut!(hits);
    let mut dd_types = BTreeMap::new();
    while let Some(hit) = hits.try_next().await? {
        let name = hit.source.get(NAME_KEY).and_then(Value::as_str);
        let data_type = hit.source.get(TYPE_KEY).and_then(Value::as_str);
        if let (Some(name), Some(data_type)) = (name, data_type) {
            dd_types.insert(name.to_string(), data_type.to_string());
        }
    }
    Ok(dd_types)
}
