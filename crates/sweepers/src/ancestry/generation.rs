//! Pure ancestry-record generation: bundles, collections, and the
//! per-membership-batch contributions that stage 3 streams out.

use std::collections::{
    BTreeMap,
    BTreeSet,
};

use common::{
    document::{
        BundleDocument,
        CollectionDocument,
        RefsBatchDocument,
        PARENT_BUNDLE_KEY,
        PARENT_COLLECTION_KEY,
    },
    identifiers::{
        Lid,
        LidVid,
        ProductRef,
    },
};
use opensearch::bulk::{
    InlineScript,
    Update,
};
use serde_json::{
    json,
    Map,
    Value,
};

use super::{
    records::{
        AncestryHistory,
        AncestryRecord,
    },
    script::ANCESTRY_UPDATE_SCRIPT,
};
use crate::versioning::SWEEPERS_ANCESTRY_VERSION;

/// Collection references declared by bundles, indexed both ways a bundle can
/// declare them: by exact LIDVID, and by LID (matching every version).
#[derive(Debug, Default)]
pub struct BundleCollectionRefs {
    by_lidvid: BTreeMap<LidVid, BTreeSet<LidVid>>,
    by_lid: BTreeMap<Lid, BTreeSet<LidVid>>,
}

impl BundleCollectionRefs {
    pub fn collect(bundles: &[BundleDocument]) -> Self {
        let mut refs = Self::default();
        for bundle in bundles {
            for collection_ref in &bundle.collection_refs {
                match collection_ref {
                    ProductRef::LidVid(collection) => {
                        refs.by_lidvid
                            .entry(collection.clone())
                            .or_default()
                            .insert(bundle.lidvid.clone());
                    },
                    ProductRef::Lid(collection_lid) => {
                        refs.by_lid
                            .entry(collection_lid.clone())
                            .or_default()
                            .insert(bundle.lidvid.clone());
                    },
                }
            }
        }
        refs
    }

    /// Bundles parenting `collection`: exact-LIDVID refs plus LID refs, which
    /// match every version of the collection's LID.
    pub fn parent_bundles_for(&self, collection: &LidVid) -> BTreeSet<LidVid> {
        let mut bundles = self.by_lidvid.get(collection).cloned().unwrap_or_default();
        if let Some(by_lid) = self.by_lid.get(collection.lid()) {
            bundles.extend(by_lid.iter().cloned());
        }
        bundles
    }
}

/// Stage 1: bundles have no ancestors; each pending bundle still gets a
/// record so its version stamp is written.
pub fn bundle_ancestry_records(pending_bundles: &[BundleDocument]) -> Vec<AncestryRecord> {
    pending_bundles
        .iter()
        .map(|bundle| AncestryRecord::new(bundle.lidvid.clone()))
        .collect()
}

/// Stage 2: each pending collection gains every bundle that references it.
pub fn collection_ancestry_records(
    pending_collections: &[CollectionDocument],
    refs: &BundleCollectionRefs,
) -> Vec<AncestryRecord> {
    pending_collections
        .iter()
        .map(|collection| {
            let parent_bundles = refs.parent_bundles_for(&collection.lidvid);
            if parent_bundles.is_empty() {
                tracing::warn!(
                    "Collection {} is not referenced by any bundle.",
                    collection.lidvid
                );
            }
            AncestryRecord::with_parents(collection.lidvid.clone(), [], parent_bundles)
        })
        .collect()
}

/// Stage 3: one membership batch's contribution to its member products. A
/// LIDVID member gets exactly that version; a legacy LID member gets every
/// published version of the LID. Parent bundles are inherited from the
/// collection.
pub fn batch_contributions(
    batch: &RefsBatchDocument,
    collection: &AncestryRecord,
    legacy_versions: &BTreeMap<Lid, BTreeSet<LidVid>>,
) -> Vec<(LidVid, AncestryHistory)> {
    let contribution = AncestryHistory {
        parent_collection_lidvids: BTreeSet::from([collection.lidvid.to_string()]),
        parent_bundle_lidvids: collection
            .resolve_parent_bundle_lidvids()
            .iter()
            .map(ToString::to_string)
            .collect(),
    };
    let mut contributions = Vec::new();
    for product_ref in &batch.product_refs {
        match product_ref {
            ProductRef::LidVid(product) => {
                contributions.push((product.clone(), contribution.clone()));
            },
            ProductRef::Lid(product_lid) => match legacy_versions.get(product_lid) {
                Some(versions) if !versions.is_empty() => {
                    for product in versions {
                        contributions.push((product.clone(), contribution.clone()));
                    }
                },
                _ => tracing::warn!(
                    "No published versions found for legacy member ref {product_lid} of \
                     collection {}",
                    batch.collection_lidvid
                ),
            },
        }
    }
    contributions
}

/// Complete record for an aggregate product: parents plus the version stamp.
pub fn update_from_record(record: &AncestryRecord) -> Update {
    scripted_update(record.lidvid.to_string(), &record.history(), true)
}

/// Partial update streamed during stage 3: only the parents known at this
/// moment, and no version stamp.
pub fn partial_update(product: &LidVid, contribution: &AncestryHistory) -> Update {
    scripted_update(product.to_string(), contribution, false)
}

/// Final update from the deferred pass: the product's full accumulated
/// ancestry, stamped.
pub fn final_update(product_id: &str, history: &AncestryHistory) -> Update {
    scripted_update(product_id.to_string(), history, true)
}

fn scripted_update(id: String, history: &AncestryHistory, stamp_version: bool) -> Update {
    let mut params = Map::new();
    params.insert("new_items".to_string(), json!(history.ancestor_refs()));
    params.insert(
        "parent_refs".to_string(),
        json!({
            (PARENT_COLLECTION_KEY): history.parent_collection_lidvids,
            (PARENT_BUNDLE_KEY): history.parent_bundle_lidvids,
        }),
    );
    params.insert(
        "sweeper_version".to_string(),
        if stamp_version {
            json!(SWEEPERS_ANCESTRY_VERSION)
        } else {
            Value::Null
        },
    );
    Update::new(id, Map::new()).with_script(InlineScript {
        source: ANCESTRY_UPDATE_SCRIPT.clone(),
        params,
    })
}
