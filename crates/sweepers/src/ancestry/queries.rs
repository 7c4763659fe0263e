//! Query builders for the ancestry sweeper's scans.

use common::document::{
    ARCHIVE_STATUS_KEY,
    LIDVID_KEY,
    PUBLISHED_ARCHIVE_STATUSES,
};
use serde_json::{
    json,
    Value,
};

use crate::versioning::{
    SWEEPERS_ANCESTRY_VERSION,
    SWEEPERS_ANCESTRY_VERSION_METADATA_KEY,
};

/// Every bundle, pending or not: even an already-stamped bundle's collection
/// references are needed to compute the parentage of a newly-pending
/// collection.
pub fn all_bundles_query() -> Value {
    json!({
        "bool": {
            "filter": [
                {"term": {"product_class": "Product_Bundle"}},
            ],
        }
    })
}

/// Collections lacking the current ancestry version stamp.
pub fn pending_collections_query() -> Value {
    json!({
        "bool": {
            "filter": [
                {"term": {"product_class": "Product_Collection"}},
            ],
            "must_not": [
                {"range": {(&*SWEEPERS_ANCESTRY_VERSION_METADATA_KEY): {"gte": SWEEPERS_ANCESTRY_VERSION}}},
            ],
        }
    })
}

/// Membership batches for a chunk of collection LIDVIDs.
pub fn collection_refs_query(collection_lidvids: &[String]) -> Value {
    json!({
        "bool": {
            "filter": [
                {"terms": {"collection_lidvid": collection_lidvids}},
            ],
        }
    })
}

/// Published LIDVIDs for a chunk of LIDs; used to expand legacy LID-only
/// references into every published version.
pub fn published_lidvids_for_lids_query(lids: &[String]) -> Value {
    json!({
        "bool": {
            "must": [
                {"terms": {(ARCHIVE_STATUS_KEY): PUBLISHED_ARCHIVE_STATUSES}},
                {"terms": {"lid": lids}},
            ],
        }
    })
}

pub fn bundle_source_fields() -> Value {
    json!({
        "includes": [
            LIDVID_KEY,
            "ref_lid_collection",
            "ref_lidvid_collection",
            "alternate_ids",
            &*SWEEPERS_ANCESTRY_VERSION_METADATA_KEY,
        ],
    })
}

pub fn collection_source_fields() -> Value {
    json!({
        "includes": [
            LIDVID_KEY,
            &*SWEEPERS_ANCESTRY_VERSION_METADATA_KEY,
        ],
    })
}

pub fn refs_source_fields() -> Value {
    json!({
        "includes": ["collection_lidvid", "batch_id", "product_lidvid"],
    })
}

pub fn lidvid_only_source_fields() -> Value {
    json!({"includes": [LIDVID_KEY]})
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bundle_query_structure() {
        let query = all_bundles_query();
        let filters = query["bool"]["filter"].as_array().unwrap();
        assert_eq!(filters.len(), 1);
        assert_eq!(
            filters[0],
            json!({"term": {"product_class": "Product_Bundle"}})
        );
        assert!(query["bool"].get("must_not").is_none());
    }

    #[test]
    fn test_collection_query_excludes_current_version() {
        let query = pending_collections_query();
        let filters = query["bool"]["filter"].as_array().unwrap();
        assert_eq!(
            filters[0],
            json!({"term": {"product_class": "Product_Collection"}})
        );
        let must_not = query["bool"]["must_not"].as_array().unwrap();
        let version_clause =
            &must_not[0]["range"][&*SWEEPERS_ANCESTRY_VERSION_METADATA_KEY]["gte"];
        assert_eq!(version_clause, &json!(SWEEPERS_ANCESTRY_VERSION));
    }

    #[test]
    fn test_bundle_source_requests_reference_fields() {
        let includes = bundle_source_fields()["includes"].clone();
        let includes: Vec<String> = serde_json::from_value(includes).unwrap();
        assert!(includes.contains(&"lidvid".to_string()));
        assert!(includes.contains(&"ref_lid_collection".to_string()));
        assert!(includes.contains(&"ref_lidvid_collection".to_string()));
        assert!(includes.contains(&"alternate_ids".to_string()));
    }

    #[test]
    fn test_legacy_lid_expansion_is_limited_to_published() {
        let query = published_lidvids_for_lids_query(&["a:b:c:d".to_string()]);
        let must = query["bool"]["must"].as_array().unwrap();
        assert_eq!(
            must[0]["terms"][ARCHIVE_STATUS_KEY],
            json!(["archived", "certified"])
        );
        assert_eq!(must[1]["terms"]["lid"], json!(["a:b:c:d"]));
    }
}
