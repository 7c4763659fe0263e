//! Typed views over raw search hits from the registry indices. Parsing is
//! tolerant: a document missing a required field is an error for that
//! document only, and sweepers log it and move on.

use anyhow::Context as _;
use serde::Deserialize;
use serde_json::{
    Map,
    Value,
};

use crate::identifiers::{
    LidVid,
    ProductClass,
    ProductRef,
};

pub const LIDVID_KEY: &str = "lidvid";
pub const PRODUCT_CLASS_KEY: &str = "product_class";
pub const ALTERNATE_IDS_KEY: &str = "alternate_ids";
pub const REF_LID_COLLECTION_KEY: &str = "ref_lid_collection";
pub const REF_LIDVID_COLLECTION_KEY: &str = "ref_lidvid_collection";
pub const ARCHIVE_STATUS_KEY: &str = "ops:Tracking_Meta/ops:archive_status";
pub const SUPERSEDED_BY_KEY: &str = "ops:Provenance/ops:superseded_by";
pub const PARENT_BUNDLE_KEY: &str = "ops:Provenance/ops:parent_bundle_identifier";
pub const PARENT_COLLECTION_KEY: &str = "ops:Provenance/ops:parent_collection_identifier";
pub const ANCESTRY_REFS_KEY: &str = "ops:Provenance/ops:ancestor_refs";
pub const HARVEST_TIME_KEY: &str = "ops:Harvest_Info/ops:harvest_date_time";
pub const HARVEST_VERSION_KEY: &str = "ops:Harvest_Info/ops:harvest_version";

/// Only published products participate in provenance and ancestry.
pub const PUBLISHED_ARCHIVE_STATUSES: [&str; 2] = ["archived", "certified"];

/// One hit from a search response: document id, requested `_source` fields,
/// and the sort cursor values used by search-after paging.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchHit {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_source", default)]
    pub source: Map<String, Value>,
    #[serde(default)]
    pub sort: Vec<Value>,
}

impl SearchHit {
    pub fn from_source(id: impl Into<String>, source: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            source,
            sort: Vec::new(),
        }
    }

    pub fn str_field(&self, key: &str) -> anyhow::Result<&str> {
        self.source
            .get(key)
            .and_then(Value::as_str)
            .with_context(|| format!("document {} is missing required field {key:?}", self.id))
    }

    /// A field which legacy records may store as a bare scalar instead of an
    /// array; always observed as a list of strings.
    pub fn string_list_field(&self, key: &str) -> Vec<String> {
        coerce_to_list(self.source.get(key))
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect()
    }

    pub fn integer_field(&self, key: &str) -> Option<i64> {
        coerce_to_list(self.source.get(key))
            .first()
            .and_then(Value::as_i64)
    }
}

/// Legacy db records did not always wrap singleton properties in an enclosing
/// array; observe every such field as a list.
pub fn coerce_to_list(value: Option<&Value>) -> Vec<Value> {
    match value {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.clone(),
        Some(other) => vec![other.clone()],
    }
}

/// Registry product document, as read by the provenance sweeper.
#[derive(Debug, Clone)]
pub struct ProductDocument {
    pub lidvid: LidVid,
    pub product_class: ProductClass,
    /// Outer `None`: the field is absent or unparseable. Inner `None`: an
    /// explicit null (the chain tip).
    pub superseded_by: Option<Option<LidVid>>,
    source: Map<String, Value>,
}

impl ProductDocument {
    pub fn from_hit(hit: &SearchHit) -> anyhow::Result<Self> {
        let lidvid: LidVid = hit.str_field(LIDVID_KEY)?.parse()?;
        let product_class = hit
            .source
            .get(PRODUCT_CLASS_KEY)
            .and_then(Value::as_str)
            .map(ProductClass::from_field_value)
            .unwrap_or_else(|| lidvid.product_class());
        let superseded_by = match hit.source.get(SUPERSEDED_BY_KEY) {
            None => None,
            Some(Value::Null) => Some(None),
            Some(Value::String(s)) => match s.parse::<LidVid>() {
                Ok(successor) => Some(Some(successor)),
                Err(e) => {
                    tracing::warn!("Ignoring malformed {SUPERSEDED_BY_KEY} on {lidvid}: {e}");
                    None
                },
            },
            Some(other) => {
                tracing::warn!(
                    "Ignoring non-string {SUPERSEDED_BY_KEY} on {lidvid}: {other}"
                );
                None
            },
        };
        Ok(Self {
            lidvid,
            product_class,
            superseded_by,
            source: hit.source.clone(),
        })
    }

    pub fn sweeper_version(&self, metadata_key: &str) -> Option<i64> {
        coerce_to_list(self.source.get(metadata_key))
            .first()
            .and_then(Value::as_i64)
    }
}

/// A bundle and the collection references it declares, split by reference
/// shape: a LIDVID ref parents one collection version, a LID ref parents
/// every published version of the LID.
#[derive(Debug, Clone)]
pub struct BundleDocument {
    pub lidvid: LidVid,
    pub collection_refs: Vec<ProductRef>,
    pub stored_sweeper_version: Option<i64>,
}

impl BundleDocument {
    pub fn from_hit(hit: &SearchHit, version_metadata_key: &str) -> anyhow::Result<Self> {
        let lidvid: LidVid = hit.str_field(LIDVID_KEY)?.parse()?;
        let mut collection_refs = Vec::new();
        for raw in hit.string_list_field(REF_LIDVID_COLLECTION_KEY) {
            match raw.parse::<LidVid>() {
                Ok(reference) => collection_refs.push(ProductRef::LidVid(reference)),
                Err(e) => tracing::warn!("Ignoring unparseable collection ref on {lidvid}: {e}"),
            }
        }
        for raw in hit.string_list_field(REF_LID_COLLECTION_KEY) {
            match raw.parse() {
                Ok(reference) => collection_refs.push(ProductRef::Lid(reference)),
                Err(e) => tracing::warn!("Ignoring unparseable collection ref on {lidvid}: {e}"),
            }
        }
        for raw in hit.string_list_field(ALTERNATE_IDS_KEY) {
            match raw.parse::<ProductRef>() {
                Ok(reference) => collection_refs.push(reference),
                Err(e) => tracing::warn!("Ignoring unparseable alternate id on {lidvid}: {e}"),
            }
        }
        collection_refs.sort();
        collection_refs.dedup();
        Ok(Self {
            lidvid,
            collection_refs,
            stored_sweeper_version: hit.integer_field(version_metadata_key),
        })
    }
}

/// A collection document, as needed for ancestry eligibility.
#[derive(Debug, Clone)]
pub struct CollectionDocument {
    pub lidvid: LidVid,
    pub stored_ancestry_version: Option<i64>,
}

impl CollectionDocument {
    pub fn from_hit(hit: &SearchHit, version_metadata_key: &str) -> anyhow::Result<Self> {
        Ok(Self {
            lidvid: hit.str_field(LIDVID_KEY)?.parse()?,
            stored_ancestry_version: hit.integer_field(version_metadata_key),
        })
    }
}

/// One membership batch from the registry-refs index. A collection's members
/// are the union over its batches; legacy batches reference members by bare
/// LID instead of LIDVID.
#[derive(Debug, Clone)]
pub struct RefsBatchDocument {
    pub collection_lidvid: LidVid,
    pub batch_id: Option<i64>,
    pub product_refs: Vec<ProductRef>,
}

impl RefsBatchDocument {
    pub fn from_hit(hit: &SearchHit) -> anyhow::Result<Self> {
        let collection_lidvid: LidVid = hit.str_field("collection_lidvid")?.parse()?;
        let mut product_refs = Vec::new();
        for raw in hit.string_list_field("product_lidvid") {
            match raw.parse::<ProductRef>() {
                Ok(reference) => product_refs.push(reference),
                Err(e) => tracing::warn!(
                    "Ignoring unparseable member of {collection_lidvid} batch {:?}: {e}",
                    hit.id
                ),
            }
        }
        Ok(Self {
            collection_lidvid,
            batch_id: hit.integer_field("batch_id"),
            product_refs,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::identifiers::ProductClass;

    fn hit(source: Value) -> SearchHit {
        let id = source
            .get(LIDVID_KEY)
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let Value::Object(source) = source else {
            panic!("fixture source must be an object");
        };
        SearchHit {
            id,
            source,
            sort: Vec::new(),
        }
    }

    #[test]
    fn test_product_document_parses_successor_states() {
        let absent = ProductDocument::from_hit(&hit(json!({"lidvid": "a:b:c:d::1.0"}))).unwrap();
        assert_eq!(absent.superseded_by, None);

        let tip = ProductDocument::from_hit(&hit(json!({
            "lidvid": "a:b:c:d::1.0",
            SUPERSEDED_BY_KEY: null,
        })))
        .unwrap();
        assert_eq!(tip.superseded_by, Some(None));

        let superseded = ProductDocument::from_hit(&hit(json!({
            "lidvid": "a:b:c:d::1.0",
            SUPERSEDED_BY_KEY: "a:b:c:d::2.0",
        })))
        .unwrap();
        assert_eq!(
            superseded.superseded_by,
            Some(Some("a:b:c:d::2.0".parse().unwrap()))
        );

        // Malformed stored successors are warned about and treated as absent,
        // so the sweeper rewrites them.
        let malformed = ProductDocument::from_hit(&hit(json!({
            "lidvid": "a:b:c:d::1.0",
            SUPERSEDED_BY_KEY: "not a lidvid",
        })))
        .unwrap();
        assert_eq!(malformed.superseded_by, None);

        let wrong_type = ProductDocument::from_hit(&hit(json!({
            "lidvid": "a:b:c:d::1.0",
            SUPERSEDED_BY_KEY: 7,
        })))
        .unwrap();
        assert_eq!(wrong_type.superseded_by, None);
    }

    #[test]
    fn test_product_document_requires_lidvid() {
        let err = ProductDocument::from_hit(&hit(json!({"product_class": "Product_Bundle"})));
        assert!(err.is_err());
    }

    #[test]
    fn test_product_class_falls_back_to_lid_depth() {
        let doc = ProductDocument::from_hit(&hit(json!({"lidvid": "a:b:c:d:e::1.0"}))).unwrap();
        assert_eq!(doc.product_class, ProductClass::Collection);
    }

    #[test]
    fn test_bundle_document_collects_refs_of_both_shapes() {
        let doc = BundleDocument::from_hit(
            &hit(json!({
                "lidvid": "a:b:c:bundle::1.0",
                "ref_lidvid_collection": ["a:b:c:bundle:col::1.0"],
                "ref_lid_collection": "a:b:c:bundle:col2",
                "alternate_ids": ["a:b:c:bundle:col3", "not a lid"],
                "ops:Sweepers/ancestry_version": 1,
            })),
            "ops:Sweepers/ancestry_version",
        )
        .unwrap();
        assert_eq!(doc.stored_sweeper_version, Some(1));
        let refs: Vec<String> = doc.collection_refs.iter().map(ToString::to_string).collect();
        assert!(refs.contains(&"a:b:c:bundle:col::1.0".to_string()));
        assert!(refs.contains(&"a:b:c:bundle:col2".to_string()));
        assert!(refs.contains(&"a:b:c:bundle:col3".to_string()));
        assert_eq!(refs.len(), 3);
    }

    #[test]
    fn test_refs_batch_handles_legacy_lid_members() {
        let doc = RefsBatchDocument::from_hit(&SearchHit::from_source(
            "a:b:c:bundle:col::1.0::batch_1",
            json!({
                "collection_lidvid": "a:b:c:bundle:col::1.0",
                "batch_id": 1,
                "product_lidvid": ["a:b:c:bundle:col:p1::1.0", "a:b:c:bundle:col:p2"],
            })
            .as_object()
            .unwrap()
            .clone(),
        ))
        .unwrap();
        assert_eq!(doc.batch_id, Some(1));
        assert_eq!(doc.product_refs.len(), 2);
        assert!(matches!(doc.product_refs[0], ProductRef::LidVid(_)));
        assert!(matches!(doc.product_refs[1], ProductRef::Lid(_)));
    }

    #[test]
    fn test_coerce_to_list_wraps_scalars() {
        assert_eq!(coerce_to_list(Some(&json!("x"))), vec![json!("x")]);
        assert_eq!(coerce_to_list(Some(&json!(["x"]))), vec![json!("x")]);
        assert!(coerce_to_list(Some(&Value::Null)).is_empty());
        assert!(coerce_to_list(None).is_empty());
    }
}
