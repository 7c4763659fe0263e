use std::{
    collections::BTreeSet,
    sync::Arc,
};

use common::identifiers::LidVid;
use serde::{
    Deserialize,
    Serialize,
};

/// Ancestry for one product: the parent collections and bundles it was
/// observed with directly, plus attached parent records through which
/// transitive ancestry resolves (a product inherits its collections' bundle
/// history).
#[derive(Debug, Clone)]
pub struct AncestryRecord {
    pub lidvid: LidVid,
    pub explicit_parent_collection_lidvids: BTreeSet<LidVid>,
    pub explicit_parent_bundle_lidvids: BTreeSet<LidVid>,
    parent_records: Vec<Arc<AncestryRecord>>,
}

impl AncestryRecord {
    pub fn new(lidvid: LidVid) -> Self {
        Self {
            lidvid,
            explicit_parent_collection_lidvids: BTreeSet::new(),
            explicit_parent_bundle_lidvids: BTreeSet::new(),
            parent_records: Vec::new(),
        }
    }

    pub fn with_parents(
        lidvid: LidVid,
        parent_collection_lidvids: impl IntoIterator<Item = LidVid>,
        parent_bundle_lidvids: impl IntoIterator<Item = LidVid>,
    ) -> Self {
        Self {
            lidvid,
            explicit_parent_collection_lidvids: parent_collection_lidvids.into_iter().collect(),
            explicit_parent_bundle_lidvids: parent_bundle_lidvids.into_iter().collect(),
            parent_records: Vec::new(),
        }
    }

    pub fn attach_parent_record(&mut self, parent: Arc<AncestryRecord>) {
        self.parent_records.push(parent);
    }

    /// Union another record for the same product into this one.
    pub fn update_with(&mut self, other: &AncestryRecord) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.lidvid == other.lidvid,
            "cannot merge ancestry of {} into {}",
            other.lidvid,
            self.lidvid,
        );
        self.explicit_parent_collection_lidvids
            .extend(other.explicit_parent_collection_lidvids.iter().cloned());
        self.explicit_parent_bundle_lidvids
            .extend(other.explicit_parent_bundle_lidvids.iter().cloned());
        self.parent_records.extend(other.parent_records.iter().cloned());
        Ok(())
    }

    /// Explicit parent bundles plus every bundle resolved through attached
    /// parent records.
    pub fn resolve_parent_bundle_lidvids(&self) -> BTreeSet<LidVid> {
        let mut resolved = self.explicit_parent_bundle_lidvids.clone();
        for parent in &self.parent_records {
            resolved.extend(parent.resolve_parent_bundle_lidvids());
        }
        resolved
    }

    /// Explicit parent collections plus, for each attached parent record,
    /// the parent itself and its own collection ancestry.
    pub fn resolve_parent_collection_lidvids(&self) -> BTreeSet<LidVid> {
        let mut resolved = self.explicit_parent_collection_lidvids.clone();
        for parent in &self.parent_records {
            resolved.insert(parent.lidvid.clone());
            resolved.extend(parent.resolve_parent_collection_lidvids());
        }
        resolved
    }

    pub fn history(&self) -> AncestryHistory {
        AncestryHistory {
            parent_collection_lidvids: self
                .resolve_parent_collection_lidvids()
                .iter()
                .map(ToString::to_string)
                .collect(),
            parent_bundle_lidvids: self
                .resolve_parent_bundle_lidvids()
                .iter()
                .map(ToString::to_string)
                .collect(),
        }
    }
}

impl PartialEq for AncestryRecord {
    fn eq(&self, other: &Self) -> bool {
        self.lidvid == other.lidvid
            && self.resolve_parent_collection_lidvids() == other.resolve_parent_collection_lidvids()
            && self.resolve_parent_bundle_lidvids() == other.resolve_parent_bundle_lidvids()
    }
}

impl Eq for AncestryRecord {}

/// Fully resolved ancestry for one product, in string form: the value
/// accumulated in the spill map and drained by the deferred pass. Merging is
/// per-field set union, which is commutative and associative as the spill map
/// requires.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AncestryHistory {
    pub parent_collection_lidvids: BTreeSet<String>,
    pub parent_bundle_lidvids: BTreeSet<String>,
}

impl AncestryHistory {
    pub fn merge(mut a: Self, b: Self) -> Self {
        a.parent_collection_lidvids.extend(b.parent_collection_lidvids);
        a.parent_bundle_lidvids.extend(b.parent_bundle_lidvids);
        a
    }

    /// Every ancestor in both LIDVID and LID form, for the deduplicated
    /// `ancestor_refs` field.
    pub fn ancestor_refs(&self) -> BTreeSet<String> {
        let mut refs = BTreeSet::new();
        for lidvid in self
            .parent_collection_lidvids
            .iter()
            .chain(&self.parent_bundle_lidvids)
        {
            refs.insert(lidvid.clone());
            if let Some((lid, _)) = lidvid.split_once("::") {
                refs.insert(lid.to_string());
            }
        }
        refs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lidvid(s: &str) -> LidVid {
        s.parse().unwrap()
    }

    #[test]
    fn test_history_serialization_round_trips() {
        let record = AncestryRecord::with_parents(
            lidvid("a:b:c:d:e:f::1.0"),
            [lidvid("a:b:c:d:e::1.0"), lidvid("a:b:c:d:e::2.0")],
            [lidvid("a:b:c:d::1.0"), lidvid("a:b:c:d::2.0")],
        );
        let history = record.history();
        let serialized = serde_json::to_value(&history).unwrap();
        assert_eq!(
            serialized,
            serde_json::json!({
                "parent_collection_lidvids": ["a:b:c:d:e::1.0", "a:b:c:d:e::2.0"],
                "parent_bundle_lidvids": ["a:b:c:d::1.0", "a:b:c:d::2.0"],
            })
        );
        let round_tripped: AncestryHistory = serde_json::from_value(serialized).unwrap();
        assert_eq!(round_tripped, history);
    }

    #[test]
    fn test_update_with_unions_and_rejects_mismatches() {
        let mut dest = AncestryRecord::with_parents(
            lidvid("a:b:c:d:e:f::1.0"),
            [lidvid("a:b:c:d:e::1.0")],
            [lidvid("a:b:c:d::1.0")],
        );
        let src = AncestryRecord::with_parents(
            lidvid("a:b:c:d:e:f::1.0"),
            [lidvid("a:b:c:d:e::2.0")],
            [lidvid("a:b:c:d::2.0")],
        );
        dest.update_with(&src).unwrap();
        let expected = AncestryRecord::with_parents(
            lidvid("a:b:c:d:e:f::1.0"),
            [lidvid("a:b:c:d:e::1.0"), lidvid("a:b:c:d:e::2.0")],
            [lidvid("a:b:c:d::1.0"), lidvid("a:b:c:d::2.0")],
        );
        assert_eq!(dest, expected);

        let mismatched = AncestryRecord::new(lidvid("a:b:c:d:e:f::2.0"));
        assert!(dest.update_with(&mismatched).is_err());
    }

    #[test]
    fn test_resolution_inherits_through_parent_records() {
        let parent = Arc::new(AncestryRecord::with_parents(
            lidvid("a:b:c:d:parent::1.0"),
            [lidvid("a:b:c:d:e::1.0")],
            [lidvid("a:b:c:d::1.0")],
        ));
        let mut child = AncestryRecord::new(lidvid("a:b:c:d:e:f::1.0"));
        child.attach_parent_record(parent.clone());

        assert_eq!(
            child.resolve_parent_bundle_lidvids(),
            BTreeSet::from([lidvid("a:b:c:d::1.0")]),
        );
        assert_eq!(
            child.resolve_parent_collection_lidvids(),
            BTreeSet::from([lidvid("a:b:c:d:e::1.0"), lidvid("a:b:c:d:parent::1.0")]),
        );
    }

    #[test]
    fn test_ancestor_refs_include_lid_and_lidvid_forms() {
        let history = AncestryHistory {
            parent_collection_lidvids: BTreeSet::from(["a:b:c:d:e::1.0".to_string()]),
            parent_bundle_lidvids: BTreeSet::from(["a:b:c:d::1.0".to_string()]),
        };
        assert_eq!(
            history.ancestor_refs(),
            BTreeSet::from([
                "a:b:c:d".to_string(),
                "a:b:c:d::1.0".to_string(),
                "a:b:c:d:e".to_string(),
                "a:b:c:d:e::1.0".to_string(),
            ])
        );
    }

    #[test]
    fn test_history_merge_is_union() {
        let a = AncestryHistory {
            parent_collection_lidvids: BTreeSet::from(["c::1.0".to_string()]),
            parent_bundle_lidvids: BTreeSet::from(["b::1.0".to_string()]),
        };
        let b = AncestryHistory {
            parent_collection_lidvids: BTreeSet::from(["c::2.0".to_string()]),
            parent_bundle_lidvids: BTreeSet::from(["b::1.0".to_string()]),
        };
        let merged = AncestryHistory::merge(a.clone(), b.clone());
        assert_eq!(merged, AncestryHistory::merge(b, a));
        assert_eq!(merged.parent_collection_lidvids.len(), 2);
        assert_eq!(merged.parent_bundle_lidvids.len(), 1);
    }
}
