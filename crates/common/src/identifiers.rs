use std::{
    fmt,
    str::FromStr,
};

use serde::{
    de::Error as _,
    Deserialize,
    Deserializer,
    Serialize,
    Serializer,
};

/// Number of `:`-separated segments for each aggregation level.
const BUNDLE_DEPTH: usize = 4;
const COLLECTION_DEPTH: usize = 5;
const BASIC_PRODUCT_DEPTH: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentifierError {
    #[error("malformed LID {input:?}: {reason}")]
    MalformedLid { input: String, reason: &'static str },
    #[error("malformed LIDVID {input:?}: {reason}")]
    MalformedLidVid { input: String, reason: &'static str },
}

/// The three PDS aggregation levels, derived from LID segment depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProductClass {
    Bundle,
    Collection,
    Basic,
}

impl ProductClass {
    /// Classification from the `product_class` document field. Anything that
    /// isn't an aggregate product (e.g. `Product_Observational`) is a basic
    /// product.
    pub fn from_field_value(value: &str) -> Self {
        match value {
            "Product_Bundle" => Self::Bundle,
            "Product_Collection" => Self::Collection,
            _ => Self::Basic,
        }
    }
}

/// Logical Identifier: a colon-delimited hierarchical name, without a
/// version. Depth determines the product class.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lid(String);

impl Lid {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split(':')
    }

    pub fn product_class(&self) -> ProductClass {
        match self.segments().count() {
            BUNDLE_DEPTH => ProductClass::Bundle,
            COLLECTION_DEPTH => ProductClass::Collection,
            _ => ProductClass::Basic,
        }
    }

    /// The LID one level up the hierarchy, or `None` for bundles.
    pub fn parent(&self) -> Option<Lid> {
        if self.segments().count() <= BUNDLE_DEPTH {
            return None;
        }
        let (parent, _) = self.0.rsplit_once(':')?;
        Some(Lid(parent.to_string()))
    }
}

impl FromStr for Lid {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = |reason| IdentifierError::MalformedLid {
            input: s.to_string(),
            reason,
        };
        if s != s.trim() {
            return Err(malformed("leading/trailing whitespace"));
        }
        if s.contains("::") {
            return Err(malformed("contains a version suffix or empty segment"));
        }
        let segments: Vec<&str> = s.split(':').collect();
        if segments.iter().any(|segment| segment.is_empty()) {
            return Err(malformed("empty segment"));
        }
        if !(BUNDLE_DEPTH..=BASIC_PRODUCT_DEPTH).contains(&segments.len()) {
            return Err(malformed("wrong segment count"));
        }
        Ok(Lid(s.to_string()))
    }
}

impl fmt::Display for Lid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Version component of a LIDVID. Ordering is numeric on (major, minor),
/// never lexicographic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Vid {
    pub major: u64,
    pub minor: u64,
}

impl FromStr for Vid {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = |reason| IdentifierError::MalformedLidVid {
            input: s.to_string(),
            reason,
        };
        let (major, minor) = s
            .split_once('.')
            .ok_or_else(|| malformed("version is not of form major.minor"))?;
        if minor.contains('.') {
            return Err(malformed("version is not of form major.minor"));
        }
        let major = major
            .parse::<u64>()
            .map_err(|_| malformed("non-numeric major version"))?;
        let minor = minor
            .parse::<u64>()
            .map_err(|_| malformed("non-numeric minor version"))?;
        Ok(Vid { major, minor })
    }
}

impl fmt::Display for Vid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Versioned Logical Identifier: `<lid>::<major>.<minor>`. Uniquely
/// identifies a document in the registry index.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LidVid {
    lid: Lid,
    vid: Vid,
}

impl LidVid {
    pub fn new(lid: Lid, vid: Vid) -> Self {
        Self { lid, vid }
    }

    pub fn lid(&self) -> &Lid {
        &self.lid
    }

    pub fn vid(&self) -> Vid {
        self.vid
    }

    pub fn product_class(&self) -> ProductClass {
        self.lid.product_class()
    }

    pub fn is_bundle(&self) -> bool {
        self.product_class() == ProductClass::Bundle
    }

    pub fn is_collection(&self) -> bool {
        self.product_class() == ProductClass::Collection
    }

    pub fn is_basic_product(&self) -> bool {
        self.product_class() == ProductClass::Basic
    }
}

impl FromStr for LidVid {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = |reason| IdentifierError::MalformedLidVid {
            input: s.to_string(),
            reason,
        };
        if s != s.trim() {
            return Err(malformed("leading/trailing whitespace"));
        }
        let (lid, vid) = s
            .split_once("::")
            .ok_or_else(|| malformed("missing :: version separator"))?;
        if vid.contains("::") {
            return Err(malformed("multiple :: version separators"));
        }
        let lid = lid.parse::<Lid>().map_err(|_| malformed("invalid LID part"))?;
        let vid = vid.parse::<Vid>()?;
        Ok(LidVid { lid, vid })
    }
}

impl fmt::Display for LidVid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}::{}", self.lid, self.vid)
    }
}

impl Serialize for LidVid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for LidVid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// A reference which may name a specific product version or every version of
/// a LID. Bundles reference collections both ways.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProductRef {
    LidVid(LidVid),
    Lid(Lid),
}

impl ProductRef {
    pub fn lid(&self) -> &Lid {
        match self {
            Self::LidVid(lidvid) => lidvid.lid(),
            Self::Lid(lid) => lid,
        }
    }
}

impl FromStr for ProductRef {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.contains("::") {
            return Ok(Self::LidVid(s.parse()?));
        }
        Ok(Self::Lid(s.parse()?))
    }
}

impl fmt::Display for ProductRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::LidVid(lidvid) => write!(f, "{lidvid}"),
            Self::Lid(lid) => write!(f, "{lid}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_lid_classification_by_depth() {
        let bundle = Lid::from_str("urn:nasa:pds:bundle").unwrap();
        let collection = Lid::from_str("urn:nasa:pds:bundle:collection").unwrap();
        let product = Lid::from_str("urn:nasa:pds:bundle:collection:product").unwrap();
        assert_eq!(bundle.product_class(), ProductClass::Bundle);
        assert_eq!(collection.product_class(), ProductClass::Collection);
        assert_eq!(product.product_class(), ProductClass::Basic);
    }

    #[test]
    fn test_lid_parent() {
        let product = Lid::from_str("urn:nasa:pds:bundle:collection:product").unwrap();
        let collection = product.parent().unwrap();
        assert_eq!(collection.as_str(), "urn:nasa:pds:bundle:collection");
        let bundle = collection.parent().unwrap();
        assert_eq!(bundle.as_str(), "urn:nasa:pds:bundle");
        assert_eq!(bundle.parent(), None);
    }

    #[test]
    fn test_lid_rejects_malformed_input() {
        assert!(Lid::from_str("urn:nasa:pds:bundle ").is_err());
        assert!(Lid::from_str(" urn:nasa:pds:bundle").is_err());
        assert!(Lid::from_str("urn:nasa:pds::bundle").is_err());
        assert!(Lid::from_str("urn:nasa:pds:bundle::1.0").is_err());
        assert!(Lid::from_str("urn:nasa:pds").is_err());
        assert!(Lid::from_str("a:b:c:d:e:f:g").is_err());
        assert!(Lid::from_str("").is_err());
    }

    #[test]
    fn test_lidvid_parse_and_display_round_trip() {
        for s in [
            "urn:nasa:pds:bundle::1.0",
            "urn:nasa:pds:bundle:collection::10.1",
            "urn:nasa:pds:bundle:collection:product::200.0",
        ] {
            assert_eq!(LidVid::from_str(s).unwrap().to_string(), s);
        }
    }

    #[test]
    fn test_lidvid_rejects_malformed_input() {
        assert!(LidVid::from_str("urn:nasa:pds:bundle").is_err());
        assert!(LidVid::from_str("urn:nasa:pds:bundle::1").is_err());
        assert!(LidVid::from_str("urn:nasa:pds:bundle::1.0.0").is_err());
        assert!(LidVid::from_str("urn:nasa:pds:bundle::one.zero").is_err());
        assert!(LidVid::from_str("urn:nasa:pds:bundle::1.0::2.0").is_err());
        assert!(LidVid::from_str("urn:nasa:pds:bundle::1.0 ").is_err());
    }

    #[test]
    fn test_version_ordering_is_numeric() {
        let v9 = LidVid::from_str("a:b:c:d::9.0").unwrap();
        let v10 = LidVid::from_str("a:b:c:d::10.0").unwrap();
        let v10_2 = LidVid::from_str("a:b:c:d::10.2").unwrap();
        let v10_11 = LidVid::from_str("a:b:c:d::10.11").unwrap();
        assert!(v9 < v10);
        assert!(v10 < v10_2);
        assert!(v10_2 < v10_11);
    }

    #[test]
    fn test_ordering_is_lid_first() {
        let a = LidVid::from_str("a:b:c:d::99.0").unwrap();
        let b = LidVid::from_str("a:b:c:e::1.0").unwrap();
        assert!(a < b);
    }

    #[test]
    fn test_product_ref_parsing() {
        let by_version = ProductRef::from_str("a:b:c:d::1.0").unwrap();
        let by_lid = ProductRef::from_str("a:b:c:d").unwrap();
        assert!(matches!(by_version, ProductRef::LidVid(_)));
        assert!(matches!(by_lid, ProductRef::Lid(_)));
        assert_eq!(by_version.lid(), by_lid.lid());
    }

    fn arb_lidvid() -> impl Strategy<Value = LidVid> {
        (
            prop::collection::vec("[a-z][a-z0-9_]{0,8}", 4..=6),
            0u64..1000,
            0u64..1000,
        )
            .prop_map(|(segments, major, minor)| {
                format!("{}::{major}.{minor}", segments.join(":"))
                    .parse()
                    .unwrap()
            })
    }

    proptest! {
        #[test]
        fn proptest_lidvid_round_trips(lidvid in arb_lidvid()) {
            let reparsed: LidVid = lidvid.to_string().parse().unwrap();
            prop_assert_eq!(reparsed, lidvid);
        }

        #[test]
        fn proptest_order_matches_components(a in arb_lidvid(), b in arb_lidvid()) {
            let expected = (a.lid().as_str(), a.vid().major, a.vid().minor)
                .cmp(&(b.lid().as_str(), b.vid().major, b.vid().minor));
            prop_assert_eq!(a.cmp(&b), expected);
        }
    }
}
