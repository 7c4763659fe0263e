//! Per-sweeper version stamps. A sweeper's version must be incremented any
//! time it changes in a way that requires reprocessing previously-processed
//! documents; documents stamped at the current version are filtered out of
//! the next run's eligibility query.

use std::sync::LazyLock;

pub const SWEEPERS_REPAIRKIT_VERSION: i64 = 1;
pub const SWEEPERS_PROVENANCE_VERSION: i64 = 2;
pub const SWEEPERS_ANCESTRY_VERSION: i64 = 2;

/// The reindexer stamps a timestamp rather than a version: the flag's
/// presence marks a document as tested, and writing it forces a reindex of
/// the whole document.
pub const REINDEXER_FLAG_METADATA_KEY: &str = "ops:Provenance/ops:reindexed_at";

pub fn sweeper_version_metadata_key(sweeper_name: &str) -> String {
    format!("ops:Sweepers/{sweeper_name}_version")
}

pub static SWEEPERS_REPAIRKIT_VERSION_METADATA_KEY: LazyLock<String> =
    LazyLock::new(|| sweeper_version_metadata_key("repairkit"));

pub static SWEEPERS_PROVENANCE_VERSION_METADATA_KEY: LazyLock<String> =
    LazyLock::new(|| sweeper_version_metadata_key("provenance"));

pub static SWEEPERS_ANCESTRY_VERSION_METADATA_KEY: LazyLock<String> =
    LazyLock::new(|| sweeper_version_metadata_key("ancestry"));
