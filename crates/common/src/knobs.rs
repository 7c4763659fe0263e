//! Tunable limits and parameters for the sweepers. Every knob can be
//! overridden with an environment variable of the same name.

use std::{
    sync::LazyLock,
    time::Duration,
};

use cmd_util::env::env_config;

/// Page size for scroll and search-after scans.
pub static SWEEPERS_PAGE_SIZE: LazyLock<usize> =
    LazyLock::new(|| env_config("SWEEPERS_PAGE_SIZE", 10000));

/// How long the server keeps a scroll cursor alive between pages.
pub static SWEEPERS_SCROLL_TTL_MINUTES: LazyLock<u64> =
    LazyLock::new(|| env_config("SWEEPERS_SCROLL_TTL_MINUTES", 10));

/// Per-request timeout for scan and bulk requests.
pub static SWEEPERS_REQUEST_TIMEOUT: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("SWEEPERS_REQUEST_TIMEOUT_SECS", 20)));

/// Updates buffered before a bulk chunk is flushed. Measured in updates (two
/// NDJSON lines each), not lines.
pub static SWEEPERS_BULK_CHUNK_SIZE: LazyLock<usize> =
    LazyLock::new(|| env_config("SWEEPERS_BULK_CHUNK_SIZE", 5000));

/// Attempts per retryable request, including the first.
pub static SWEEPERS_RETRY_ATTEMPTS: LazyLock<u32> =
    LazyLock::new(|| env_config("SWEEPERS_RETRY_ATTEMPTS", 4));

/// Initial retry delay; doubles on each failure, with jitter.
pub static SWEEPERS_RETRY_INITIAL_BACKOFF: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_millis(env_config("SWEEPERS_RETRY_INITIAL_BACKOFF_MS", 2000)));

/// Ceiling on any single retry delay.
pub static SWEEPERS_RETRY_MAX_BACKOFF: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("SWEEPERS_RETRY_MAX_BACKOFF_SECS", 60)));

/// Ancestry spill map: in-memory entries before the oldest slice spills to
/// disk.
pub static SWEEPERS_SPILL_THRESHOLD: LazyLock<usize> =
    LazyLock::new(|| env_config("SWEEPERS_SPILL_THRESHOLD", 100000));

/// Proportion of the cache evicted per spill, oldest-insertion-first.
pub static SWEEPERS_SPILL_PROPORTION: LazyLock<f64> =
    LazyLock::new(|| env_config("SWEEPERS_SPILL_PROPORTION", 0.5));

/// LIDs fetched per provenance terms-aggregation page.
pub static PROVENANCE_AGG_PAGE_SIZE: LazyLock<usize> =
    LazyLock::new(|| env_config("PROVENANCE_AGG_PAGE_SIZE", 1000));

/// Products iterated per reindexer pass before updates are written, limiting
/// work discarded if the cluster becomes overloaded mid-pass.
pub static REINDEXER_BATCH_LIMIT: LazyLock<usize> =
    LazyLock::new(|| env_config("REINDEXER_BATCH_LIMIT", 100000));

/// The reindexer is opt-in; it mutates index mappings.
pub static SWEEPERS_ENABLE_REINDEXER: LazyLock<bool> =
    LazyLock::new(|| env_config("SWEEPERS_ENABLE_REINDEXER", false));
