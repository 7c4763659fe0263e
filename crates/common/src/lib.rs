//! Shared building blocks for the registry sweepers: the PDS identifier
//! model, document views over raw search hits, retry backoff, and tunable
//! knobs.

pub mod backoff;
pub mod document;
pub mod identifiers;
pub mod knobs;
