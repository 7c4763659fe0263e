//! Batch sweepers that post-process the planetary-science product registry:
//! scan its documents, derive cross-document metadata, and write that
//! metadata back in bulk.

pub mod ancestry;
pub mod context;
pub mod driver;
pub mod provenance;
pub mod reindexer;
pub mod repairkit;
pub mod versioning;
