//! Authenticated access to an OpenSearch-compatible document store, plus the
//! two engines every sweeper is built from: paged scans (scroll and
//! search-after) and chunked bulk updates.

pub mod auth;
pub mod bulk;
mod client;
mod error;
pub mod index_utils;
pub mod retry;
pub mod scan;

pub use client::{
    BulkResponse,
    Client,
    ClientConfig,
    HitsEnvelope,
    SearchResponse,
    TotalHits,
};
pub use error::Error;
