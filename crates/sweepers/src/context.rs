use std::sync::Arc;

use opensearch::{
    index_utils::IndexName,
    scan::cross_cluster_index_path,
    Client,
};

/// Everything a sweeper needs to talk to the registry, assembled once by the
/// driver. The tenant token is threaded through here rather than read from
/// the environment at call sites.
#[derive(Clone)]
pub struct Context {
    pub client: Arc<Client>,
    pub tenant: Option<String>,
    pub remotes: Vec<String>,
}

impl Context {
    pub fn new(client: Arc<Client>, tenant: Option<String>, remotes: Vec<String>) -> Self {
        Self {
            client,
            tenant,
            remotes,
        }
    }

    /// Tenant-resolved index name; the target for writes.
    pub fn index(&self, name: IndexName) -> String {
        name.resolved(self.tenant.as_deref())
    }

    /// Tenant-resolved index path including cross-cluster remotes; the
    /// target for scans.
    pub fn scan_path(&self, name: IndexName) -> String {
        cross_cluster_index_path(&self.index(name), &self.remotes)
    }
}
