//! Logical index names, multi-tenant resolution, and mapping maintenance.

use std::{
    collections::BTreeMap,
    fmt,
    str::FromStr,
};

use serde_json::{
    json,
    Value,
};

use crate::{
    Client,
    Error,
};

/// The registry's logical index names. Multi-tenant deployments prefix each
/// with the node id; no other names are supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexName {
    Registry,
    RegistryRefs,
    RegistryDd,
}

impl IndexName {
    pub fn logical_name(self) -> &'static str {
        match self {
            Self::Registry => "registry",
            Self::RegistryRefs => "registry-refs",
            Self::RegistryDd => "registry-dd",
        }
    }

    pub fn resolved(self, tenant: Option<&str>) -> String {
        match tenant.map(str::trim).filter(|tenant| !tenant.is_empty()) {
            Some(tenant) => format!("{tenant}-{}", self.logical_name()),
            None => self.logical_name().to_string(),
        }
    }
}

impl FromStr for IndexName {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "registry" => Ok(Self::Registry),
            "registry-refs" => Ok(Self::RegistryRefs),
            "registry-dd" => Ok(Self::RegistryDd),
            other => anyhow::bail!(
                "index name {other:?} not supported (expected one of registry, registry-refs, \
                 registry-dd)"
            ),
        }
    }
}

impl fmt::Display for IndexName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.logical_name())
    }
}

/// `indices.exists` answers true for aliases too; a real index is one that
/// exists and is not an alias.
pub async fn index_exists(client: &Client, index_or_alias: &str) -> Result<bool, Error> {
    Ok(client.exists_index(index_or_alias).await? && !client.exists_alias(index_or_alias).await?)
}

/// Resolve an alias to its concrete index name, passing real index names
/// through unchanged.
pub async fn resolve_index_name_if_aliased(
    client: &Client,
    index_or_alias: &str,
) -> anyhow::Result<String> {
    if index_exists(client, index_or_alias).await? {
        return Ok(index_or_alias.to_string());
    }
    if let Some(index) = client.resolve_alias(index_or_alias).await? {
        tracing::debug!("Resolved alias {index_or_alias} to index {index}");
        return Ok(index);
    }
    anyhow::bail!("could not resolve index for name {index_or_alias:?}")
}

/// Property-name → type map from a live index mapping.
pub fn mapping_property_types(mapping_response: &Value) -> BTreeMap<String, String> {
    let Some(index_body) = mapping_response
        .as_object()
        .and_then(|indices| indices.values().next())
    else {
        return BTreeMap::new();
    };
    let Some(properties) = index_body
        .get("mappings")
        .and_then(|mappings| mappings.get("properties"))
        .and_then(Value::as_object)
    else {
        return BTreeMap::new();
    };
    properties
        .iter()
        .filter_map(|(name, body)| {
            body.get("type")
                .and_then(Value::as_str)
                .map(|t| (name.clone(), t.to_string()))
        })
        .collect()
}

/// Idempotently ensure `field` is mapped as `mapping_type` on `index`.
/// Succeeds when the field is absent (mapping added) or already mapped with
/// the requested type; a differing existing type is a conflict requiring
/// operator action.
pub async fn ensure_index_mapping(
    client: &Client,
    index: &str,
    field: &str,
    mapping_type: &str,
) -> Result<(), Error> {
    let mapping = client.get_mapping(index).await?;
    let existing_types = mapping_property_types(&mapping);
    match existing_types.get(field) {
        Some(existing) if existing == mapping_type => Ok(()),
        Some(existing) => Err(Error::MappingConflict {
            index: index.to_string(),
            field: field.to_string(),
            existing: existing.clone(),
            requested: mapping_type.to_string(),
        }),
        None => {
            tracing::info!("Adding mapping ({field}, {mapping_type}) to index {index}");
            let body = json!({"properties": {field: {"type": mapping_type}}});
            client.put_mapping(index, &body).await
        },
    }
}
