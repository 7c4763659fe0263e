use std::{
    collections::BTreeMap,
    process::ExitCode,
    sync::Arc,
};

use anyhow::Context as _;
use clap::Parser;
use opensearch::{
    auth::{
        AuthScheme,
        SigV4Signer,
    },
    Client,
    ClientConfig,
};
use sweepers::{
    context::Context,
    driver,
};
use url::Url;

/// Sweep the registry and write derived metadata (provenance, ancestry,
/// repairs) back onto its documents.
#[derive(Parser, Debug)]
#[command(name = "registry-sweepers")]
struct Args {
    /// Registry OpenSearch endpoint URL.
    #[arg(long, env = "PROV_ENDPOINT")]
    endpoint: Url,

    /// JSON map of {"username": "password"} for basic auth.
    #[arg(long, env = "PROV_CREDENTIALS", hide_env_values = true)]
    credentials: Option<String>,

    /// Sign requests with AWS credentials from the default provider chain
    /// instead of basic auth; the value names the role for operator
    /// reference only.
    #[arg(long, env = "SWEEPERS_IAM_ROLE_NAME")]
    iam_role_name: Option<String>,

    /// Multi-tenant node id; prefixes every index name.
    #[arg(long, env = "MULTITENANCY_NODE_ID")]
    node_id: Option<String>,

    /// Names of additional cross-cluster remotes to include in scans,
    /// space-separated.
    #[arg(long = "ccs-remotes", num_args = 0..)]
    ccs_remotes: Vec<String>,

    /// Log level (ERROR, WARN, INFO, DEBUG, TRACE).
    #[arg(long, env = "LOGLEVEL", default_value = "INFO")]
    log_level: String,

    /// Development mode: disables TLS certificate verification. Any
    /// non-empty value counts as set.
    #[arg(long, env = "DEV_MODE")]
    dev_mode: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let level = cmd_util::env::parse_log_level(&args.log_level);
    let _guard = cmd_util::env::config_service_with_level(level);
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("Sweepers run failed: {e:#}");
            ExitCode::FAILURE
        },
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let auth = resolve_auth(&args).await?;
    let mut config = ClientConfig::new(args.endpoint, auth);
    if args.dev_mode.as_deref().is_some_and(|v| !v.trim().is_empty()) {
        config.verify_tls = false;
    }
    let client = Arc::new(Client::new(config)?);
    client
        .ping()
        .await
        .context("failed to reach the registry endpoint")?;

    let ctx = Context::new(client, normalize(args.node_id), args.ccs_remotes);
    driver::run_sweepers(&ctx).await
}

async fn resolve_auth(args: &Args) -> anyhow::Result<AuthScheme> {
    let credentials = args
        .credentials
        .as_deref()
        .map(str::trim)
        .filter(|raw| !raw.is_empty());
    match (credentials, &args.iam_role_name) {
        (Some(raw), None) => {
            let (username, password) = parse_basic_credentials(raw)?;
            Ok(AuthScheme::Basic { username, password })
        },
        (None, Some(role)) => {
            tracing::info!("Signing requests with AWS credentials (role {role})");
            Ok(AuthScheme::SigV4(SigV4Signer::from_environment().await?))
        },
        (None, None) => anyhow::bail!(
            "one of PROV_CREDENTIALS or SWEEPERS_IAM_ROLE_NAME must be provided"
        ),
        (Some(_), Some(_)) => anyhow::bail!(
            "PROV_CREDENTIALS and SWEEPERS_IAM_ROLE_NAME are mutually exclusive"
        ),
    }
}

/// `PROV_CREDENTIALS` is a single-entry JSON map of username onto password.
fn parse_basic_credentials(raw: &str) -> anyhow::Result<(String, String)> {
    let parsed: BTreeMap<String, String> =
        serde_json::from_str(raw).context("PROV_CREDENTIALS is not a JSON object of strings")?;
    let mut entries = parsed.into_iter();
    let (username, password) = entries
        .next()
        .context("PROV_CREDENTIALS contains no credentials")?;
    if entries.next().is_some() {
        tracing::warn!("PROV_CREDENTIALS contains multiple entries; using the first");
    }
    Ok((username, password))
}

fn normalize(tenant: Option<String>) -> Option<String> {
    tenant
        .map(|tenant| tenant.trim().to_string())
        .filter(|tenant| !tenant.is_empty())
}

#[cfg(test)]
mod tests {
    use super::{
        normalize,
        parse_basic_credentials,
    };

    #[test]
    fn test_parse_basic_credentials() {
        let (username, password) =
            parse_basic_credentials(r#"{"svc-user": "hunter2"}"#).unwrap();
        assert_eq!(username, "svc-user");
        assert_eq!(password, "hunter2");

        assert!(parse_basic_credentials("{}").is_err());
        assert!(parse_basic_credentials("not json").is_err());
    }

    #[test]
    fn test_tenant_normalization() {
        assert_eq!(normalize(None), None);
        assert_eq!(normalize(Some("  ".to_string())), None);
        assert_eq!(normalize(Some(" atm ".to_string())), Some("atm".to_string()));
    }
}
