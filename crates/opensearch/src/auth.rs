//! Authentication strategies for the document-store client.
//!
//! Basic auth carries a fixed username/password. SigV4 signs every outgoing
//! request with credentials fetched from the AWS default provider chain at
//! request time, so rotating (e.g. IAM-role) credentials never go stale.

use std::time::SystemTime;

use aws_config::BehaviorVersion;
use aws_credential_types::provider::{
    ProvideCredentials as _,
    SharedCredentialsProvider,
};
use aws_sigv4::{
    http_request::{
        sign,
        PayloadChecksumKind,
        SignableBody,
        SignableRequest,
        SigningSettings,
    },
    sign::v4,
};
use aws_smithy_runtime_api::client::identity::Identity;
use http::{
    HeaderMap,
    Method,
};
use url::Url;

use crate::Error;

/// Signing name used by serverless OpenSearch collections.
const SIGNING_SERVICE: &str = "aoss";

#[derive(Clone)]
pub enum AuthScheme {
    None,
    Basic { username: String, password: String },
    SigV4(SigV4Signer),
}

impl std::fmt::Debug for AuthScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "AuthScheme::None"),
            Self::Basic { username, .. } => {
                write!(f, "AuthScheme::Basic {{ username: {username:?} }}")
            },
            Self::SigV4(signer) => write!(f, "AuthScheme::SigV4 {{ region: {:?} }}", signer.region),
        }
    }
}

#[derive(Clone)]
pub struct SigV4Signer {
    credentials: SharedCredentialsProvider,
    region: String,
}

impl SigV4Signer {
    /// Resolve credentials and region from the AWS default provider chain
    /// (environment, profile, IMDS/IRSA role).
    pub async fn from_environment() -> anyhow::Result<Self> {
        let config = aws_config::defaults(BehaviorVersion::latest()).load().await;
        let credentials = config
            .credentials_provider()
            .ok_or_else(|| anyhow::anyhow!("no AWS credentials provider available"))?;
        let region = config
            .region()
            .ok_or_else(|| anyhow::anyhow!("AWS region must be configured (e.g. AWS_REGION)"))?
            .to_string();
        Ok(Self {
            credentials,
            region,
        })
    }

    /// Sign one request, mutating `headers` in place. Credentials are fetched
    /// from the provider on every call; caching the resulting auth header
    /// would break credential rotation.
    pub async fn sign_request(
        &self,
        method: &Method,
        url: &Url,
        headers: &mut HeaderMap,
        body: &[u8],
    ) -> Result<(), Error> {
        let credentials = self
            .credentials
            .provide_credentials()
            .await
            .map_err(|e| Error::Signing(format!("failed to resolve AWS credentials: {e}")))?;
        let identity: Identity = credentials.into();

        let mut settings = SigningSettings::default();
        settings.payload_checksum_kind = PayloadChecksumKind::XAmzSha256;
        let signing_params = v4::SigningParams::builder()
            .identity(&identity)
            .region(&self.region)
            .name(SIGNING_SERVICE)
            .time(SystemTime::now())
            .settings(settings)
            .build()
            .map_err(|e| Error::Signing(e.to_string()))?;

        let signable_headers = headers
            .iter()
            .map(|(name, value)| (name.as_str(), value.to_str().unwrap_or_default()));
        let signable = SignableRequest::new(
            method.as_str(),
            url.as_str(),
            signable_headers,
            SignableBody::Bytes(body),
        )
        .map_err(|e| Error::Signing(e.to_string()))?;

        let (instructions, _signature) = sign(signable, &signing_params.into())
            .map_err(|e| Error::Signing(e.to_string()))?
            .into_parts();

        let mut signed = http::Request::builder()
            .method(method.clone())
            .uri(url.as_str());
        for (name, value) in headers.iter() {
            signed = signed.header(name, value);
        }
        let mut signed = signed
            .body(())
            .map_err(|e| Error::Signing(e.to_string()))?;
        instructions.apply_to_request_http1x(&mut signed);
        *headers = signed.headers().clone();
        Ok(())
    }
}
