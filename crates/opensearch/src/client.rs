use std::time::Duration;

use common::{
    document::SearchHit,
    knobs::SWEEPERS_REQUEST_TIMEOUT,
};
use http::{
    header::CONTENT_TYPE,
    HeaderMap,
    HeaderValue,
    Method,
    StatusCode,
};
use serde::{
    de::DeserializeOwned,
    Deserialize,
};
use serde_json::Value;
use url::Url;

use crate::{
    auth::AuthScheme,
    Error,
};

const ERROR_BODY_EXCERPT_LEN: usize = 2000;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub endpoint: Url,
    pub auth: AuthScheme,
    pub verify_tls: bool,
    pub request_timeout: Duration,
}

impl ClientConfig {
    pub fn new(endpoint: Url, auth: AuthScheme) -> Self {
        Self {
            endpoint,
            auth,
            verify_tls: true,
            request_timeout: *SWEEPERS_REQUEST_TIMEOUT,
        }
    }
}

/// Thin wrapper over one pooled `reqwest::Client`; shared by every sweeper in
/// a run and safe to use from concurrent tasks.
pub struct Client {
    http: reqwest::Client,
    endpoint: Url,
    auth: AuthScheme,
    request_timeout: Duration,
}

enum Payload<'a> {
    Empty,
    Json(&'a Value),
    NdJson(&'a str),
}

impl Client {
    pub fn new(config: ClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder();
        if !config.verify_tls {
            tracing::warn!("TLS certificate verification is disabled");
            builder = builder.danger_accept_invalid_certs(true);
        }
        Ok(Self {
            http: builder.build()?,
            endpoint: config.endpoint,
            auth: config.auth,
            request_timeout: config.request_timeout,
        })
    }

    pub async fn ping(&self) -> Result<(), Error> {
        self.request(Method::GET, "", &[], Payload::Empty).await?;
        Ok(())
    }

    pub async fn search(&self, index_path: &str, body: &Value) -> Result<SearchResponse, Error> {
        let path = format!("{index_path}/_search");
        let response = self
            .request(Method::POST, &path, &[], Payload::Json(body))
            .await?;
        parse_json(response).await
    }

    pub async fn search_scroll_begin(
        &self,
        index_path: &str,
        body: &Value,
        scroll_ttl_minutes: u64,
    ) -> Result<SearchResponse, Error> {
        let path = format!("{index_path}/_search");
        let query = [("scroll", format!("{scroll_ttl_minutes}m"))];
        let response = self
            .request(Method::POST, &path, &query, Payload::Json(body))
            .await?;
        parse_json(response).await
    }

    pub async fn search_scroll_continue(
        &self,
        scroll_id: &str,
        scroll_ttl_minutes: u64,
    ) -> Result<SearchResponse, Error> {
        let body = serde_json::json!({
            "scroll": format!("{scroll_ttl_minutes}m"),
            "scroll_id": scroll_id,
        });
        let response = self
            .request(Method::POST, "_search/scroll", &[], Payload::Json(&body))
            .await?;
        parse_json(response).await
    }

    pub async fn scroll_clear(&self, scroll_id: &str) -> Result<(), Error> {
        let path = format!("_search/scroll/{scroll_id}");
        self.request(Method::DELETE, &path, &[], Payload::Empty)
            .await?;
        Ok(())
    }

    /// Total hits for a query body of the form `{"query": …}`.
    pub async fn count(&self, index_path: &str, body: &Value) -> Result<u64, Error> {
        #[derive(Deserialize)]
        struct CountResponse {
            count: u64,
        }
        let path = format!("{index_path}/_count");
        let response = self
            .request(Method::POST, &path, &[], Payload::Json(body))
            .await?;
        let parsed: CountResponse = parse_json(response).await?;
        Ok(parsed.count)
    }

    pub async fn bulk(&self, index: &str, ndjson: &str) -> Result<BulkResponse, Error> {
        let path = format!("{index}/_bulk");
        let response = self
            .request(Method::PUT, &path, &[], Payload::NdJson(ndjson))
            .await?;
        parse_json(response).await
    }

    pub async fn get_mapping(&self, index: &str) -> Result<Value, Error> {
        let path = format!("{index}/_mapping");
        let response = self
            .request(Method::GET, &path, &[], Payload::Empty)
            .await?;
        parse_json(response).await
    }

    pub async fn put_mapping(&self, index: &str, body: &Value) -> Result<(), Error> {
        let path = format!("{index}/_mapping");
        self.request(Method::PUT, &path, &[], Payload::Json(body))
            .await?;
        Ok(())
    }

    pub async fn exists_index(&self, name: &str) -> Result<bool, Error> {
        self.exists(name).await
    }

    pub async fn exists_alias(&self, name: &str) -> Result<bool, Error> {
        self.exists(&format!("_alias/{name}")).await
    }

    /// The concrete index behind an alias, or `None` when no such alias
    /// exists.
    pub async fn resolve_alias(&self, name: &str) -> Result<Option<String>, Error> {
        let path = format!("_alias/{name}");
        let response = match self.request(Method::GET, &path, &[], Payload::Empty).await {
            Ok(response) => response,
            Err(Error::Query { status, .. }) if status == StatusCode::NOT_FOUND => {
                return Ok(None)
            },
            Err(e) => return Err(e),
        };
        let body: Value = parse_json(response).await?;
        let index = body
            .as_object()
            .and_then(|aliases| aliases.keys().next())
            .cloned();
        Ok(index)
    }

    async fn exists(&self, path: &str) -> Result<bool, Error> {
        match self.request(Method::HEAD, path, &[], Payload::Empty).await {
            Ok(_) => Ok(true),
            Err(Error::Query { status, .. }) if status == StatusCode::NOT_FOUND => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn build_url(&self, path: &str, query: &[(&str, String)]) -> Url {
        let mut url = self.endpoint.clone();
        let base = url.path().trim_end_matches('/').to_string();
        url.set_path(&format!("{base}/{path}"));
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (name, value) in query {
                pairs.append_pair(name, value);
            }
        }
        url
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        payload: Payload<'_>,
    ) -> Result<reqwest::Response, Error> {
        let url = self.build_url(path, query);

        let mut headers = HeaderMap::new();
        let body: Vec<u8> = match payload {
            Payload::Empty => Vec::new(),
            Payload::Json(value) => {
                headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                serde_json::to_vec(value)
                    .map_err(|e| Error::MalformedResponse(format!("unencodable body: {e}")))?
            },
            Payload::NdJson(lines) => {
                headers.insert(
                    CONTENT_TYPE,
                    HeaderValue::from_static("application/x-ndjson"),
                );
                lines.as_bytes().to_vec()
            },
        };

        if let AuthScheme::SigV4(signer) = &self.auth {
            signer
                .sign_request(&method, &url, &mut headers, &body)
                .await?;
        }

        let mut request = self
            .http
            .request(method, url)
            .timeout(self.request_timeout)
            .headers(headers)
            .body(body);
        if let AuthScheme::Basic { username, password } = &self.auth {
            request = request.basic_auth(username, Some(password));
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, body))
    }
}

fn classify_status(status: StatusCode, body: String) -> Error {
    let mut body = body;
    body.truncate(ERROR_BODY_EXCERPT_LEN);
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        Error::Auth { status }
    } else if status.is_server_error() {
        Error::ServerError { status, body }
    } else {
        Error::Query { status, body }
    }
}

async fn parse_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, Error> {
    let body = response.text().await?;
    serde_json::from_str(&body).map_err(|e| {
        let mut excerpt = body;
        excerpt.truncate(ERROR_BODY_EXCERPT_LEN);
        Error::MalformedResponse(format!("{e}: {excerpt}"))
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchResponse {
    #[serde(default)]
    pub hits: HitsEnvelope,
    #[serde(rename = "_scroll_id")]
    pub scroll_id: Option<String>,
    #[serde(default)]
    pub aggregations: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HitsEnvelope {
    #[serde(default)]
    pub total: TotalHits,
    #[serde(default)]
    pub hits: Vec<SearchHit>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct TotalHits {
    #[serde(default)]
    pub value: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BulkResponse {
    #[serde(default)]
    pub errors: bool,
    #[serde(default)]
    pub items: Vec<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_response_parses_scroll_shape() {
        let raw = serde_json::json!({
            "_scroll_id": "abc123",
            "hits": {
                "total": {"value": 2, "relation": "eq"},
                "hits": [
                    {"_id": "a::1.0", "_source": {"lidvid": "a::1.0"}},
                    {"_id": "a::2.0", "_source": {"lidvid": "a::2.0"}, "sort": ["a::2.0"]},
                ],
            },
        });
        let parsed: SearchResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.scroll_id.as_deref(), Some("abc123"));
        assert_eq!(parsed.hits.total.value, 2);
        assert_eq!(parsed.hits.hits.len(), 2);
        assert_eq!(parsed.hits.hits[1].sort, vec![serde_json::json!("a::2.0")]);
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, String::new()),
            Error::Auth { .. }
        ));
        assert!(classify_status(StatusCode::SERVICE_UNAVAILABLE, String::new()).is_retryable());
        assert!(!classify_status(StatusCode::BAD_REQUEST, String::new()).is_retryable());
    }
}
