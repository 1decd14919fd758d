//! Request construction against the engine's external controller.
//!
//! Every call goes through [`EndpointClient::request`], which composes the
//! URL from the server descriptor, percent-encodes user-supplied names and
//! attaches the bearer credential. A descriptor that cannot form a URL yields
//! [`CoreError::InvalidConfiguration`] instead of a request.

use futures_util::future::BoxFuture;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::{ProbeConfig, ServerConfig};
use crate::error::CoreError;
use crate::model::{ProvidersResponse, ProxiesResponse};

/// Everything except unreserved characters is escaped; names may contain
/// slashes, spaces, emoji and so on.
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Extra time the HTTP client waits beyond the engine-side probe timeout.
const TRANSPORT_MARGIN_MS: u64 = 5_000;

/// Supplies the bearer credential. The OpenWRT session login lives outside
/// this crate and plugs in here.
pub trait TokenSource: Send + Sync {
    fn token(&self) -> BoxFuture<'_, Result<Option<String>, CoreError>>;
}

/// The controller secret from the config file.
pub struct StaticSecret(pub Option<String>);

impl TokenSource for StaticSecret {
    fn token(&self) -> BoxFuture<'_, Result<Option<String>, CoreError>> {
        let token = self.0.clone();
        Box::pin(async move { Ok(token) })
    }
}

#[derive(Serialize)]
struct SelectRequest<'a> {
    name: &'a str,
}

/// Result of a delay test: every name the engine reported, with 0 for
/// timeouts.
pub type DelayMap = HashMap<String, u32>;

#[derive(Clone)]
pub struct EndpointClient {
    http: reqwest::Client,
    server: ServerConfig,
    probe: ProbeConfig,
    tokens: Arc<dyn TokenSource>,
}

impl EndpointClient {
    pub fn new(
        server: ServerConfig,
        probe: ProbeConfig,
        tokens: Arc<dyn TokenSource>,
    ) -> Result<Self, CoreError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(probe.timeout_ms + TRANSPORT_MARGIN_MS))
            .build()
            .map_err(|e| CoreError::InvalidConfiguration(format!("build reqwest client: {}", e)))?;
        Ok(Self {
            http,
            server,
            probe,
            tokens,
        })
    }

    pub fn with_secret(server: ServerConfig, probe: ProbeConfig) -> Result<Self, CoreError> {
        let tokens = Arc::new(StaticSecret(server.secret.clone()));
        Self::new(server, probe, tokens)
    }

    pub fn server(&self) -> &ServerConfig {
        &self.server
    }

    pub fn probe_config(&self) -> &ProbeConfig {
        &self.probe
    }

    pub async fn token(&self) -> Result<Option<String>, CoreError> {
        self.tokens.token().await
    }

    fn base(&self, secure_scheme: &str, plain_scheme: &str) -> Option<Url> {
        let host = self.server.host.trim();
        if host.is_empty() || self.server.port == 0 {
            return None;
        }
        let host = if host.contains(':') && !host.starts_with('[') {
            format!("[{}]", host)
        } else {
            host.to_string()
        };
        let scheme = if self.server.tls { secure_scheme } else { plain_scheme };
        let url = Url::parse(&format!("{}://{}:{}/", scheme, host, self.server.port)).ok()?;
        if url.host_str().is_none() {
            return None;
        }
        Some(url)
    }

    fn compose(mut base: Url, segments: &[&str], query: &[(&str, String)]) -> Option<Url> {
        let path = segments
            .iter()
            .map(|s| utf8_percent_encode(s, SEGMENT).to_string())
            .collect::<Vec<_>>()
            .join("/");
        base.set_path(&format!("/{}", path));
        if !query.is_empty() {
            let mut pairs = base.query_pairs_mut();
            for (k, v) in query {
                pairs.append_pair(k, v);
            }
        }
        Some(base)
    }

    /// Fully-qualified control-plane URL, or `None` if the descriptor is
    /// unusable.
    pub fn url(&self, segments: &[&str], query: &[(&str, String)]) -> Option<Url> {
        Self::compose(self.base("https", "http")?, segments, query)
    }

    /// Log channel URL carrying `token` and `level` as query parameters.
    pub fn logs_url(&self, token: Option<&str>, level: &str) -> Option<Url> {
        let query = [
            ("token", token.unwrap_or_default().to_string()),
            ("level", level.to_string()),
        ];
        Self::compose(self.base("wss", "ws")?, &["logs"], &query)
    }

    pub async fn request(
        &self,
        method: Method,
        segments: &[&str],
        query: &[(&str, String)],
    ) -> Result<RequestBuilder, CoreError> {
        let url = self.url(segments, query).ok_or_else(|| {
            CoreError::InvalidConfiguration(format!(
                "cannot build a URL from {}:{}",
                self.server.host, self.server.port
            ))
        })?;
        let mut req = self
            .http
            .request(method, url)
            .header(CONTENT_TYPE, "application/json");
        if let Some(token) = self.token().await? {
            if !token.is_empty() {
                req = req.header(AUTHORIZATION, format!("Bearer {}", token));
            }
        }
        Ok(req)
    }

    async fn checked(req: RequestBuilder) -> Result<Response, CoreError> {
        let resp = req.send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(CoreError::from_status(status, &body))
    }

    async fn json<T: DeserializeOwned>(req: RequestBuilder) -> Result<T, CoreError> {
        let resp = Self::checked(req).await?;
        let bytes = resp.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn probe_query(&self) -> [(&'static str, String); 2] {
        [
            ("url", self.probe.url.clone()),
            ("timeout", self.probe.timeout_ms.to_string()),
        ]
    }

    // ========================================================================
    // Typed calls
    // ========================================================================

    pub async fn version(&self) -> Result<serde_json::Value, CoreError> {
        Self::json(self.request(Method::GET, &["version"], &[]).await?).await
    }

    pub async fn proxies(&self) -> Result<ProxiesResponse, CoreError> {
        let mut resp: ProxiesResponse =
            Self::json(self.request(Method::GET, &["proxies"], &[]).await?).await?;
        for (key, proxy) in resp.proxies.iter_mut() {
            if proxy.name.is_empty() {
                proxy.name = key.clone();
            }
        }
        Ok(resp)
    }

    pub async fn providers(&self) -> Result<ProvidersResponse, CoreError> {
        Self::json(
            self.request(Method::GET, &["providers", "proxies"], &[])
                .await?,
        )
        .await
    }

    pub async fn select_proxy(&self, group: &str, proxy: &str) -> Result<(), CoreError> {
        let req = self
            .request(Method::PUT, &["proxies", group], &[])
            .await?
            .json(&SelectRequest { name: proxy });
        Self::checked(req).await?;
        Ok(())
    }

    /// `GET proxies/{name}/delay`.
    pub async fn proxy_delay(&self, name: &str) -> Result<DelayMap, CoreError> {
        let req = self
            .request(Method::GET, &["proxies", name, "delay"], &self.probe_query())
            .await?;
        self.delay_call(name, req).await
    }

    /// `GET group/{name}/delay`; the engine tests every member and reports
    /// each one.
    pub async fn group_delay(&self, name: &str) -> Result<DelayMap, CoreError> {
        let req = self
            .request(Method::GET, &["group", name, "delay"], &self.probe_query())
            .await?;
        self.delay_call(name, req).await
    }

    async fn delay_call(&self, name: &str, req: RequestBuilder) -> Result<DelayMap, CoreError> {
        match Self::json::<serde_json::Value>(req).await {
            Ok(value) => parse_delay_map(name, &value),
            Err(CoreError::Server { status, detail }) if is_probe_timeout(status) => {
                debug!("delay test for {} reported {}: {}", name, status, detail);
                Ok(HashMap::from([(name.to_string(), 0)]))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn update_provider(&self, provider: &str) -> Result<(), CoreError> {
        let req = self
            .request(Method::PUT, &["providers", "proxies", provider], &[])
            .await?;
        Self::checked(req).await?;
        Ok(())
    }

    pub async fn provider_healthcheck(&self, provider: &str) -> Result<(), CoreError> {
        let req = self
            .request(
                Method::GET,
                &["providers", "proxies", provider, "healthcheck"],
                &[],
            )
            .await?;
        Self::checked(req).await?;
        Ok(())
    }

    pub async fn provider_proxy_healthcheck(
        &self,
        provider: &str,
        proxy: &str,
    ) -> Result<u32, CoreError> {
        let req = self
            .request(
                Method::GET,
                &["providers", "proxies", provider, proxy, "healthcheck"],
                &self.probe_query(),
            )
            .await?;
        match Self::json::<serde_json::Value>(req).await {
            Ok(value) => Ok(parse_delay_map(proxy, &value)?
                .remove(proxy)
                .unwrap_or(0)),
            Err(CoreError::Server { status, .. }) if is_probe_timeout(status) => Ok(0),
            Err(e) => Err(e),
        }
    }
}

/// Statuses the engine uses when the probe itself ran and failed.
fn is_probe_timeout(status: u16) -> bool {
    status == StatusCode::REQUEST_TIMEOUT.as_u16()
        || status == StatusCode::SERVICE_UNAVAILABLE.as_u16()
        || status == StatusCode::GATEWAY_TIMEOUT.as_u16()
}

/// Accepts both `{"delay": n}` (single proxy) and `{"name": n, ...}` (group).
pub fn parse_delay_map(name: &str, value: &serde_json::Value) -> Result<DelayMap, CoreError> {
    let obj = value
        .as_object()
        .ok_or_else(|| CoreError::Decode(format!("delay response for {} is not an object", name)))?;
    if let Some(delay) = obj.get("delay") {
        let delay = delay
            .as_u64()
            .ok_or_else(|| CoreError::Decode(format!("delay for {} is not a number", name)))?;
        return Ok(HashMap::from([(name.to_string(), clamp_delay(delay))]));
    }
    Ok(obj
        .iter()
        .filter_map(|(k, v)| v.as_u64().map(|d| (k.clone(), clamp_delay(d))))
        .collect())
}

fn clamp_delay(d: u64) -> u32 {
    d.min(u32::MAX as u64) as u32
}
