use std::time::{Duration, Instant};

use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;

use crate::config::{HttpCfg, UpstreamCfg};
use crate::error::{CoreResult, RelayError};
use crate::model::RelayMode;
use crate::upstream::UpstreamResponse;

/// Thin wrapper around reqwest::Client with defaults and helpers.
#[derive(Debug, Clone)]
pub struct HttpClient {
    inner: Client,
    user_agent: String,
}

impl HttpClient {
    pub fn new_default() -> CoreResult<Self> {
        Self::from_cfg(&HttpCfg::default())
    }

    pub fn from_cfg(cfg: &HttpCfg) -> CoreResult<Self> {
        let mut builder = Client::builder()
            .connect_timeout(Duration::from_millis(cfg.connect_timeout_ms))
            .timeout(Duration::from_millis(cfg.request_timeout_ms));
        if let Some(n) = cfg.pool_max_idle_per_host {
            builder = builder.pool_max_idle_per_host(n);
        }
        let inner = builder
            .build()
            .map_err(|e| RelayError::Other(anyhow::anyhow!("http client build failed: {e}")))?;
        Ok(Self {
            inner,
            user_agent: concat!("relay/", env!("CARGO_PKG_VERSION")).to_string(),
        })
    }

    /// POST JSON and hand back the response as-is, whatever its status, so it can be relayed.
    pub async fn post_json_raw<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
        headers: &[(&str, &str)],
    ) -> CoreResult<UpstreamResponse> {
        let start = Instant::now();
        let mut req = self
            .inner
            .post(url)
            .json(body)
            .header("User-Agent", &self.user_agent);
        for (k, v) in headers {
            req = req.header(*k, *v);
        }

        let resp = req.send().await.map_err(|e| {
            tracing::warn!(error = %e, url, "upstream request failed");
            RelayError::UpstreamUnavailable { upstream: url.to_string() }
        })?;

        tracing::debug!(
            status = resp.status().as_u16(),
            latency_ms = start.elapsed().as_millis() as u64,
            upstream_request_id = extract_request_id(resp.headers()).as_deref(),
            "upstream responded"
        );
        Ok(UpstreamResponse::from_reqwest(resp))
    }
}

fn extract_request_id(headers: &reqwest::header::HeaderMap) -> Option<String> {
    static CANDIDATES: [&str; 4] = [
        "x-request-id",
        "request-id",
        "openai-request-id",
        "x-amzn-requestid",
    ];
    for k in CANDIDATES {
        if let Some(v) = headers.get(k)
            && let Ok(s) = v.to_str()
        {
            return Some(s.to_string());
        }
    }
    None
}

/// An OpenAI-compatible upstream: base URL plus bearer key.
#[derive(Debug, Clone)]
pub struct Upstream {
    http: HttpClient,
    base: String,
    api_key: Option<SecretString>,
}

impl Upstream {
    pub fn new(http: HttpClient, base: impl Into<String>, api_key: Option<SecretString>) -> Self {
        let base = base.into();
        Self {
            http,
            base: base.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    /// Build from config, reading the key from the configured environment variable if set.
    pub fn from_cfg(cfg: &UpstreamCfg, http: &HttpCfg) -> CoreResult<Self> {
        let api_key = match &cfg.api_key_env {
            Some(var) => Some(SecretString::from(std::env::var(var).map_err(|_| {
                RelayError::Validation(format!("environment variable '{var}' is not set"))
            })?)),
            None => None,
        };
        Ok(Self::new(HttpClient::from_cfg(http)?, cfg.base_url.clone(), api_key))
    }

    pub fn url_for(&self, mode: RelayMode) -> String {
        format!("{}{}", self.base, mode.endpoint())
    }

    pub async fn send<T: Serialize + ?Sized>(
        &self,
        mode: RelayMode,
        body: &T,
    ) -> CoreResult<UpstreamResponse> {
        let auth = self
            .api_key
            .as_ref()
            .map(|k| format!("Bearer {}", k.expose_secret()));
        let mut headers: Vec<(&str, &str)> = vec![("Content-Type", "application/json")];
        if let Some(auth) = auth.as_deref() {
            headers.push(("Authorization", auth));
        }
        self.http.post_json_raw(&self.url_for(mode), body, &headers).await
    }
}
