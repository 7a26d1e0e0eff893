//! Daemon→server HTTP calls, authenticated with the ai-critic-token cookie read from the
//! credentials file.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use common::config::{Config, AUTH_COOKIE_NAME};

#[derive(Debug, Clone, Deserialize)]
pub struct DomainSummary {
    pub domain: String,
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Clone)]
pub struct ServerClient {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl ServerClient {
    pub fn new(cfg: &Config, server_port: u16) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            base_url: format!("http://localhost:{}", server_port),
            token: cfg.read_auth_token(),
            http,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut req = self.http.request(method, format!("{}{}", self.base_url, path));
        if let Some(token) = &self.token {
            req = req.header("cookie", format!("{}={}", AUTH_COOKIE_NAME, token));
        }
        req
    }

    /// GET /ping and verify the body is "pong".
    pub async fn ping(&self) -> bool {
        let Ok(resp) = self
            .http
            .get(format!("{}/ping", self.base_url))
            .timeout(Duration::from_secs(2))
            .send()
            .await
        else {
            return false;
        };
        resp.status().is_success() && resp.text().await.map(|t| t == "pong").unwrap_or(false)
    }

    /// POST /api/shutdown. A 200 response is the server's promise that it is stopping.
    pub async fn shutdown(&self) -> Result<()> {
        let resp = self
            .request(reqwest::Method::POST, "/api/shutdown")
            .send()
            .await
            .context("calling /api/shutdown")?;
        if !resp.status().is_success() {
            bail!("/api/shutdown returned {}", resp.status());
        }
        Ok(())
    }

    pub async fn list_domains(&self) -> Result<Vec<DomainSummary>> {
        let resp = self
            .request(reqwest::Method::GET, "/api/domains")
            .send()
            .await
            .context("calling /api/domains")?;
        if !resp.status().is_success() {
            bail!("/api/domains returned {}", resp.status());
        }
        resp.json().await.context("parsing /api/domains response")
    }

    async fn domain_action(&self, action: &str, domain: &str) -> Result<()> {
        let resp = self
            .request(
                reqwest::Method::POST,
                &format!("/api/domains/tunnel/{}", action),
            )
            .json(&serde_json::json!({ "domain": domain }))
            .send()
            .await
            .with_context(|| format!("calling /api/domains/tunnel/{}", action))?;
        if !resp.status().is_success() {
            bail!("/api/domains/tunnel/{} returned {}", action, resp.status());
        }
        Ok(())
    }

    /// Stop+start each enabled domain tunnel; returns one log line per step.
    pub async fn fix_tunnels(&self) -> Result<Vec<String>> {
        let domains = self.list_domains().await?;
        let mut log = Vec::new();
        let enabled: Vec<_> = domains.into_iter().filter(|d| d.enabled).collect();
        if enabled.is_empty() {
            log.push("no enabled domain tunnels".to_string());
            return Ok(log);
        }
        for d in enabled {
            match self.domain_action("stop", &d.domain).await {
                Ok(()) => log.push(format!("stopped tunnel for {}", d.domain)),
                Err(e) => {
                    log.push(format!("stopping tunnel for {}: {:#}", d.domain, e));
                    continue;
                }
            }
            match self.domain_action("start", &d.domain).await {
                Ok(()) => log.push(format!("started tunnel for {}", d.domain)),
                Err(e) => log.push(format!("starting tunnel for {}: {:#}", d.domain, e)),
            }
        }
        Ok(log)
    }
}
