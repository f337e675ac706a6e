//! Gateway Bypass Fetcher
//!
//! Default [`BypassFetch`] implementation. The Bittrex socket endpoint sits
//! behind an anti-automation gateway that answers 503 until a request arrives
//! with an accepted user-agent and clearance cookie. This adapter performs a
//! browser-like GET against the gateway, collects the cookies it sets, and
//! packages them with the user-agent as the [`BypassCredential`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::cookie::{CookieStore, Jar};
use url::Url;

use crate::application::ports::{BypassCredential, BypassError, BypassFetch};

/// User-agent presented to the gateway. The same value must accompany every
/// later request, so it travels inside the credential.
const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// Fetches the bypass credential by clearing the gateway challenge.
pub struct GatewayBypassFetcher {
    url: Url,
    user_agent: String,
    jar: Arc<Jar>,
    http: reqwest::Client,
}

impl GatewayBypassFetcher {
    /// Create a fetcher targeting the given gateway URL.
    ///
    /// # Errors
    ///
    /// Returns [`BypassError::Fetch`] if the HTTP client cannot be built.
    pub fn new(url: Url) -> Result<Self, BypassError> {
        Self::with_user_agent(url, DEFAULT_USER_AGENT)
    }

    /// Create a fetcher presenting a specific user-agent.
    ///
    /// # Errors
    ///
    /// Returns [`BypassError::Fetch`] if the HTTP client cannot be built.
    pub fn with_user_agent(url: Url, user_agent: impl Into<String>) -> Result<Self, BypassError> {
        let user_agent = user_agent.into();
        let jar = Arc::new(Jar::default());
        let http = reqwest::Client::builder()
            .user_agent(user_agent.clone())
            .cookie_provider(Arc::clone(&jar))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| BypassError::Fetch(format!("http client: {e}")))?;
        Ok(Self {
            url,
            user_agent,
            jar,
            http,
        })
    }

    /// User-agent this fetcher presents.
    #[must_use]
    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }
}

#[async_trait]
impl BypassFetch for GatewayBypassFetcher {
    async fn fetch(&self) -> Result<BypassCredential, BypassError> {
        tracing::debug!(url = %self.url, "Fetching gateway bypass credential");

        let response = self
            .http
            .get(self.url.clone())
            .send()
            .await
            .map_err(|e| BypassError::Fetch(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(BypassError::Fetch(format!(
                "gateway answered {status} instead of clearing"
            )));
        }

        let cookie = self
            .jar
            .cookies(&self.url)
            .and_then(|value| value.to_str().map(str::to_string).ok())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| BypassError::Fetch("gateway set no cookies".to_string()))?;

        tracing::info!("Gateway bypass credential acquired");
        Ok(BypassCredential::new(self.user_agent.clone(), cookie))
    }
}

impl std::fmt::Debug for GatewayBypassFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayBypassFetcher")
            .field("url", &self.url.as_str())
            .field("user_agent", &self.user_agent)
            .finish_non_exhaustive()
    }
}
