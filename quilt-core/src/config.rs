//! Hub endpoint selection.
//!
//! The hub URL is configuration input: a development endpoint on localhost
//! or a deployed endpoint, chosen by runtime environment detection. An
//! explicit `QUILT_HUB_URL` always wins; otherwise `QUILT_ENV=production`
//! selects the deployed URL (from `QUILT_DEPLOYED_URL`), and everything
//! else falls back to the local development hub.

use std::env;

pub const DEV_HUB_URL: &str = "ws://127.0.0.1:9090";

const ENV_HUB_URL: &str = "QUILT_HUB_URL";
const ENV_ENVIRONMENT: &str = "QUILT_ENV";
const ENV_DEPLOYED_URL: &str = "QUILT_DEPLOYED_URL";

/// Resolved hub endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub url: String,
}

impl Endpoint {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// The local development hub.
    pub fn development() -> Self {
        Self::new(DEV_HUB_URL)
    }

    /// Pick the endpoint from the process environment.
    pub fn from_env() -> Self {
        if let Ok(url) = env::var(ENV_HUB_URL) {
            if !url.trim().is_empty() {
                return Self::new(url);
            }
        }

        let is_production = env::var(ENV_ENVIRONMENT)
            .map(|v| v.eq_ignore_ascii_case("production"))
            .unwrap_or(false);

        if is_production {
            if let Ok(url) = env::var(ENV_DEPLOYED_URL) {
                if !url.trim().is_empty() {
                    return Self::new(url);
                }
            }
            log::warn!("{ENV_ENVIRONMENT}=production but {ENV_DEPLOYED_URL} is unset; using development hub");
        }

        Self::development()
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::development()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_development_endpoint() {
        assert_eq!(Endpoint::development().url(), DEV_HUB_URL);
    }

    #[test]
    fn test_default_is_development() {
        assert_eq!(Endpoint::default(), Endpoint::development());
    }

    #[test]
    fn test_explicit_url() {
        let ep = Endpoint::new("ws://example.net:7000");
        assert_eq!(ep.url(), "ws://example.net:7000");
    }
}
