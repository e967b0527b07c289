//! Reachability check of a served candidate page before an agent run.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

const PREFLIGHT_TIMEOUT: Duration = Duration::from_secs(20);

/// Outcome of one preflight request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreflightReport {
    /// URL actually requested, scheme included
    pub url: String,
    pub status: Option<u16>,
    pub ok: bool,
    /// Connection or status failure description
    pub error: Option<String>,
}

/// Prefix `http://` when `url` names no scheme
pub fn with_scheme(url: &str) -> String {
    if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        format!("http://{url}")
    }
}

/// GET `url` and report whether it answered with a success status.
///
/// Never fails: connection problems are part of the report.
pub async fn check_url(url: &str) -> PreflightReport {
    let url = with_scheme(url);
    let client = match reqwest::Client::builder().timeout(PREFLIGHT_TIMEOUT).build() {
        Ok(client) => client,
        Err(err) => {
            return PreflightReport {
                url,
                status: None,
                ok: false,
                error: Some(format!("Failed to build HTTP client: {err}")),
            };
        }
    };

    match client.get(&url).send().await {
        Ok(response) if response.status().is_success() => {
            info!(url = %url, status = %response.status(), "page is reachable");
            PreflightReport {
                url,
                status: Some(response.status().as_u16()),
                ok: true,
                error: None,
            }
        }
        Ok(response) => {
            warn!(url = %url, status = %response.status(), "page returned an error status");
            PreflightReport {
                status: Some(response.status().as_u16()),
                ok: false,
                error: Some(format!("URL returned status code {}", response.status())),
                url,
            }
        }
        Err(err) => {
            warn!(url = %url, error = %err, "page is unreachable");
            PreflightReport {
                error: Some(format!("Failed to connect to {url}: {err}")),
                url,
                status: None,
                ok: false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Server;

    #[test]
    fn test_scheme_is_added() {
        assert_eq!(with_scheme("localhost:3000"), "http://localhost:3000");
        assert_eq!(with_scheme("https://example.com"), "https://example.com");
    }

    #[tokio::test]
    async fn test_reachable_page() {
        let mut server = Server::new_async().await;
        let mock = server.mock("GET", "/").with_status(200).with_body("<html></html>").create_async().await;

        let report = check_url(&server.url()).await;

        mock.assert_async().await;
        assert!(report.ok);
        assert_eq!(report.status, Some(200));
        assert_eq!(report.error, None);
    }

    #[tokio::test]
    async fn test_error_status_is_reported() {
        let mut server = Server::new_async().await;
        let _mock = server.mock("GET", "/").with_status(503).create_async().await;

        let report = check_url(&server.url()).await;

        assert!(!report.ok);
        assert_eq!(report.status, Some(503));
        assert!(report.error.unwrap().contains("503"));
    }

    #[tokio::test]
    async fn test_unreachable_host() {
        // Port 9 (discard) is closed on test machines.
        let report = check_url("127.0.0.1:9").await;
        assert!(!report.ok);
        assert_eq!(report.url, "http://127.0.0.1:9");
        assert_eq!(report.status, None);
        assert!(report.error.unwrap().starts_with("Failed to connect"));
    }
}
