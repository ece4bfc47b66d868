//! HTTP repository source

use std::future::Future;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::source::RepositorySource;

/// Max attempts for one catalog fetch
const MAX_RETRIES: u32 = 3;
/// Delay between attempts
const RETRY_DELAY: Duration = Duration::from_secs(2);
/// Time to establish a TCP connection
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
/// Overall request timeout; catalogs are small documents
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Build the HTTP client shared by catalog fetchers
pub fn build_client() -> Result<Client> {
    Client::builder()
        .user_agent(concat!("vinery/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(REQUEST_TIMEOUT)
        .build()
        .context("Failed to create HTTP client")
}

/// Run an async operation, retrying failed attempts
pub async fn with_retry<F, Fut, T>(
    operation_name: &str,
    max_retries: u32,
    delay: Duration,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_retries = max_retries.max(1);
    let mut last_error = None;

    for attempt in 1..=max_retries {
        match f().await {
            Ok(result) => {
                if attempt > 1 {
                    info!("{} succeeded on attempt {}/{}", operation_name, attempt, max_retries);
                }
                return Ok(result);
            }
            Err(e) => {
                warn!(
                    "{} failed (attempt {}/{}): {}",
                    operation_name, attempt, max_retries, e
                );
                last_error = Some(e);

                if attempt < max_retries {
                    sleep(delay).await;
                }
            }
        }
    }

    match last_error {
        Some(e) => Err(e.context(format!(
            "{} failed after {} attempts",
            operation_name, max_retries
        ))),
        None => bail!("{} was never attempted", operation_name),
    }
}

/// GET a URL and return the body, failing on non-success status
pub async fn fetch_url(client: &Client, url: &str) -> Result<Vec<u8>> {
    let response = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("Failed to fetch {}", url))?;

    if !response.status().is_success() {
        bail!("Failed to fetch {}: HTTP {}", url, response.status());
    }

    let bytes = response
        .bytes()
        .await
        .with_context(|| format!("Failed to read response body from {}", url))?;

    debug!("Fetched {} bytes from {}", bytes.len(), url);
    Ok(bytes.to_vec())
}

/// Source serving the catalog document over HTTP(S)
pub struct HttpSource {
    name: String,
    url: String,
    client: Client,
}

impl HttpSource {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            url: url.into(),
            client: build_client()?,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl RepositorySource for HttpSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self) -> Result<Vec<u8>> {
        let operation = format!("Fetch catalog '{}'", self.name);
        with_retry(&operation, MAX_RETRIES, RETRY_DELAY, || {
            fetch_url(&self.client, &self.url)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_with_retry_recovers() {
        let attempts = AtomicU32::new(0);
        let result = with_retry("flaky", 3, Duration::ZERO, || async {
            let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 2 {
                bail!("attempt {} failed", n);
            }
            Ok(n)
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_with_retry_gives_up() {
        let attempts = AtomicU32::new(0);
        let result: Result<()> = with_retry("broken", 3, Duration::ZERO, || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            bail!("always fails")
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    #[ignore] // Requires network
    async fn test_fetch_unreachable_host() {
        let source = HttpSource::new("nowhere", "http://127.0.0.1:9/catalog.json").unwrap();
        assert!(source.fetch().await.is_err());
    }
}
