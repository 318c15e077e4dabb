use crate::error::{RagError, Result};
use reqwest::Client;
use std::future::Future;
use std::time::Duration;
use tracing::warn;
use url::Url;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Network settings shared by every HTTP collaborator.
#[derive(Debug, Clone, Copy)]
pub struct HttpSettings {
    pub timeout: Duration,
    pub retry_backoff: Duration,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }
}

impl HttpSettings {
    pub fn client(&self) -> Result<Client> {
        Ok(Client::builder().timeout(self.timeout).build()?)
    }
}

/// Joins `path` onto a base URL, keeping any path prefix the base already has.
pub fn endpoint(base: &str, path: &str) -> Result<String> {
    let parsed = Url::parse(base)
        .map_err(|error| RagError::Config(format!("invalid base url {base}: {error}")))?;
    Ok(format!(
        "{}/{}",
        parsed.as_str().trim_end_matches('/'),
        path.trim_start_matches('/')
    ))
}

/// Runs `operation`, retrying once after `backoff` when the failure is transient.
pub async fn with_retry<F, Fut, T>(label: &str, backoff: Duration, operation: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match operation().await {
        Ok(value) => Ok(value),
        Err(error) if error.is_transient() => {
            warn!(
                collaborator = label,
                backoff_ms = backoff.as_millis() as u64,
                error = %error,
                "retrying after transient error"
            );
            tokio::time::sleep(backoff).await;
            operation().await
        }
        Err(error) => Err(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn endpoint_keeps_base_path() -> Result<()> {
        assert_eq!(
            endpoint("https://api.groq.com/openai/v1/", "/chat/completions")?,
            "https://api.groq.com/openai/v1/chat/completions"
        );
        assert_eq!(endpoint("http://localhost:8080", "rerank")?, "http://localhost:8080/rerank");
        assert!(matches!(endpoint("not a url", "x"), Err(RagError::Config(_))));
        Ok(())
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicUsize::new(0);
        let result: Result<()> = with_retry("test", Duration::from_millis(1), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(RagError::Chat("bad request".to_string()))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    /// A URL on a local port that was just released, so connecting fails fast.
    fn closed_port_url() -> std::io::Result<String> {
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        let port = listener.local_addr()?.port();
        drop(listener);
        Ok(format!("http://127.0.0.1:{port}/"))
    }

    #[tokio::test]
    async fn transient_errors_are_retried_once() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let url = closed_port_url()?;
        let client = HttpSettings::default().client()?;
        let calls = AtomicUsize::new(0);

        let result: Result<()> = with_retry("test", Duration::from_millis(1), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            client.get(&url).send().await?;
            Ok(())
        })
        .await;

        assert!(result.as_ref().is_err_and(RagError::is_transient));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test]
    async fn retry_recovers_after_one_transient_failure(
    ) -> std::result::Result<(), Box<dyn std::error::Error>> {
        let url = closed_port_url()?;
        let client = HttpSettings::default().client()?;
        let calls = AtomicUsize::new(0);

        let value = with_retry("test", Duration::from_millis(1), || async {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                client.get(&url).send().await?;
            }
            Ok(7)
        })
        .await?;

        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test]
    async fn success_runs_once() -> Result<()> {
        let calls = AtomicUsize::new(0);
        let value = with_retry("test", Duration::from_millis(1), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(7)
        })
        .await?;

        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        Ok(())
    }
}
