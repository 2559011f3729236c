use std::io::Write;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("HTTP {status} from {url}")]
    Status { url: String, status: u16 },
    #[error("{0}")]
    Transport(#[from] reqwest::Error),
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("download truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: u64, actual: u64 },
}

/// The two HTTP operations the updater needs.
pub trait ReleaseClient {
    fn fetch_text(&self, url: &str) -> Result<String, HttpError>;

    /// Streams the response body of `url` into `out`, returning the byte count.
    fn download(&self, url: &str, out: &mut dyn Write) -> Result<u64, HttpError>;
}

pub struct HttpReleaseClient {
    client: reqwest::blocking::Client,
    request_timeout: Duration,
    download_timeout: Duration,
}

impl HttpReleaseClient {
    /// `request_timeout` bounds connecting and small requests such as the
    /// version lookup. The archive download gets its own, longer budget.
    pub fn new(request_timeout: Duration, download_timeout: Duration) -> Result<Self, HttpError> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("depcheck-runner/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(request_timeout)
            .timeout(None::<Duration>)
            .build()?;
        Ok(Self {
            client,
            request_timeout,
            download_timeout,
        })
    }

    fn get(&self, url: &str, timeout: Duration) -> Result<reqwest::blocking::Response, HttpError> {
        let resp = self.client.get(url).timeout(timeout).send()?;
        let status = resp.status();
        if !status.is_success() {
            return Err(HttpError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(resp)
    }
}

impl ReleaseClient for HttpReleaseClient {
    fn fetch_text(&self, url: &str) -> Result<String, HttpError> {
        Ok(self.get(url, self.request_timeout)?.text()?)
    }

    fn download(&self, url: &str, out: &mut dyn Write) -> Result<u64, HttpError> {
        let mut resp = self.get(url, self.download_timeout)?;
        let expected = resp.content_length();
        let actual = std::io::copy(&mut resp, out)?;
        if let Some(expected) = expected {
            if actual != expected {
                return Err(HttpError::Truncated { expected, actual });
            }
        }
        Ok(actual)
    }
}
