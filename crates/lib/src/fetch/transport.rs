//! Byte transports for fetch sources.
//!
//! A transport only moves bytes; verification and publishing belong to the
//! fetch cache.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum TransportError {
  #[error("unsupported source {url}")]
  Unsupported { url: String },

  #[error("failed to read {url}: {source}")]
  Io {
    url: String,
    #[source]
    source: io::Error,
  },

  #[error("request to {url} failed: {message}")]
  Http { url: String, message: String },

  #[error("request to {url} returned HTTP {status}")]
  Status { url: String, status: u16 },
}

/// Moves the bytes behind a source descriptor into a file.
pub trait Transport: Send + Sync {
  /// Write the content of `url` into `dest`, returning the byte count.
  fn fetch(&self, url: &str, dest: &mut File) -> Result<u64, TransportError>;
}

/// Local paths, `file://` URLs and `http(s)://` URLs.
#[derive(Debug, Clone)]
pub struct DefaultTransport {
  timeout: Duration,
}

impl Default for DefaultTransport {
  fn default() -> Self {
    Self {
      timeout: Duration::from_secs(300),
    }
  }
}

impl DefaultTransport {
  fn fetch_local(&self, url: &str, path: &Path, dest: &mut File) -> Result<u64, TransportError> {
    let mut src = File::open(path).map_err(|source| TransportError::Io {
      url: url.to_string(),
      source,
    })?;
    io::copy(&mut src, dest).map_err(|source| TransportError::Io {
      url: url.to_string(),
      source,
    })
  }

  fn fetch_http(&self, url: &str, dest: &mut File) -> Result<u64, TransportError> {
    let http_err = |e: reqwest::Error| TransportError::Http {
      url: url.to_string(),
      message: e.to_string(),
    };
    let client = reqwest::blocking::Client::builder()
      .user_agent(concat!("cairn/", env!("CARGO_PKG_VERSION")))
      .timeout(self.timeout)
      .build()
      .map_err(http_err)?;

    let mut response = client.get(url).send().map_err(http_err)?;
    if !response.status().is_success() {
      return Err(TransportError::Status {
        url: url.to_string(),
        status: response.status().as_u16(),
      });
    }
    response.copy_to(dest).map_err(http_err)
  }
}

impl Transport for DefaultTransport {
  fn fetch(&self, url: &str, dest: &mut File) -> Result<u64, TransportError> {
    debug!(url, "fetching");
    if url.starts_with("http://") || url.starts_with("https://") {
      return self.fetch_http(url, dest);
    }
    if url.starts_with("file://") {
      let path = reqwest::Url::parse(url)
        .ok()
        .and_then(|u| u.to_file_path().ok())
        .ok_or_else(|| TransportError::Unsupported { url: url.to_string() })?;
      return self.fetch_local(url, &path, dest);
    }
    if url.starts_with('/') {
      return self.fetch_local(url, &PathBuf::from(url), dest);
    }
    Err(TransportError::Unsupported { url: url.to_string() })
  }
}
