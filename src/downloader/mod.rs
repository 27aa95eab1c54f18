//! Content downloaders
//!
//! A [`Downloader`] fetches the bytes behind one task and streams them into a
//! caller-supplied sink, returning whatever metadata it learned along the way.
//! [`DownloaderFactory`] picks the implementation for a task's download type.

use crate::config::DownloadConfig;
use crate::error::DownloadError;
use crate::types::{DownloadTask, DownloadType, Metadata};
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::AsyncWrite;

mod http;

pub use http::HttpDownloader;

/// Metadata key holding the response's `Content-Type`
pub const METADATA_CONTENT_TYPE: &str = "content-type";
/// Metadata key holding the number of bytes written to the sink
pub const METADATA_SIZE_BYTES: &str = "size-bytes";
/// Metadata key holding the file name announced by the server or taken from the URL
pub const METADATA_FILE_NAME: &str = "file-name";

/// Fetches the content of one task
#[async_trait]
pub trait Downloader: Send + Sync {
    /// Stream the content into `sink`
    ///
    /// The sink is written chunk by chunk and is never flushed or committed
    /// here; the caller decides whether to keep what was written.
    async fn download(&self, sink: &mut (dyn AsyncWrite + Unpin + Send)) -> Result<Metadata>;
}

/// Picks a [`Downloader`] for a task
pub trait DownloaderFactory: Send + Sync {
    /// Downloader for `task`'s type and URL
    fn downloader_for(&self, task: &DownloadTask) -> Result<Box<dyn Downloader>>;
}

/// Factory handing out HTTP downloaders that share one connection pool
#[derive(Clone)]
pub struct DefaultDownloaderFactory {
    client: reqwest::Client,
}

impl DefaultDownloaderFactory {
    /// Build the shared HTTP client from `config`
    pub fn new(config: &DownloadConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| Error::Other(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client })
    }

    /// Wrap in an `Arc` for sharing between the engine and its callers
    pub fn shared(self) -> Arc<dyn DownloaderFactory> {
        Arc::new(self)
    }
}

impl DownloaderFactory for DefaultDownloaderFactory {
    fn downloader_for(&self, task: &DownloadTask) -> Result<Box<dyn Downloader>> {
        match task.download_type {
            DownloadType::Http => Ok(Box::new(HttpDownloader::new(
                self.client.clone(),
                task.url.clone(),
            ))),
            DownloadType::Unspecified => Err(Error::Download(DownloadError::UnsupportedType(
                task.download_type.to_string(),
            ))),
        }
    }
}
