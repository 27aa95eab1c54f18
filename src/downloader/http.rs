//! HTTP(S) GET downloader.

use super::{Downloader, METADATA_CONTENT_TYPE, METADATA_FILE_NAME, METADATA_SIZE_BYTES};
use crate::error::DownloadError;
use crate::types::{Metadata, MetadataValue};
use crate::{Error, Result};
use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Downloads one URL with a plain GET
pub struct HttpDownloader {
    client: reqwest::Client,
    url: String,
}

impl HttpDownloader {
    /// Downloader for `url` using the shared `client`
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    fn transport_error(&self, e: reqwest::Error) -> Error {
        let message = if e.is_timeout() {
            format!("timed out fetching '{}'", self.url)
        } else if e.is_connect() {
            format!("connection failed for '{}': {}", self.url, e)
        } else {
            format!("failed to fetch '{}': {}", self.url, e)
        };
        Error::Download(DownloadError::Transport(message))
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn download(&self, sink: &mut (dyn AsyncWrite + Unpin + Send)) -> Result<Metadata> {
        let mut response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Download(DownloadError::HttpStatus {
                url: self.url.clone(),
                status: status.as_u16(),
            }));
        }

        let mut metadata = Metadata::new();
        if let Some(content_type) = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
        {
            metadata.insert(METADATA_CONTENT_TYPE.to_string(), content_type.into());
        }
        if let Some(file_name) = file_name_from_response(&response) {
            metadata.insert(METADATA_FILE_NAME.to_string(), file_name.into());
        }

        let mut written: i64 = 0;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| self.transport_error(e))?
        {
            sink.write_all(&chunk)
                .await
                .map_err(|e| Error::Download(DownloadError::Sink(e.to_string())))?;
            written += chunk.len() as i64;
        }

        metadata.insert(
            METADATA_SIZE_BYTES.to_string(),
            MetadataValue::Integer(written),
        );

        tracing::debug!(url = %self.url, bytes = written, "HTTP download finished");
        Ok(metadata)
    }
}

/// File name from the Content-Disposition header, falling back to the last
/// non-empty segment of the final URL path
fn file_name_from_response(response: &reqwest::Response) -> Option<String> {
    if let Some(disposition) = response
        .headers()
        .get(reqwest::header::CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
    {
        // Format: attachment; filename="file.bin"
        for part in disposition.split(';') {
            if let Some(name) = part.trim().strip_prefix("filename=") {
                let name = name.trim_matches('"');
                if !name.is_empty() {
                    return Some(name.to_string());
                }
            }
        }
    }

    response
        .url()
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
}
