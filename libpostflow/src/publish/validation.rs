//! Pre-flight checks run before any publish request leaves the process
//!
//! Caption length and media count are checked locally; each image URL is
//! then probed over HTTP. The first failure stops validation.

use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use super::PublishRequest;
use crate::error::{PlatformError, Result, ValidationError};
use crate::types::ImageMimeType;

/// What a successful probe learned about an image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbedMedia {
    pub url: String,
    pub content_type: String,
    pub size: u64,
}

/// Downloaded image ready for upload
#[derive(Debug, Clone)]
pub struct MediaBlob {
    pub bytes: Vec<u8>,
    pub mime: ImageMimeType,
}

/// Access to the images a post references
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Check the URL is reachable, is an image and is within the size bound
    async fn probe(&self, url: &str) -> std::result::Result<ProbedMedia, ValidationError>;

    /// Download the image body
    async fn fetch(&self, url: &str) -> std::result::Result<MediaBlob, ValidationError>;
}

/// [`MediaSource`] over plain HTTP GETs
pub struct HttpMediaSource {
    http: reqwest::Client,
    max_bytes: u64,
}

impl HttpMediaSource {
    pub fn new(timeout: Duration, max_bytes: u64, user_agent: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| PlatformError::Network(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { http, max_bytes })
    }

    async fn get(&self, url: &str) -> std::result::Result<reqwest::Response, ValidationError> {
        let unreachable = |reason: String| ValidationError::MediaUnreachable {
            url: url.to_string(),
            reason,
        };

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| unreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(unreachable(format!("HTTP {}", status.as_u16())));
        }

        let content_type = content_type(&response);
        if !content_type.to_lowercase().contains("image") {
            return Err(ValidationError::NotAnImage {
                url: url.to_string(),
                content_type,
            });
        }

        Ok(response)
    }

    /// Read the body chunk by chunk, giving up as soon as it passes the limit
    async fn read_body(
        &self,
        url: &str,
        mut response: reqwest::Response,
    ) -> std::result::Result<Vec<u8>, ValidationError> {
        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| ValidationError::MediaUnreachable {
                url: url.to_string(),
                reason: e.to_string(),
            })?
        {
            body.extend_from_slice(&chunk);
            self.check_size(url, body.len() as u64)?;
        }
        Ok(body)
    }

    fn check_size(&self, url: &str, size: u64) -> std::result::Result<(), ValidationError> {
        if size > self.max_bytes {
            return Err(ValidationError::MediaTooLarge {
                url: url.to_string(),
                size,
                limit: self.max_bytes,
            });
        }
        Ok(())
    }
}

fn content_type(response: &reqwest::Response) -> String {
    response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

#[async_trait]
impl MediaSource for HttpMediaSource {
    async fn probe(&self, url: &str) -> std::result::Result<ProbedMedia, ValidationError> {
        let response = self.get(url).await?;
        let content_type = content_type(&response);

        let size = match response.content_length() {
            Some(length) => {
                self.check_size(url, length)?;
                length
            }
            None => self.read_body(url, response).await?.len() as u64,
        };

        debug!(url, %content_type, size, "Media probe passed");
        Ok(ProbedMedia {
            url: url.to_string(),
            content_type,
            size,
        })
    }

    async fn fetch(&self, url: &str) -> std::result::Result<MediaBlob, ValidationError> {
        let response = self.get(url).await?;
        let content_type = content_type(&response);

        let mime = ImageMimeType::from_content_type(&content_type).ok_or_else(|| {
            ValidationError::NotAnImage {
                url: url.to_string(),
                content_type: content_type.clone(),
            }
        })?;

        if let Some(length) = response.content_length() {
            self.check_size(url, length)?;
        }
        let bytes = self.read_body(url, response).await?;

        Ok(MediaBlob { bytes, mime })
    }
}

/// Caption length in Unicode scalar values
pub fn validate_caption(text: &str, limit: usize) -> std::result::Result<(), ValidationError> {
    let length = text.chars().count();
    if length > limit {
        return Err(ValidationError::CaptionTooLong { length, limit });
    }
    Ok(())
}

pub fn validate_media_count(count: usize, limit: usize) -> std::result::Result<(), ValidationError> {
    if count == 0 {
        return Err(ValidationError::NoMedia);
    }
    if count > limit {
        return Err(ValidationError::TooManyMedia { count, limit });
    }
    Ok(())
}

/// Probe every image in order, stopping at the first failure
pub async fn probe_media(
    urls: &[String],
    media: &dyn MediaSource,
) -> std::result::Result<Vec<ProbedMedia>, ValidationError> {
    let mut probed = Vec::with_capacity(urls.len());
    for url in urls {
        probed.push(media.probe(url).await?);
    }
    Ok(probed)
}

/// Local checks for one platform's limits
pub fn validate_request(
    request: &PublishRequest,
    caption_limit: usize,
    max_media: usize,
) -> std::result::Result<(), ValidationError> {
    validate_caption(&request.text, caption_limit)?;
    validate_media_count(request.media_urls.len(), max_media)
}
