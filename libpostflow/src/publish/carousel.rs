//! Container-based publishing for the image API
//!
//! A post becomes one container per image (marked as carousel items when
//! there is more than one) plus a parent carrying the caption. The parent is
//! then published. Each step is sent exactly once per attempt; this module
//! owns the retry loops:
//!
//! - container creation that fails with a 5xx restarts the whole post, up to
//!   `container_retries` more times
//! - publishing retries "media not ready" and 5xx answers with linear
//!   backoff, `publish_attempts` calls in total

use async_trait::async_trait;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

use super::{PlatformPublisher, PublishRequest, PublishSettings, PublishTracker};
use crate::error::{PlatformError, Result};
use crate::http::Backoff;
use crate::platforms::instagram::{GraphClient, CAPTION_LIMIT, MAX_CAROUSEL_ITEMS};
use crate::platforms::PlatformResult;
use crate::types::{Platform, PlatformAccount, PublishState};

pub struct ImageCarouselPublisher {
    client: GraphClient,
    container_retries: u32,
    container_retry_delay: Duration,
    publish_attempts: u32,
    publish_backoff: Backoff,
}

impl ImageCarouselPublisher {
    pub fn new(client: GraphClient, settings: &PublishSettings) -> Self {
        let single = client.policy().clone().single_attempt();
        Self {
            client: client.with_policy(single),
            container_retries: settings.container_retries,
            container_retry_delay: settings.container_retry_delay,
            publish_attempts: settings.publish_attempts.max(1),
            publish_backoff: Backoff::Linear {
                step: settings.publish_backoff_step,
            },
        }
    }

    /// Create the container that will be published
    async fn create_containers(
        &self,
        account: &PlatformAccount,
        request: &PublishRequest,
    ) -> PlatformResult<String> {
        if let [image_url] = request.media_urls.as_slice() {
            return self
                .client
                .create_image_container(account, image_url, Some(&request.text), false)
                .await;
        }

        let mut children = Vec::with_capacity(request.media_urls.len());
        for image_url in &request.media_urls {
            let child = self
                .client
                .create_image_container(account, image_url, None, true)
                .await?;
            children.push(child);
        }

        self.client
            .create_carousel_container(account, &children, &request.text)
            .await
    }

    async fn publish_with_backoff(
        &self,
        account: &PlatformAccount,
        creation_id: &str,
    ) -> PlatformResult<String> {
        let mut attempt = 1;
        loop {
            match self.client.publish_container(account, creation_id).await {
                Ok(media_id) => return Ok(media_id),
                Err(e) if is_publish_retryable(&e) && attempt < self.publish_attempts => {
                    let delay = self.publish_backoff.delay(attempt);
                    warn!(
                        creation_id,
                        attempt,
                        max_attempts = self.publish_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Container not published yet, retrying"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn is_publish_retryable(error: &PlatformError) -> bool {
    matches!(
        error,
        PlatformError::MediaNotReady { .. } | PlatformError::Server { .. }
    )
}

#[async_trait]
impl PlatformPublisher for ImageCarouselPublisher {
    fn platform(&self) -> Platform {
        Platform::Instagram
    }

    fn caption_limit(&self) -> usize {
        CAPTION_LIMIT
    }

    fn max_media(&self) -> usize {
        MAX_CAROUSEL_ITEMS
    }

    async fn publish(
        &self,
        account: &PlatformAccount,
        request: &PublishRequest,
        tracker: &mut PublishTracker<'_>,
    ) -> Result<String> {
        tracker.advance(PublishState::Uploading).await?;

        let mut retries = 0;
        let creation_id = loop {
            match self.create_containers(account, request).await {
                Ok(id) => break id,
                Err(e) if e.is_server_error() && retries < self.container_retries => {
                    retries += 1;
                    warn!(
                        post_id = %request.post_id,
                        retry = retries,
                        max_retries = self.container_retries,
                        error = %e,
                        "Container creation failed, retrying post"
                    );
                    sleep(self.container_retry_delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        };
        tracker.advance(PublishState::ContainerCreated).await?;

        tracker.advance(PublishState::Publishing).await?;
        let media_id = self.publish_with_backoff(account, &creation_id).await?;

        info!(
            post_id = %request.post_id,
            media_id = %media_id,
            images = request.media_urls.len(),
            "Published to Instagram"
        );
        Ok(media_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_retry_classification() {
        assert!(is_publish_retryable(&PlatformError::MediaNotReady {
            code: "9007".to_string(),
            message: "not ready".to_string()
        }));
        assert!(is_publish_retryable(&PlatformError::Server {
            status: 502,
            message: "bad gateway".to_string()
        }));
        assert!(!is_publish_retryable(&PlatformError::Api {
            status: 400,
            code: Some("100".to_string()),
            message: "invalid".to_string()
        }));
        assert!(!is_publish_retryable(&PlatformError::Network("reset".to_string())));
    }
}
