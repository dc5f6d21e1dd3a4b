//! Single-step publishing for the status APIs
//!
//! Each image is downloaded and uploaded as a media attachment, then one
//! status is created referencing them. Nothing is retried: a failure ends
//! the attempt for that account in this cycle.

use async_trait::async_trait;
use std::sync::Arc;

use super::{MediaSource, PlatformPublisher, PublishRequest, PublishTracker};
use crate::error::Result;
use crate::platforms::status::StatusClient;
use crate::types::{Platform, PlatformAccount, PublishState};

pub struct SingleStepStatusPublisher {
    client: StatusClient,
    media: Arc<dyn MediaSource>,
}

impl SingleStepStatusPublisher {
    pub fn new(client: StatusClient, media: Arc<dyn MediaSource>) -> Self {
        let single = client.policy().clone().single_attempt();
        Self {
            client: client.retargeted(single),
            media,
        }
    }
}

#[async_trait]
impl PlatformPublisher for SingleStepStatusPublisher {
    fn platform(&self) -> Platform {
        self.client.flavor().platform()
    }

    fn caption_limit(&self) -> usize {
        self.client.flavor().caption_limit()
    }

    fn max_media(&self) -> usize {
        self.client.flavor().max_media()
    }

    async fn publish(
        &self,
        account: &PlatformAccount,
        request: &PublishRequest,
        tracker: &mut PublishTracker<'_>,
    ) -> Result<String> {
        tracker.advance(PublishState::Uploading).await?;

        let mut media_ids = Vec::with_capacity(request.media_urls.len());
        for url in &request.media_urls {
            let blob = self.media.fetch(url).await?;
            let media_id = self
                .client
                .upload_media(account, &blob.bytes, blob.mime)
                .await?;
            media_ids.push(media_id);
        }

        tracker.advance(PublishState::Publishing).await?;
        let status_id = self
            .client
            .create_status(account, &request.text, &media_ids)
            .await?;

        Ok(status_id)
    }
}
