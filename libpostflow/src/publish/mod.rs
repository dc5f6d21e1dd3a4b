//! Publish engine
//!
//! Drives every (scheduled post, linked account) target through
//! `queued → validating → uploading → [container_created →] publishing → posted`,
//! or to `failed` from any state. Platform protocols live behind
//! [`PlatformPublisher`]; the engine only sequences targets, validates, and
//! records outcomes.
//!
//! Targets are handled one at a time. A failure on one account never stops
//! the others, and consecutive accounts on the same platform are separated
//! by a fixed delay.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::{parse_duration, Config, HttpConfig, PublishConfig};
use crate::db::Database;
use crate::error::{PlatformError, PostflowError, Result, ValidationError};
use crate::platforms::instagram::GraphClient;
use crate::platforms::status::{StatusClient, StatusFlavor};
use crate::types::{Platform, PlatformAccount, PublishState, ScheduledPost};

pub mod carousel;
pub mod status;
pub mod validation;

pub use carousel::ImageCarouselPublisher;
pub use status::SingleStepStatusPublisher;
pub use validation::{HttpMediaSource, MediaBlob, MediaSource, ProbedMedia};

/// What every platform receives for one scheduled post
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRequest {
    pub post_id: String,
    pub text: String,
    pub media_urls: Vec<String>,
}

impl PublishRequest {
    pub fn from_post(post: &ScheduledPost) -> Self {
        Self {
            post_id: post.id.clone(),
            text: post.compose_text(),
            media_urls: post.media_urls.clone(),
        }
    }
}

/// Persists state transitions for one target as a publisher works
pub struct PublishTracker<'a> {
    db: &'a Database,
    post_id: &'a str,
    account_id: &'a str,
    state: PublishState,
    history: Vec<PublishState>,
}

impl<'a> PublishTracker<'a> {
    pub fn new(db: &'a Database, post_id: &'a str, account_id: &'a str) -> Self {
        Self {
            db,
            post_id,
            account_id,
            state: PublishState::Queued,
            history: vec![PublishState::Queued],
        }
    }

    pub async fn advance(&mut self, state: PublishState) -> Result<()> {
        debug!(
            post_id = self.post_id,
            account_id = self.account_id,
            from = self.state.as_str(),
            to = state.as_str(),
            "Publish state transition"
        );
        self.db
            .set_target_state(self.post_id, self.account_id, state, now())
            .await?;
        self.state = state;
        self.history.push(state);
        Ok(())
    }

    pub fn state(&self) -> PublishState {
        self.state
    }

    /// Every state visited so far, starting at `Queued`
    pub fn history(&self) -> &[PublishState] {
        &self.history
    }
}

/// One platform's publish protocol
#[async_trait]
pub trait PlatformPublisher: Send + Sync {
    fn platform(&self) -> Platform;

    fn caption_limit(&self) -> usize;

    fn max_media(&self) -> usize;

    /// Publish an already validated request, returning the platform's post id
    ///
    /// Implementations advance `tracker` through `Uploading` onwards; the
    /// engine records the terminal state.
    async fn publish(
        &self,
        account: &PlatformAccount,
        request: &PublishRequest,
        tracker: &mut PublishTracker<'_>,
    ) -> Result<String>;
}

/// Timing and bounds for the publish path, parsed from [`PublishConfig`]
#[derive(Debug, Clone)]
pub struct PublishSettings {
    pub inter_account_delay: Duration,
    pub request_timeout: Duration,
    pub container_retries: u32,
    pub container_retry_delay: Duration,
    pub publish_attempts: u32,
    pub publish_backoff_step: Duration,
    pub media_probe_timeout: Duration,
    pub max_image_bytes: u64,
}

impl PublishSettings {
    pub fn from_config(config: &PublishConfig) -> Result<Self> {
        Ok(Self {
            inter_account_delay: parse_duration(
                "publish.inter_account_delay",
                &config.inter_account_delay,
            )?,
            request_timeout: parse_duration("publish.request_timeout", &config.request_timeout)?,
            container_retries: config.container_retries,
            container_retry_delay: parse_duration(
                "publish.container_retry_delay",
                &config.container_retry_delay,
            )?,
            publish_attempts: config.publish_attempts.max(1),
            publish_backoff_step: parse_duration(
                "publish.publish_backoff_step",
                &config.publish_backoff_step,
            )?,
            media_probe_timeout: parse_duration(
                "publish.media_probe_timeout",
                &config.media_probe_timeout,
            )?,
            max_image_bytes: config.max_image_bytes,
        })
    }
}

impl Default for PublishSettings {
    fn default() -> Self {
        Self {
            inter_account_delay: Duration::from_secs(1),
            request_timeout: Duration::from_secs(15),
            container_retries: 2,
            container_retry_delay: Duration::from_secs(2),
            publish_attempts: 3,
            publish_backoff_step: Duration::from_secs(2),
            media_probe_timeout: Duration::from_secs(10),
            max_image_bytes: 8 * 1024 * 1024,
        }
    }
}

/// Outcome for a single (post, account) target
#[derive(Debug, Clone)]
pub struct TargetResult {
    pub account_id: String,
    pub platform: Option<Platform>,
    pub success: bool,
    pub platform_post_id: Option<String>,
    pub error: Option<String>,
}

impl TargetResult {
    fn posted(account_id: &str, platform: Platform, platform_post_id: String) -> Self {
        Self {
            account_id: account_id.to_string(),
            platform: Some(platform),
            success: true,
            platform_post_id: Some(platform_post_id),
            error: None,
        }
    }

    fn failed(account_id: &str, platform: Option<Platform>, error: String) -> Self {
        Self {
            account_id: account_id.to_string(),
            platform,
            success: false,
            platform_post_id: None,
            error: Some(error),
        }
    }
}

/// Counts from one dispatch pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub posts: usize,
    pub targets_posted: usize,
    pub targets_failed: usize,
}

pub struct PublishEngine {
    db: Database,
    publishers: HashMap<Platform, Arc<dyn PlatformPublisher>>,
    media: Arc<dyn MediaSource>,
    settings: PublishSettings,
}

impl PublishEngine {
    pub fn new(db: Database, media: Arc<dyn MediaSource>, settings: PublishSettings) -> Self {
        Self {
            db,
            publishers: HashMap::new(),
            media,
            settings,
        }
    }

    /// Engine with the production publishers for all three platforms
    pub fn from_config(db: Database, config: &Config) -> Result<Self> {
        let settings = PublishSettings::from_config(&config.publish)?;
        let media: Arc<dyn MediaSource> = Arc::new(HttpMediaSource::new(
            settings.media_probe_timeout,
            settings.max_image_bytes,
            &config.http.user_agent,
        )?);

        // Publish calls get the shorter publish timeout
        let http = HttpConfig {
            timeout: config.publish.request_timeout.clone(),
            ..config.http.clone()
        };

        let graph = GraphClient::new(&config.instagram, &http)?;
        let instagram = ImageCarouselPublisher::new(graph, &settings);
        let mastodon = SingleStepStatusPublisher::new(
            StatusClient::new(StatusFlavor::Mastodon, &http)?,
            media.clone(),
        );
        let pixelfed = SingleStepStatusPublisher::new(
            StatusClient::new(StatusFlavor::Pixelfed, &http)?,
            media.clone(),
        );

        Ok(Self::new(db, media, settings)
            .with_publisher(Arc::new(instagram))
            .with_publisher(Arc::new(mastodon))
            .with_publisher(Arc::new(pixelfed)))
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn PlatformPublisher>) -> Self {
        self.register(publisher);
        self
    }

    pub fn register(&mut self, publisher: Arc<dyn PlatformPublisher>) {
        self.publishers.insert(publisher.platform(), publisher);
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Publish every pending post scheduled at or before `now`
    pub async fn dispatch_due(&self, now: i64) -> Result<DispatchSummary> {
        let posts = self.db.due_posts(now).await?;
        let mut summary = DispatchSummary::default();

        if posts.is_empty() {
            debug!("No posts due");
            return Ok(summary);
        }
        info!(count = posts.len(), "Dispatching due posts");

        for post in &posts {
            let results = self.publish_post(post).await?;
            summary.posts += 1;
            summary.targets_posted += results.iter().filter(|r| r.success).count();
            summary.targets_failed += results.iter().filter(|r| !r.success).count();
        }

        Ok(summary)
    }

    /// Attempt every linked account of one post
    ///
    /// Returns one result per target attempted. Only storage errors are
    /// returned as `Err`; platform and validation failures are recorded on
    /// the target.
    pub async fn publish_post(&self, post: &ScheduledPost) -> Result<Vec<TargetResult>> {
        let targets = self.db.publish_targets(&post.id).await?;

        if targets.is_empty() {
            warn!(post_id = %post.id, "Scheduled post has no linked accounts");
            self.db.mark_post_failed(&post.id, now()).await?;
            return Ok(Vec::new());
        }

        let request = PublishRequest::from_post(post);
        let mut media_check: Option<std::result::Result<(), ValidationError>> = None;
        let mut previous_platform: Option<Platform> = None;
        let mut results = Vec::with_capacity(targets.len());

        for target in targets {
            if target.state.is_terminal() {
                debug!(
                    post_id = %post.id,
                    account_id = %target.account_id,
                    state = target.state.as_str(),
                    "Target already finished"
                );
                continue;
            }

            let Some(account) = self.db.get_account(&target.account_id).await? else {
                let error = format!("Account {} not found", target.account_id);
                self.db
                    .record_publish_failure(&post.id, &target.account_id, &error, now())
                    .await?;
                results.push(TargetResult::failed(&target.account_id, None, error));
                continue;
            };

            if previous_platform == Some(account.platform) && !self.settings.inter_account_delay.is_zero() {
                sleep(self.settings.inter_account_delay).await;
            }
            previous_platform = Some(account.platform);

            let mut tracker = PublishTracker::new(&self.db, &post.id, &account.id);
            let outcome = self
                .publish_target(&account, &request, &mut tracker, &mut media_check)
                .await;

            match outcome {
                Ok(platform_post_id) => {
                    self.db
                        .record_publish_success(&post.id, &account.id, &platform_post_id, now())
                        .await?;
                    info!(
                        post_id = %post.id,
                        account_id = %account.id,
                        platform = %account.platform,
                        platform_post_id = %platform_post_id,
                        "Published"
                    );
                    results.push(TargetResult::posted(&account.id, account.platform, platform_post_id));
                }
                Err(PostflowError::Database(e)) => return Err(PostflowError::Database(e)),
                Err(e) => {
                    warn!(
                        post_id = %post.id,
                        account_id = %account.id,
                        platform = %account.platform,
                        state = tracker.state().as_str(),
                        error = %e,
                        "Publish failed"
                    );
                    self.db
                        .record_publish_failure(&post.id, &account.id, &e.to_string(), now())
                        .await?;
                    results.push(TargetResult::failed(&account.id, Some(account.platform), e.to_string()));
                }
            }
        }

        Ok(results)
    }

    async fn publish_target(
        &self,
        account: &PlatformAccount,
        request: &PublishRequest,
        tracker: &mut PublishTracker<'_>,
        media_check: &mut Option<std::result::Result<(), ValidationError>>,
    ) -> Result<String> {
        let publisher = self.publishers.get(&account.platform).ok_or_else(|| {
            PostflowError::InvalidInput(format!("No publisher registered for {}", account.platform))
        })?;

        if account.is_token_expired(now()) {
            return Err(PlatformError::Authentication(format!(
                "Access token for {} account {} has expired",
                account.platform, account.id
            ))
            .into());
        }

        tracker.advance(PublishState::Validating).await?;
        validation::validate_request(request, publisher.caption_limit(), publisher.max_media())?;

        // Images are probed once per post, not once per account
        if media_check.is_none() {
            let probed = validation::probe_media(&request.media_urls, self.media.as_ref()).await;
            *media_check = Some(probed.map(|_| ()));
        }
        if let Some(Err(e)) = media_check {
            return Err(e.clone().into());
        }

        publisher.publish(account, request, tracker).await
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}
