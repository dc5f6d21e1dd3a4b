//! In-memory platform doubles for tests
//!
//! [`MockSource`] serves canned posts and engagement lists to the sync
//! engine, [`MockPublisher`] stands in for a platform's publish protocol, and
//! [`MockRefresher`] hands out fresh tokens. All three count their calls
//! through shared handles so tests can assert on traffic after the fact.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::sleep;

use super::{AnalyticsSource, PlatformResult, PostPage, RefreshedToken, TokenRefresher};
use crate::error::{PlatformError, Result};
use crate::publish::{PlatformPublisher, PublishRequest, PublishTracker};
use crate::types::{
    Platform, PlatformAccount, PostMetrics, PublishState, RemoteActor, RemotePost, RemoteReply,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn mock_failure(call: MockCall) -> PlatformError {
    PlatformError::Server {
        status: 503,
        message: format!("mock {:?} failure", call),
    }
}

/// Calls a [`MockSource`] can receive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockCall {
    ListPosts,
    Reactions,
    Replies,
    Reshares,
    Metrics,
    VerifyCredentials,
}

/// Canned read side of a platform
///
/// Pages are cut from `posts` in order; the cursor is the id of the last
/// item handed out, like a `max_id` listing.
#[derive(Clone)]
pub struct MockSource {
    platform: Platform,
    posts: Vec<RemotePost>,
    reactions: HashMap<String, Vec<RemoteActor>>,
    replies: HashMap<String, Vec<RemoteReply>>,
    reshares: HashMap<String, Vec<RemoteActor>>,
    metrics: HashMap<String, PostMetrics>,
    failing: HashSet<MockCall>,
    calls: Arc<Mutex<Vec<MockCall>>>,
    page_requests: Arc<Mutex<Vec<usize>>>,
}

impl MockSource {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            posts: Vec::new(),
            reactions: HashMap::new(),
            replies: HashMap::new(),
            reshares: HashMap::new(),
            metrics: HashMap::new(),
            failing: HashSet::new(),
            calls: Arc::new(Mutex::new(Vec::new())),
            page_requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_posts(mut self, posts: Vec<RemotePost>) -> Self {
        self.posts = posts;
        self
    }

    pub fn with_reactions(mut self, post_id: &str, actors: Vec<RemoteActor>) -> Self {
        self.reactions.insert(post_id.to_string(), actors);
        self
    }

    pub fn with_replies(mut self, post_id: &str, replies: Vec<RemoteReply>) -> Self {
        self.replies.insert(post_id.to_string(), replies);
        self
    }

    pub fn with_reshares(mut self, post_id: &str, actors: Vec<RemoteActor>) -> Self {
        self.reshares.insert(post_id.to_string(), actors);
        self
    }

    pub fn with_metrics(mut self, post_id: &str, metrics: PostMetrics) -> Self {
        self.metrics.insert(post_id.to_string(), metrics);
        self
    }

    /// Make every call of this kind fail with a 503
    pub fn failing(mut self, call: MockCall) -> Self {
        self.failing.insert(call);
        self
    }

    pub fn call_count(&self, call: MockCall) -> usize {
        lock(&self.calls).iter().filter(|c| **c == call).count()
    }

    /// Number of items returned by each `list_posts` call
    pub fn page_sizes(&self) -> Vec<usize> {
        lock(&self.page_requests).clone()
    }

    fn record(&self, call: MockCall) -> PlatformResult<()> {
        lock(&self.calls).push(call);
        if self.failing.contains(&call) {
            return Err(mock_failure(call));
        }
        Ok(())
    }

    fn actor_list(
        &self,
        detail: &HashMap<String, Vec<RemoteActor>>,
        post_id: &str,
    ) -> Option<Vec<RemoteActor>> {
        if !self.platform.exposes_actor_detail() {
            return None;
        }
        Some(detail.get(post_id).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl AnalyticsSource for MockSource {
    fn platform(&self) -> Platform {
        self.platform
    }

    async fn list_posts(
        &self,
        _account: &PlatformAccount,
        cursor: Option<&str>,
        limit: usize,
    ) -> PlatformResult<PostPage> {
        self.record(MockCall::ListPosts)?;

        let start = match cursor {
            Some(cursor) => self
                .posts
                .iter()
                .position(|post| post.id == cursor)
                .map(|index| index + 1)
                .unwrap_or(self.posts.len()),
            None => 0,
        };
        let items: Vec<RemotePost> = self.posts.iter().skip(start).take(limit).cloned().collect();
        lock(&self.page_requests).push(items.len());

        let next_cursor = items.last().map(|post| post.id.clone());
        Ok(PostPage { items, next_cursor })
    }

    async fn reactions(
        &self,
        _account: &PlatformAccount,
        post_id: &str,
    ) -> PlatformResult<Option<Vec<RemoteActor>>> {
        self.record(MockCall::Reactions)?;
        Ok(self.actor_list(&self.reactions, post_id))
    }

    async fn replies(
        &self,
        _account: &PlatformAccount,
        post_id: &str,
    ) -> PlatformResult<Vec<RemoteReply>> {
        self.record(MockCall::Replies)?;
        Ok(self.replies.get(post_id).cloned().unwrap_or_default())
    }

    async fn reshares(
        &self,
        _account: &PlatformAccount,
        post_id: &str,
    ) -> PlatformResult<Option<Vec<RemoteActor>>> {
        self.record(MockCall::Reshares)?;
        Ok(self.actor_list(&self.reshares, post_id))
    }

    async fn metrics(&self, _account: &PlatformAccount, post_id: &str) -> PlatformResult<PostMetrics> {
        self.record(MockCall::Metrics)?;
        Ok(self.metrics.get(post_id).cloned().unwrap_or_default())
    }

    async fn verify_credentials(&self, account: &PlatformAccount) -> PlatformResult<RemoteActor> {
        self.record(MockCall::VerifyCredentials)?;
        Ok(RemoteActor {
            id: account.remote_account_id.clone(),
            username: account.username.clone(),
            display_name: None,
        })
    }
}

/// Configurable stand-in for a platform's publish protocol
#[derive(Clone)]
pub struct MockPublisher {
    platform: Platform,
    caption_limit: usize,
    max_media: usize,
    error: Option<PlatformError>,
    delay: Duration,
    published: Arc<Mutex<Vec<(String, PublishRequest)>>>,
}

impl MockPublisher {
    /// Always succeeds, with generous limits
    pub fn success(platform: Platform) -> Self {
        Self {
            platform,
            caption_limit: 2200,
            max_media: 10,
            error: None,
            delay: Duration::ZERO,
            published: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn failure(platform: Platform, error: PlatformError) -> Self {
        Self {
            error: Some(error),
            ..Self::success(platform)
        }
    }

    pub fn with_limits(mut self, caption_limit: usize, max_media: usize) -> Self {
        self.caption_limit = caption_limit;
        self.max_media = max_media;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn publish_count(&self) -> usize {
        lock(&self.published).len()
    }

    /// `(account_id, request)` for every publish call, in order
    pub fn published(&self) -> Vec<(String, PublishRequest)> {
        lock(&self.published).clone()
    }
}

#[async_trait]
impl PlatformPublisher for MockPublisher {
    fn platform(&self) -> Platform {
        self.platform
    }

    fn caption_limit(&self) -> usize {
        self.caption_limit
    }

    fn max_media(&self) -> usize {
        self.max_media
    }

    async fn publish(
        &self,
        account: &PlatformAccount,
        request: &PublishRequest,
        tracker: &mut PublishTracker<'_>,
    ) -> Result<String> {
        let call = {
            let mut published = lock(&self.published);
            published.push((account.id.clone(), request.clone()));
            published.len()
        };

        tracker.advance(PublishState::Uploading).await?;
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }

        if let Some(error) = &self.error {
            return Err(error.clone().into());
        }

        tracker.advance(PublishState::Publishing).await?;
        Ok(format!("{}-{}", self.platform, call))
    }
}

/// Token refresher that issues numbered tokens or fails
#[derive(Clone)]
pub struct MockRefresher {
    platform: Platform,
    expires_in: Option<i64>,
    error: Option<PlatformError>,
    refreshed: Arc<Mutex<Vec<String>>>,
}

impl MockRefresher {
    pub fn new(platform: Platform, expires_in: Option<i64>) -> Self {
        Self {
            platform,
            expires_in,
            error: None,
            refreshed: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn failing(platform: Platform, error: PlatformError) -> Self {
        Self {
            error: Some(error),
            ..Self::new(platform, None)
        }
    }

    /// Account ids refreshed so far
    pub fn refreshed(&self) -> Vec<String> {
        lock(&self.refreshed).clone()
    }
}

#[async_trait]
impl TokenRefresher for MockRefresher {
    fn platform(&self) -> Platform {
        self.platform
    }

    async fn refresh(&self, account: &PlatformAccount) -> PlatformResult<RefreshedToken> {
        let count = {
            let mut refreshed = lock(&self.refreshed);
            refreshed.push(account.id.clone());
            refreshed.len()
        };

        if let Some(error) = &self.error {
            return Err(error.clone());
        }

        Ok(RefreshedToken {
            access_token: format!("refreshed-token-{}", count),
            expires_in: self.expires_in,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn post(id: &str) -> RemotePost {
        RemotePost {
            id: id.to_string(),
            ..Default::default()
        }
    }

    fn account() -> PlatformAccount {
        PlatformAccount::new("user-1", Platform::Pixelfed, "42", "token")
            .with_instance("https://pixelfed.test")
    }

    #[tokio::test]
    async fn test_mock_source_pages_by_cursor() {
        let source = MockSource::new(Platform::Pixelfed)
            .with_posts(vec![post("5"), post("4"), post("3")]);

        let first = source.list_posts(&account(), None, 2).await.unwrap();
        assert_eq!(first.items.len(), 2);
        assert_eq!(first.next_cursor.as_deref(), Some("4"));

        let second = source
            .list_posts(&account(), first.next_cursor.as_deref(), 2)
            .await
            .unwrap();
        assert_eq!(second.items.len(), 1);
        assert_eq!(source.page_sizes(), vec![2, 1]);
        assert_eq!(source.call_count(MockCall::ListPosts), 2);
    }

    #[tokio::test]
    async fn test_mock_source_hides_actors_for_instagram() {
        let source = MockSource::new(Platform::Instagram);
        let reactions = source.reactions(&account(), "1").await.unwrap();
        assert!(reactions.is_none());
    }

    #[tokio::test]
    async fn test_mock_source_failure() {
        let source = MockSource::new(Platform::Mastodon).failing(MockCall::Replies);
        let err = source.replies(&account(), "1").await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_mock_refresher_counts() {
        let refresher = MockRefresher::new(Platform::Instagram, Some(5_184_000));
        let token = refresher.refresh(&account()).await.unwrap();
        assert_eq!(token.access_token, "refreshed-token-1");
        assert_eq!(refresher.refreshed().len(), 1);
    }
}
