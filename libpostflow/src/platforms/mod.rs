//! Platform API clients
//!
//! Two REST families are supported:
//!
//! - [`instagram::GraphClient`]: the Instagram Graph API (containers,
//!   publish, media listing, insights, comments, token refresh)
//! - [`status::StatusClient`]: the Mastodon-compatible status API, shared by
//!   Mastodon and Pixelfed and parameterised by [`status::StatusFlavor`]
//!
//! Both sit on [`crate::http::ResilientClient`]. The sync engine talks to them
//! only through [`AnalyticsSource`] and the credential job through
//! [`TokenRefresher`], so tests can swap in [`mock::MockSource`].

use async_trait::async_trait;

use crate::error::PlatformError;
use crate::types::{Platform, PlatformAccount, PostMetrics, RemoteActor, RemotePost, RemoteReply};

pub mod instagram;
pub mod status;

// Mock source is public so integration tests can drive the sync engine
pub mod mock;

pub type PlatformResult<T> = std::result::Result<T, PlatformError>;

/// Maximum page size accepted by the listing endpoints
pub const MAX_PAGE_SIZE: usize = 40;

/// One page of a user's posts
#[derive(Debug, Clone, Default)]
pub struct PostPage {
    pub items: Vec<RemotePost>,
    /// Cursor for the following page; `None` when the platform says there is none
    pub next_cursor: Option<String>,
}

/// Read side of a platform, used by the sync engine
#[async_trait]
pub trait AnalyticsSource: Send + Sync {
    fn platform(&self) -> Platform;

    /// Fetch up to `limit` posts older than `cursor`
    async fn list_posts(
        &self,
        account: &PlatformAccount,
        cursor: Option<&str>,
        limit: usize,
    ) -> PlatformResult<PostPage>;

    /// Who reacted to a post, or `None` when the platform does not say
    async fn reactions(
        &self,
        account: &PlatformAccount,
        post_id: &str,
    ) -> PlatformResult<Option<Vec<RemoteActor>>>;

    /// Replies/comments, including nested ones
    async fn replies(
        &self,
        account: &PlatformAccount,
        post_id: &str,
    ) -> PlatformResult<Vec<RemoteReply>>;

    /// Who reshared a post, or `None` when the platform does not say
    async fn reshares(
        &self,
        account: &PlatformAccount,
        post_id: &str,
    ) -> PlatformResult<Option<Vec<RemoteActor>>>;

    /// Aggregate metrics the platform computes itself (impressions, saves)
    async fn metrics(
        &self,
        _account: &PlatformAccount,
        _post_id: &str,
    ) -> PlatformResult<PostMetrics> {
        Ok(PostMetrics::default())
    }

    async fn verify_credentials(&self, account: &PlatformAccount) -> PlatformResult<RemoteActor>;
}

/// A freshly issued access token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshedToken {
    pub access_token: String,
    /// Seconds until expiry as reported by the platform
    pub expires_in: Option<i64>,
}

/// Exchanges a long-lived token for a new one
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    fn platform(&self) -> Platform;

    async fn refresh(&self, account: &PlatformAccount) -> PlatformResult<RefreshedToken>;
}

/// Parse the timestamp formats the platforms emit into unix seconds
///
/// Mastodon uses RFC 3339; the Graph API uses `+0000` offsets without a colon.
pub fn parse_timestamp(value: &str) -> Option<i64> {
    chrono::DateTime::parse_from_rfc3339(value)
        .or_else(|_| chrono::DateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%z"))
        .map(|dt| dt.timestamp())
        .ok()
}
