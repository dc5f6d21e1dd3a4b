//! Core types for PostFlow

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// Platforms
// ============================================================================

/// Platforms PostFlow can publish to and sync from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Instagram,
    Mastodon,
    Pixelfed,
}

impl Platform {
    pub const ALL: [Platform; 3] = [Platform::Instagram, Platform::Mastodon, Platform::Pixelfed];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Instagram => "instagram",
            Platform::Mastodon => "mastodon",
            Platform::Pixelfed => "pixelfed",
        }
    }

    /// Whether the platform lists who reacted to / reshared a post.
    ///
    /// The Graph API only returns aggregate like counts, so Instagram
    /// summaries fall back to the counters stored on the post mirror.
    pub fn exposes_actor_detail(&self) -> bool {
        !matches!(self, Platform::Instagram)
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "instagram" => Ok(Platform::Instagram),
            "mastodon" => Ok(Platform::Mastodon),
            "pixelfed" => Ok(Platform::Pixelfed),
            _ => Err(format!(
                "Unknown platform: '{}'. Valid options: instagram, mastodon, pixelfed",
                s
            )),
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Scheduled posts
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PostStatus {
    Pending,
    Posted,
    Failed,
}

impl PostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostStatus::Pending => "pending",
            PostStatus::Posted => "posted",
            PostStatus::Failed => "failed",
        }
    }

    pub(crate) fn from_db(s: &str) -> Self {
        match s {
            "posted" => PostStatus::Posted,
            "failed" => PostStatus::Failed,
            _ => PostStatus::Pending,
        }
    }
}

impl std::fmt::Display for PostStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A post the application scheduled for publishing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledPost {
    pub id: String,
    pub user_id: String,
    pub caption: String,
    pub hashtags: Vec<String>,
    /// Publicly reachable image URLs in carousel order
    pub media_urls: Vec<String>,
    pub scheduled_at: i64,
    pub status: PostStatus,
    pub created_at: i64,
}

impl ScheduledPost {
    pub fn new(user_id: &str, caption: &str, scheduled_at: i64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            caption: caption.to_string(),
            hashtags: Vec::new(),
            media_urls: Vec::new(),
            scheduled_at,
            status: PostStatus::Pending,
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    pub fn with_media<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.media_urls = urls.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_hashtags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.hashtags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Caption followed by a line of hashtags, trimmed
    pub fn compose_text(&self) -> String {
        let hashtags = self.hashtags.join(" ");
        if self.caption.is_empty() && hashtags.is_empty() {
            return String::new();
        }
        format!("{}\n{}", self.caption, hashtags).trim().to_string()
    }
}

/// Where a (post, account) pair is in the publish state machine
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PublishState {
    Queued,
    Validating,
    Uploading,
    /// Image-API platforms only
    ContainerCreated,
    Publishing,
    Posted,
    Failed,
}

impl PublishState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PublishState::Queued => "queued",
            PublishState::Validating => "validating",
            PublishState::Uploading => "uploading",
            PublishState::ContainerCreated => "container_created",
            PublishState::Publishing => "publishing",
            PublishState::Posted => "posted",
            PublishState::Failed => "failed",
        }
    }

    pub(crate) fn from_db(s: &str) -> Self {
        match s {
            "validating" => PublishState::Validating,
            "uploading" => PublishState::Uploading,
            "container_created" => PublishState::ContainerCreated,
            "publishing" => PublishState::Publishing,
            "posted" => PublishState::Posted,
            "failed" => PublishState::Failed,
            _ => PublishState::Queued,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PublishState::Posted | PublishState::Failed)
    }
}

impl std::fmt::Display for PublishState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A scheduled post's link to one platform account
#[derive(Debug, Clone)]
pub struct PublishTarget {
    pub post_id: String,
    pub account_id: String,
    pub platform_post_id: Option<String>,
    pub state: PublishState,
    pub last_error: Option<String>,
    pub updated_at: Option<i64>,
}

// ============================================================================
// Accounts
// ============================================================================

#[derive(Clone, Serialize, Deserialize)]
pub struct PlatformAccount {
    pub id: String,
    pub user_id: String,
    pub platform: Platform,
    /// Base URL for federated instances; `None` for Instagram
    pub instance_url: Option<String>,
    /// Platform-assigned account id (Instagram user id, Mastodon account id)
    pub remote_account_id: String,
    pub username: String,
    pub access_token: String,
    pub token_expires_at: Option<i64>,
    pub last_refreshed_at: Option<i64>,
    pub last_posts_sync_at: Option<i64>,
    pub last_engagement_sync_at: Option<i64>,
}

impl PlatformAccount {
    pub fn new(user_id: &str, platform: Platform, remote_account_id: &str, access_token: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            platform,
            instance_url: None,
            remote_account_id: remote_account_id.to_string(),
            username: String::new(),
            access_token: access_token.to_string(),
            token_expires_at: None,
            last_refreshed_at: None,
            last_posts_sync_at: None,
            last_engagement_sync_at: None,
        }
    }

    pub fn with_instance(mut self, instance_url: &str) -> Self {
        self.instance_url = Some(instance_url.trim_end_matches('/').to_string());
        self
    }

    pub fn with_username(mut self, username: &str) -> Self {
        self.username = username.to_string();
        self
    }

    /// The namespace in which this account's post ids are unique
    pub fn scope(&self) -> String {
        match &self.instance_url {
            Some(url) => url.trim_end_matches('/').to_lowercase(),
            None => self.remote_account_id.clone(),
        }
    }

    pub fn is_token_expired(&self, now: i64) -> bool {
        matches!(self.token_expires_at, Some(expires) if expires <= now)
    }
}

impl std::fmt::Debug for PlatformAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformAccount")
            .field("id", &self.id)
            .field("platform", &self.platform)
            .field("instance_url", &self.instance_url)
            .field("remote_account_id", &self.remote_account_id)
            .field("username", &self.username)
            .field("access_token", &"<redacted>")
            .field("token_expires_at", &self.token_expires_at)
            .finish()
    }
}

// ============================================================================
// Remote data (as returned by platform APIs)
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Carousel,
    Text,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
            MediaKind::Carousel => "carousel",
            MediaKind::Text => "text",
        }
    }

    /// Normalise a platform media type label
    pub fn from_remote(label: &str) -> Self {
        match label.to_lowercase().as_str() {
            "image" | "photo" | "gifv" => MediaKind::Image,
            "video" | "reels" | "audio" => MediaKind::Video,
            "carousel" | "carousel_album" | "album" => MediaKind::Carousel,
            _ => MediaKind::Text,
        }
    }
}

/// A post as listed by the platform
#[derive(Debug, Clone, Default)]
pub struct RemotePost {
    pub id: String,
    pub content: String,
    pub media_kind: Option<MediaKind>,
    pub media_url: Option<String>,
    pub post_url: Option<String>,
    pub posted_at: i64,
    pub edited_at: Option<i64>,
    pub visibility: Option<String>,
    pub language: Option<String>,
    pub sensitive: bool,
    pub spoiler_text: Option<String>,
    pub in_reply_to_id: Option<String>,
    pub reaction_count: i64,
    pub reply_count: i64,
    pub reshare_count: i64,
}

/// Someone who reacted to or reshared a post
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteActor {
    pub id: String,
    pub username: String,
    pub display_name: Option<String>,
}

/// A reply or comment, possibly nested under another reply
#[derive(Debug, Clone)]
pub struct RemoteReply {
    pub id: String,
    pub author_id: Option<String>,
    pub author_username: String,
    pub content: String,
    pub in_reply_to_id: Option<String>,
    pub like_count: i64,
    pub created_at: Option<i64>,
}

/// Platform-reported aggregate metrics for one post
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PostMetrics {
    pub impressions: Option<i64>,
    pub reach: Option<i64>,
    pub saved: Option<i64>,
    pub plays: Option<i64>,
    pub total_interactions: Option<i64>,
}

impl PostMetrics {
    pub fn is_empty(&self) -> bool {
        *self == PostMetrics::default()
    }
}

// ============================================================================
// Local mirrors
// ============================================================================

/// Local mirror of a platform post
#[derive(Debug, Clone)]
pub struct PlatformPost {
    pub id: i64,
    pub platform: Platform,
    pub scope: String,
    pub platform_post_id: String,
    pub account_id: String,
    pub scheduled_post_id: Option<String>,
    pub content: String,
    pub media_kind: MediaKind,
    pub media_url: Option<String>,
    pub post_url: Option<String>,
    pub posted_at: i64,
    pub edited_at: Option<i64>,
    pub api_reaction_count: i64,
    pub api_reply_count: i64,
    pub api_reshare_count: i64,
    pub api_save_count: Option<i64>,
    pub impressions: Option<i64>,
    pub reach: Option<i64>,
    pub last_fetched_at: i64,
}

/// Derived engagement totals for one platform post
#[derive(Debug, Clone, PartialEq)]
pub struct EngagementSummary {
    pub post_id: i64,
    pub reaction_count: i64,
    pub reply_count: i64,
    pub reshare_count: i64,
    pub save_count: i64,
    pub total_engagement: i64,
    pub impressions: Option<i64>,
    pub reach: Option<i64>,
    pub engagement_rate: Option<f64>,
    pub computed_at: i64,
}

// ============================================================================
// Media
// ============================================================================

/// Supported image MIME types for publishing
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ImageMimeType {
    Jpeg,
    Png,
    Gif,
    WebP,
}

impl ImageMimeType {
    /// Parse a `Content-Type` header value (parameters are ignored)
    pub fn from_content_type(s: &str) -> Option<Self> {
        let essence = s.split(';').next().unwrap_or_default().trim();
        match essence.to_lowercase().as_str() {
            "image/jpeg" | "image/jpg" => Some(Self::Jpeg),
            "image/png" => Some(Self::Png),
            "image/gif" => Some(Self::Gif),
            "image/webp" => Some(Self::WebP),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Gif => "image/gif",
            Self::WebP => "image/webp",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Png => "png",
            Self::Gif => "gif",
            Self::WebP => "webp",
        }
    }
}

impl std::fmt::Display for ImageMimeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_from_str() {
        assert_eq!("instagram".parse::<Platform>().unwrap(), Platform::Instagram);
        assert_eq!("Mastodon".parse::<Platform>().unwrap(), Platform::Mastodon);
        assert_eq!("PIXELFED".parse::<Platform>().unwrap(), Platform::Pixelfed);
        assert!("friendica".parse::<Platform>().is_err());
    }

    #[test]
    fn test_compose_text_joins_hashtags_on_new_line() {
        let post = ScheduledPost::new("u1", "Sunset over the bay", 0)
            .with_hashtags(["#sunset", "#film"]);
        assert_eq!(post.compose_text(), "Sunset over the bay\n#sunset #film");
    }

    #[test]
    fn test_compose_text_trims_missing_parts() {
        let caption_only = ScheduledPost::new("u1", "Just words", 0);
        assert_eq!(caption_only.compose_text(), "Just words");

        let tags_only = ScheduledPost::new("u1", "", 0).with_hashtags(["#a"]);
        assert_eq!(tags_only.compose_text(), "#a");

        let empty = ScheduledPost::new("u1", "", 0);
        assert_eq!(empty.compose_text(), "");
    }

    #[test]
    fn test_account_scope() {
        let masto = PlatformAccount::new("u1", Platform::Mastodon, "109", "tok")
            .with_instance("https://Mastodon.Social/");
        assert_eq!(masto.scope(), "https://mastodon.social");

        let insta = PlatformAccount::new("u1", Platform::Instagram, "17841400000", "tok");
        assert_eq!(insta.scope(), "17841400000");
    }

    #[test]
    fn test_token_expiry() {
        let mut account = PlatformAccount::new("u1", Platform::Instagram, "1", "tok");
        assert!(!account.is_token_expired(1_000));

        account.token_expires_at = Some(1_000);
        assert!(account.is_token_expired(1_000));
        assert!(!account.is_token_expired(999));
    }

    #[test]
    fn test_account_debug_redacts_token() {
        let account = PlatformAccount::new("u1", Platform::Pixelfed, "7", "super-secret");
        let debug = format!("{:?}", account);
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_media_kind_from_remote() {
        assert_eq!(MediaKind::from_remote("CAROUSEL_ALBUM"), MediaKind::Carousel);
        assert_eq!(MediaKind::from_remote("IMAGE"), MediaKind::Image);
        assert_eq!(MediaKind::from_remote("gifv"), MediaKind::Image);
        assert_eq!(MediaKind::from_remote("video"), MediaKind::Video);
        assert_eq!(MediaKind::from_remote("unknown"), MediaKind::Text);
    }

    #[test]
    fn test_image_mime_from_content_type() {
        assert_eq!(
            ImageMimeType::from_content_type("image/jpeg; charset=binary"),
            Some(ImageMimeType::Jpeg)
        );
        assert_eq!(ImageMimeType::from_content_type("IMAGE/PNG"), Some(ImageMimeType::Png));
        assert_eq!(ImageMimeType::from_content_type("text/html"), None);
    }

    #[test]
    fn test_publish_state_round_trip_labels() {
        for state in [
            PublishState::Queued,
            PublishState::Validating,
            PublishState::Uploading,
            PublishState::ContainerCreated,
            PublishState::Publishing,
            PublishState::Posted,
            PublishState::Failed,
        ] {
            assert_eq!(PublishState::from_db(state.as_str()), state);
        }
        assert!(PublishState::Posted.is_terminal());
        assert!(!PublishState::Publishing.is_terminal());
    }
}
