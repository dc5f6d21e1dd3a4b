//! Instagram Graph API client
//!
//! Publishing is a two-step protocol: create a media container (one per
//! image, plus a parent for carousels), then publish the container. The
//! access token travels as the `access_token` query parameter.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use super::{
    parse_timestamp, AnalyticsSource, PlatformResult, PostPage, RefreshedToken, TokenRefresher,
    MAX_PAGE_SIZE,
};
use crate::config::{parse_duration, HttpConfig, InstagramConfig};
use crate::error::{PlatformError, Result};
use crate::http::{ErrorFormat, ResilientClient, RetryPolicy};
use crate::types::{
    MediaKind, Platform, PlatformAccount, PostMetrics, RemoteActor, RemotePost, RemoteReply,
};

/// Graph error code for "media is still being processed"
pub const MEDIA_NOT_READY_CODE: &str = "9007";
pub const RATE_LIMIT_HEADER: &str = "Retry-After";
pub const CAPTION_LIMIT: usize = 2200;
pub const MAX_CAROUSEL_ITEMS: usize = 10;

const MEDIA_FIELDS: &str =
    "id,caption,media_type,media_url,permalink,timestamp,like_count,comments_count";
const COMMENT_FIELDS: &str = "id,text,username,timestamp,like_count";
const INSIGHT_METRICS: &str = "impressions,reach,saved,total_interactions,plays";
const COMMENT_PAGE_SIZE: usize = 50;

#[derive(Debug, Deserialize)]
struct IdResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct Listing<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
    paging: Option<Paging>,
}

#[derive(Debug, Deserialize)]
struct Paging {
    cursors: Option<Cursors>,
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Cursors {
    after: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GraphMedia {
    id: String,
    caption: Option<String>,
    media_type: Option<String>,
    media_url: Option<String>,
    permalink: Option<String>,
    timestamp: Option<String>,
    #[serde(default)]
    like_count: i64,
    #[serde(default)]
    comments_count: i64,
}

#[derive(Debug, Deserialize)]
struct GraphComment {
    id: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    username: String,
    timestamp: Option<String>,
    #[serde(default)]
    like_count: i64,
}

#[derive(Debug, Deserialize)]
struct Insight {
    name: String,
    #[serde(default)]
    values: Vec<InsightValue>,
    total_value: Option<InsightValue>,
}

#[derive(Debug, Deserialize)]
struct InsightValue {
    #[serde(default)]
    value: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct Me {
    id: String,
    #[serde(default)]
    username: String,
}

#[derive(Clone)]
pub struct GraphClient {
    http: ResilientClient,
    base_url: String,
    refresh_url: String,
}

impl GraphClient {
    pub fn new(config: &InstagramConfig, http: &HttpConfig) -> Result<Self> {
        let policy = RetryPolicy::from_config(http, RATE_LIMIT_HEADER)?;
        let timeout = parse_duration("http.timeout", &http.timeout)?;
        let client = ResilientClient::new(policy, ErrorFormat::Graph, timeout, &http.user_agent)?;

        Ok(Self {
            http: client,
            base_url: config.graph_base_url.trim_end_matches('/').to_string(),
            refresh_url: config.refresh_url.clone(),
        })
    }

    /// Client against a custom base URL (test servers, proxies)
    pub fn with_base_url(base_url: &str, policy: RetryPolicy) -> Result<Self> {
        let base_url = base_url.trim_end_matches('/').to_string();
        let client = ResilientClient::new(
            policy,
            ErrorFormat::Graph,
            Duration::from_secs(30),
            "PostFlow/1.0",
        )?;

        Ok(Self {
            http: client,
            refresh_url: format!("{}/refresh_access_token", base_url),
            base_url,
        })
    }

    /// Same endpoints, different retry policy
    pub fn with_policy(&self, policy: RetryPolicy) -> Self {
        Self {
            http: self.http.with_policy(policy),
            base_url: self.base_url.clone(),
            refresh_url: self.refresh_url.clone(),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        self.http.policy()
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    // ========================================================================
    // Publishing
    // ========================================================================

    /// Create a container for one image
    ///
    /// Carousel children carry no caption; the parent does.
    pub async fn create_image_container(
        &self,
        account: &PlatformAccount,
        image_url: &str,
        caption: Option<&str>,
        carousel_item: bool,
    ) -> PlatformResult<String> {
        let url = self.url(&format!("{}/media", account.remote_account_id));
        let mut form = vec![("image_url", image_url.to_string())];
        if carousel_item {
            form.push(("is_carousel_item", "true".to_string()));
        }
        if let Some(caption) = caption {
            form.push(("caption", caption.to_string()));
        }

        let response: IdResponse = self
            .http
            .send_json(|http| {
                http.post(&url)
                    .query(&[("access_token", account.access_token.as_str())])
                    .form(&form)
            })
            .await?;

        debug!(container_id = %response.id, carousel_item, "Created image container");
        Ok(response.id)
    }

    /// Create the parent container of a carousel
    pub async fn create_carousel_container(
        &self,
        account: &PlatformAccount,
        children: &[String],
        caption: &str,
    ) -> PlatformResult<String> {
        let url = self.url(&format!("{}/media", account.remote_account_id));
        let form = [
            ("media_type", "CAROUSEL".to_string()),
            ("children", children.join(",")),
            ("caption", caption.to_string()),
        ];

        let response: IdResponse = self
            .http
            .send_json(|http| {
                http.post(&url)
                    .query(&[("access_token", account.access_token.as_str())])
                    .form(&form)
            })
            .await?;

        debug!(container_id = %response.id, children = children.len(), "Created carousel container");
        Ok(response.id)
    }

    /// Publish a container, returning the media id
    ///
    /// The "not ready" error code is reported as [`PlatformError::MediaNotReady`].
    pub async fn publish_container(
        &self,
        account: &PlatformAccount,
        creation_id: &str,
    ) -> PlatformResult<String> {
        let url = self.url(&format!("{}/media_publish", account.remote_account_id));

        let result: PlatformResult<IdResponse> = self
            .http
            .send_json(|http| {
                http.post(&url)
                    .query(&[("access_token", account.access_token.as_str())])
                    .form(&[("creation_id", creation_id)])
            })
            .await;

        match result {
            Ok(response) => Ok(response.id),
            Err(PlatformError::Api {
                code: Some(code),
                message,
                ..
            }) if code == MEDIA_NOT_READY_CODE => Err(PlatformError::MediaNotReady { code, message }),
            Err(e) => Err(e),
        }
    }

    // ========================================================================
    // Analytics
    // ========================================================================

    pub async fn list_media(
        &self,
        account: &PlatformAccount,
        after: Option<&str>,
        limit: usize,
    ) -> PlatformResult<PostPage> {
        let url = self.url(&format!("{}/media", account.remote_account_id));
        let limit = limit.clamp(1, MAX_PAGE_SIZE).to_string();

        let listing: Listing<GraphMedia> = self
            .http
            .send_json(|http| {
                let mut request = http.get(&url).query(&[
                    ("fields", MEDIA_FIELDS),
                    ("limit", limit.as_str()),
                    ("access_token", account.access_token.as_str()),
                ]);
                if let Some(after) = after {
                    request = request.query(&[("after", after)]);
                }
                request
            })
            .await?;

        let next_cursor = listing.paging.and_then(|paging| match paging.next {
            Some(_) => paging.cursors.and_then(|c| c.after),
            None => None,
        });

        Ok(PostPage {
            items: listing.data.into_iter().map(remote_post_from_media).collect(),
            next_cursor,
        })
    }

    /// Insights for one media object; failures yield empty metrics
    pub async fn media_insights(&self, account: &PlatformAccount, media_id: &str) -> PostMetrics {
        let url = self.url(&format!("{}/insights", media_id));

        let result: PlatformResult<Listing<Insight>> = self
            .http
            .send_json(|http| {
                http.get(&url).query(&[
                    ("metric", INSIGHT_METRICS),
                    ("access_token", account.access_token.as_str()),
                ])
            })
            .await;

        match result {
            Ok(listing) => metrics_from_insights(listing.data),
            Err(e) => {
                warn!(media_id, error = %e, "Could not fetch insights");
                PostMetrics::default()
            }
        }
    }

    async fn list_comments(
        &self,
        account: &PlatformAccount,
        path: &str,
    ) -> PlatformResult<Vec<GraphComment>> {
        let url = self.url(path);
        let limit = COMMENT_PAGE_SIZE.to_string();

        let listing: Listing<GraphComment> = self
            .http
            .send_json(|http| {
                http.get(&url).query(&[
                    ("fields", COMMENT_FIELDS),
                    ("limit", limit.as_str()),
                    ("access_token", account.access_token.as_str()),
                ])
            })
            .await?;

        Ok(listing.data)
    }

    /// Comments on a media object followed by the replies to each comment
    pub async fn comments_with_replies(
        &self,
        account: &PlatformAccount,
        media_id: &str,
    ) -> PlatformResult<Vec<RemoteReply>> {
        let comments = self
            .list_comments(account, &format!("{}/comments", media_id))
            .await?;

        let mut replies = Vec::with_capacity(comments.len());
        for comment in comments {
            let comment_id = comment.id.clone();
            replies.push(remote_reply_from_comment(comment, media_id));

            match self
                .list_comments(account, &format!("{}/replies", comment_id))
                .await
            {
                Ok(nested) => replies.extend(
                    nested
                        .into_iter()
                        .map(|reply| remote_reply_from_comment(reply, &comment_id)),
                ),
                Err(e) => warn!(comment_id = %comment_id, error = %e, "Could not fetch comment replies"),
            }
        }

        Ok(replies)
    }

    pub async fn me(&self, account: &PlatformAccount) -> PlatformResult<RemoteActor> {
        let url = self.url("me");
        let me: Me = self
            .http
            .send_json(|http| {
                http.get(&url).query(&[
                    ("fields", "id,username"),
                    ("access_token", account.access_token.as_str()),
                ])
            })
            .await?;

        Ok(RemoteActor {
            id: me.id,
            username: me.username,
            display_name: None,
        })
    }

    /// Exchange a long-lived token for a fresh one
    pub async fn refresh_access_token(&self, access_token: &str) -> PlatformResult<RefreshedToken> {
        let response: RefreshResponse = self
            .http
            .send_json(|http| {
                http.get(&self.refresh_url).query(&[
                    ("grant_type", "ig_refresh_token"),
                    ("access_token", access_token),
                ])
            })
            .await?;

        if response.access_token.is_empty() {
            return Err(PlatformError::InvalidResponse(
                "Refresh response contained no access token".to_string(),
            ));
        }

        Ok(RefreshedToken {
            access_token: response.access_token,
            expires_in: response.expires_in,
        })
    }
}

fn remote_post_from_media(media: GraphMedia) -> RemotePost {
    RemotePost {
        content: media.caption.unwrap_or_default(),
        media_kind: media.media_type.as_deref().map(MediaKind::from_remote),
        media_url: media.media_url,
        post_url: media.permalink,
        posted_at: media
            .timestamp
            .as_deref()
            .and_then(parse_timestamp)
            .unwrap_or_default(),
        reaction_count: media.like_count,
        reply_count: media.comments_count,
        id: media.id,
        ..Default::default()
    }
}

fn remote_reply_from_comment(comment: GraphComment, parent_id: &str) -> RemoteReply {
    RemoteReply {
        id: comment.id,
        author_id: None,
        author_username: comment.username,
        content: comment.text,
        in_reply_to_id: Some(parent_id.to_string()),
        like_count: comment.like_count,
        created_at: comment.timestamp.as_deref().and_then(parse_timestamp),
    }
}

fn metrics_from_insights(insights: Vec<Insight>) -> PostMetrics {
    let mut metrics = PostMetrics::default();

    for insight in insights {
        let value = insight
            .values
            .first()
            .or(insight.total_value.as_ref())
            .and_then(|v| v.value.as_i64());

        match insight.name.as_str() {
            "impressions" => metrics.impressions = value,
            "reach" => metrics.reach = value,
            "saved" => metrics.saved = value,
            "plays" | "video_views" => metrics.plays = value,
            "total_interactions" | "engagement" => metrics.total_interactions = value,
            _ => {}
        }
    }

    metrics
}

#[async_trait]
impl AnalyticsSource for GraphClient {
    fn platform(&self) -> Platform {
        Platform::Instagram
    }

    async fn list_posts(
        &self,
        account: &PlatformAccount,
        cursor: Option<&str>,
        limit: usize,
    ) -> PlatformResult<PostPage> {
        self.list_media(account, cursor, limit).await
    }

    async fn reactions(
        &self,
        _account: &PlatformAccount,
        _post_id: &str,
    ) -> PlatformResult<Option<Vec<RemoteActor>>> {
        Ok(None)
    }

    async fn replies(
        &self,
        account: &PlatformAccount,
        post_id: &str,
    ) -> PlatformResult<Vec<RemoteReply>> {
        self.comments_with_replies(account, post_id).await
    }

    async fn reshares(
        &self,
        _account: &PlatformAccount,
        _post_id: &str,
    ) -> PlatformResult<Option<Vec<RemoteActor>>> {
        Ok(None)
    }

    async fn metrics(&self, account: &PlatformAccount, post_id: &str) -> PlatformResult<PostMetrics> {
        Ok(self.media_insights(account, post_id).await)
    }

    async fn verify_credentials(&self, account: &PlatformAccount) -> PlatformResult<RemoteActor> {
        self.me(account).await
    }
}

#[async_trait]
impl TokenRefresher for GraphClient {
    fn platform(&self) -> Platform {
        Platform::Instagram
    }

    async fn refresh(&self, account: &PlatformAccount) -> PlatformResult<RefreshedToken> {
        self.refresh_access_token(&account.access_token).await
    }
}
