//! Mastodon-compatible status API client (Mastodon and Pixelfed)
//!
//! One client serves every instance: the base URL comes from the account
//! being used, and the bearer token from its stored credentials.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::{parse_timestamp, AnalyticsSource, PlatformResult, PostPage, MAX_PAGE_SIZE};
use crate::config::{parse_duration, HttpConfig};
use crate::error::{PlatformError, Result};
use crate::http::{ErrorFormat, ResilientClient, RetryPolicy};
use crate::types::{
    ImageMimeType, MediaKind, Platform, PlatformAccount, RemoteActor, RemotePost, RemoteReply,
};

pub const RATE_LIMIT_HEADER: &str = "X-RateLimit-Reset";

/// Which server family an account lives on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusFlavor {
    Mastodon,
    Pixelfed,
}

impl StatusFlavor {
    pub fn platform(&self) -> Platform {
        match self {
            StatusFlavor::Mastodon => Platform::Mastodon,
            StatusFlavor::Pixelfed => Platform::Pixelfed,
        }
    }

    pub fn caption_limit(&self) -> usize {
        match self {
            StatusFlavor::Mastodon => 500,
            StatusFlavor::Pixelfed => 2000,
        }
    }

    pub fn max_media(&self) -> usize {
        match self {
            StatusFlavor::Mastodon => 4,
            StatusFlavor::Pixelfed => 10,
        }
    }

    /// Extra listing filters each server understands
    fn listing_filters(&self) -> &'static [(&'static str, &'static str)] {
        match self {
            StatusFlavor::Mastodon => &[("exclude_reblogs", "true")],
            StatusFlavor::Pixelfed => &[("only_media", "true")],
        }
    }
}

#[derive(Debug, Deserialize)]
struct Account {
    id: String,
    #[serde(default)]
    username: String,
    display_name: Option<String>,
}

impl From<Account> for RemoteActor {
    fn from(account: Account) -> Self {
        RemoteActor {
            id: account.id,
            username: account.username,
            display_name: account.display_name.filter(|name| !name.is_empty()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Attachment {
    #[serde(rename = "type", default)]
    kind: String,
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Status {
    id: String,
    created_at: Option<String>,
    edited_at: Option<String>,
    #[serde(default)]
    content: String,
    url: Option<String>,
    visibility: Option<String>,
    language: Option<String>,
    #[serde(default)]
    sensitive: bool,
    spoiler_text: Option<String>,
    in_reply_to_id: Option<String>,
    #[serde(default)]
    favourites_count: i64,
    #[serde(default)]
    replies_count: i64,
    #[serde(default)]
    reblogs_count: i64,
    #[serde(default)]
    media_attachments: Vec<Attachment>,
    account: Option<Account>,
}

#[derive(Debug, Deserialize)]
struct Context {
    #[serde(default)]
    descendants: Vec<Status>,
}

#[derive(Debug, Deserialize)]
struct MediaAttachment {
    id: String,
}

#[derive(Debug, Deserialize)]
struct CreatedStatus {
    id: String,
}

#[derive(Clone)]
pub struct StatusClient {
    flavor: StatusFlavor,
    http: ResilientClient,
}

impl StatusClient {
    pub fn new(flavor: StatusFlavor, config: &HttpConfig) -> Result<Self> {
        let policy = RetryPolicy::from_config(config, RATE_LIMIT_HEADER)?;
        let timeout = parse_duration("http.timeout", &config.timeout)?;
        let http = ResilientClient::new(policy, ErrorFormat::Mastodon, timeout, &config.user_agent)?;
        Ok(Self { flavor, http })
    }

    pub fn with_policy(flavor: StatusFlavor, policy: RetryPolicy) -> Result<Self> {
        let http = ResilientClient::new(
            policy,
            ErrorFormat::Mastodon,
            Duration::from_secs(30),
            "PostFlow/1.0",
        )?;
        Ok(Self { flavor, http })
    }

    pub fn flavor(&self) -> StatusFlavor {
        self.flavor
    }

    pub fn policy(&self) -> &RetryPolicy {
        self.http.policy()
    }

    /// Same transport with a different policy
    pub fn retargeted(&self, policy: RetryPolicy) -> Self {
        Self {
            flavor: self.flavor,
            http: self.http.with_policy(policy),
        }
    }

    fn url(&self, account: &PlatformAccount, path: &str) -> PlatformResult<String> {
        let instance = account.instance_url.as_deref().ok_or_else(|| {
            PlatformError::Authentication(format!(
                "{} account {} has no instance URL, reconnect it",
                self.flavor.platform(),
                account.id
            ))
        })?;
        Ok(format!("{}{}", instance.trim_end_matches('/'), path))
    }

    // ========================================================================
    // Publishing
    // ========================================================================

    /// Upload one image, returning the attachment id
    ///
    /// Servers answer 202 while still processing large files; the id is
    /// usable for a status either way.
    pub async fn upload_media(
        &self,
        account: &PlatformAccount,
        data: &[u8],
        mime: ImageMimeType,
    ) -> PlatformResult<String> {
        let url = self.url(account, "/api/v1/media")?;
        let file_name = format!("upload.{}", mime.extension());

        let mut part_headers = HeaderMap::new();
        part_headers.insert(CONTENT_TYPE, HeaderValue::from_static(mime.as_str()));

        let attachment: MediaAttachment = self
            .http
            .send_json_expecting(&[200, 202], |http| {
                let part = Part::bytes(data.to_vec())
                    .file_name(file_name.clone())
                    .headers(part_headers.clone());
                http.post(&url)
                    .bearer_auth(&account.access_token)
                    .multipart(Form::new().part("file", part))
            })
            .await?;

        debug!(media_id = %attachment.id, bytes = data.len(), "Uploaded media");
        Ok(attachment.id)
    }

    /// Post a public status with the given attachments
    pub async fn create_status(
        &self,
        account: &PlatformAccount,
        text: &str,
        media_ids: &[String],
    ) -> PlatformResult<String> {
        let url = self.url(account, "/api/v1/statuses")?;

        let mut form: Vec<(&str, &str)> = vec![("status", text), ("visibility", "public")];
        form.extend(media_ids.iter().map(|id| ("media_ids[]", id.as_str())));

        let status: CreatedStatus = self
            .http
            .send_json(|http| {
                http.post(&url)
                    .bearer_auth(&account.access_token)
                    .form(&form)
            })
            .await?;

        Ok(status.id)
    }

    // ========================================================================
    // Analytics
    // ========================================================================

    /// One page of the account's own statuses, newest first
    pub async fn list_statuses(
        &self,
        account: &PlatformAccount,
        max_id: Option<&str>,
        limit: usize,
    ) -> PlatformResult<PostPage> {
        let url = self.url(
            account,
            &format!("/api/v1/accounts/{}/statuses", account.remote_account_id),
        )?;
        let limit = limit.clamp(1, MAX_PAGE_SIZE).to_string();
        let filters = self.flavor.listing_filters();

        let statuses: Vec<Status> = self
            .http
            .send_json(|http| {
                let mut request = http
                    .get(&url)
                    .bearer_auth(&account.access_token)
                    .query(&[("limit", limit.as_str()), ("exclude_replies", "true")])
                    .query(filters);
                if let Some(max_id) = max_id {
                    request = request.query(&[("max_id", max_id)]);
                }
                request
            })
            .await?;

        let next_cursor = statuses.last().map(|status| status.id.clone());
        Ok(PostPage {
            items: statuses.into_iter().map(remote_post_from_status).collect(),
            next_cursor,
        })
    }

    async fn list_accounts(
        &self,
        account: &PlatformAccount,
        path: &str,
    ) -> PlatformResult<Vec<RemoteActor>> {
        let url = self.url(account, path)?;
        let accounts: Vec<Account> = self
            .http
            .send_json(|http| http.get(&url).bearer_auth(&account.access_token))
            .await?;
        Ok(accounts.into_iter().map(RemoteActor::from).collect())
    }

    pub async fn favourited_by(
        &self,
        account: &PlatformAccount,
        status_id: &str,
    ) -> PlatformResult<Vec<RemoteActor>> {
        self.list_accounts(account, &format!("/api/v1/statuses/{}/favourited_by", status_id))
            .await
    }

    pub async fn reblogged_by(
        &self,
        account: &PlatformAccount,
        status_id: &str,
    ) -> PlatformResult<Vec<RemoteActor>> {
        self.list_accounts(account, &format!("/api/v1/statuses/{}/reblogged_by", status_id))
            .await
    }

    /// Every reply in the thread below a status
    pub async fn descendants(
        &self,
        account: &PlatformAccount,
        status_id: &str,
    ) -> PlatformResult<Vec<RemoteReply>> {
        let url = self.url(account, &format!("/api/v1/statuses/{}/context", status_id))?;
        let context: Context = self
            .http
            .send_json(|http| http.get(&url).bearer_auth(&account.access_token))
            .await?;

        Ok(context
            .descendants
            .into_iter()
            .map(remote_reply_from_status)
            .collect())
    }

    pub async fn verify_account(&self, account: &PlatformAccount) -> PlatformResult<RemoteActor> {
        let url = self.url(account, "/api/v1/accounts/verify_credentials")?;
        let me: Account = self
            .http
            .send_json(|http| http.get(&url).bearer_auth(&account.access_token))
            .await?;
        Ok(me.into())
    }
}

fn media_kind(attachments: &[Attachment]) -> MediaKind {
    match attachments {
        [] => MediaKind::Text,
        [single] => MediaKind::from_remote(&single.kind),
        _ => MediaKind::Carousel,
    }
}

fn remote_post_from_status(status: Status) -> RemotePost {
    RemotePost {
        media_kind: Some(media_kind(&status.media_attachments)),
        media_url: status
            .media_attachments
            .first()
            .and_then(|attachment| attachment.url.clone()),
        posted_at: status
            .created_at
            .as_deref()
            .and_then(parse_timestamp)
            .unwrap_or_default(),
        edited_at: status.edited_at.as_deref().and_then(parse_timestamp),
        id: status.id,
        content: status.content,
        post_url: status.url,
        visibility: status.visibility,
        language: status.language,
        sensitive: status.sensitive,
        spoiler_text: status.spoiler_text.filter(|s| !s.is_empty()),
        in_reply_to_id: status.in_reply_to_id,
        reaction_count: status.favourites_count,
        reply_count: status.replies_count,
        reshare_count: status.reblogs_count,
    }
}

fn remote_reply_from_status(status: Status) -> RemoteReply {
    let (author_id, author_username) = match status.account {
        Some(account) => (Some(account.id), account.username),
        None => (None, String::new()),
    };

    RemoteReply {
        id: status.id,
        author_id,
        author_username,
        content: status.content,
        in_reply_to_id: status.in_reply_to_id,
        like_count: status.favourites_count,
        created_at: status.created_at.as_deref().and_then(parse_timestamp),
    }
}

#[async_trait]
impl AnalyticsSource for StatusClient {
    fn platform(&self) -> Platform {
        self.flavor.platform()
    }

    async fn list_posts(
        &self,
        account: &PlatformAccount,
        cursor: Option<&str>,
        limit: usize,
    ) -> PlatformResult<PostPage> {
        self.list_statuses(account, cursor, limit).await
    }

    async fn reactions(
        &self,
        account: &PlatformAccount,
        post_id: &str,
    ) -> PlatformResult<Option<Vec<RemoteActor>>> {
        self.favourited_by(account, post_id).await.map(Some)
    }

    async fn replies(
        &self,
        account: &PlatformAccount,
        post_id: &str,
    ) -> PlatformResult<Vec<RemoteReply>> {
        self.descendants(account, post_id).await
    }

    async fn reshares(
        &self,
        account: &PlatformAccount,
        post_id: &str,
    ) -> PlatformResult<Option<Vec<RemoteActor>>> {
        self.reblogged_by(account, post_id).await.map(Some)
    }

    async fn verify_credentials(&self, account: &PlatformAccount) -> PlatformResult<RemoteActor> {
        self.verify_account(account).await
    }
}
