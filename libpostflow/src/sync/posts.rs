//! Post sync: page through an account's posts and upsert the mirrors

use regex::Regex;
use std::sync::LazyLock;
use tracing::{debug, info, warn};

use super::{now, SyncEngine};
use crate::db::UpsertKind;
use crate::error::{LinkResolutionError, Result};
use crate::types::{Platform, PlatformAccount, RemotePost};

static BREAK_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<br\s*/?>|</p>\s*<p[^>]*>").unwrap());

static TAG_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").unwrap());

/// Plain text from status HTML: paragraphs and `<br>` become newlines,
/// other tags are dropped and entities decoded
pub fn strip_html(content: &str) -> String {
    let with_breaks = BREAK_REGEX.replace_all(content, "\n");
    let without_tags = TAG_REGEX.replace_all(&with_breaks, "");
    html_escape::decode_html_entities(&without_tags)
        .trim()
        .to_string()
}

/// Counts from syncing one or more accounts' posts
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PostSyncSummary {
    pub accounts: usize,
    pub failed_accounts: usize,
    pub fetched: usize,
    pub created: usize,
    pub updated: usize,
    /// Mirrors newly linked to the scheduled post they were published from
    pub linked: usize,
    pub errors: Vec<String>,
}

impl PostSyncSummary {
    pub fn merge(&mut self, other: &PostSyncSummary) {
        self.accounts += other.accounts;
        self.failed_accounts += other.failed_accounts;
        self.fetched += other.fetched;
        self.created += other.created;
        self.updated += other.updated;
        self.linked += other.linked;
        self.errors.extend(other.errors.iter().cloned());
    }
}

impl SyncEngine {
    /// Fetch an account's posts page by page and upsert each one
    ///
    /// Paging stops at the first empty or short page, once `limit` items have
    /// been fetched, or when the platform offers no further cursor. A failed
    /// listing call aborts the account; a failed upsert is counted and
    /// skipped.
    pub async fn sync_account_posts(
        &self,
        account: &PlatformAccount,
        limit: Option<usize>,
    ) -> Result<PostSyncSummary> {
        let source = self.source(account.platform)?;
        let page_size = self.settings.page_size;
        let started_at = now();

        let mut summary = PostSyncSummary {
            accounts: 1,
            ..Default::default()
        };
        let mut cursor: Option<String> = None;
        let mut page = 1;

        loop {
            let batch = match limit {
                Some(limit) => page_size.min(limit.saturating_sub(summary.fetched)),
                None => page_size,
            };
            if batch == 0 {
                break;
            }

            debug!(account_id = %account.id, page, batch, cursor = ?cursor, "Fetching posts page");
            let mut listing = source.list_posts(account, cursor.as_deref(), batch).await?;

            if listing.items.is_empty() {
                debug!(account_id = %account.id, page, "Empty page, done");
                break;
            }

            listing.items.truncate(batch);
            let received = listing.items.len();
            summary.fetched += received;

            for remote in listing.items {
                self.store_post(account, remote, started_at, &mut summary).await;
            }

            if received < batch {
                break;
            }
            if limit.is_some_and(|limit| summary.fetched >= limit) {
                break;
            }
            match listing.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
            page += 1;
        }

        self.db.mark_posts_synced(&account.id, started_at).await?;

        info!(
            account_id = %account.id,
            platform = %account.platform,
            pages = page,
            fetched = summary.fetched,
            created = summary.created,
            updated = summary.updated,
            "Synced posts"
        );
        Ok(summary)
    }

    async fn store_post(
        &self,
        account: &PlatformAccount,
        mut remote: RemotePost,
        now: i64,
        summary: &mut PostSyncSummary,
    ) {
        if account.platform != Platform::Instagram {
            remote.content = strip_html(&remote.content);
        }

        let (post_id, kind) = match self.db.upsert_platform_post(account, &remote, now).await {
            Ok(result) => result,
            Err(e) => {
                warn!(account_id = %account.id, platform_post_id = %remote.id, error = %e, "Failed to store post");
                summary.errors.push(format!("{}: {}", remote.id, e));
                return;
            }
        };

        match kind {
            UpsertKind::Created => summary.created += 1,
            UpsertKind::Updated => summary.updated += 1,
            UpsertKind::Unchanged => {}
        }

        // Mirrors are linked once, when first seen
        if kind != UpsertKind::Created {
            return;
        }
        match self.link_post(account, &remote.id, post_id).await {
            Ok(true) => summary.linked += 1,
            Ok(false) => {}
            Err(e) => debug!(error = %e, "Leaving post unlinked"),
        }
    }

    /// Best-effort match of a mirror to the scheduled post it came from
    async fn link_post(
        &self,
        account: &PlatformAccount,
        platform_post_id: &str,
        post_id: i64,
    ) -> std::result::Result<bool, LinkResolutionError> {
        let link_error = |reason: String| LinkResolutionError {
            platform: account.platform.to_string(),
            platform_post_id: platform_post_id.to_string(),
            reason,
        };

        let scheduled = self
            .db
            .find_scheduled_post_by_platform_id(account.platform, platform_post_id, &account.user_id)
            .await
            .map_err(|e| link_error(e.to_string()))?;

        let Some(scheduled_post_id) = scheduled else {
            return Ok(false);
        };

        self.db
            .link_scheduled_post(post_id, &scheduled_post_id)
            .await
            .map_err(|e| link_error(e.to_string()))?;

        debug!(post_id, scheduled_post_id = %scheduled_post_id, "Linked mirror to scheduled post");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::platforms::mock::{MockCall, MockSource};
    use crate::sync::SyncSettings;
    use crate::types::{MediaKind, PlatformPost};
    use std::sync::Arc;

    fn remote(id: &str) -> RemotePost {
        RemotePost {
            id: id.to_string(),
            content: format!("<p>post {}</p>", id),
            posted_at: 1_700_000_000,
            ..Default::default()
        }
    }

    fn numbered(count: usize) -> Vec<RemotePost> {
        (0..count).map(|i| remote(&format!("{}", 10_000 - i))).collect()
    }

    async fn setup(source: MockSource) -> (SyncEngine, PlatformAccount) {
        let db = Database::in_memory().await.unwrap();
        let account = PlatformAccount::new("user-1", Platform::Pixelfed, "42", "token")
            .with_instance("https://pixelfed.test");
        db.upsert_account(&account).await.unwrap();

        let engine = SyncEngine::new(db, SyncSettings::default()).with_source(Arc::new(source));
        (engine, account)
    }

    #[test]
    fn test_strip_html() {
        assert_eq!(strip_html("<p>Hello <b>world</b></p>"), "Hello world");
        assert_eq!(strip_html("<p>one</p><p>two</p>"), "one\ntwo");
        assert_eq!(strip_html("a<br>b<br />c"), "a\nb\nc");
        assert_eq!(strip_html("fish &amp; chips"), "fish & chips");
        assert_eq!(strip_html("plain"), "plain");
    }

    #[tokio::test]
    async fn test_pagination_stops_after_short_page() {
        let source = MockSource::new(Platform::Pixelfed).with_posts(numbered(97));
        let (engine, account) = setup(source.clone()).await;

        let summary = engine.sync_account_posts(&account, None).await.unwrap();

        assert_eq!(summary.fetched, 97);
        assert_eq!(summary.created, 97);
        assert_eq!(source.page_sizes(), vec![40, 40, 17]);
        assert_eq!(source.call_count(MockCall::ListPosts), 3);
    }

    #[tokio::test]
    async fn test_pagination_respects_limit() {
        let source = MockSource::new(Platform::Pixelfed).with_posts(numbered(97));
        let (engine, account) = setup(source.clone()).await;

        let summary = engine.sync_account_posts(&account, Some(50)).await.unwrap();

        assert_eq!(summary.fetched, 50);
        assert_eq!(source.page_sizes(), vec![40, 10]);
    }

    #[tokio::test]
    async fn test_exact_multiple_ends_on_empty_page() {
        let source = MockSource::new(Platform::Pixelfed).with_posts(numbered(80));
        let (engine, account) = setup(source.clone()).await;

        let summary = engine.sync_account_posts(&account, None).await.unwrap();

        assert_eq!(summary.fetched, 80);
        assert_eq!(source.page_sizes(), vec![40, 40, 0]);
    }

    /// Every stored column except the fetch timestamp
    fn without_fetch_time(post: &PlatformPost) -> String {
        let mut post = post.clone();
        post.last_fetched_at = 0;
        format!("{:?}", post)
    }

    #[tokio::test]
    async fn test_second_sync_creates_nothing() {
        let posts = numbered(12)
            .into_iter()
            .enumerate()
            .map(|(i, post)| RemotePost {
                media_kind: Some(MediaKind::Image),
                media_url: Some(format!("https://pixelfed.test/m/{}.jpg", post.id)),
                post_url: Some(format!("https://pixelfed.test/p/{}", post.id)),
                edited_at: Some(1_700_000_500),
                reaction_count: i as i64,
                reply_count: 2,
                reshare_count: 1,
                ..post
            })
            .collect();
        let source = MockSource::new(Platform::Pixelfed).with_posts(posts);
        let (engine, account) = setup(source).await;

        let first = engine.sync_account_posts(&account, None).await.unwrap();
        let before = engine.database().recent_platform_posts(&account.id, 50).await.unwrap();
        let second = engine.sync_account_posts(&account, None).await.unwrap();
        let after = engine.database().recent_platform_posts(&account.id, 50).await.unwrap();

        assert_eq!(first.created, 12);
        assert_eq!(second.created, 0);
        assert_eq!(second.updated, 12);
        assert_eq!(engine.database().count_platform_posts(&account.id).await.unwrap(), 12);

        assert_eq!(before.len(), 12);
        assert_eq!(
            before.iter().map(without_fetch_time).collect::<Vec<_>>(),
            after.iter().map(without_fetch_time).collect::<Vec<_>>()
        );
        for (old, new) in before.iter().zip(&after) {
            assert!(new.last_fetched_at >= old.last_fetched_at);
        }
        assert!(after
            .iter()
            .all(|post| post.media_kind == MediaKind::Image && post.content.starts_with("post ")));
    }

    #[tokio::test]
    async fn test_content_is_stripped_for_status_platforms() {
        let source = MockSource::new(Platform::Pixelfed).with_posts(vec![remote("1")]);
        let (engine, account) = setup(source).await;

        engine.sync_account_posts(&account, None).await.unwrap();

        let stored = engine
            .database()
            .find_platform_post(Platform::Pixelfed, &account.scope(), "1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.content, "post 1");
    }

    #[tokio::test]
    async fn test_listing_failure_aborts_account() {
        let source = MockSource::new(Platform::Pixelfed)
            .with_posts(numbered(3))
            .failing(MockCall::ListPosts);
        let (engine, account) = setup(source).await;

        assert!(engine.sync_account_posts(&account, None).await.is_err());

        let summary = engine.sync_all_posts().await.unwrap();
        assert_eq!(summary.accounts, 1);
        assert_eq!(summary.failed_accounts, 1);
        assert_eq!(summary.errors.len(), 1);
    }
}
