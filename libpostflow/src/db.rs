//! Database operations for PostFlow
//!
//! Every write goes through a unique key (post id, account id, the
//! `(platform, scope, platform_post_id)` triple of a mirror, or a mirror plus
//! remote id for engagement rows). Writes that touch engagement detail
//! recompute the post's summary inside the same transaction, so a reader
//! never sees a summary that disagrees with its detail rows.

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;

use crate::error::{DbError, PostflowError, Result};
use crate::types::{
    EngagementSummary, MediaKind, Platform, PlatformAccount, PlatformPost, PostMetrics,
    PostStatus, PublishState, PublishTarget, RemoteActor, RemotePost, RemoteReply, ScheduledPost,
};

/// Outcome of an upsert keyed by a unique constraint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertKind {
    Created,
    Updated,
    Unchanged,
}

/// The two engagement tables keyed by (post, actor)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorEngagement {
    Reaction,
    Reshare,
}

impl ActorEngagement {
    fn table(&self) -> &'static str {
        match self {
            ActorEngagement::Reaction => "reactions",
            ActorEngagement::Reshare => "reshares",
        }
    }
}

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

fn db_err(e: sqlx::Error) -> PostflowError {
    DbError::SqlxError(e).into()
}

impl Database {
    /// Open (creating if needed) the database at `db_path` and run migrations
    pub async fn new(db_path: &str) -> Result<Self> {
        let expanded_path = shellexpand::tilde(db_path).to_string();
        let path = Path::new(&expanded_path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(DbError::IoError)?;
        }

        // mode=rwc creates the file on first open
        let db_url = format!("sqlite://{}?mode=rwc", expanded_path.replace('\\', "/"));

        let options = SqliteConnectOptions::from_str(&db_url)
            .map_err(db_err)?
            .foreign_keys(true);
        let pool = SqlitePool::connect_with(options).await.map_err(db_err)?;
        Self::migrate(&pool).await?;

        Ok(Self { pool })
    }

    /// Private in-memory database on a single connection
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(db_err)?
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(db_err)?;
        Self::migrate(&pool).await?;

        Ok(Self { pool })
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(pool)
            .await
            .map_err(DbError::MigrationError)?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ========================================================================
    // Platform accounts
    // ========================================================================

    pub async fn upsert_account(&self, account: &PlatformAccount) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO platform_accounts (
                id, user_id, platform, instance_url, remote_account_id, username,
                access_token, token_expires_at, last_refreshed_at,
                last_posts_sync_at, last_engagement_sync_at, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                instance_url = excluded.instance_url,
                remote_account_id = excluded.remote_account_id,
                username = excluded.username,
                access_token = excluded.access_token,
                token_expires_at = excluded.token_expires_at,
                last_refreshed_at = excluded.last_refreshed_at,
                last_posts_sync_at = excluded.last_posts_sync_at,
                last_engagement_sync_at = excluded.last_engagement_sync_at
            "#,
        )
        .bind(&account.id)
        .bind(&account.user_id)
        .bind(account.platform.as_str())
        .bind(&account.instance_url)
        .bind(&account.remote_account_id)
        .bind(&account.username)
        .bind(&account.access_token)
        .bind(account.token_expires_at)
        .bind(account.last_refreshed_at)
        .bind(account.last_posts_sync_at)
        .bind(account.last_engagement_sync_at)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    pub async fn get_account(&self, account_id: &str) -> Result<Option<PlatformAccount>> {
        let row = sqlx::query("SELECT * FROM platform_accounts WHERE id = ?")
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        row.map(|r| account_from_row(&r)).transpose()
    }

    pub async fn accounts_for_platform(&self, platform: Platform) -> Result<Vec<PlatformAccount>> {
        let rows = sqlx::query(
            "SELECT * FROM platform_accounts WHERE platform = ? ORDER BY created_at, id",
        )
        .bind(platform.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(account_from_row).collect()
    }

    /// Accounts whose token expires at or before `deadline`
    pub async fn accounts_expiring_before(
        &self,
        platform: Platform,
        deadline: i64,
    ) -> Result<Vec<PlatformAccount>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM platform_accounts
            WHERE platform = ? AND token_expires_at IS NOT NULL AND token_expires_at <= ?
            ORDER BY token_expires_at
            "#,
        )
        .bind(platform.as_str())
        .bind(deadline)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(account_from_row).collect()
    }

    pub async fn update_account_token(
        &self,
        account_id: &str,
        access_token: &str,
        expires_at: i64,
        refreshed_at: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE platform_accounts
            SET access_token = ?, token_expires_at = ?, last_refreshed_at = ?
            WHERE id = ?
            "#,
        )
        .bind(access_token)
        .bind(expires_at)
        .bind(refreshed_at)
        .bind(account_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    pub async fn mark_posts_synced(&self, account_id: &str, at: i64) -> Result<()> {
        sqlx::query("UPDATE platform_accounts SET last_posts_sync_at = ? WHERE id = ?")
            .bind(at)
            .bind(account_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    pub async fn mark_engagement_synced(&self, account_id: &str, at: i64) -> Result<()> {
        sqlx::query("UPDATE platform_accounts SET last_engagement_sync_at = ? WHERE id = ?")
            .bind(at)
            .bind(account_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    // ========================================================================
    // Scheduled posts
    // ========================================================================

    /// Store a scheduled post with its media and the accounts it targets
    pub async fn create_scheduled_post(
        &self,
        post: &ScheduledPost,
        account_ids: &[&str],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query(
            r#"
            INSERT INTO scheduled_posts (id, user_id, caption, hashtags, scheduled_at, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&post.id)
        .bind(&post.user_id)
        .bind(&post.caption)
        .bind(post.hashtags.join(" "))
        .bind(post.scheduled_at)
        .bind(post.status.as_str())
        .bind(post.created_at)
        .bind(post.created_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        for (position, url) in post.media_urls.iter().enumerate() {
            sqlx::query("INSERT INTO scheduled_post_media (post_id, position, url) VALUES (?, ?, ?)")
                .bind(&post.id)
                .bind(position as i64)
                .bind(url)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }

        for account_id in account_ids {
            sqlx::query(
                "INSERT INTO scheduled_post_targets (post_id, account_id, publish_state) VALUES (?, ?, 'queued')",
            )
            .bind(&post.id)
            .bind(account_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    pub async fn get_scheduled_post(&self, post_id: &str) -> Result<Option<ScheduledPost>> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, caption, hashtags, scheduled_at, status, created_at
            FROM scheduled_posts WHERE id = ?
            "#,
        )
        .bind(post_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        let Some(r) = row else {
            return Ok(None);
        };

        let media_urls: Vec<String> = sqlx::query_scalar(
            "SELECT url FROM scheduled_post_media WHERE post_id = ? ORDER BY position",
        )
        .bind(post_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let hashtags: String = r.get("hashtags");

        Ok(Some(ScheduledPost {
            id: r.get("id"),
            user_id: r.get("user_id"),
            caption: r.get("caption"),
            hashtags: hashtags.split_whitespace().map(str::to_string).collect(),
            media_urls,
            scheduled_at: r.get("scheduled_at"),
            status: PostStatus::from_db(r.get::<String, _>("status").as_str()),
            created_at: r.get("created_at"),
        }))
    }

    /// Pending posts whose scheduled time has passed, oldest first
    pub async fn due_posts(&self, now: i64) -> Result<Vec<ScheduledPost>> {
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT id FROM scheduled_posts
            WHERE status = 'pending' AND scheduled_at <= ?
            ORDER BY scheduled_at, id
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut posts = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(post) = self.get_scheduled_post(&id).await? {
                posts.push(post);
            }
        }
        Ok(posts)
    }

    pub async fn publish_targets(&self, post_id: &str) -> Result<Vec<PublishTarget>> {
        let rows = sqlx::query(
            r#"
            SELECT t.post_id, t.account_id, t.platform_post_id, t.publish_state, t.last_error, t.updated_at
            FROM scheduled_post_targets t
            JOIN platform_accounts a ON a.id = t.account_id
            WHERE t.post_id = ?
            ORDER BY a.platform, a.created_at, a.id
            "#,
        )
        .bind(post_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows
            .iter()
            .map(|r| PublishTarget {
                post_id: r.get("post_id"),
                account_id: r.get("account_id"),
                platform_post_id: r.get("platform_post_id"),
                state: PublishState::from_db(r.get::<String, _>("publish_state").as_str()),
                last_error: r.get("last_error"),
                updated_at: r.get("updated_at"),
            })
            .collect())
    }

    /// Record an intermediate publish state for one target
    pub async fn set_target_state(
        &self,
        post_id: &str,
        account_id: &str,
        state: PublishState,
        now: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE scheduled_post_targets SET publish_state = ?, updated_at = ? WHERE post_id = ? AND account_id = ?",
        )
        .bind(state.as_str())
        .bind(now)
        .bind(post_id)
        .bind(account_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    /// Store the platform id and mark the post posted, in one transaction
    ///
    /// A post that already failed on another account stays failed.
    pub async fn record_publish_success(
        &self,
        post_id: &str,
        account_id: &str,
        platform_post_id: &str,
        now: i64,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query(
            r#"
            UPDATE scheduled_post_targets
            SET platform_post_id = ?, publish_state = 'posted', last_error = NULL, updated_at = ?
            WHERE post_id = ? AND account_id = ?
            "#,
        )
        .bind(platform_post_id)
        .bind(now)
        .bind(post_id)
        .bind(account_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query(
            r#"
            UPDATE scheduled_posts
            SET status = CASE WHEN status = 'failed' THEN 'failed' ELSE 'posted' END, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(now)
        .bind(post_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    /// Mark one target and its post failed; no platform id is kept
    pub async fn record_publish_failure(
        &self,
        post_id: &str,
        account_id: &str,
        error: &str,
        now: i64,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query(
            r#"
            UPDATE scheduled_post_targets
            SET platform_post_id = NULL, publish_state = 'failed', last_error = ?, updated_at = ?
            WHERE post_id = ? AND account_id = ?
            "#,
        )
        .bind(error)
        .bind(now)
        .bind(post_id)
        .bind(account_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query("UPDATE scheduled_posts SET status = 'failed', updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(post_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    pub async fn mark_post_failed(&self, post_id: &str, now: i64) -> Result<()> {
        sqlx::query("UPDATE scheduled_posts SET status = 'failed', updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(post_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// The scheduled post (owned by `user_id`) that was published as `platform_post_id`
    pub async fn find_scheduled_post_by_platform_id(
        &self,
        platform: Platform,
        platform_post_id: &str,
        user_id: &str,
    ) -> Result<Option<String>> {
        sqlx::query_scalar(
            r#"
            SELECT t.post_id
            FROM scheduled_post_targets t
            JOIN platform_accounts a ON a.id = t.account_id
            JOIN scheduled_posts p ON p.id = t.post_id
            WHERE a.platform = ? AND t.platform_post_id = ? AND p.user_id = ?
            LIMIT 1
            "#,
        )
        .bind(platform.as_str())
        .bind(platform_post_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)
    }

    // ========================================================================
    // Platform post mirrors
    // ========================================================================

    /// Insert or refresh the mirror of `remote`, keyed by (platform, scope, id)
    ///
    /// Returns the local row id and whether the row was created.
    pub async fn upsert_platform_post(
        &self,
        account: &PlatformAccount,
        remote: &RemotePost,
        now: i64,
    ) -> Result<(i64, UpsertKind)> {
        let scope = account.scope();
        let media_kind = remote.media_kind.unwrap_or(MediaKind::Text);
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let existing: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM platform_posts WHERE platform = ? AND scope = ? AND platform_post_id = ?",
        )
        .bind(account.platform.as_str())
        .bind(&scope)
        .bind(&remote.id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        let (post_id, kind) = match existing {
            Some(id) => {
                sqlx::query(
                    r#"
                    UPDATE platform_posts SET
                        content = ?, media_type = ?, media_url = ?, post_url = ?,
                        posted_at = ?, edited_at = ?, visibility = ?, language = ?,
                        sensitive = ?, spoiler_text = ?, in_reply_to_id = ?,
                        api_reaction_count = ?, api_reply_count = ?, api_reshare_count = ?,
                        last_fetched_at = ?
                    WHERE id = ?
                    "#,
                )
                .bind(&remote.content)
                .bind(media_kind.as_str())
                .bind(&remote.media_url)
                .bind(&remote.post_url)
                .bind(remote.posted_at)
                .bind(remote.edited_at)
                .bind(&remote.visibility)
                .bind(&remote.language)
                .bind(remote.sensitive)
                .bind(&remote.spoiler_text)
                .bind(&remote.in_reply_to_id)
                .bind(remote.reaction_count)
                .bind(remote.reply_count)
                .bind(remote.reshare_count)
                .bind(now)
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
                (id, UpsertKind::Updated)
            }
            None => {
                let result = sqlx::query(
                    r#"
                    INSERT INTO platform_posts (
                        platform, scope, platform_post_id, account_id,
                        content, media_type, media_url, post_url, posted_at, edited_at,
                        visibility, language, sensitive, spoiler_text, in_reply_to_id,
                        api_reaction_count, api_reply_count, api_reshare_count,
                        last_fetched_at, created_at
                    )
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(account.platform.as_str())
                .bind(&scope)
                .bind(&remote.id)
                .bind(&account.id)
                .bind(&remote.content)
                .bind(media_kind.as_str())
                .bind(&remote.media_url)
                .bind(&remote.post_url)
                .bind(remote.posted_at)
                .bind(remote.edited_at)
                .bind(&remote.visibility)
                .bind(&remote.language)
                .bind(remote.sensitive)
                .bind(&remote.spoiler_text)
                .bind(&remote.in_reply_to_id)
                .bind(remote.reaction_count)
                .bind(remote.reply_count)
                .bind(remote.reshare_count)
                .bind(now)
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
                (result.last_insert_rowid(), UpsertKind::Created)
            }
        };

        recompute_summary_in(&mut *tx, post_id, now).await?;
        tx.commit().await.map_err(db_err)?;

        Ok((post_id, kind))
    }

    pub async fn link_scheduled_post(&self, post_id: i64, scheduled_post_id: &str) -> Result<()> {
        sqlx::query("UPDATE platform_posts SET scheduled_post_id = ? WHERE id = ?")
            .bind(scheduled_post_id)
            .bind(post_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    pub async fn get_platform_post(&self, post_id: i64) -> Result<Option<PlatformPost>> {
        let row = sqlx::query("SELECT * FROM platform_posts WHERE id = ?")
            .bind(post_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        row.map(|r| platform_post_from_row(&r)).transpose()
    }

    pub async fn find_platform_post(
        &self,
        platform: Platform,
        scope: &str,
        platform_post_id: &str,
    ) -> Result<Option<PlatformPost>> {
        let row = sqlx::query(
            "SELECT * FROM platform_posts WHERE platform = ? AND scope = ? AND platform_post_id = ?",
        )
        .bind(platform.as_str())
        .bind(scope)
        .bind(platform_post_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(|r| platform_post_from_row(&r)).transpose()
    }

    /// Most recently published mirrors for an account
    pub async fn recent_platform_posts(
        &self,
        account_id: &str,
        limit: usize,
    ) -> Result<Vec<PlatformPost>> {
        let rows = sqlx::query(
            "SELECT * FROM platform_posts WHERE account_id = ? ORDER BY posted_at DESC, id DESC LIMIT ?",
        )
        .bind(account_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(platform_post_from_row).collect()
    }

    pub async fn count_platform_posts(&self, account_id: &str) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM platform_posts WHERE account_id = ?")
            .bind(account_id)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)
    }

    /// Store platform-reported metrics (insights) and recompute the summary
    pub async fn update_post_metrics(
        &self,
        post_id: i64,
        metrics: &PostMetrics,
        now: i64,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query(
            r#"
            UPDATE platform_posts
            SET api_save_count = COALESCE(?, api_save_count),
                impressions = COALESCE(?, impressions),
                reach = COALESCE(?, reach)
            WHERE id = ?
            "#,
        )
        .bind(metrics.saved)
        .bind(metrics.impressions)
        .bind(metrics.reach)
        .bind(post_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        recompute_summary_in(&mut *tx, post_id, now).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    // ========================================================================
    // Engagement detail
    // ========================================================================

    /// Record that `actor` reacted to / reshared the post
    ///
    /// Returns `true` when this is the first time the actor was seen. The
    /// stored `first_seen_at` is the observation time, since platforms do
    /// not say when the action happened.
    pub async fn record_actor_engagement(
        &self,
        kind: ActorEngagement,
        post_id: i64,
        actor: &RemoteActor,
        now: i64,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let sql = format!(
            r#"
            INSERT INTO {} (post_id, actor_id, actor_username, actor_display_name, first_seen_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(post_id, actor_id) DO NOTHING
            "#,
            kind.table()
        );
        let result = sqlx::query(&sql)
            .bind(post_id)
            .bind(&actor.id)
            .bind(&actor.username)
            .bind(&actor.display_name)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        let created = result.rows_affected() > 0;
        if created {
            recompute_summary_in(&mut *tx, post_id, now).await?;
        }
        tx.commit().await.map_err(db_err)?;

        Ok(created)
    }

    /// Insert or update a reply by its own remote id
    pub async fn upsert_reply(
        &self,
        post_id: i64,
        reply: &RemoteReply,
        now: i64,
    ) -> Result<UpsertKind> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let existing = sqlx::query(
            "SELECT id, content, in_reply_to_id, like_count FROM replies WHERE post_id = ? AND remote_id = ?",
        )
        .bind(post_id)
        .bind(&reply.id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        let kind = match existing {
            Some(row) => {
                let unchanged = row.get::<String, _>("content") == reply.content
                    && row.get::<Option<String>, _>("in_reply_to_id") == reply.in_reply_to_id
                    && row.get::<i64, _>("like_count") == reply.like_count;
                if unchanged {
                    UpsertKind::Unchanged
                } else {
                    sqlx::query(
                        r#"
                        UPDATE replies
                        SET content = ?, in_reply_to_id = ?, like_count = ?, updated_at = ?
                        WHERE id = ?
                        "#,
                    )
                    .bind(&reply.content)
                    .bind(&reply.in_reply_to_id)
                    .bind(reply.like_count)
                    .bind(now)
                    .bind(row.get::<i64, _>("id"))
                    .execute(&mut *tx)
                    .await
                    .map_err(db_err)?;
                    UpsertKind::Updated
                }
            }
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO replies (
                        post_id, remote_id, author_id, author_username, content,
                        in_reply_to_id, like_count, occurred_at, first_seen_at, updated_at
                    )
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(post_id)
                .bind(&reply.id)
                .bind(&reply.author_id)
                .bind(&reply.author_username)
                .bind(&reply.content)
                .bind(&reply.in_reply_to_id)
                .bind(reply.like_count)
                .bind(reply.created_at)
                .bind(now)
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
                UpsertKind::Created
            }
        };

        if kind == UpsertKind::Created {
            recompute_summary_in(&mut *tx, post_id, now).await?;
        }
        tx.commit().await.map_err(db_err)?;

        Ok(kind)
    }

    /// Row counts of (reactions, replies, reshares) stored for a post
    pub async fn engagement_counts(&self, post_id: i64) -> Result<(i64, i64, i64)> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        detail_counts(&mut *conn, post_id).await
    }

    // ========================================================================
    // Summaries
    // ========================================================================

    /// Rebuild the summary for a post from its current detail rows
    pub async fn recompute_summary(&self, post_id: i64, now: i64) -> Result<EngagementSummary> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let summary = recompute_summary_in(&mut *tx, post_id, now).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(summary)
    }

    pub async fn get_summary(&self, post_id: i64) -> Result<Option<EngagementSummary>> {
        let row = sqlx::query("SELECT * FROM engagement_summaries WHERE post_id = ?")
            .bind(post_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(row.map(|r| EngagementSummary {
            post_id: r.get("post_id"),
            reaction_count: r.get("reaction_count"),
            reply_count: r.get("reply_count"),
            reshare_count: r.get("reshare_count"),
            save_count: r.get("save_count"),
            total_engagement: r.get("total_engagement"),
            impressions: r.get("impressions"),
            reach: r.get("reach"),
            engagement_rate: r.get("engagement_rate"),
            computed_at: r.get("computed_at"),
        }))
    }
}

async fn detail_counts(conn: &mut SqliteConnection, post_id: i64) -> Result<(i64, i64, i64)> {
    let row = sqlx::query(
        r#"
        SELECT
            (SELECT COUNT(*) FROM reactions WHERE post_id = ?) AS reactions,
            (SELECT COUNT(*) FROM replies WHERE post_id = ?) AS replies,
            (SELECT COUNT(*) FROM reshares WHERE post_id = ?) AS reshares
        "#,
    )
    .bind(post_id)
    .bind(post_id)
    .bind(post_id)
    .fetch_one(&mut *conn)
    .await
    .map_err(db_err)?;

    Ok((row.get("reactions"), row.get("replies"), row.get("reshares")))
}

/// Derive and persist the summary for `post_id` on the given connection
///
/// Reactions and reshares come from detail rows where the platform lists
/// actors and from the post's API counters where it does not. Replies always
/// come from rows.
async fn recompute_summary_in(
    conn: &mut SqliteConnection,
    post_id: i64,
    now: i64,
) -> Result<EngagementSummary> {
    let post = sqlx::query(
        r#"
        SELECT platform, api_reaction_count, api_reshare_count, api_save_count, impressions, reach
        FROM platform_posts WHERE id = ?
        "#,
    )
    .bind(post_id)
    .fetch_one(&mut *conn)
    .await
    .map_err(db_err)?;

    let platform = parse_platform(post.get::<String, _>("platform").as_str())?;
    let (reaction_rows, reply_rows, reshare_rows) = detail_counts(conn, post_id).await?;

    let (reaction_count, reshare_count) = if platform.exposes_actor_detail() {
        (reaction_rows, reshare_rows)
    } else {
        (
            post.get::<i64, _>("api_reaction_count"),
            post.get::<i64, _>("api_reshare_count"),
        )
    };
    let save_count = post.get::<Option<i64>, _>("api_save_count").unwrap_or(0);
    let impressions: Option<i64> = post.get("impressions");
    let reach: Option<i64> = post.get("reach");

    let total_engagement = reaction_count + reply_rows + reshare_count + save_count;
    let engagement_rate = match impressions {
        Some(i) if i > 0 => Some(total_engagement as f64 * 100.0 / i as f64),
        _ => None,
    };

    let summary = EngagementSummary {
        post_id,
        reaction_count,
        reply_count: reply_rows,
        reshare_count,
        save_count,
        total_engagement,
        impressions,
        reach,
        engagement_rate,
        computed_at: now,
    };

    sqlx::query(
        r#"
        INSERT INTO engagement_summaries (
            post_id, reaction_count, reply_count, reshare_count, save_count,
            total_engagement, impressions, reach, engagement_rate, computed_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(post_id) DO UPDATE SET
            reaction_count = excluded.reaction_count,
            reply_count = excluded.reply_count,
            reshare_count = excluded.reshare_count,
            save_count = excluded.save_count,
            total_engagement = excluded.total_engagement,
            impressions = excluded.impressions,
            reach = excluded.reach,
            engagement_rate = excluded.engagement_rate,
            computed_at = excluded.computed_at
        "#,
    )
    .bind(summary.post_id)
    .bind(summary.reaction_count)
    .bind(summary.reply_count)
    .bind(summary.reshare_count)
    .bind(summary.save_count)
    .bind(summary.total_engagement)
    .bind(summary.impressions)
    .bind(summary.reach)
    .bind(summary.engagement_rate)
    .bind(summary.computed_at)
    .execute(&mut *conn)
    .await
    .map_err(db_err)?;

    Ok(summary)
}

fn parse_platform(s: &str) -> Result<Platform> {
    s.parse::<Platform>().map_err(PostflowError::InvalidInput)
}

fn account_from_row(r: &SqliteRow) -> Result<PlatformAccount> {
    Ok(PlatformAccount {
        id: r.get("id"),
        user_id: r.get("user_id"),
        platform: parse_platform(r.get::<String, _>("platform").as_str())?,
        instance_url: r.get("instance_url"),
        remote_account_id: r.get("remote_account_id"),
        username: r.get("username"),
        access_token: r.get("access_token"),
        token_expires_at: r.get("token_expires_at"),
        last_refreshed_at: r.get("last_refreshed_at"),
        last_posts_sync_at: r.get("last_posts_sync_at"),
        last_engagement_sync_at: r.get("last_engagement_sync_at"),
    })
}

fn platform_post_from_row(r: &SqliteRow) -> Result<PlatformPost> {
    Ok(PlatformPost {
        id: r.get("id"),
        platform: parse_platform(r.get::<String, _>("platform").as_str())?,
        scope: r.get("scope"),
        platform_post_id: r.get("platform_post_id"),
        account_id: r.get("account_id"),
        scheduled_post_id: r.get("scheduled_post_id"),
        content: r.get("content"),
        media_kind: MediaKind::from_remote(r.get::<String, _>("media_type").as_str()),
        media_url: r.get("media_url"),
        post_url: r.get("post_url"),
        posted_at: r.get("posted_at"),
        edited_at: r.get("edited_at"),
        api_reaction_count: r.get("api_reaction_count"),
        api_reply_count: r.get("api_reply_count"),
        api_reshare_count: r.get("api_reshare_count"),
        api_save_count: r.get("api_save_count"),
        impressions: r.get("impressions"),
        reach: r.get("reach"),
        last_fetched_at: r.get("last_fetched_at"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn setup() -> (Database, PlatformAccount) {
        let db = Database::in_memory().await.unwrap();
        let account = PlatformAccount::new("user-1", Platform::Mastodon, "109", "token")
            .with_instance("https://mastodon.social")
            .with_username("alice");
        db.upsert_account(&account).await.unwrap();
        (db, account)
    }

    fn remote_post(id: &str) -> RemotePost {
        RemotePost {
            id: id.to_string(),
            content: "hello".to_string(),
            media_kind: Some(MediaKind::Image),
            posted_at: 1_700_000_000,
            reaction_count: 4,
            reply_count: 1,
            reshare_count: 2,
            ..Default::default()
        }
    }

    fn actor(id: &str) -> RemoteActor {
        RemoteActor {
            id: id.to_string(),
            username: format!("user{}", id),
            display_name: None,
        }
    }

    #[tokio::test]
    async fn test_database_new_creates_parent_dirs() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("nested").join("postflow.db");

        let db = Database::new(db_path.to_str().unwrap()).await;
        assert!(db.is_ok());
        assert!(db_path.exists());
    }

    #[tokio::test]
    async fn test_create_and_load_scheduled_post() {
        let (db, account) = setup().await;
        let post = ScheduledPost::new("user-1", "Caption", 100)
            .with_media(["https://cdn.example/a.jpg", "https://cdn.example/b.jpg"])
            .with_hashtags(["#one", "#two"]);

        db.create_scheduled_post(&post, &[&account.id]).await.unwrap();

        let loaded = db.get_scheduled_post(&post.id).await.unwrap().unwrap();
        assert_eq!(loaded.media_urls, post.media_urls);
        assert_eq!(loaded.hashtags, vec!["#one", "#two"]);
        assert_eq!(loaded.status, PostStatus::Pending);

        let targets = db.publish_targets(&post.id).await.unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].state, PublishState::Queued);
    }

    #[tokio::test]
    async fn test_due_posts_only_pending_and_past() {
        let (db, account) = setup().await;
        let due = ScheduledPost::new("user-1", "due", 100);
        let future = ScheduledPost::new("user-1", "future", 10_000);
        let mut done = ScheduledPost::new("user-1", "done", 50);
        done.status = PostStatus::Posted;

        for post in [&due, &future, &done] {
            db.create_scheduled_post(post, &[&account.id]).await.unwrap();
        }

        let posts = db.due_posts(500).await.unwrap();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].id, due.id);
    }

    #[tokio::test]
    async fn test_failure_is_sticky_across_accounts() {
        let (db, first) = setup().await;
        let second = PlatformAccount::new("user-1", Platform::Mastodon, "110", "token")
            .with_instance("https://fosstodon.org");
        db.upsert_account(&second).await.unwrap();

        let post = ScheduledPost::new("user-1", "x", 100);
        db.create_scheduled_post(&post, &[&first.id, &second.id]).await.unwrap();

        db.record_publish_failure(&post.id, &first.id, "boom", 200).await.unwrap();
        db.record_publish_success(&post.id, &second.id, "abc", 201).await.unwrap();

        let loaded = db.get_scheduled_post(&post.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, PostStatus::Failed);

        let targets = db.publish_targets(&post.id).await.unwrap();
        let ok = targets.iter().find(|t| t.account_id == second.id).unwrap();
        assert_eq!(ok.platform_post_id.as_deref(), Some("abc"));
        let failed = targets.iter().find(|t| t.account_id == first.id).unwrap();
        assert_eq!(failed.platform_post_id, None);
        assert_eq!(failed.last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_upsert_platform_post_is_idempotent() {
        let (db, account) = setup().await;
        let remote = remote_post("111");

        let (id, kind) = db.upsert_platform_post(&account, &remote, 10).await.unwrap();
        assert_eq!(kind, UpsertKind::Created);

        let (again, kind) = db.upsert_platform_post(&account, &remote, 20).await.unwrap();
        assert_eq!(kind, UpsertKind::Updated);
        assert_eq!(again, id);
        assert_eq!(db.count_platform_posts(&account.id).await.unwrap(), 1);

        let stored = db.get_platform_post(id).await.unwrap().unwrap();
        assert_eq!(stored.last_fetched_at, 20);
    }

    #[tokio::test]
    async fn test_same_post_id_on_different_instances_is_kept_apart() {
        let (db, account) = setup().await;
        let other = PlatformAccount::new("user-1", Platform::Mastodon, "109", "token")
            .with_instance("https://hachyderm.io");
        db.upsert_account(&other).await.unwrap();

        db.upsert_platform_post(&account, &remote_post("42"), 1).await.unwrap();
        db.upsert_platform_post(&other, &remote_post("42"), 1).await.unwrap();

        assert!(db
            .find_platform_post(Platform::Mastodon, "https://mastodon.social", "42")
            .await
            .unwrap()
            .is_some());
        assert!(db
            .find_platform_post(Platform::Mastodon, "https://hachyderm.io", "42")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_actor_engagement_unique_per_actor() {
        let (db, account) = setup().await;
        let (post_id, _) = db.upsert_platform_post(&account, &remote_post("1"), 1).await.unwrap();

        assert!(db
            .record_actor_engagement(ActorEngagement::Reaction, post_id, &actor("a"), 5)
            .await
            .unwrap());
        assert!(!db
            .record_actor_engagement(ActorEngagement::Reaction, post_id, &actor("a"), 9)
            .await
            .unwrap());

        let first_seen: i64 =
            sqlx::query_scalar("SELECT first_seen_at FROM reactions WHERE actor_id = 'a'")
                .fetch_one(db.pool())
                .await
                .unwrap();
        assert_eq!(first_seen, 5);
    }

    #[tokio::test]
    async fn test_reply_upsert_updates_edited_text() {
        let (db, account) = setup().await;
        let (post_id, _) = db.upsert_platform_post(&account, &remote_post("1"), 1).await.unwrap();
        let mut reply = RemoteReply {
            id: "r1".to_string(),
            author_id: Some("9".to_string()),
            author_username: "bob".to_string(),
            content: "nice".to_string(),
            in_reply_to_id: Some("1".to_string()),
            like_count: 0,
            created_at: Some(3),
        };

        assert_eq!(db.upsert_reply(post_id, &reply, 5).await.unwrap(), UpsertKind::Created);
        assert_eq!(db.upsert_reply(post_id, &reply, 6).await.unwrap(), UpsertKind::Unchanged);

        reply.content = "very nice".to_string();
        assert_eq!(db.upsert_reply(post_id, &reply, 7).await.unwrap(), UpsertKind::Updated);
        assert_eq!(db.engagement_counts(post_id).await.unwrap(), (0, 1, 0));
    }

    #[tokio::test]
    async fn test_summary_matches_detail_rows() {
        let (db, account) = setup().await;
        let (post_id, _) = db.upsert_platform_post(&account, &remote_post("1"), 1).await.unwrap();

        for id in ["a", "b", "c"] {
            db.record_actor_engagement(ActorEngagement::Reaction, post_id, &actor(id), 2)
                .await
                .unwrap();
        }
        db.record_actor_engagement(ActorEngagement::Reshare, post_id, &actor("d"), 2)
            .await
            .unwrap();

        let summary = db.get_summary(post_id).await.unwrap().unwrap();
        let (reactions, replies, reshares) = db.engagement_counts(post_id).await.unwrap();
        assert_eq!(summary.reaction_count, 3);
        assert_eq!(summary.reshare_count, 1);
        assert_eq!(summary.total_engagement, reactions + replies + reshares);
    }

    #[tokio::test]
    async fn test_instagram_summary_uses_counters_and_insights() {
        let db = Database::in_memory().await.unwrap();
        let account = PlatformAccount::new("user-1", Platform::Instagram, "1784", "token");
        db.upsert_account(&account).await.unwrap();

        let mut remote = remote_post("900");
        remote.reaction_count = 10;
        remote.reshare_count = 0;
        let (post_id, _) = db.upsert_platform_post(&account, &remote, 1).await.unwrap();

        db.update_post_metrics(
            post_id,
            &PostMetrics {
                impressions: Some(200),
                reach: Some(150),
                saved: Some(2),
                ..Default::default()
            },
            2,
        )
        .await
        .unwrap();

        let summary = db.get_summary(post_id).await.unwrap().unwrap();
        assert_eq!(summary.reaction_count, 10);
        assert_eq!(summary.save_count, 2);
        assert_eq!(summary.total_engagement, 12);
        assert_eq!(summary.engagement_rate, Some(6.0));
    }

    #[tokio::test]
    async fn test_deleting_mirror_cascades_to_detail() {
        let (db, account) = setup().await;
        let (post_id, _) = db.upsert_platform_post(&account, &remote_post("1"), 1).await.unwrap();
        db.record_actor_engagement(ActorEngagement::Reaction, post_id, &actor("a"), 2)
            .await
            .unwrap();

        sqlx::query("DELETE FROM platform_posts WHERE id = ?")
            .bind(post_id)
            .execute(db.pool())
            .await
            .unwrap();

        let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM reactions")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(remaining, 0);
        assert!(db.get_summary(post_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_find_scheduled_post_by_platform_id_scoped_to_user() {
        let (db, account) = setup().await;
        let post = ScheduledPost::new("user-1", "x", 1);
        db.create_scheduled_post(&post, &[&account.id]).await.unwrap();
        db.record_publish_success(&post.id, &account.id, "555", 2).await.unwrap();

        let found = db
            .find_scheduled_post_by_platform_id(Platform::Mastodon, "555", "user-1")
            .await
            .unwrap();
        assert_eq!(found.as_deref(), Some(post.id.as_str()));

        let other_user = db
            .find_scheduled_post_by_platform_id(Platform::Mastodon, "555", "user-2")
            .await
            .unwrap();
        assert!(other_user.is_none());
    }

    #[tokio::test]
    async fn test_accounts_expiring_before() {
        let db = Database::in_memory().await.unwrap();
        let mut soon = PlatformAccount::new("u", Platform::Instagram, "1", "t");
        soon.token_expires_at = Some(1_000);
        let mut later = PlatformAccount::new("u", Platform::Instagram, "2", "t");
        later.token_expires_at = Some(9_000);
        let never = PlatformAccount::new("u", Platform::Instagram, "3", "t");
        for account in [&soon, &later, &never] {
            db.upsert_account(account).await.unwrap();
        }

        let expiring = db
            .accounts_expiring_before(Platform::Instagram, 2_000)
            .await
            .unwrap();
        assert_eq!(expiring.len(), 1);
        assert_eq!(expiring[0].id, soon.id);
    }
}
