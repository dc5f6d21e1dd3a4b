//! Engagement sync: reactions, replies and reshares for recent posts

use tracing::{debug, info, warn};

use super::posts::strip_html;
use super::{now, SyncEngine};
use crate::db::{ActorEngagement, UpsertKind};
use crate::error::Result;
use crate::platforms::AnalyticsSource;
use crate::types::{Platform, PlatformAccount, PlatformPost, RemoteActor};

/// Counts from fetching engagement for one or more posts
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngagementSyncSummary {
    pub accounts: usize,
    pub failed_accounts: usize,
    pub posts: usize,
    pub new_reactions: usize,
    pub new_replies: usize,
    pub updated_replies: usize,
    pub new_reshares: usize,
    pub metrics_updated: usize,
    /// One entry per list that could not be fetched or stored
    pub errors: Vec<String>,
}

impl EngagementSyncSummary {
    pub fn merge(&mut self, other: &EngagementSyncSummary) {
        self.accounts += other.accounts;
        self.failed_accounts += other.failed_accounts;
        self.posts += other.posts;
        self.new_reactions += other.new_reactions;
        self.new_replies += other.new_replies;
        self.updated_replies += other.updated_replies;
        self.new_reshares += other.new_reshares;
        self.metrics_updated += other.metrics_updated;
        self.errors.extend(other.errors.iter().cloned());
    }
}

impl SyncEngine {
    /// Engagement for the account's `limit` most recent mirrored posts
    pub async fn fetch_account_engagement(
        &self,
        account: &PlatformAccount,
        limit: usize,
    ) -> Result<EngagementSyncSummary> {
        let posts = self.db.recent_platform_posts(&account.id, limit).await?;
        let mut summary = EngagementSyncSummary {
            accounts: 1,
            ..Default::default()
        };

        for post in &posts {
            let post_summary = self.fetch_post_engagement(account, post).await?;
            summary.merge(&post_summary);
        }

        self.db.mark_engagement_synced(&account.id, now()).await?;

        info!(
            account_id = %account.id,
            platform = %account.platform,
            posts = summary.posts,
            new_reactions = summary.new_reactions,
            new_replies = summary.new_replies,
            new_reshares = summary.new_reshares,
            errors = summary.errors.len(),
            "Fetched engagement"
        );
        Ok(summary)
    }

    /// Fetch and store the three engagement lists for one post
    ///
    /// Each list is handled on its own; a failure is recorded in the summary
    /// and the remaining lists still run. The summary row is recomputed at
    /// the end regardless.
    pub async fn fetch_post_engagement(
        &self,
        account: &PlatformAccount,
        post: &PlatformPost,
    ) -> Result<EngagementSyncSummary> {
        let source = self.source(account.platform)?;
        let remote_id = post.platform_post_id.as_str();
        let now = now();
        let mut summary = EngagementSyncSummary {
            posts: 1,
            ..Default::default()
        };

        match source.reactions(account, remote_id).await {
            Ok(Some(actors)) => {
                summary.new_reactions += self
                    .store_actors(ActorEngagement::Reaction, post.id, &actors, now, &mut summary.errors)
                    .await;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(platform_post_id = remote_id, error = %e, "Failed to fetch reactions");
                summary.errors.push(format!("reactions: {}", e));
            }
        }

        match source.replies(account, remote_id).await {
            Ok(mut replies) => {
                // Status APIs return reply bodies as HTML
                if account.platform != Platform::Instagram {
                    for reply in &mut replies {
                        reply.content = strip_html(&reply.content);
                    }
                }
                for reply in &replies {
                    match self.db.upsert_reply(post.id, reply, now).await {
                        Ok(UpsertKind::Created) => summary.new_replies += 1,
                        Ok(UpsertKind::Updated) => summary.updated_replies += 1,
                        Ok(UpsertKind::Unchanged) => {}
                        Err(e) => summary.errors.push(format!("reply {}: {}", reply.id, e)),
                    }
                }
            }
            Err(e) => {
                warn!(platform_post_id = remote_id, error = %e, "Failed to fetch replies");
                summary.errors.push(format!("replies: {}", e));
            }
        }

        match source.reshares(account, remote_id).await {
            Ok(Some(actors)) => {
                summary.new_reshares += self
                    .store_actors(ActorEngagement::Reshare, post.id, &actors, now, &mut summary.errors)
                    .await;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(platform_post_id = remote_id, error = %e, "Failed to fetch reshares");
                summary.errors.push(format!("reshares: {}", e));
            }
        }

        self.store_metrics(source.as_ref(), account, post, now, &mut summary)
            .await;

        let totals = self.db.recompute_summary(post.id, now).await?;
        debug!(
            post_id = post.id,
            total = totals.total_engagement,
            "Recomputed engagement summary"
        );

        Ok(summary)
    }

    async fn store_actors(
        &self,
        kind: ActorEngagement,
        post_id: i64,
        actors: &[RemoteActor],
        now: i64,
        errors: &mut Vec<String>,
    ) -> usize {
        let mut created = 0;
        for actor in actors {
            match self.db.record_actor_engagement(kind, post_id, actor, now).await {
                Ok(true) => created += 1,
                Ok(false) => {}
                Err(e) => errors.push(format!("{:?} {}: {}", kind, actor.id, e)),
            }
        }
        created
    }

    async fn store_metrics(
        &self,
        source: &dyn AnalyticsSource,
        account: &PlatformAccount,
        post: &PlatformPost,
        now: i64,
        summary: &mut EngagementSyncSummary,
    ) {
        let metrics = match source.metrics(account, &post.platform_post_id).await {
            Ok(metrics) => metrics,
            Err(e) => {
                warn!(platform_post_id = %post.platform_post_id, error = %e, "Failed to fetch metrics");
                summary.errors.push(format!("metrics: {}", e));
                return;
            }
        };

        if metrics.is_empty() {
            return;
        }

        match self.db.update_post_metrics(post.id, &metrics, now).await {
            Ok(()) => summary.metrics_updated += 1,
            Err(e) => summary.errors.push(format!("metrics: {}", e)),
        }
    }
}
