//! Sync / ingestion engine
//!
//! Mirrors each account's remote posts into `platform_posts` and pulls
//! engagement detail for the most recent of them. Every write is an upsert
//! in its own transaction, so an interrupted run leaves whatever it already
//! processed in a consistent state and the next run simply continues.
//!
//! Failures are collected into the returned summaries instead of aborting:
//! one account's bad credentials do not stop the others, and one failing
//! engagement list does not discard the other two.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::{Config, SyncConfig};
use crate::db::Database;
use crate::error::{PostflowError, Result};
use crate::platforms::instagram::GraphClient;
use crate::platforms::status::{StatusClient, StatusFlavor};
use crate::platforms::{AnalyticsSource, MAX_PAGE_SIZE};
use crate::types::Platform;

pub mod engagement;
pub mod posts;

pub use engagement::EngagementSyncSummary;
pub use posts::{strip_html, PostSyncSummary};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    /// Items requested per listing call (at most 40)
    pub page_size: usize,
    /// Upper bound on posts per account for each post sync; `None` fetches all
    pub post_limit: Option<usize>,
    pub instagram_engagement_posts: usize,
    pub status_engagement_posts: usize,
}

impl SyncSettings {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            page_size: config.page_size.clamp(1, MAX_PAGE_SIZE),
            post_limit: config.post_limit,
            instagram_engagement_posts: config.instagram_engagement_posts,
            status_engagement_posts: config.status_engagement_posts,
        }
    }

    /// How many recent posts get engagement fetched per account
    pub fn engagement_posts(&self, platform: Platform) -> usize {
        match platform {
            Platform::Instagram => self.instagram_engagement_posts,
            Platform::Mastodon | Platform::Pixelfed => self.status_engagement_posts,
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            page_size: MAX_PAGE_SIZE,
            post_limit: None,
            instagram_engagement_posts: 30,
            status_engagement_posts: 50,
        }
    }
}

pub struct SyncEngine {
    db: Database,
    sources: HashMap<Platform, Arc<dyn AnalyticsSource>>,
    settings: SyncSettings,
}

impl SyncEngine {
    pub fn new(db: Database, settings: SyncSettings) -> Self {
        Self {
            db,
            sources: HashMap::new(),
            settings,
        }
    }

    /// Engine reading from the real platform APIs
    pub fn from_config(db: Database, config: &Config) -> Result<Self> {
        let graph = GraphClient::new(&config.instagram, &config.http)?;
        let mastodon = StatusClient::new(StatusFlavor::Mastodon, &config.http)?;
        let pixelfed = StatusClient::new(StatusFlavor::Pixelfed, &config.http)?;

        Ok(Self::new(db, SyncSettings::from_config(&config.sync))
            .with_source(Arc::new(graph))
            .with_source(Arc::new(mastodon))
            .with_source(Arc::new(pixelfed)))
    }

    pub fn with_source(mut self, source: Arc<dyn AnalyticsSource>) -> Self {
        self.register(source);
        self
    }

    pub fn register(&mut self, source: Arc<dyn AnalyticsSource>) {
        self.sources.insert(source.platform(), source);
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    fn source(&self, platform: Platform) -> Result<&Arc<dyn AnalyticsSource>> {
        self.sources.get(&platform).ok_or_else(|| {
            PostflowError::InvalidInput(format!("No analytics source registered for {}", platform))
        })
    }

    /// Post sync for every account on every registered platform
    pub async fn sync_all_posts(&self) -> Result<PostSyncSummary> {
        let mut total = PostSyncSummary::default();

        for platform in self.registered_platforms() {
            for account in self.db.accounts_for_platform(platform).await? {
                match self.sync_account_posts(&account, self.settings.post_limit).await {
                    Ok(summary) => total.merge(&summary),
                    Err(e) => {
                        warn!(
                            account_id = %account.id,
                            platform = %platform,
                            error = %e,
                            "Post sync failed for account"
                        );
                        total.accounts += 1;
                        total.failed_accounts += 1;
                        total.errors.push(format!("{}: {}", account.id, e));
                    }
                }
            }
        }

        info!(
            accounts = total.accounts,
            failed_accounts = total.failed_accounts,
            fetched = total.fetched,
            created = total.created,
            updated = total.updated,
            "Post sync finished"
        );
        Ok(total)
    }

    /// Engagement fetch for every account on every registered platform
    pub async fn fetch_all_engagement(&self) -> Result<EngagementSyncSummary> {
        let mut total = EngagementSyncSummary::default();

        for platform in self.registered_platforms() {
            let limit = self.settings.engagement_posts(platform);
            for account in self.db.accounts_for_platform(platform).await? {
                match self.fetch_account_engagement(&account, limit).await {
                    Ok(summary) => total.merge(&summary),
                    Err(e) => {
                        warn!(
                            account_id = %account.id,
                            platform = %platform,
                            error = %e,
                            "Engagement fetch failed for account"
                        );
                        total.accounts += 1;
                        total.failed_accounts += 1;
                        total.errors.push(format!("{}: {}", account.id, e));
                    }
                }
            }
        }

        info!(
            accounts = total.accounts,
            failed_accounts = total.failed_accounts,
            posts = total.posts,
            new_reactions = total.new_reactions,
            new_replies = total.new_replies,
            new_reshares = total.new_reshares,
            "Engagement fetch finished"
        );
        Ok(total)
    }

    fn registered_platforms(&self) -> Vec<Platform> {
        Platform::ALL
            .iter()
            .copied()
            .filter(|platform| self.sources.contains_key(platform))
            .collect()
    }
}

pub(crate) fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_from_config() {
        let mut config = SyncConfig::default();
        config.page_size = 25;
        config.post_limit = Some(100);

        let settings = SyncSettings::from_config(&config);
        assert_eq!(settings.page_size, 25);
        assert_eq!(settings.post_limit, Some(100));
        assert_eq!(settings.engagement_posts(Platform::Instagram), 30);
        assert_eq!(settings.engagement_posts(Platform::Pixelfed), 50);
    }
}
