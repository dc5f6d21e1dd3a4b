//! The four scheduled jobs and their wiring from configuration

use anyhow::Context;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::{Job, JobSpec};
use crate::config::{
    parse_duration, Config, DISPATCH_DUE_POSTS, FETCH_ENGAGEMENT, REFRESH_CREDENTIALS, SYNC_POSTS,
};
use crate::db::Database;
use crate::error::{Result, SchedulerError};
use crate::platforms::instagram::GraphClient;
use crate::platforms::TokenRefresher;
use crate::publish::PublishEngine;
use crate::sync::SyncEngine;
use crate::types::Platform;

/// Tokens reported as expiring sooner than this are treated as 60-day tokens
const MIN_REPORTED_LIFETIME: i64 = 3600;
const DEFAULT_TOKEN_LIFETIME: i64 = 60 * 24 * 3600;

pub struct DispatchDuePostsJob {
    engine: Arc<PublishEngine>,
}

impl DispatchDuePostsJob {
    pub fn new(engine: Arc<PublishEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl Job for DispatchDuePostsJob {
    async fn run(&self, now: i64) -> anyhow::Result<()> {
        let summary = self
            .engine
            .dispatch_due(now)
            .await
            .context("dispatching due posts")?;
        if summary.posts > 0 {
            info!(
                posts = summary.posts,
                posted = summary.targets_posted,
                failed = summary.targets_failed,
                "Dispatch pass finished"
            );
        }
        Ok(())
    }
}

pub struct SyncPostsJob {
    engine: Arc<SyncEngine>,
}

impl SyncPostsJob {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl Job for SyncPostsJob {
    async fn run(&self, _now: i64) -> anyhow::Result<()> {
        self.engine.sync_all_posts().await.context("syncing posts")?;
        Ok(())
    }
}

pub struct FetchEngagementJob {
    engine: Arc<SyncEngine>,
}

impl FetchEngagementJob {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl Job for FetchEngagementJob {
    async fn run(&self, _now: i64) -> anyhow::Result<()> {
        self.engine
            .fetch_all_engagement()
            .await
            .context("fetching engagement")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    pub refreshed: usize,
    pub failed: usize,
}

/// Renews access tokens that are about to expire
pub struct RefreshCredentialsJob {
    db: Database,
    refreshers: HashMap<Platform, Arc<dyn TokenRefresher>>,
    window: Duration,
}

impl RefreshCredentialsJob {
    pub fn new(db: Database, window: Duration) -> Self {
        Self {
            db,
            refreshers: HashMap::new(),
            window,
        }
    }

    pub fn with_refresher(mut self, refresher: Arc<dyn TokenRefresher>) -> Self {
        self.refreshers.insert(refresher.platform(), refresher);
        self
    }

    /// Refresh every account whose token expires within the window
    ///
    /// One account failing does not stop the rest; only storage errors
    /// abort the pass.
    pub async fn refresh_due(&self, now: i64) -> Result<RefreshSummary> {
        let deadline = now + self.window.as_secs() as i64;
        let mut summary = RefreshSummary::default();

        for platform in Platform::ALL {
            let Some(refresher) = self.refreshers.get(&platform) else {
                continue;
            };

            for account in self.db.accounts_expiring_before(platform, deadline).await? {
                match refresher.refresh(&account).await {
                    Ok(token) => {
                        let lifetime = token
                            .expires_in
                            .filter(|secs| *secs >= MIN_REPORTED_LIFETIME)
                            .unwrap_or(DEFAULT_TOKEN_LIFETIME);
                        self.db
                            .update_account_token(&account.id, &token.access_token, now + lifetime, now)
                            .await?;
                        info!(
                            account_id = %account.id,
                            platform = %platform,
                            expires_at = now + lifetime,
                            "Refreshed access token"
                        );
                        summary.refreshed += 1;
                    }
                    Err(e) => {
                        warn!(account_id = %account.id, platform = %platform, error = %e, "Token refresh failed");
                        summary.failed += 1;
                    }
                }
            }
        }

        Ok(summary)
    }
}

#[async_trait]
impl Job for RefreshCredentialsJob {
    async fn run(&self, now: i64) -> anyhow::Result<()> {
        let summary = self.refresh_due(now).await.context("refreshing credentials")?;
        if summary.failed > 0 {
            anyhow::bail!(
                "{} of {} token refreshes failed",
                summary.failed,
                summary.failed + summary.refreshed
            );
        }
        Ok(())
    }
}

/// Build the enabled jobs from configuration, backed by the real platform APIs
pub fn configured_jobs(config: &Config, db: Database) -> Result<Vec<(JobSpec, Arc<dyn Job>)>> {
    let mut publish: Option<Arc<PublishEngine>> = None;
    let mut sync: Option<Arc<SyncEngine>> = None;
    let mut jobs: Vec<(JobSpec, Arc<dyn Job>)> = Vec::new();

    for (name, job_config) in &config.scheduler.jobs {
        if !job_config.enabled {
            info!(job = %name, "Job disabled in configuration");
            continue;
        }
        let spec = JobSpec::from_config(name, job_config)?;

        let job: Arc<dyn Job> = match name.as_str() {
            DISPATCH_DUE_POSTS => {
                let engine = match &publish {
                    Some(engine) => Arc::clone(engine),
                    None => {
                        let engine = Arc::new(PublishEngine::from_config(db.clone(), config)?);
                        publish = Some(Arc::clone(&engine));
                        engine
                    }
                };
                Arc::new(DispatchDuePostsJob::new(engine))
            }
            SYNC_POSTS | FETCH_ENGAGEMENT => {
                let engine = match &sync {
                    Some(engine) => Arc::clone(engine),
                    None => {
                        let engine = Arc::new(SyncEngine::from_config(db.clone(), config)?);
                        sync = Some(Arc::clone(&engine));
                        engine
                    }
                };
                if name == SYNC_POSTS {
                    Arc::new(SyncPostsJob::new(engine))
                } else {
                    Arc::new(FetchEngagementJob::new(engine))
                }
            }
            REFRESH_CREDENTIALS => {
                let window =
                    parse_duration("sync.token_refresh_window", &config.sync.token_refresh_window)?;
                let graph = GraphClient::new(&config.instagram, &config.http)?;
                Arc::new(RefreshCredentialsJob::new(db.clone(), window).with_refresher(Arc::new(graph)))
            }
            other => {
                return Err(SchedulerError::Registration(format!("unknown job '{}'", other)).into());
            }
        };

        jobs.push((spec, job));
    }

    Ok(jobs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PlatformError;
    use crate::platforms::mock::MockRefresher;
    use crate::types::PlatformAccount;

    const NOW: i64 = 1_700_000_000;

    async fn account(db: &Database, platform: Platform, expires_at: Option<i64>) -> PlatformAccount {
        let mut account = PlatformAccount::new("user-1", platform, "42", "old-token");
        if platform != Platform::Instagram {
            account = account.with_instance("https://social.test");
        }
        account.token_expires_at = expires_at;
        db.upsert_account(&account).await.unwrap();
        account
    }

    #[tokio::test]
    async fn test_refreshes_only_expiring_accounts() {
        let db = Database::in_memory().await.unwrap();
        let soon = account(&db, Platform::Instagram, Some(NOW + 3600)).await;
        let later = account(&db, Platform::Instagram, Some(NOW + 30 * 86_400)).await;
        let refresher = MockRefresher::new(Platform::Instagram, Some(5_184_000));

        let job = RefreshCredentialsJob::new(db.clone(), Duration::from_secs(2 * 86_400))
            .with_refresher(Arc::new(refresher.clone()));
        let summary = job.refresh_due(NOW).await.unwrap();

        assert_eq!(summary, RefreshSummary { refreshed: 1, failed: 0 });
        assert_eq!(refresher.refreshed(), vec![soon.id.clone()]);

        let stored = db.get_account(&soon.id).await.unwrap().unwrap();
        assert_eq!(stored.token_expires_at, Some(NOW + 5_184_000));
        assert_eq!(stored.last_refreshed_at, Some(NOW));
        assert_ne!(stored.access_token, "old-token");

        let untouched = db.get_account(&later.id).await.unwrap().unwrap();
        assert_eq!(untouched.access_token, "old-token");
    }

    #[tokio::test]
    async fn test_short_reported_lifetime_uses_default() {
        let db = Database::in_memory().await.unwrap();
        let expiring = account(&db, Platform::Instagram, Some(NOW - 10)).await;

        let job = RefreshCredentialsJob::new(db.clone(), Duration::from_secs(86_400))
            .with_refresher(Arc::new(MockRefresher::new(Platform::Instagram, Some(0))));
        job.refresh_due(NOW).await.unwrap();

        let stored = db.get_account(&expiring.id).await.unwrap().unwrap();
        assert_eq!(stored.token_expires_at, Some(NOW + DEFAULT_TOKEN_LIFETIME));
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_token_and_fails_job() {
        let db = Database::in_memory().await.unwrap();
        let expiring = account(&db, Platform::Instagram, Some(NOW + 60)).await;
        let refresher = MockRefresher::failing(
            Platform::Instagram,
            PlatformError::Authentication("token revoked".to_string()),
        );

        let job = RefreshCredentialsJob::new(db.clone(), Duration::from_secs(86_400))
            .with_refresher(Arc::new(refresher));

        assert!(job.run(NOW).await.is_err());
        let stored = db.get_account(&expiring.id).await.unwrap().unwrap();
        assert_eq!(stored.access_token, "old-token");
    }

    #[tokio::test]
    async fn test_platforms_without_refresher_are_skipped() {
        let db = Database::in_memory().await.unwrap();
        account(&db, Platform::Mastodon, Some(NOW + 60)).await;
        let refresher = MockRefresher::new(Platform::Instagram, None);

        let job = RefreshCredentialsJob::new(db, Duration::from_secs(86_400))
            .with_refresher(Arc::new(refresher.clone()));
        let summary = job.refresh_due(NOW).await.unwrap();

        assert_eq!(summary.refreshed, 0);
        assert!(refresher.refreshed().is_empty());
    }

    #[tokio::test]
    async fn test_configured_jobs_follow_config() {
        let db = Database::in_memory().await.unwrap();
        let mut config = Config::default_config();
        if let Some(job) = config.scheduler.jobs.get_mut(SYNC_POSTS) {
            job.enabled = false;
        }

        let jobs = configured_jobs(&config, db).unwrap();
        let names: Vec<&str> = jobs.iter().map(|(spec, _)| spec.name.as_str()).collect();
        assert_eq!(names, vec![DISPATCH_DUE_POSTS, FETCH_ENGAGEMENT, REFRESH_CREDENTIALS]);
    }

    #[tokio::test]
    async fn test_unknown_job_rejected() {
        let db = Database::in_memory().await.unwrap();
        let mut config = Config::default_config();
        let extra = config.scheduler.jobs[SYNC_POSTS].clone();
        config.scheduler.jobs.insert("purge_everything".to_string(), extra);

        assert!(configured_jobs(&config, db).is_err());
    }
}
