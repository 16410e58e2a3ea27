use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::metrics::AuthMetrics;
use crate::store::{CredentialStore, PurgeReport, StoreResult};

pub const MIN_CLEANUP_INTERVAL: Duration = Duration::from_secs(10);
pub const MAX_REVOKED_RETENTION: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupPolicy {
    pub interval: Duration,
    /// How long revoked refresh tokens are kept for reuse detection.
    pub revoked_retention: Duration,
}

impl Default for CleanupPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            revoked_retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl CleanupPolicy {
    pub fn new(interval: Duration, revoked_retention: Duration) -> Self {
        Self {
            interval: interval.max(MIN_CLEANUP_INTERVAL),
            revoked_retention: revoked_retention.min(MAX_REVOKED_RETENTION),
        }
    }
}

/// One purge pass over the credential store.
pub async fn run_sweep(
    store: &dyn CredentialStore,
    policy: &CleanupPolicy,
) -> StoreResult<PurgeReport> {
    let now = Utc::now();
    let revoked_before = chrono::Duration::from_std(policy.revoked_retention)
        .ok()
        .and_then(|retention| now.checked_sub_signed(retention))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    store.purge_expired(now, revoked_before).await
}

/// Starts the periodic sweep. The first tick fires immediately; failures are
/// logged and retried on the next tick.
pub fn spawn_cleanup(
    store: Arc<dyn CredentialStore>,
    policy: CleanupPolicy,
    metrics: Option<Arc<AuthMetrics>>,
) -> JoinHandle<()> {
    info!(
        interval_secs = policy.interval.as_secs(),
        revoked_retention_secs = policy.revoked_retention.as_secs(),
        "starting credential cleanup"
    );

    tokio::spawn(async move {
        let mut ticker = interval(policy.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match run_sweep(store.as_ref(), &policy).await {
                Ok(report) => {
                    if let Some(metrics) = &metrics {
                        metrics.cleanup_sweep("success");
                        metrics.purged("auth_token_blacklist", report.blacklist_removed);
                        metrics.purged("auth_refresh_tokens", report.refresh_tokens_removed);
                    }
                    if report.total() > 0 {
                        info!(
                            blacklist_removed = report.blacklist_removed,
                            refresh_tokens_removed = report.refresh_tokens_removed,
                            "credential cleanup sweep"
                        );
                    } else {
                        debug!("credential cleanup sweep found nothing to purge");
                    }
                }
                Err(err) => {
                    if let Some(metrics) = &metrics {
                        metrics.cleanup_sweep("failure");
                    }
                    warn!(error = %err, "credential cleanup sweep failed");
                }
            }
        }
    })
}
