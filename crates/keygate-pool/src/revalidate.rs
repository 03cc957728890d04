use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::group::Group;
use crate::pool::CredentialPool;

/// Probe used by cron revalidation. Implemented by the channel adapters; a
/// `2xx` from the validation endpoint means the key works again.
#[async_trait]
pub trait KeyValidator: Send + Sync {
    async fn validate(&self, key: &str, group: &Group) -> Result<(), String>;
}

#[derive(Debug, Clone)]
pub struct RevalidationConfig {
    pub interval: Duration,
    /// Probes issued per batch before pausing.
    pub batch_size: usize,
    /// Pause between batches so a large pool does not burst the endpoint.
    pub batch_delay: Duration,
}

impl Default for RevalidationConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1800),
            batch_size: 10,
            batch_delay: Duration::from_millis(500),
        }
    }
}

/// Background task that walks non-active credentials in staggered batches and
/// restores the ones whose keys validate again.
pub fn spawn_revalidation_task(
    pool: Arc<CredentialPool>,
    validator: Arc<dyn KeyValidator>,
    config: RevalidationConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The immediate first tick would probe keys imported seconds ago.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            run_revalidation_pass(&pool, validator.as_ref(), &config).await;
        }
    })
}

pub async fn run_revalidation_pass(
    pool: &CredentialPool,
    validator: &dyn KeyValidator,
    config: &RevalidationConfig,
) {
    let candidates = pool.non_active().await;
    if candidates.is_empty() {
        return;
    }
    info!(candidates = candidates.len(), "revalidation pass started");

    let mut restored = 0usize;
    for (batch_no, batch) in candidates.chunks(config.batch_size.max(1)).enumerate() {
        if batch_no > 0 {
            tokio::time::sleep(config.batch_delay).await;
        }
        for (id, group_id, key) in batch {
            let Some(group) = pool.group(*group_id).await else {
                continue;
            };
            match validator.validate(key, &group).await {
                Ok(()) => {
                    pool.restore(*id).await;
                    restored += 1;
                    debug!(credential_id = id, group = %group.name, "credential revalidated");
                }
                Err(message) => {
                    debug!(credential_id = id, group = %group.name, %message, "revalidation failed");
                }
            }
        }
    }

    if restored > 0 {
        info!(restored, "revalidation pass restored credentials");
    } else {
        warn!("revalidation pass restored no credentials");
    }
}
