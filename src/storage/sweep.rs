//! Background retention sweeps: once at startup, then on a fixed interval and
//! whenever the retention setting changes.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::cache::{CacheStore, SweepReport};
use crate::cancel::TaskHandle;
use crate::core::models::APP_SETTINGS_KEY;
use crate::core::settings::{AppSettings, RetentionPolicy};
use crate::errors::PanelError;

pub struct RetentionSweeper {
    cache: Arc<CacheStore>,
    every: Duration,
}

impl RetentionSweeper {
    #[must_use]
    pub fn new(cache: Arc<CacheStore>, every: Duration) -> Self {
        Self {
            cache,
            every: every.max(Duration::from_secs(1)),
        }
    }

    /// One sweep under the currently stored retention setting.
    ///
    /// # Errors
    ///
    /// Returns an error if the store rejects a write.
    pub fn sweep_now(&self) -> Result<SweepReport, PanelError> {
        let policy = self.cache.load_settings().retention_policy();
        self.cache.sweep_with_policy(policy, Utc::now())
    }

    fn sweep_logged(&self, reason: &str) {
        match self.sweep_now() {
            Ok(report) => debug!(reason, removed_summaries = report.summaries, "Retention sweep done"),
            Err(e) => warn!(reason, "Retention sweep failed: {e}"),
        }
    }

    /// Spawns the sweep loop. The first interval tick fires immediately, which
    /// is the startup sweep.
    #[must_use]
    pub fn spawn(self) -> TaskHandle {
        let cancel = CancellationToken::new();
        let loop_token = cancel.clone();
        let mut changes = self.cache.subscribe();

        let task = tokio::spawn(async move {
            let mut ticker = interval(self.every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut watching_settings = true;

            loop {
                tokio::select! {
                    () = loop_token.cancelled() => break,
                    _ = ticker.tick() => self.sweep_logged("scheduled"),
                    change = changes.recv(), if watching_settings => match change {
                        Ok(change) if change.key == APP_SETTINGS_KEY => {
                            let before = retention_of(change.old_value.as_ref());
                            let after = retention_of(change.new_value.as_ref());
                            if before != after {
                                info!(
                                    old_days = before.retention_days,
                                    new_days = after.retention_days,
                                    "Retention setting changed"
                                );
                                self.sweep_logged("retention changed");
                            }
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            // Missed changes may include a retention edit.
                            warn!(skipped, "Storage change feed lagged");
                            self.sweep_logged("change feed lagged");
                        }
                        Err(RecvError::Closed) => watching_settings = false,
                    },
                }
            }
            debug!("Retention sweeper stopped");
        });

        TaskHandle::new(cancel, task)
    }
}

fn retention_of(value: Option<&Value>) -> RetentionPolicy {
    value
        .and_then(|v| serde_json::from_value::<AppSettings>(v.clone()).ok())
        .unwrap_or_default()
        .retention_policy()
}
