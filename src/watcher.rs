//! Config-file watcher: polls the mtime and reports successful reloads.
//!
//! Emits only on change. An edit that fails to parse is logged and skipped so
//! a half-saved file never resets the voice settings.

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::service::Trigger;

pub struct ConfigWatcher {
    path: PathBuf,
    poll_interval: Duration,
    cancel_token: CancellationToken,
}

impl ConfigWatcher {
    pub fn new(path: PathBuf, poll_interval: Duration, cancel_token: CancellationToken) -> Self {
        Self {
            path,
            poll_interval,
            cancel_token,
        }
    }

    fn mtime(&self) -> Option<SystemTime> {
        std::fs::metadata(&self.path).and_then(|m| m.modified()).ok()
    }

    /// Poll until cancelled or the receiver goes away.
    pub async fn run(self, tx: mpsc::Sender<Trigger>) {
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_mtime = self.mtime();

        debug!("Watching {}", self.path.display());

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let current = self.mtime();
                    if current == last_mtime {
                        continue;
                    }
                    last_mtime = current;

                    match Config::load_file(&self.path) {
                        Ok(config) => {
                            info!("Config changed, reloaded {}", self.path.display());
                            if tx.send(Trigger::SettingsChanged(Box::new(config))).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("Ignoring config change: {e}"),
                    }
                }
                _ = self.cancel_token.cancelled() => {
                    debug!("Config watcher cancelled");
                    break;
                }
            }
        }
    }
}
