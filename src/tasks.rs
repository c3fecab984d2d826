// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Haven Health Labs

//! # Background Maintenance
//!
//! Each sweep runs on its own interval as an independent task, cancellable
//! through a shared `CancellationToken`. Sweeps never hold a hot-path lock
//! across a whole pass; the services they call take short-lived locks per
//! item.
//!
//! | Task | Interval |
//! |------|----------|
//! | Session-expiry sweep | 60 s |
//! | Token-rotation push | 10 min (shortest tier's rotation window) |
//! | Audit buffer flush | 5 s |
//! | Token-revocation pruning | hourly |
//! | Rate-limiter cleanup | hourly |
//! | Key-rotation check | daily |
//! | Audit retention purge | daily |

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::state::AppState;

const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const TOKEN_PUSH_INTERVAL: Duration = Duration::from_secs(10 * 60);
const AUDIT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);
const REVOCATION_PRUNE_INTERVAL: Duration = Duration::from_secs(60 * 60);
const LIMITER_CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);
const KEY_ROTATION_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
const RETENTION_PURGE_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Background maintenance runner for the security core.
pub struct Maintenance {
    state: AppState,
}

impl Maintenance {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Spawn every maintenance loop. Each task exits when the token is
    /// cancelled.
    pub fn spawn_all(self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let state = self.state;
        info!("Starting background maintenance tasks");

        vec![
            spawn_loop("session-sweep", SESSION_SWEEP_INTERVAL, shutdown.clone(), {
                let state = state.clone();
                move || {
                    let swept = state.sessions.sweep_expired();
                    if swept > 0 {
                        info!(count = swept, "Session sweep terminated expired sessions");
                    }
                }
            }),
            spawn_loop("token-push", TOKEN_PUSH_INTERVAL, shutdown.clone(), {
                let state = state.clone();
                move || {
                    match state
                        .sessions
                        .push_token_rotation(chrono::Duration::minutes(10))
                    {
                        Ok(rotated) if rotated > 0 => {
                            info!(count = rotated, "Pushed token rotation")
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "Token-rotation push failed"),
                    }
                }
            }),
            spawn_loop("audit-flush", AUDIT_FLUSH_INTERVAL, shutdown.clone(), {
                let state = state.clone();
                move || {
                    if let Err(e) = state.audit.flush() {
                        warn!(error = %e, "Audit buffer flush failed");
                    }
                }
            }),
            spawn_loop(
                "revocation-prune",
                REVOCATION_PRUNE_INTERVAL,
                shutdown.clone(),
                {
                    let state = state.clone();
                    move || match state.sessions.prune_revoked_tokens() {
                        Ok(pruned) if pruned > 0 => {
                            info!(count = pruned, "Pruned token revocations")
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "Revocation pruning failed"),
                    }
                },
            ),
            spawn_loop(
                "limiter-cleanup",
                LIMITER_CLEANUP_INTERVAL,
                shutdown.clone(),
                {
                    let state = state.clone();
                    move || match state.limiter.cleanup() {
                        Ok(stats) => debug!(
                            windows = stats.windows_dropped,
                            blocks = stats.blocks_cleared,
                            reputation = stats.reputation_dropped,
                            "Rate-limiter cleanup complete"
                        ),
                        Err(e) => warn!(error = %e, "Rate-limiter cleanup failed"),
                    }
                },
            ),
            spawn_loop("key-rotation", KEY_ROTATION_INTERVAL, shutdown.clone(), {
                let state = state.clone();
                move || {
                    match state.fields.rotate_keys(false) {
                        Ok(events) if !events.is_empty() => {
                            info!(count = events.len(), "Rotated keys past their interval")
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "Key-rotation check failed"),
                    }
                    if let Err(e) = state.registry.purge_expired() {
                        warn!(error = %e, "Expired key purge failed");
                    }
                }
            }),
            spawn_loop(
                "retention-purge",
                RETENTION_PURGE_INTERVAL,
                shutdown,
                {
                    let state = state.clone();
                    move || match state.audit.purge_expired() {
                        Ok(purged) if purged > 0 => {
                            info!(count = purged, "Purged audit entries past retention")
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "Audit retention purge failed"),
                    }
                },
            ),
        ]
    }
}

/// Run `work` every `interval` until the token is cancelled.
fn spawn_loop(
    name: &'static str,
    interval: Duration,
    shutdown: CancellationToken,
    work: impl Fn() + Send + 'static,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {},
                _ = shutdown.cancelled() => {
                    debug!(task = name, "Maintenance task shutting down");
                    return;
                }
            }
            work();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::MasterSecret;
    use tempfile::TempDir;

    #[tokio::test]
    async fn tasks_shut_down_on_cancellation() {
        let temp = TempDir::new().unwrap();
        let state =
            crate::state::AppState::bootstrap(temp.path(), MasterSecret::new([23u8; 32])).unwrap();

        let shutdown = CancellationToken::new();
        let handles = Maintenance::new(state).spawn_all(shutdown.clone());
        assert_eq!(handles.len(), 7);

        shutdown.cancel();
        for handle in handles {
            handle.await.expect("maintenance task panicked");
        }
    }
}
