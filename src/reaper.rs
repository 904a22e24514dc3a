use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::session::SessionRegistry;

/// What one sweep did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Active sessions killed for being idle past the session timeout.
    pub idle_closed: Vec<String>,
    /// Sessions dropped from the registry.
    pub removed: Vec<String>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.idle_closed.is_empty() && self.removed.is_empty()
    }
}

/// Periodic eviction of idle and closed sessions.
///
/// An idle session is killed and removed in the same sweep. A closed session
/// is removed once its grace delay has passed, so a final read can still see
/// its output. Kill failures are swallowed: the process being gone already is
/// the common case.
pub struct Reaper {
    registry: SessionRegistry,
    session_timeout: Duration,
    grace: Duration,
}

impl Reaper {
    pub fn new(registry: SessionRegistry, session_timeout: Duration, grace: Duration) -> Self {
        Self {
            registry,
            session_timeout,
            grace,
        }
    }

    pub fn from_config(registry: SessionRegistry, config: &EngineConfig) -> Self {
        Self::new(registry, config.session_timeout(), config.close_grace())
    }

    /// Run a sweep every `period` until `shutdown` is cancelled.
    pub fn spawn(self, period: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately; nothing can be stale yet.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = self.sweep();
                        if !report.is_empty() {
                            tracing::info!(
                                idle_closed = report.idle_closed.len(),
                                removed = report.removed.len(),
                                "reaper sweep"
                            );
                        }
                    }
                }
            }
            tracing::debug!("reaper stopped");
        })
    }

    pub fn sweep(&self) -> SweepReport {
        self.sweep_at(Utc::now())
    }

    /// Sweep as if the current time were `now`.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        for session in self.registry.sessions() {
            if session.is_active() {
                if !elapsed_beyond(session.last_activity(), now, self.session_timeout) {
                    continue;
                }
                tracing::info!(session = %session.id, "reaping idle session");
                session.force_close();
                report.idle_closed.push(session.id.clone());
            } else {
                let expired = session
                    .closed_at()
                    .map_or(true, |closed_at| !elapsed_within(closed_at, now, self.grace));
                if !expired {
                    continue;
                }
            }
            if self.registry.remove(&session.id).is_some() {
                report.removed.push(session.id.clone());
            }
        }
        report
    }
}

/// `now - since > limit`. A timestamp in the future is never beyond.
fn elapsed_beyond(since: DateTime<Utc>, now: DateTime<Utc>, limit: Duration) -> bool {
    (now - since).to_std().is_ok_and(|elapsed| elapsed > limit)
}

/// `now - since < limit`, treating future timestamps as within.
fn elapsed_within(since: DateTime<Utc>, now: DateTime<Utc>, limit: Duration) -> bool {
    (now - since).to_std().map_or(true, |elapsed| elapsed < limit)
}
