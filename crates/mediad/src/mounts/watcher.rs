//! Wakes the event loop when the system mount table may have changed.
//!
//! On Linux `/proc/self/mountinfo` signals `POLLPRI` whenever the mount
//! namespace changes. Where that cannot be registered the watcher falls back
//! to a fixed polling interval. Either way a wake only means "reconcile now";
//! the caller re-reads the table itself.

use std::fs::File;
use std::path::Path;
use std::time::Duration;

use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, warn};

/// Kernel mount table of the daemon's own namespace.
pub const MOUNTINFO_PATH: &str = "/proc/self/mountinfo";

/// Fallback period when priority polling is unavailable.
pub const FALLBACK_INTERVAL: Duration = Duration::from_secs(2);

enum Source {
    Priority(AsyncFd<File>),
    Interval(Interval),
}

pub struct MountTableWatcher {
    source: Source,
}

impl MountTableWatcher {
    /// Watches the live mount table. Must be called inside a Tokio runtime.
    pub fn open() -> Self {
        Self::watch_path(Path::new(MOUNTINFO_PATH))
    }

    /// Watches `path` for priority events, falling back to polling.
    pub fn watch_path(path: &Path) -> Self {
        let registered = File::open(path)
            .and_then(|file| AsyncFd::with_interest(file, Interest::PRIORITY));
        match registered {
            Ok(fd) => {
                debug!(path = %path.display(), "Watching mount table");
                Self {
                    source: Source::Priority(fd),
                }
            }
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "Cannot watch mount table, polling instead"
                );
                Self::polling(FALLBACK_INTERVAL)
            }
        }
    }

    /// Wakes every `period` regardless of changes.
    pub fn polling(period: Duration) -> Self {
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            source: Source::Interval(interval),
        }
    }

    pub fn is_polling(&self) -> bool {
        matches!(self.source, Source::Interval(_))
    }

    /// Resolves at the next possible change. Cancel-safe.
    pub async fn changed(&mut self) {
        let failed = match &mut self.source {
            Source::Priority(fd) => match fd.ready(Interest::PRIORITY).await {
                Ok(mut guard) => {
                    guard.clear_ready();
                    return;
                }
                Err(e) => e,
            },
            Source::Interval(interval) => {
                interval.tick().await;
                return;
            }
        };

        warn!(error = %failed, "Mount table watch failed, polling instead");
        *self = Self::polling(FALLBACK_INTERVAL);
    }
}
