//! Scheduled acquisition of the OUI reference file.
//!
//! A [`RefreshScheduler`] keeps one destination file fresh. On startup it
//! decides whether a scheduled refresh was missed while the process was not
//! running (the file's mtime is the only freshness record), then downloads the
//! source on every cron trigger. Each outcome is broadcast as a
//! [`RefreshEvent`].

pub mod cron;
pub mod fetch;
pub mod store;

use std::fmt;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, TimeZone, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub use cron::{CronError, CronSchedule};
pub use fetch::HttpFetcher;

/// Where in the refresh sequence a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Init,
    Download,
    Write,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Init => "init",
            Stage::Download => "download",
            Stage::Write => "write",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised while checking or refreshing the destination file.
///
/// Sources are reference counted so the error can travel inside a
/// broadcast [`RefreshEvent`] as well as back to the caller.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RefreshError {
    #[error("failed to inspect {}: {source}", .path.display())]
    Init {
        path: PathBuf,
        #[source]
        source: Arc<io::Error>,
    },
    #[error("GET {url} returned HTTP {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },
    #[error("GET {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: Arc<reqwest::Error>,
    },
    #[error("failed to write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: Arc<io::Error>,
    },
}

impl RefreshError {
    pub fn stage(&self) -> Stage {
        match self {
            RefreshError::Init { .. } => Stage::Init,
            RefreshError::Status { .. } | RefreshError::Transport { .. } => Stage::Download,
            RefreshError::Write { .. } => Stage::Write,
        }
    }
}

/// Lifecycle notification emitted after every refresh attempt.
#[derive(Debug, Clone)]
pub enum RefreshEvent {
    Updated {
        path: PathBuf,
        url: String,
        at: DateTime<Utc>,
    },
    Failed {
        error: RefreshError,
        stage: Stage,
        url: String,
    },
}

/// Fixed parameters of a scheduler.
#[derive(Debug, Clone)]
pub struct RefreshSettings {
    pub destination: PathBuf,
    pub source_url: String,
    pub schedule: CronSchedule,
    /// Return init-time failures from [`RefreshScheduler::initialize`]
    /// instead of only broadcasting them.
    pub propagate_init_errors: bool,
    pub timeout: Duration,
}

/// Keeps the destination file in sync with the remote source.
pub struct RefreshScheduler {
    destination: PathBuf,
    source_url: String,
    schedule: CronSchedule,
    propagate_init_errors: bool,
    fetcher: HttpFetcher,
    events: broadcast::Sender<RefreshEvent>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl RefreshScheduler {
    /// Create a scheduler. Nothing is fetched and no timer runs until
    /// [`initialize`](Self::initialize) is called.
    pub fn new(settings: RefreshSettings) -> Result<Arc<Self>, reqwest::Error> {
        let fetcher = HttpFetcher::new(settings.timeout)?;
        let (events, _) = broadcast::channel(16);
        Ok(Arc::new(Self {
            destination: settings.destination,
            source_url: settings.source_url,
            schedule: settings.schedule,
            propagate_init_errors: settings.propagate_init_errors,
            fetcher,
            events,
            timer: Mutex::new(None),
        }))
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    pub fn schedule(&self) -> &CronSchedule {
        &self.schedule
    }

    /// Subscribe to refresh outcomes.
    pub fn subscribe(&self) -> broadcast::Receiver<RefreshEvent> {
        self.events.subscribe()
    }

    /// Refresh the file if it is missing or stale, then arm the timer.
    ///
    /// With `propagate_init_errors` set, any failure is returned and the timer
    /// is left unarmed. Otherwise failures are only broadcast: a failed
    /// staleness check counts as stale, and the timer is armed regardless.
    pub async fn initialize(self: &Arc<Self>) -> Result<(), RefreshError> {
        let stale = match self.is_stale_at(Local::now()) {
            Ok(stale) => stale,
            Err(e) if self.propagate_init_errors => return Err(e),
            Err(e) => {
                warn!(path = %self.destination.display(), error = %e, "Staleness check failed, refreshing anyway");
                self.notify_failure(e);
                true
            }
        };

        if stale {
            info!(path = %self.destination.display(), "Reference file missing or stale, refreshing");
            if let Err(e) = self.refresh_now().await {
                if self.propagate_init_errors {
                    return Err(e);
                }
            }
        } else {
            debug!(path = %self.destination.display(), "Reference file is up to date");
        }

        self.arm_timer().await;
        Ok(())
    }

    /// Whether the destination is missing or older than the most recent
    /// scheduled trigger at or before `now`.
    pub fn is_stale_at(&self, now: DateTime<Local>) -> Result<bool, RefreshError> {
        let modified =
            store::modified_time(&self.destination).map_err(|source| RefreshError::Init {
                path: self.destination.clone(),
                source: Arc::new(source),
            })?;

        let Some(modified) = modified else {
            return Ok(true);
        };

        Ok(match self.schedule.prev_at_or_before(&now) {
            Some(last_trigger) => modified < last_trigger,
            None => false,
        })
    }

    /// Download the source and atomically replace the destination.
    ///
    /// The outcome is broadcast and also returned.
    pub async fn refresh_now(&self) -> Result<(), RefreshError> {
        match self.download_and_replace().await {
            Ok(bytes) => {
                let at = Utc::now();
                info!(
                    path = %self.destination.display(),
                    url = %self.source_url,
                    bytes,
                    "Reference file updated"
                );
                // No subscribers is fine.
                let _ = self.events.send(RefreshEvent::Updated {
                    path: self.destination.clone(),
                    url: self.source_url.clone(),
                    at,
                });
                Ok(())
            }
            Err(e) => {
                error!(
                    stage = %e.stage(),
                    url = %self.source_url,
                    error = %e,
                    "Reference refresh failed"
                );
                self.notify_failure(e.clone());
                Err(e)
            }
        }
    }

    async fn download_and_replace(&self) -> Result<usize, RefreshError> {
        let payload = self.fetcher.fetch(&self.source_url).await?;
        let bytes = payload.len();

        let write_error = |source: io::Error| RefreshError::Write {
            path: self.destination.clone(),
            source: Arc::new(source),
        };

        let dest = self.destination.clone();
        tokio::task::spawn_blocking(move || {
            store::write_atomic(&dest, |file| file.write_all(&payload))
        })
        .await
        .map_err(|e| write_error(io::Error::new(io::ErrorKind::Other, e)))?
        .map_err(write_error)?;

        Ok(bytes)
    }

    fn notify_failure(&self, error: RefreshError) {
        let _ = self.events.send(RefreshEvent::Failed {
            stage: error.stage(),
            url: self.source_url.clone(),
            error,
        });
    }

    /// Start the recurring timer, cancelling any previously armed one.
    ///
    /// The timer task only holds a weak reference, so dropping the last
    /// `Arc` to the scheduler stops it.
    pub async fn arm_timer(self: &Arc<Self>) {
        let schedule = self.schedule.clone();
        self.spawn_timer(move || {
            let delay = until_next(&schedule, &Local::now());
            if delay.is_none() {
                warn!(schedule = %schedule, "Refresh schedule never fires again, timer stopped");
            }
            delay
        })
        .await;
    }

    /// Refresh after each delay returned by `next_delay` until it returns
    /// `None` or the scheduler is dropped.
    async fn spawn_timer<F>(self: &Arc<Self>, mut next_delay: F)
    where
        F: FnMut() -> Option<Duration> + Send + 'static,
    {
        let scheduler = Arc::downgrade(self);

        let task = tokio::spawn(async move {
            while let Some(delay) = next_delay() {
                debug!(?delay, "Next reference refresh scheduled");
                tokio::time::sleep(delay).await;

                let Some(scheduler) = scheduler.upgrade() else {
                    return;
                };
                // Failures were already logged and broadcast.
                let _ = scheduler.refresh_now().await;
            }
        });

        if let Some(previous) = self.timer.lock().await.replace(task) {
            previous.abort();
        }
    }

    /// Whether a timer is armed and still running.
    pub async fn is_armed(&self) -> bool {
        self.timer
            .lock()
            .await
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Cancel the recurring timer. An in-flight refresh is not interrupted
    /// once it has started writing.
    pub async fn shutdown(&self) {
        if let Some(task) = self.timer.lock().await.take() {
            task.abort();
        }
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        if let Some(task) = self.timer.get_mut().take() {
            task.abort();
        }
    }
}

/// Time from `now` until `schedule` next fires.
fn until_next<Tz: TimeZone>(schedule: &CronSchedule, now: &DateTime<Tz>) -> Option<Duration> {
    let next = schedule.next_after(now)?;
    Some(
        next.signed_duration_since(now.clone())
            .to_std()
            .unwrap_or_default(),
    )
}
