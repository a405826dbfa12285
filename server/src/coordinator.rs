//! Glue between the refresh scheduler and the OUI database.
//!
//! The coordinator rebuilds the database whenever the scheduler reports a
//! successful refresh, keeps a small record of refresh outcomes for the
//! status endpoint, and serves lookups from whatever index is current.

use std::sync::{Arc, PoisonError, RwLock, Weak};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::RefreshConfig;
use crate::oui::{IndexStats, OuiDatabase, OuiMatch};
use crate::refresh::{RefreshError, RefreshEvent, RefreshScheduler, Stage};

/// The most recent refresh failure.
#[derive(Debug, Clone, Serialize)]
pub struct FailureRecord {
    pub stage: Stage,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Outcome history kept in memory for the status endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RefreshStatus {
    pub last_updated: Option<DateTime<Utc>>,
    pub last_failure: Option<FailureRecord>,
    /// Last rebuild error, cleared by the next successful rebuild.
    pub index_error: Option<String>,
}

/// Everything the status endpoint reports.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub source_url: String,
    pub destination: String,
    pub schedule: String,
    pub index: IndexStats,
    pub refresh: RefreshStatus,
}

pub struct Coordinator {
    scheduler: Arc<RefreshScheduler>,
    database: Arc<OuiDatabase>,
    status: RwLock<RefreshStatus>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Coordinator {
    pub fn new(scheduler: Arc<RefreshScheduler>, database: Arc<OuiDatabase>) -> Arc<Self> {
        Arc::new(Self {
            scheduler,
            database,
            status: RwLock::new(RefreshStatus::default()),
            listener: Mutex::new(None),
        })
    }

    /// Build a scheduler and database for the same destination file.
    pub fn from_config(config: &RefreshConfig) -> anyhow::Result<Arc<Self>> {
        let settings = config.settings()?;
        let database = Arc::new(OuiDatabase::new(settings.destination.clone()));
        let scheduler = RefreshScheduler::new(settings)?;
        Ok(Self::new(scheduler, database))
    }

    pub fn scheduler(&self) -> &Arc<RefreshScheduler> {
        &self.scheduler
    }

    pub fn database(&self) -> &Arc<OuiDatabase> {
        &self.database
    }

    /// Initialize the scheduler, start listening for refreshes, and load the
    /// index once.
    ///
    /// Only returns an error if the scheduler is configured to propagate
    /// initialization failures. A missing or unreadable file just leaves the
    /// index empty until the next successful refresh.
    pub async fn start(self: &Arc<Self>) -> Result<(), RefreshError> {
        let mut events = self.scheduler.subscribe();
        let initialized = self.scheduler.initialize().await;

        // Record what happened during initialization; the rebuild below
        // covers any update it made.
        while let Ok(event) = events.try_recv() {
            self.record(&event);
        }
        initialized?;

        // Rebuild before the listener starts so rebuilds never overlap.
        // Updates arriving meanwhile stay buffered in `events`.
        if let Err(e) = self.rebuild().await {
            warn!(error = %e, "No OUI data loaded at startup, lookups will not match until the next refresh");
        }

        self.listen(events).await;
        Ok(())
    }

    async fn listen(self: &Arc<Self>, mut events: broadcast::Receiver<RefreshEvent>) {
        let coordinator: Weak<Self> = Arc::downgrade(self);

        let task = tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // An update may have been among the dropped events.
                        warn!(skipped, "Refresh listener lagged, rebuilding");
                        let Some(coordinator) = coordinator.upgrade() else {
                            return;
                        };
                        let _ = coordinator.rebuild().await;
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                };

                let Some(coordinator) = coordinator.upgrade() else {
                    return;
                };
                coordinator.record(&event);
                if matches!(event, RefreshEvent::Updated { .. }) {
                    let _ = coordinator.rebuild().await;
                }
            }
        });

        if let Some(previous) = self.listener.lock().await.replace(task) {
            previous.abort();
        }
    }

    fn record(&self, event: &RefreshEvent) {
        let mut status = self.status.write().unwrap_or_else(PoisonError::into_inner);
        match event {
            RefreshEvent::Updated { at, .. } => {
                status.last_updated = Some(*at);
            }
            RefreshEvent::Failed { error, stage, .. } => {
                status.last_failure = Some(FailureRecord {
                    stage: *stage,
                    message: error.to_string(),
                    at: Utc::now(),
                });
            }
        }
    }

    async fn rebuild(&self) -> Result<usize, crate::oui::IndexError> {
        let result = self.database.rebuild().await;
        let mut status = self.status.write().unwrap_or_else(PoisonError::into_inner);
        match &result {
            Ok(_) => status.index_error = None,
            Err(e) => {
                error!(path = %self.database.path().display(), error = %e, "OUI database rebuild failed, keeping previous index");
                status.index_error = Some(e.to_string());
            }
        }
        result
    }

    /// Download now. The listener rebuilds the index once the new file is in
    /// place.
    pub async fn refresh(&self) -> Result<(), RefreshError> {
        info!(url = %self.scheduler.source_url(), "Manual refresh requested");
        self.scheduler.refresh_now().await
    }

    pub fn lookup(&self, address: &str) -> Option<OuiMatch> {
        self.database.lookup(address)
    }

    pub fn status(&self) -> StatusReport {
        StatusReport {
            source_url: self.scheduler.source_url().to_string(),
            destination: self.scheduler.destination().display().to_string(),
            schedule: self.scheduler.schedule().to_string(),
            index: self.database.stats(),
            refresh: self
                .status
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        if let Some(task) = self.listener.get_mut().take() {
            task.abort();
        }
    }
}
