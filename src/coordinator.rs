use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::client::{VestaClient, DEFAULT_EVENT_LOG_LIMIT};
use crate::diff::diff_snapshots;
use crate::types::*;
use crate::{Error, ErrorKind};

pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(5);

type EventCallback = Box<dyn Fn(&Event) + Send + Sync>;
type SnapshotCallback = Box<dyn Fn(&VestaData) + Send + Sync>;

/// The single "update failed" signal handed to dependents. The original
/// error is kept for diagnostics.
#[derive(Debug, Clone)]
pub struct UpdateFailed {
    cause: Arc<Error>,
}

impl UpdateFailed {
    pub fn kind(&self) -> ErrorKind {
        self.cause.kind()
    }

    pub fn cause(&self) -> &Error {
        &self.cause
    }
}

impl fmt::Display for UpdateFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "update failed: {}", self.cause)
    }
}

impl std::error::Error for UpdateFailed {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&*self.cause)
    }
}

/// Health of the polling loop, published separately from the data.
#[derive(Debug, Clone)]
pub enum UpdateStatus {
    /// No refresh has completed yet.
    Pending,
    Healthy,
    /// The last refresh failed; any earlier snapshot is still readable.
    Failing(UpdateFailed),
}

impl UpdateStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, UpdateStatus::Healthy)
    }
}

/// Why initial setup did not complete. The two cases call for different
/// recovery: new credentials versus trying again later.
#[derive(Debug)]
pub enum SetupError {
    AuthFailed(Arc<Error>),
    NotReady(Arc<Error>),
}

impl SetupError {
    fn from_cause(cause: Arc<Error>) -> Self {
        if cause.kind() == ErrorKind::Authentication {
            SetupError::AuthFailed(cause)
        } else {
            SetupError::NotReady(cause)
        }
    }

    pub fn cause(&self) -> &Error {
        match self {
            SetupError::AuthFailed(e) | SetupError::NotReady(e) => e,
        }
    }
}

impl fmt::Display for SetupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SetupError::AuthFailed(e) => write!(f, "panel rejected credentials: {e}"),
            SetupError::NotReady(e) => write!(f, "panel not ready: {e}"),
        }
    }
}

impl std::error::Error for SetupError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.cause())
    }
}

pub struct CoordinatorBuilder {
    client: VestaClient,
    update_interval: Duration,
    event_log_limit: usize,
    event_log_every: u32,
    trigger_rules: TriggerRules,
    event_callbacks: Vec<EventCallback>,
    snapshot_callbacks: Vec<SnapshotCallback>,
}

impl CoordinatorBuilder {
    pub fn new(client: VestaClient) -> Self {
        Self {
            client,
            update_interval: DEFAULT_UPDATE_INTERVAL,
            event_log_limit: DEFAULT_EVENT_LOG_LIMIT,
            event_log_every: 1,
            trigger_rules: TriggerRules::default(),
            event_callbacks: Vec::new(),
            snapshot_callbacks: Vec::new(),
        }
    }

    /// Scheduled refresh period. Zero disables the background loop.
    pub fn update_interval(mut self, interval: Duration) -> Self {
        self.update_interval = interval;
        self
    }

    pub fn event_log_limit(mut self, limit: usize) -> Self {
        self.event_log_limit = limit;
        self
    }

    /// Fetch the event log on every `n`th refresh. Zero never fetches it.
    pub fn event_log_every(mut self, n: u32) -> Self {
        self.event_log_every = n;
        self
    }

    pub fn trigger_rules(mut self, rules: TriggerRules) -> Self {
        self.trigger_rules = rules;
        self
    }

    pub fn on_event(mut self, f: impl Fn(&Event) + Send + Sync + 'static) -> Self {
        self.event_callbacks.push(Box::new(f));
        self
    }

    pub fn on_snapshot(mut self, f: impl Fn(&VestaData) + Send + Sync + 'static) -> Self {
        self.snapshot_callbacks.push(Box::new(f));
        self
    }

    /// Coordinator without any I/O. Call [`Coordinator::refresh`] and
    /// [`Coordinator::start`] yourself.
    pub fn build(self) -> Coordinator {
        let (data, _) = watch::channel(None);
        let (status, _) = watch::channel(UpdateStatus::Pending);
        Coordinator {
            inner: Arc::new(Inner {
                client: self.client,
                update_interval: self.update_interval,
                event_log_limit: self.event_log_limit,
                event_log_every: self.event_log_every,
                trigger_rules: self.trigger_rules,
                event_callbacks: self.event_callbacks,
                snapshot_callbacks: self.snapshot_callbacks,
                data,
                status,
                refresh_lock: Mutex::new(()),
                cycles: AtomicU64::new(0),
                cancel: CancellationToken::new(),
                task: Mutex::new(None),
            }),
        }
    }

    /// Authenticate, perform the first refresh, then start scheduled polling.
    /// On failure the client session is closed.
    pub async fn setup(self) -> Result<Coordinator, SetupError> {
        let coordinator = self.build();
        let client = coordinator.client();
        debug!(host = %client.host(), "setting up coordinator");

        if let Err(e) = client.authenticate().await {
            client.close().await;
            return Err(SetupError::from_cause(Arc::new(e)));
        }
        if let Err(failed) = coordinator.refresh().await {
            client.close().await;
            return Err(SetupError::from_cause(failed.cause));
        }

        coordinator.start().await;
        info!(host = %client.host(), "coordinator ready");
        Ok(coordinator)
    }
}

/// Single polling owner for one panel.
///
/// Cheaply cloneable. Holds the last good [`VestaData`] and publishes it
/// through a watch channel; failures are published on a separate channel so
/// stale data and a failing poll stay distinguishable.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

struct Inner {
    client: VestaClient,
    update_interval: Duration,
    event_log_limit: usize,
    event_log_every: u32,
    trigger_rules: TriggerRules,
    event_callbacks: Vec<EventCallback>,
    snapshot_callbacks: Vec<SnapshotCallback>,
    data: watch::Sender<Option<Arc<VestaData>>>,
    status: watch::Sender<UpdateStatus>,
    refresh_lock: Mutex<()>,
    cycles: AtomicU64,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Coordinator {
    pub fn builder(client: VestaClient) -> CoordinatorBuilder {
        CoordinatorBuilder::new(client)
    }

    pub fn client(&self) -> &VestaClient {
        &self.inner.client
    }

    pub fn trigger_rules(&self) -> &TriggerRules {
        &self.inner.trigger_rules
    }

    /// Last good snapshot, if any refresh has ever succeeded.
    pub fn data(&self) -> Option<Arc<VestaData>> {
        self.inner.data.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<VestaData>>> {
        self.inner.data.subscribe()
    }

    pub fn status(&self) -> UpdateStatus {
        self.inner.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<UpdateStatus> {
        self.inner.status.subscribe()
    }

    pub fn last_update_success(&self) -> bool {
        self.inner.status.borrow().is_healthy()
    }

    /// Derived on every call from the current snapshot.
    pub fn alarm_state(&self) -> Option<AlarmState> {
        self.data()
            .map(|data| data.alarm_state(&self.inner.trigger_rules))
    }

    pub fn is_triggered(&self) -> bool {
        self.data()
            .is_some_and(|data| data.is_triggered(&self.inner.trigger_rules))
    }

    /// Run one refresh cycle, waiting for any cycle already in flight.
    pub async fn refresh(&self) -> Result<Arc<VestaData>, UpdateFailed> {
        let _guard = self.inner.refresh_lock.lock().await;
        self.refresh_locked().await
    }

    /// Send a mode change; on success force a refresh so dependents see the
    /// new mode without waiting for the next tick.
    pub async fn set_alarm_mode(&self, mode: ArmMode, area: u32) -> bool {
        match self.inner.client.set_alarm_mode(mode, area).await {
            Ok(true) => {
                // failure is already published on the status channel
                let _ = self.refresh().await;
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!(error = %e, mode = mode.as_key(), area, "failed to set alarm mode");
                false
            }
        }
    }

    /// Spawn the scheduled refresh loop. No-op if already running or the
    /// interval is zero.
    pub async fn start(&self) {
        if self.inner.update_interval.is_zero() {
            debug!("update interval is zero, scheduled refresh disabled");
            return;
        }
        let mut task = self.inner.task.lock().await;
        if task.is_some() || self.inner.cancel.is_cancelled() {
            return;
        }
        let coordinator = self.clone();
        let cancel = self.inner.cancel.clone();
        *task = Some(tokio::spawn(refresh_task(coordinator, cancel)));
        debug!(
            interval_ms = self.inner.update_interval.as_millis() as u64,
            "scheduled refresh started"
        );
    }

    /// Stop polling and close the client session.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.client.close().await;
        if let Some(handle) = self.inner.task.lock().await.take() {
            let _ = handle.await;
        }
        self.inner.client.close().await;
        debug!(host = %self.inner.client.host(), "coordinator shut down");
    }

    async fn scheduled_refresh(&self) {
        let Ok(_guard) = self.inner.refresh_lock.try_lock() else {
            trace!("refresh already in flight, skipping tick");
            return;
        };
        let _ = self.refresh_locked().await;
    }

    async fn refresh_locked(&self) -> Result<Arc<VestaData>, UpdateFailed> {
        let inner = &self.inner;
        let cycle = inner.cycles.fetch_add(1, Ordering::Relaxed);
        let previous = inner.data.borrow().clone();
        let carried_log = || {
            previous
                .as_ref()
                .map(|p| p.event_log.clone())
                .unwrap_or_default()
        };

        let fetch_log =
            inner.event_log_every > 0 && cycle % u64::from(inner.event_log_every) == 0;
        let result = if fetch_log {
            let (data, log) = tokio::join!(
                inner.client.get_all_data(),
                inner.client.get_event_log(inner.event_log_limit)
            );
            data.map(|mut data| {
                data.event_log = match log {
                    Ok(entries) => entries,
                    Err(e) => {
                        warn!(error = %e, "event log fetch failed, keeping previous log");
                        carried_log()
                    }
                };
                data
            })
        } else {
            inner.client.get_all_data().await.map(|mut data| {
                data.event_log = carried_log();
                data
            })
        };

        match result {
            Ok(data) => {
                let data = Arc::new(data);
                let events = diff_snapshots(previous.as_deref(), &data, &inner.trigger_rules);
                let mode_is_new = previous
                    .as_ref()
                    .is_none_or(|p| p.panel.mode != data.panel.mode);
                if mode_is_new && data.panel.alarm_state() == AlarmState::Unknown {
                    warn!(mode = %data.panel.mode, "unknown alarm mode");
                }
                inner.data.send_replace(Some(Arc::clone(&data)));
                inner.status.send_replace(UpdateStatus::Healthy);
                debug!(
                    mode = %data.panel.mode,
                    devices = data.devices.len(),
                    events = data.event_log.len(),
                    "updated data"
                );

                for event in &events {
                    for cb in &inner.event_callbacks {
                        cb(event);
                    }
                }
                for cb in &inner.snapshot_callbacks {
                    cb(&data);
                }
                Ok(data)
            }
            Err(Error::Closed) if inner.cancel.is_cancelled() => {
                debug!("refresh interrupted by shutdown");
                Err(UpdateFailed {
                    cause: Arc::new(Error::Closed),
                })
            }
            Err(e) => {
                match e.kind() {
                    ErrorKind::Authentication => {
                        error!(error = %e, "authentication failed during update")
                    }
                    ErrorKind::Connection => warn!(error = %e, "connection error during update"),
                    ErrorKind::Api => error!(error = %e, "API error during update"),
                }
                let failed = UpdateFailed { cause: Arc::new(e) };
                inner.status.send_replace(UpdateStatus::Failing(failed.clone()));
                Err(failed)
            }
        }
    }
}

async fn refresh_task(coordinator: Coordinator, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(coordinator.inner.update_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval.tick().await; // consume the immediate first tick

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = interval.tick() => coordinator.scheduled_refresh().await,
        }
    }
}
