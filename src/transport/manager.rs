//! Transport ranking, failover and the aggregate connection state
//!
//! Metrics arrive from two places: external reports (`update_metrics`) and
//! the manager's own handshakes and probes, which feed a rolling
//! [`MetricsWindow`]. The latest write wins.
//!
//! Every switch of the active transport happens under `switching`, an async
//! mutex, and only after the connector's handshake returned `Ok`.

use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TransportConfig;
use crate::error::{Error, Result, TransportError};
use crate::events::{EventChannel, TransportEvent};
use crate::retry::{create_scheduler, with_timeout, Scheduler, SchedulerOptions};
use crate::transport::metrics::{quality_for_latency, score, MetricsWindow, ProbeOutcome};
use crate::transport::{
    ConnectionQuality, ConnectionState, TransportConnector, TransportKind, TransportMetrics,
};

/// What prompted a failover attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverTrigger {
    /// Active transport's metrics dropped below the threshold
    Degraded,
    /// The active transport reported a hard error
    Error,
}

struct TransportEntry {
    window: MetricsWindow,
    metrics: TransportMetrics,
}

pub struct TransportManager {
    config: TransportConfig,
    connector: Arc<dyn TransportConnector>,
    table: Mutex<BTreeMap<TransportKind, TransportEntry>>,
    state: Mutex<ConnectionState>,
    switching: tokio::sync::Mutex<()>,
    events: EventChannel<TransportEvent>,
}

impl TransportManager {
    pub fn new(config: TransportConfig, connector: Arc<dyn TransportConnector>) -> Self {
        Self {
            config,
            connector,
            table: Mutex::new(BTreeMap::new()),
            state: Mutex::new(ConnectionState::default()),
            switching: tokio::sync::Mutex::new(()),
            events: EventChannel::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    pub fn get_connection_state(&self) -> ConnectionState {
        self.state.lock().clone()
    }

    pub fn metrics(&self, kind: TransportKind) -> Option<TransportMetrics> {
        self.table.lock().get(&kind).map(|entry| entry.metrics)
    }

    pub fn all_metrics(&self) -> BTreeMap<TransportKind, TransportMetrics> {
        self.table
            .lock()
            .iter()
            .map(|(kind, entry)| (*kind, entry.metrics))
            .collect()
    }

    /// Replace the metrics for `kind`
    pub fn update_metrics(&self, kind: TransportKind, metrics: TransportMetrics) {
        {
            let mut table = self.table.lock();
            let window = self.config.metrics_window;
            table
                .entry(kind)
                .or_insert_with(|| TransportEntry {
                    window: MetricsWindow::new(window),
                    metrics,
                })
                .metrics = metrics;
        }
        self.refresh_quality(kind, &metrics);
    }

    /// Fold one probe or handshake outcome into the rolling window
    pub fn record_outcome(&self, kind: TransportKind, outcome: ProbeOutcome) -> TransportMetrics {
        let metrics = {
            let mut table = self.table.lock();
            let window = self.config.metrics_window;
            let entry = table.entry(kind).or_insert_with(|| TransportEntry {
                window: MetricsWindow::new(window),
                metrics: TransportMetrics::unhealthy(),
            });
            entry.window.push(outcome);
            entry.metrics = entry.window.metrics(self.config.failover_success_rate);
            entry.metrics
        };
        self.refresh_quality(kind, &metrics);
        metrics
    }

    /// Healthy transports, best first. Equal scores fall back to preference order.
    pub fn ranked_transports(&self) -> Vec<(TransportKind, f64)> {
        let mut ranked: Vec<(TransportKind, f64)> = self
            .table
            .lock()
            .iter()
            .filter(|(_, entry)| entry.metrics.is_healthy)
            .map(|(kind, entry)| (*kind, score(&entry.metrics, &self.config)))
            .collect();

        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        ranked
    }

    fn needs_failover(&self, metrics: &TransportMetrics) -> bool {
        !metrics.is_healthy || metrics.success_rate < self.config.failover_success_rate
    }

    /// Replace metrics and fail over if the active transport fell below the threshold
    pub async fn report_metrics(
        &self,
        kind: TransportKind,
        metrics: TransportMetrics,
        token: &CancellationToken,
    ) -> Result<Option<TransportKind>> {
        self.update_metrics(kind, metrics);
        if self.is_active(kind) && self.needs_failover(&metrics) {
            return self.failover(kind, FailoverTrigger::Degraded, token).await;
        }
        Ok(self.get_connection_state().current_transport)
    }

    /// Hard error on `kind`. Fails over if it was the active transport.
    pub async fn report_error(
        &self,
        kind: TransportKind,
        reason: &str,
        token: &CancellationToken,
    ) -> Result<Option<TransportKind>> {
        warn!("Transport {} error: {}", kind, reason);
        self.record_outcome(kind, ProbeOutcome::Failure);
        if self.is_active(kind) {
            return self.failover(kind, FailoverTrigger::Error, token).await;
        }
        Ok(self.get_connection_state().current_transport)
    }

    fn is_active(&self, kind: TransportKind) -> bool {
        let state = self.state.lock();
        state.is_connected && state.current_transport == Some(kind)
    }

    /// Connect on the best transport. Untried transports are attempted after
    /// the healthy ones, in preference order.
    pub async fn connect(&self, token: &CancellationToken) -> Result<TransportKind> {
        let _switching = self.switching.lock().await;

        {
            let state = self.state.lock();
            if let (true, Some(current)) = (state.is_connected, state.current_transport) {
                return Ok(current);
            }
        }

        let mut candidates: Vec<TransportKind> =
            self.ranked_transports().into_iter().map(|(kind, _)| kind).collect();
        {
            let table = self.table.lock();
            let mut untried: Vec<TransportKind> = self
                .connector
                .available()
                .into_iter()
                .filter(|kind| !table.contains_key(kind))
                .collect();
            untried.sort();
            candidates.extend(untried);
        }

        for kind in candidates {
            match self.attempt(kind, token).await {
                Ok(_) => {
                    self.activate(kind, false);
                    info!("Connected over {}", kind);
                    return Ok(kind);
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => warn!("Handshake on {} failed: {}", kind, e),
            }
        }

        Err(TransportError::NoViableTransport.into())
    }

    /// Move off `from` to the next-ranked healthy transport.
    ///
    /// A trigger for a transport that is no longer active (another failover
    /// already moved on) is a no-op.
    pub async fn failover(
        &self,
        from: TransportKind,
        trigger: FailoverTrigger,
        token: &CancellationToken,
    ) -> Result<Option<TransportKind>> {
        let _switching = self.switching.lock().await;

        if !self.is_active(from) {
            let current = self.get_connection_state().current_transport;
            debug!("Failover from {} skipped, active transport is {:?}", from, current);
            return Ok(current);
        }

        let candidates: Vec<TransportKind> = self
            .ranked_transports()
            .into_iter()
            .map(|(kind, _)| kind)
            .filter(|kind| *kind != from)
            .collect();

        for kind in candidates {
            match self.attempt(kind, token).await {
                Ok(_) => {
                    self.activate(kind, true);
                    info!("Failed over {} -> {} ({:?})", from, kind, trigger);
                    return Ok(Some(kind));
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => warn!("Failover handshake on {} failed: {}", kind, e),
            }
        }

        match trigger {
            FailoverTrigger::Degraded => {
                warn!("No healthier transport than {}, staying on it", from);
                Ok(Some(from))
            }
            FailoverTrigger::Error => {
                warn!("No transport left after {} failed", from);
                self.mark_disconnected();
                Err(TransportError::NoViableTransport.into())
            }
        }
    }

    /// Drop the active transport; counters are kept.
    ///
    /// Waits for an in-flight connect or failover to settle, so a handshake
    /// that completes during the call cannot leave the state connected.
    pub async fn disconnect(&self) {
        let _switching = self.switching.lock().await;
        self.mark_disconnected();
    }

    /// Handshake on `kind` under the configured timeout and record the outcome
    async fn attempt(&self, kind: TransportKind, token: &CancellationToken) -> Result<Duration> {
        let connector = self.connector.clone();
        let result = with_timeout(
            move |child| async move { connector.handshake(kind, child).await },
            self.config.handshake_timeout(),
            format!("{} handshake", kind),
            token,
        )
        .await
        .and_then(|handshake| handshake.map_err(Error::from));

        match &result {
            Ok(latency) => {
                self.record_outcome(kind, ProbeOutcome::Success(*latency));
            }
            Err(e) if e.is_cancelled() => {}
            Err(_) => {
                self.record_outcome(kind, ProbeOutcome::Failure);
            }
        }
        result
    }

    fn activate(&self, kind: TransportKind, is_failover: bool) {
        let quality = self
            .metrics(kind)
            .map(|m| quality_for_latency(m.average_latency_ms, &self.config))
            .unwrap_or(ConnectionQuality::Unknown);

        let snapshot = {
            let mut state = self.state.lock();
            state.is_connected = true;
            state.current_transport = Some(kind);
            state.connection_quality = quality;
            state.total_connections += 1;
            if is_failover {
                state.failover_count += 1;
            }
            state.clone()
        };
        self.events.emit(TransportEvent::ConnectionStateChanged(snapshot));
    }

    fn mark_disconnected(&self) {
        let snapshot = {
            let mut state = self.state.lock();
            if !state.is_connected && state.current_transport.is_none() {
                return;
            }
            state.is_connected = false;
            state.current_transport = None;
            state.connection_quality = ConnectionQuality::Unknown;
            state.clone()
        };
        self.events.emit(TransportEvent::ConnectionStateChanged(snapshot));
    }

    fn refresh_quality(&self, kind: TransportKind, metrics: &TransportMetrics) {
        let snapshot = {
            let mut state = self.state.lock();
            if !state.is_connected || state.current_transport != Some(kind) {
                return;
            }
            let quality = quality_for_latency(metrics.average_latency_ms, &self.config);
            if quality == state.connection_quality {
                return;
            }
            state.connection_quality = quality;
            state.clone()
        };
        self.events.emit(TransportEvent::ConnectionStateChanged(snapshot));
    }

    /// Probe every transport the connector offers on `probe_interval_ms` and
    /// fail over when the active one degrades
    pub fn start_probing(self: &Arc<Self>, parent: &CancellationToken) -> Result<Scheduler> {
        let manager = Arc::clone(self);
        let token = parent.child_token();

        let scheduler = create_scheduler(
            "transport-probe",
            move || {
                let manager = manager.clone();
                let token = token.clone();
                async move {
                    manager.probe_all(&token).await;
                }
            },
            Duration::from_millis(self.config.probe_interval_ms),
            SchedulerOptions {
                immediate: true,
                max_iterations: None,
            },
        );
        scheduler.start_linked(parent)?;
        Ok(scheduler)
    }

    /// One probe round
    pub async fn probe_all(&self, token: &CancellationToken) {
        for kind in self.connector.available() {
            if token.is_cancelled() {
                return;
            }
            if let Err(e) = self.attempt(kind, token).await {
                debug!("Probe on {} failed: {}", kind, e);
            }
        }

        let current = self.get_connection_state().current_transport;
        if let Some(kind) = current {
            let degraded = self
                .metrics(kind)
                .map(|m| self.needs_failover(&m))
                .unwrap_or(false);
            if degraded {
                if let Err(e) = self.failover(kind, FailoverTrigger::Degraded, token).await {
                    debug!("Failover after probe failed: {}", e);
                }
            }
        }
    }
}
