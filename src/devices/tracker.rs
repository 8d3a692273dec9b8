//! Device tracker
//!
//! Turns the bridge's enumeration snapshots into discrete
//! `deviceConnected` / `deviceDisconnected` events. The diff in
//! [`DeviceTracker::apply_snapshot`] is the single place device state changes,
//! whether snapshots come from polling or from an event-driven feed.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::config::DeviceTrackerConfig;
use crate::devices::bridge::{DebugBridge, DeviceListing, ForwardRule};
use crate::devices::{Device, DeviceState};
use crate::error::Result;
use crate::events::{DeviceEvent, EventChannel};
use crate::retry::{create_scheduler, Scheduler, SchedulerOptions};

/// Live session for a connected device. At most one exists per serial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionHandle {
    pub serial: String,
    pub opened_at: DateTime<Utc>,
    /// Scan cycle that opened the session
    pub scan: u64,
}

#[derive(Default)]
struct TrackerState {
    devices: HashMap<String, Device>,
    sessions: HashMap<String, SessionHandle>,
    /// Serials with a registered (or in-flight) forwarding rule
    forwarded: HashSet<String>,
    bridge_failing: bool,
    scans: u64,
}

/// Tracks debug-bridge devices and their forwarding rules
pub struct DeviceTracker {
    bridge: Arc<dyn DebugBridge>,
    config: DeviceTrackerConfig,
    state: Mutex<TrackerState>,
    events: EventChannel<DeviceEvent>,
}

impl DeviceTracker {
    pub fn new(bridge: Arc<dyn DebugBridge>, config: DeviceTrackerConfig) -> Self {
        Self {
            bridge,
            config,
            state: Mutex::new(TrackerState::default()),
            events: EventChannel::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    fn forward_rule(&self) -> ForwardRule {
        ForwardRule {
            device_port: self.config.device_port,
            host_port: self.config.host_port,
        }
    }

    /// Diff a snapshot against the known set and emit the resulting events.
    ///
    /// Duplicate rows for one serial collapse to the most ready status, so a
    /// flap inside one scan never produces a disconnect/connect pair.
    pub fn apply_snapshot(&self, listings: Vec<DeviceListing>) -> Vec<DeviceEvent> {
        let mut merged: BTreeMap<String, DeviceListing> = BTreeMap::new();
        for listing in listings {
            match merged.get(&listing.serial) {
                Some(existing) if existing.status.readiness() >= listing.status.readiness() => {}
                _ => {
                    merged.insert(listing.serial.clone(), listing);
                }
            }
        }

        let now = Utc::now();
        let mut events = Vec::new();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            state.scans += 1;
            let scan = state.scans;

            let mut gone: Vec<String> = state
                .devices
                .keys()
                .filter(|serial| !merged.contains_key(*serial))
                .cloned()
                .collect();
            gone.sort();

            for serial in gone {
                if let Some(mut device) = state.devices.remove(&serial) {
                    let was_connected = device.is_connected();
                    state.sessions.remove(&serial);
                    device.state = DeviceState::Absent;
                    if was_connected {
                        events.push(DeviceEvent::DeviceDisconnected(device));
                    }
                }
            }

            for (serial, listing) in merged {
                let device = state
                    .devices
                    .entry(serial.clone())
                    .or_insert_with(|| Device::new(serial.clone()));
                let was_connected = device.is_connected();
                let next = listing.status.device_state();

                device.model = listing.model;
                device.info = listing.info;
                device.last_seen = now;
                device.state = next;

                match (was_connected, next == DeviceState::Connected) {
                    (false, true) => {
                        state.sessions.insert(
                            serial.clone(),
                            SessionHandle {
                                serial: serial.clone(),
                                opened_at: now,
                                scan,
                            },
                        );
                        events.push(DeviceEvent::DeviceConnected(device.clone()));
                    }
                    (true, false) => {
                        state.sessions.remove(&serial);
                        events.push(DeviceEvent::DeviceDisconnected(device.clone()));
                    }
                    _ => {}
                }
            }
        }

        for event in &events {
            match event {
                DeviceEvent::DeviceConnected(device) => {
                    tracing::info!("Device connected: {} ({:?})", device.serial, device.model)
                }
                DeviceEvent::DeviceDisconnected(device) => {
                    tracing::info!("Device disconnected: {} ({:?})", device.serial, device.state)
                }
            }
            self.events.emit(event.clone());
        }

        events
    }

    /// One enumeration cycle: list, diff, and reconcile forwarding.
    ///
    /// Enumeration failures leave device state untouched. The first failure in
    /// a run of failures is logged at warn level, the rest at debug.
    pub async fn poll_once(&self) -> Result<Vec<DeviceEvent>> {
        let listings = match self.bridge.list_devices().await {
            Ok(listings) => listings,
            Err(err) => {
                let first = {
                    let mut state = self.state.lock();
                    !std::mem::replace(&mut state.bridge_failing, true)
                };
                if first {
                    tracing::warn!(
                        "Device enumeration failed: {}. Retrying every {:?}",
                        err,
                        self.config.poll_interval()
                    );
                } else {
                    tracing::debug!("Device enumeration still failing: {}", err);
                }
                return Err(err.into());
            }
        };

        let recovered = std::mem::replace(&mut self.state.lock().bridge_failing, false);
        if recovered {
            tracing::info!("Debug bridge reachable again");
        }

        let events = self.apply_snapshot(listings);

        if self.config.auto_forward {
            for event in &events {
                if let DeviceEvent::DeviceDisconnected(device) = event {
                    self.teardown_forwarding(&device.serial).await;
                }
            }
            for serial in self.unforwarded_connected() {
                if let Err(err) = self.ensure_forwarding(&serial).await {
                    tracing::warn!("Port forwarding for {} failed: {}", serial, err);
                }
            }
        }

        Ok(events)
    }

    fn unforwarded_connected(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut serials: Vec<String> = state
            .devices
            .values()
            .filter(|d| d.is_connected() && !state.forwarded.contains(&d.serial))
            .map(|d| d.serial.clone())
            .collect();
        serials.sort();
        serials
    }

    /// Register the forwarding rule for a connected device.
    ///
    /// Returns `Ok(true)` if a rule was added, `Ok(false)` if one already
    /// exists (or is being added) or the device is not connected.
    pub async fn ensure_forwarding(&self, serial: &str) -> Result<bool> {
        {
            let mut state = self.state.lock();
            let connected = state.devices.get(serial).is_some_and(Device::is_connected);
            if !connected || !state.forwarded.insert(serial.to_string()) {
                return Ok(false);
            }
        }

        let rule = self.forward_rule();
        match self.bridge.add_port_forward(serial, rule).await {
            Ok(()) => {
                let mut state = self.state.lock();
                if let Some(device) = state.devices.get_mut(serial) {
                    device.forwarding_active = true;
                }
                tracing::info!(
                    "Forwarding device tcp:{} -> host tcp:{} for {}",
                    rule.device_port,
                    rule.host_port,
                    serial
                );
                Ok(true)
            }
            Err(err) => {
                self.state.lock().forwarded.remove(serial);
                Err(err.into())
            }
        }
    }

    /// Remove the forwarding rule for `serial`. Returns `true` only for the
    /// call that actually tore it down.
    pub async fn teardown_forwarding(&self, serial: &str) -> bool {
        {
            let mut state = self.state.lock();
            if !state.forwarded.remove(serial) {
                return false;
            }
            if let Some(device) = state.devices.get_mut(serial) {
                device.forwarding_active = false;
            }
        }

        // A vanished device usually takes its rule with it
        if let Err(err) = self.bridge.remove_port_forward(serial, self.forward_rule()).await {
            tracing::debug!("Removing forward for {}: {}", serial, err);
        }
        true
    }

    /// Poll on the configured interval until `parent` is cancelled
    pub fn start_polling(self: &Arc<Self>, parent: &CancellationToken) -> Result<Scheduler> {
        let tracker = self.clone();
        let scheduler = create_scheduler(
            "device-tracker",
            move || {
                let tracker = tracker.clone();
                async move {
                    // Already logged; the next tick retries
                    let _ = tracker.poll_once().await;
                }
            },
            self.config.poll_interval(),
            SchedulerOptions {
                immediate: true,
                max_iterations: None,
            },
        );
        scheduler.start_linked(parent)?;
        Ok(scheduler)
    }

    /// Known devices, sorted by serial
    pub fn devices(&self) -> Vec<Device> {
        let state = self.state.lock();
        let mut devices: Vec<Device> = state.devices.values().cloned().collect();
        devices.sort_by(|a, b| a.serial.cmp(&b.serial));
        devices
    }

    pub fn device(&self, serial: &str) -> Option<Device> {
        self.state.lock().devices.get(serial).cloned()
    }

    pub fn session(&self, serial: &str) -> Option<SessionHandle> {
        self.state.lock().sessions.get(serial).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    pub fn forwarded_serials(&self) -> Vec<String> {
        let mut serials: Vec<String> = self.state.lock().forwarded.iter().cloned().collect();
        serials.sort();
        serials
    }

    pub fn is_bridge_failing(&self) -> bool {
        self.state.lock().bridge_failing
    }
}
