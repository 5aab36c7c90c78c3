//! Device registry and availability tracker.
//!
//! Every push re-arms a per-device deadline. A device that stays silent
//! past the deadline is marked unavailable and a single
//! [`DeviceEvent::Unavailable`] is emitted. Pushes and the timer of one
//! device are serialized through its slot lock; a generation counter
//! makes a timer that lost the race a no-op.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use aqara_protocol::constants::TIME_TILL_UNAVAILABLE;
use aqara_protocol::{Frame, Payload, ProtoVersion};

use crate::DeviceError;
use crate::battery::{Battery, parse_battery};
use crate::models::{Command, DeviceKind, DeviceState, ModelDescriptor, ModelRegistry};

/// Identifies a sub-device: owning hub sid plus its own sid.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DeviceKey {
    pub hub: String,
    pub sid: String,
}

impl DeviceKey {
    pub fn new(hub: impl Into<String>, sid: impl Into<String>) -> Self {
        Self {
            hub: hub.into(),
            sid: sid.into(),
        }
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.hub, self.sid)
    }
}

/// Point-in-time view of a device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSnapshot {
    pub key: DeviceKey,
    pub model: String,
    pub kind: DeviceKind,
    pub state: DeviceState,
    /// Every attribute received so far, merged.
    pub attributes: Payload,
    pub voltage: Option<f64>,
    pub battery_level: Option<f64>,
    pub available: bool,
}

/// Notification for the host.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    /// State changed or the device came back.
    Updated(DeviceSnapshot),
    /// No report within the availability window.
    Unavailable(DeviceKey),
}

struct Entry {
    key: DeviceKey,
    model: String,
    descriptor: ModelDescriptor,
    slot: Mutex<Slot>,
}

struct Slot {
    state: DeviceState,
    attributes: Payload,
    battery: Option<Battery>,
    available: bool,
    generation: u64,
    deadline: Option<Instant>,
    timer: Option<JoinHandle<()>>,
}

impl Entry {
    fn lock(&self) -> std::sync::MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self, slot: &Slot) -> DeviceSnapshot {
        DeviceSnapshot {
            key: self.key.clone(),
            model: self.model.clone(),
            kind: self.descriptor.kind,
            state: slot.state.clone(),
            attributes: slot.attributes.clone(),
            voltage: slot.battery.map(|b| b.voltage),
            battery_level: slot.battery.map(|b| b.level),
            available: slot.available,
        }
    }
}

/// Sub-devices of every hub, keyed by (hub sid, device sid).
pub struct DeviceRegistry {
    models: ModelRegistry,
    devices: RwLock<HashMap<DeviceKey, Arc<Entry>>>,
    timeout: Duration,
    events_tx: mpsc::Sender<DeviceEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<DeviceEvent>>>,
}

impl DeviceRegistry {
    pub fn new(models: ModelRegistry) -> Self {
        Self::with_timeout(models, TIME_TILL_UNAVAILABLE)
    }

    /// Registry with a custom availability window.
    pub fn with_timeout(models: ModelRegistry, timeout: Duration) -> Self {
        let (tx, rx) = mpsc::channel(256);
        Self {
            models,
            devices: RwLock::new(HashMap::new()),
            timeout,
            events_tx: tx,
            events_rx: Mutex::new(Some(rx)),
        }
    }

    /// Takes the event receiver. Can only be called once.
    pub fn take_events(&self) -> Option<mpsc::Receiver<DeviceEvent>> {
        self.events_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn models(&self) -> &ModelRegistry {
        &self.models
    }

    /// Adds an enumerated device and starts its availability timer.
    ///
    /// Returns `Ok(false)` if the device was already known.
    pub fn register(
        &self,
        hub: &str,
        sid: &str,
        model: &str,
        proto: ProtoVersion,
        data: &Payload,
    ) -> Result<bool, DeviceError> {
        let key = DeviceKey::new(hub, sid);
        if self.entry(&key).is_some() {
            return Ok(false);
        }
        let entry = self.create(key, model, proto)?;

        let mut slot = entry.lock();
        (entry.descriptor.decode)(&mut slot.state, data);
        slot.attributes.extend(data.clone());
        slot.battery = parse_battery(data);
        self.arm(&entry, &mut slot);
        debug!(device = %entry.key, model, "device registered");
        Ok(true)
    }

    /// Applies a pushed report. Returns `true` if anything the host
    /// displays changed, including availability.
    ///
    /// Devices not yet known are created from the frame's `model`.
    pub fn on_push(&self, hub: &str, sid: &str, data: &Payload, raw: &Frame) -> bool {
        let key = DeviceKey::new(hub, sid);
        let entry = match self.entry(&key) {
            Some(e) => e,
            None => {
                let Some(model) = raw.model.as_deref() else {
                    debug!(device = %key, cmd = %raw.cmd, "push for unknown device without model");
                    return false;
                };
                let proto = if raw.params.is_some() {
                    ProtoVersion::V2
                } else {
                    ProtoVersion::V1
                };
                match self.create(key, model, proto) {
                    Ok(e) => e,
                    Err(e) => {
                        debug!("{e}");
                        return false;
                    }
                }
            }
        };

        let mut slot = entry.lock();
        let was_unavailable = !slot.available;
        self.arm(&entry, &mut slot);

        let is_data = (entry.descriptor.decode)(&mut slot.state, data);
        slot.attributes.extend(data.clone());

        let is_voltage = match parse_battery(data) {
            Some(battery) => {
                let changed = slot.battery != Some(battery);
                slot.battery = Some(battery);
                changed
            }
            None => false,
        };

        let changed = is_data || is_voltage || was_unavailable;
        if was_unavailable {
            info!(device = %entry.key, "device available again");
        }
        if changed {
            let snapshot = entry.snapshot(&slot);
            drop(slot);
            self.emit(DeviceEvent::Updated(snapshot));
        }
        changed
    }

    /// Encodes `command` into write fields for the device.
    pub fn command(&self, hub: &str, sid: &str, command: &Command) -> Option<Payload> {
        let entry = self.entry(&DeviceKey::new(hub, sid))?;
        let slot = entry.lock();
        (entry.descriptor.encode_command)(&slot.state, command)
    }

    /// Devices whose model needs periodic reads.
    pub fn polled(&self) -> Vec<DeviceKey> {
        let mut keys: Vec<DeviceKey> = self
            .devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|e| e.descriptor.polled)
            .map(|e| e.key.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn snapshot(&self, hub: &str, sid: &str) -> Option<DeviceSnapshot> {
        let entry = self.entry(&DeviceKey::new(hub, sid))?;
        let slot = entry.lock();
        Some(entry.snapshot(&slot))
    }

    pub fn is_available(&self, hub: &str, sid: &str) -> Option<bool> {
        let entry = self.entry(&DeviceKey::new(hub, sid))?;
        let available = entry.lock().available;
        Some(available)
    }

    /// When the device will be marked unavailable without further reports.
    pub fn deadline(&self, hub: &str, sid: &str) -> Option<Instant> {
        self.entry(&DeviceKey::new(hub, sid))?.lock().deadline
    }

    pub fn snapshots(&self) -> Vec<DeviceSnapshot> {
        let entries: Vec<Arc<Entry>> = self
            .devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        entries
            .iter()
            .map(|e| {
                let slot = e.lock();
                e.snapshot(&slot)
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.devices.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entry(&self, key: &DeviceKey) -> Option<Arc<Entry>> {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn create(
        &self,
        key: DeviceKey,
        model: &str,
        proto: ProtoVersion,
    ) -> Result<Arc<Entry>, DeviceError> {
        let descriptor = self
            .models
            .lookup(model)
            .cloned()
            .ok_or_else(|| DeviceError::UnsupportedModel {
                model: model.to_string(),
                sid: key.sid.clone(),
            })?;

        let mut devices = self.devices.write().unwrap_or_else(PoisonError::into_inner);
        // Another push may have created it meanwhile.
        if let Some(existing) = devices.get(&key) {
            return Ok(existing.clone());
        }

        let entry = Arc::new(Entry {
            key: key.clone(),
            model: model.to_string(),
            slot: Mutex::new(Slot {
                state: (descriptor.init)(model, proto),
                attributes: Payload::new(),
                battery: None,
                available: true,
                generation: 0,
                deadline: None,
                timer: None,
            }),
            descriptor,
        });
        devices.insert(key, entry.clone());
        Ok(entry)
    }

    /// Marks the device available and restarts its timer.
    fn arm(&self, entry: &Arc<Entry>, slot: &mut Slot) {
        slot.available = true;
        slot.generation += 1;
        if let Some(old) = slot.timer.take() {
            old.abort();
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(device = %entry.key, "no runtime, availability is not tracked");
            return;
        };

        let deadline = Instant::now() + self.timeout;
        slot.deadline = Some(deadline);

        let generation = slot.generation;
        let entry = Arc::clone(entry);
        let events = self.events_tx.clone();
        slot.timer = Some(runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;

            {
                let mut slot = entry.lock();
                if slot.generation != generation || !slot.available {
                    return;
                }
                slot.available = false;
                slot.timer = None;
                drop(slot);
            }

            warn!(device = %entry.key, model = %entry.model, "device unavailable, no report received");
            // Waits for room; this is the only notification for the timeout.
            if events
                .send(DeviceEvent::Unavailable(entry.key.clone()))
                .await
                .is_err()
            {
                debug!(device = %entry.key, "unavailable event dropped, receiver gone");
            }
        }));
    }

    fn emit(&self, event: DeviceEvent) {
        if self.events_tx.try_send(event).is_err() {
            debug!("device event dropped, receiver full or gone");
        }
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new(ModelRegistry::builtin())
    }
}

impl Drop for DeviceRegistry {
    fn drop(&mut self) {
        let devices = self.devices.get_mut().unwrap_or_else(PoisonError::into_inner);
        for entry in devices.values() {
            if let Some(timer) = entry.lock().timer.take() {
                timer.abort();
            }
        }
    }
}
