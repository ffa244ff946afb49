//! An in-process [`Transport`] that plays the part of a CA server.
//!
//! Records live in shared memory and are answered with real DBR byte layouts, so the
//! runtime decodes exactly what it would from a network transport. Every reply is
//! queued with a configurable latency and handed over from [`Transport::pend_event`].

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant, SystemTime},
};

use num::{Bounded, NumCast};
use thiserror::Error;
use tracing::{debug, trace};

use super::{
    Access, ChannelId, EventSender, IoId, MonitorId, MonitorMask, RawPayload, Transport,
    TransportEvent,
};
use crate::{
    dbr::{
        Dbr, DbrBasicType, DbrCategory, DbrControl, DbrGraphics, DbrType, DbrValue, Limits,
        MAX_ENUM_STATES, Status,
    },
    error::ErrorCondition,
    utils::wrapping_inplace_add,
};

#[derive(Debug, Error)]
#[error("A PV named '{0}' already exists")]
pub struct PvAlreadyExists(pub String);

#[derive(Debug)]
struct Record {
    value: DbrValue,
    status: Status,
    /// The last time this value was written
    timestamp: SystemTime,
    units: String,
    precision: i16,
    labels: Vec<String>,
    limits: Limits<f64>,
    control: (f64, f64),
    access: Access,
    online: bool,
    /// A record that is not responsive never answers reads or put callbacks
    responsive: bool,
}

/// Convert a limit to a narrower type, saturating at the bounds of that type
fn saturate<T: NumCast + Bounded>(v: f64) -> T {
    NumCast::from(v).unwrap_or_else(|| {
        if v < 0.0 {
            T::min_value()
        } else {
            T::max_value()
        }
    })
}

fn narrow<T: NumCast + Bounded>(limits: &Limits<f64>) -> Limits<T> {
    let pair = |(l, u): (f64, f64)| (saturate(l), saturate(u));
    Limits {
        display_limits: pair(limits.display_limits),
        alarm_limits: pair(limits.alarm_limits),
        warning_limits: pair(limits.warning_limits),
    }
}

impl Record {
    fn new(value: DbrValue) -> Self {
        Record {
            value,
            status: Status::default(),
            timestamp: SystemTime::now(),
            units: String::new(),
            precision: 0,
            labels: Vec::new(),
            limits: Limits {
                display_limits: (0.0, 0.0),
                alarm_limits: (0.0, 0.0),
                warning_limits: (0.0, 0.0),
            },
            control: (0.0, 0.0),
            access: Access::ReadWrite,
            online: true,
            responsive: true,
        }
    }

    /// Store a value written by a client, converting to the native type
    fn store(&mut self, value: &DbrValue) -> Result<(), ErrorCondition> {
        let native = self.value.get_type();
        self.value = match value {
            DbrValue::String(strings) if native == DbrBasicType::Enum => {
                let indices: Option<Vec<u16>> = strings
                    .iter()
                    .map(|s| self.labels.iter().position(|l| l == s).map(|i| i as u16))
                    .collect();
                match indices {
                    Some(indices) => DbrValue::Enum(indices),
                    None => value.coerce_to(native)?,
                }
            }
            _ => value.coerce_to(native)?,
        };
        self.timestamp = SystemTime::now();
        Ok(())
    }

    fn graphics(&self, kind: DbrBasicType) -> DbrGraphics {
        let units = self.units.clone();
        match kind {
            DbrBasicType::String => DbrGraphics::String,
            DbrBasicType::Enum => DbrGraphics::Enum {
                labels: self.labels.clone(),
            },
            DbrBasicType::Char => DbrGraphics::Char {
                units,
                limits: narrow(&self.limits),
            },
            DbrBasicType::Int => DbrGraphics::Int {
                units,
                limits: narrow(&self.limits),
            },
            DbrBasicType::Long => DbrGraphics::Long {
                units,
                limits: narrow(&self.limits),
            },
            DbrBasicType::Float => DbrGraphics::Float {
                units,
                limits: narrow(&self.limits),
                precision: self.precision,
            },
            DbrBasicType::Double => DbrGraphics::Double {
                units,
                limits: self.limits.clone(),
                precision: self.precision,
            },
        }
    }

    fn control(&self, kind: DbrBasicType) -> DbrControl {
        let (l, u) = self.control;
        match kind {
            DbrBasicType::String => DbrControl::String,
            DbrBasicType::Enum => DbrControl::Enum,
            DbrBasicType::Char => DbrControl::Char(saturate(l), saturate(u)),
            DbrBasicType::Int => DbrControl::Int(saturate(l), saturate(u)),
            DbrBasicType::Long => DbrControl::Long(saturate(l), saturate(u)),
            DbrBasicType::Float => DbrControl::Float(saturate(l), saturate(u)),
            DbrBasicType::Double => DbrControl::Double(l, u),
        }
    }

    /// Load the value into a Dbr of the requested type, ready to send to a client
    fn load_for_ca(&self, data_type: DbrType, count: usize) -> Result<Dbr, ErrorCondition> {
        let kind = data_type.basic_type;
        let mut value = match (&self.value, kind) {
            (DbrValue::Enum(indices), DbrBasicType::String) => DbrValue::String(
                indices
                    .iter()
                    .map(|i| {
                        self.labels
                            .get(*i as usize)
                            .cloned()
                            .unwrap_or_else(|| i.to_string())
                    })
                    .collect(),
            ),
            (value, kind) => value.convert_to(kind)?,
        };
        if count > 0 {
            value.resize(count);
        }
        let status = self.status;
        Ok(match data_type.category {
            DbrCategory::Basic => Dbr::Basic(value),
            DbrCategory::Status => Dbr::Status { status, value },
            DbrCategory::Time => Dbr::Time {
                status,
                timestamp: self.timestamp,
                value,
            },
            DbrCategory::Graphics => Dbr::Graphics {
                status,
                graphics: self.graphics(kind),
                value,
            },
            DbrCategory::Control => Dbr::Control {
                status,
                graphics: self.graphics(kind),
                control: self.control(kind),
                value,
            },
        })
    }

    fn encode(&self, data_type: DbrType, count: usize) -> Result<RawPayload, ErrorCondition> {
        let (count, data) = self.load_for_ca(data_type, count)?.to_bytes(None);
        Ok(RawPayload {
            data_type,
            count,
            data,
        })
    }
}

struct ChannelEntry {
    name: String,
    events: EventSender,
    connected: bool,
}

struct Monitor {
    channel: ChannelId,
    data_type: DbrType,
    count: usize,
    mask: MonitorMask,
}

struct Delivery {
    due: Instant,
    events: EventSender,
    event: TransportEvent,
}

struct MemoryState {
    records: HashMap<String, Arc<Mutex<Record>>>,
    channels: HashMap<ChannelId, ChannelEntry>,
    monitors: HashMap<MonitorId, Monitor>,
    /// Replies waiting to be handed over, in the order they were produced
    queue: VecDeque<Delivery>,
    next_channel: u32,
    next_monitor: u32,
    latency: Duration,
    host: String,
    flushes: usize,
}

impl Default for MemoryState {
    fn default() -> Self {
        MemoryState {
            records: HashMap::new(),
            channels: HashMap::new(),
            monitors: HashMap::new(),
            queue: VecDeque::new(),
            next_channel: 1,
            next_monitor: 1,
            flushes: 0,
            latency: Duration::ZERO,
            host: "localhost:5064".to_string(),
        }
    }
}

impl MemoryState {
    fn schedule(&mut self, events: &EventSender, event: TransportEvent) {
        trace!("Scheduling {event:?}");
        self.queue.push_back(Delivery {
            due: Instant::now() + self.latency,
            events: events.clone(),
            event,
        });
    }

    /// The record behind a channel, if it is currently connected
    fn connected_record(&self, channel: ChannelId) -> Option<Arc<Mutex<Record>>> {
        let entry = self.channels.get(&channel)?;
        if !entry.connected {
            return None;
        }
        self.records.get(&entry.name).cloned()
    }

    fn connect_channel(&mut self, id: ChannelId) {
        let Some(entry) = self.channels.get_mut(&id) else {
            return;
        };
        let Some(record) = self.records.get(&entry.name).cloned() else {
            return;
        };
        entry.connected = true;
        let events = entry.events.clone();
        debug!("Memory channel {} ({id:?}) connected", entry.name);

        let record = record.lock().unwrap();
        let mut replies = vec![
            TransportEvent::Connection {
                channel: id,
                connected: true,
            },
            TransportEvent::AccessRights {
                channel: id,
                access: record.access,
            },
        ];
        // Monitors survive a disconnect, and are refreshed on reconnection
        replies.extend(
            self.monitors
                .iter()
                .filter(|(_, m)| m.channel == id)
                .map(|(monitor, m)| TransportEvent::Monitor {
                    monitor: *monitor,
                    result: record.encode(m.data_type, m.count),
                }),
        );
        drop(record);
        for event in replies {
            self.schedule(&events, event);
        }
    }

    fn disconnect_channel(&mut self, id: ChannelId) {
        let Some(entry) = self.channels.get_mut(&id) else {
            return;
        };
        if !entry.connected {
            return;
        }
        entry.connected = false;
        let events = entry.events.clone();
        self.schedule(
            &events,
            TransportEvent::Connection {
                channel: id,
                connected: false,
            },
        );
    }

    fn channels_named(&self, name: &str) -> Vec<ChannelId> {
        self.channels
            .iter()
            .filter(|(_, c)| c.name == name)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Send new values to every monitor of `name` interested in this kind of change
    fn notify(&mut self, name: &str, changed: MonitorMask) {
        let Some(record) = self.records.get(name).cloned() else {
            return;
        };
        let record = record.lock().unwrap();
        let mut updates = Vec::new();
        for (monitor, m) in &self.monitors {
            let Some(channel) = self.channels.get(&m.channel) else {
                continue;
            };
            if channel.name != name || !channel.connected || m.mask.bits() & changed.bits() == 0 {
                continue;
            }
            updates.push((
                channel.events.clone(),
                TransportEvent::Monitor {
                    monitor: *monitor,
                    result: record.encode(m.data_type, m.count),
                },
            ));
        }
        drop(record);
        for (events, event) in updates {
            self.schedule(&events, event);
        }
    }

    /// Apply a client write; returns the status a put callback reports
    fn write(&mut self, channel: ChannelId, value: &DbrValue) -> Option<ErrorCondition> {
        let record = self.connected_record(channel)?;
        let name = self.channels.get(&channel)?.name.clone();
        let result = {
            let mut record = record.lock().unwrap();
            if !record.responsive {
                return None;
            }
            record.store(value)
        };
        match result {
            Ok(()) => {
                self.notify(&name, MonitorMask::from_bits(MonitorMask::VALUE | MonitorMask::LOG));
                Some(ErrorCondition::Normal)
            }
            Err(status) => Some(status),
        }
    }
}

/// Simulated CA server for tests and demonstrations
///
/// Clones share the same records, so one instance can back several contexts:
///
/// ```
/// use epicars_runtime::transport::MemoryTransport;
/// let transport = MemoryTransport::new();
/// let temperature = transport.add_pv("TEMP1", 23.4f64).unwrap();
/// temperature.store(23.9f64).unwrap();
/// ```
#[derive(Clone, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every reply by `latency`
    pub fn with_latency(latency: Duration) -> Self {
        let transport = Self::default();
        transport.state.lock().unwrap().latency = latency;
        transport
    }

    /// Add a record. Channels already waiting for this name connect to it.
    pub fn add_pv(
        &self,
        name: &str,
        value: impl Into<DbrValue>,
    ) -> Result<MemoryPv, PvAlreadyExists> {
        let mut state = self.state.lock().unwrap();
        if state.records.contains_key(name) {
            return Err(PvAlreadyExists(name.to_string()));
        }
        let record = Arc::new(Mutex::new(Record::new(value.into())));
        state.records.insert(name.to_string(), record.clone());
        for id in state.channels_named(name) {
            state.connect_channel(id);
        }
        Ok(MemoryPv {
            name: name.to_string(),
            state: self.state.clone(),
            record,
        })
    }

    pub fn pv(&self, name: &str) -> Option<MemoryPv> {
        let state = self.state.lock().unwrap();
        state.records.get(name).map(|record| MemoryPv {
            name: name.to_string(),
            state: self.state.clone(),
            record: record.clone(),
        })
    }

    /// Number of channels currently open against this transport
    pub fn channel_count(&self) -> usize {
        self.state.lock().unwrap().channels.len()
    }

    /// Number of times the client has flushed its send buffer
    pub fn flush_count(&self) -> usize {
        self.state.lock().unwrap().flushes
    }

    /// Number of monitors currently installed on `name`
    pub fn monitor_count(&self, name: &str) -> usize {
        let state = self.state.lock().unwrap();
        state
            .monitors
            .values()
            .filter(|m| state.channels.get(&m.channel).is_some_and(|c| c.name == name))
            .count()
    }
}

impl Transport for MemoryTransport {
    fn create_channel(&self, name: &str, events: EventSender) -> ChannelId {
        let mut state = self.state.lock().unwrap();
        let id = ChannelId(wrapping_inplace_add(&mut state.next_channel));
        debug!("Creating memory channel {name} as {id:?}");
        state.channels.insert(
            id,
            ChannelEntry {
                name: name.to_string(),
                events,
                connected: false,
            },
        );
        let online = state
            .records
            .get(name)
            .is_some_and(|r| r.lock().unwrap().online);
        if online {
            state.connect_channel(id);
        }
        id
    }

    fn clear_channel(&self, channel: ChannelId) {
        let mut state = self.state.lock().unwrap();
        state.channels.remove(&channel);
        state.monitors.retain(|_, m| m.channel != channel);
    }

    fn is_connected(&self, channel: ChannelId) -> bool {
        let state = self.state.lock().unwrap();
        state.channels.get(&channel).is_some_and(|c| c.connected)
    }

    fn field_type(&self, channel: ChannelId) -> Option<DbrBasicType> {
        let record = self.state.lock().unwrap().connected_record(channel)?;
        Some(record.lock().unwrap().value.get_type())
    }

    fn element_count(&self, channel: ChannelId) -> usize {
        let record = self.state.lock().unwrap().connected_record(channel);
        record.map_or(0, |r| r.lock().unwrap().value.get_count())
    }

    fn host_name(&self, channel: ChannelId) -> Option<String> {
        let state = self.state.lock().unwrap();
        state.connected_record(channel).map(|_| state.host.clone())
    }

    fn access(&self, channel: ChannelId) -> Access {
        let record = self.state.lock().unwrap().connected_record(channel);
        record.map_or(Access::None, |r| r.lock().unwrap().access)
    }

    fn get(
        &self,
        channel: ChannelId,
        data_type: DbrType,
        count: usize,
        ioid: IoId,
    ) -> Result<(), ErrorCondition> {
        let mut state = self.state.lock().unwrap();
        let record = state
            .connected_record(channel)
            .ok_or(ErrorCondition::Disconn)?;
        let result = {
            let record = record.lock().unwrap();
            if !record.access.can_read() {
                return Err(ErrorCondition::NoRdAccess);
            }
            if !record.responsive {
                trace!("Dropping read {ioid:?} to unresponsive record");
                return Ok(());
            }
            record.encode(data_type, count)
        };
        let events = match state.channels.get(&channel) {
            Some(entry) => entry.events.clone(),
            None => return Err(ErrorCondition::BadChId),
        };
        state.schedule(&events, TransportEvent::ReadComplete { ioid, result });
        Ok(())
    }

    fn put(&self, channel: ChannelId, value: &DbrValue) -> Result<(), ErrorCondition> {
        let mut state = self.state.lock().unwrap();
        let record = state
            .connected_record(channel)
            .ok_or(ErrorCondition::Disconn)?;
        if !record.lock().unwrap().access.can_write() {
            return Err(ErrorCondition::NoWtAccess);
        }
        if let Some(status) = state.write(channel, value)
            && !status.is_normal()
        {
            debug!("Plain write to {channel:?} failed: {status}");
        }
        Ok(())
    }

    fn put_with_callback(
        &self,
        channel: ChannelId,
        value: &DbrValue,
        ioid: IoId,
    ) -> Result<(), ErrorCondition> {
        let mut state = self.state.lock().unwrap();
        let record = state
            .connected_record(channel)
            .ok_or(ErrorCondition::Disconn)?;
        if !record.lock().unwrap().access.can_write() {
            return Err(ErrorCondition::NoWtAccess);
        }
        let Some(status) = state.write(channel, value) else {
            trace!("Dropping write {ioid:?} to unresponsive record");
            return Ok(());
        };
        let events = match state.channels.get(&channel) {
            Some(entry) => entry.events.clone(),
            None => return Err(ErrorCondition::BadChId),
        };
        state.schedule(&events, TransportEvent::WriteComplete { ioid, status });
        Ok(())
    }

    fn subscribe(
        &self,
        channel: ChannelId,
        data_type: DbrType,
        count: usize,
        mask: MonitorMask,
    ) -> Result<MonitorId, ErrorCondition> {
        if mask.is_empty() {
            return Err(ErrorCondition::BadMask);
        }
        let mut state = self.state.lock().unwrap();
        let Some(entry) = state.channels.get(&channel) else {
            return Err(ErrorCondition::BadChId);
        };
        let events = entry.events.clone();
        let id = MonitorId(wrapping_inplace_add(&mut state.next_monitor));
        state.monitors.insert(
            id,
            Monitor {
                channel,
                data_type,
                count,
                mask,
            },
        );
        // Every new monitor is sent the current value straight away
        if let Some(record) = state.connected_record(channel) {
            let result = record.lock().unwrap().encode(data_type, count);
            state.schedule(&events, TransportEvent::Monitor { monitor: id, result });
        }
        Ok(id)
    }

    fn unsubscribe(&self, monitor: MonitorId) {
        self.state.lock().unwrap().monitors.remove(&monitor);
    }

    fn flush_io(&self) {
        self.state.lock().unwrap().flushes += 1;
    }

    fn pend_event(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        loop {
            let next_due = {
                let mut state = self.state.lock().unwrap();
                let now = Instant::now();
                let mut delivered = 0;
                while state.queue.front().is_some_and(|d| d.due <= now) {
                    if let Some(delivery) = state.queue.pop_front() {
                        // The receiving context may already be gone
                        let _ = delivery.events.send(delivery.event);
                        delivered += 1;
                    }
                }
                if delivered > 0 {
                    return;
                }
                state.queue.front().map(|d| d.due)
            };
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            let wake = next_due.map_or(deadline, |due| due.min(deadline));
            thread::sleep(wake.saturating_duration_since(now));
        }
    }
}

/// Server side access to one record of a [`MemoryTransport`]
#[derive(Clone)]
pub struct MemoryPv {
    name: String,
    state: Arc<Mutex<MemoryState>>,
    record: Arc<Mutex<Record>>,
}

impl MemoryPv {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn load(&self) -> DbrValue {
        self.record.lock().unwrap().value.clone()
    }

    /// Update the value and notify value/log monitors
    pub fn store(&self, value: impl Into<DbrValue>) -> Result<(), ErrorCondition> {
        let mut state = self.state.lock().unwrap();
        self.record.lock().unwrap().store(&value.into())?;
        state.notify(
            &self.name,
            MonitorMask::from_bits(MonitorMask::VALUE | MonitorMask::LOG),
        );
        Ok(())
    }

    /// Change alarm status and severity, notifying alarm monitors on change
    pub fn set_alarm(&self, status: i16, severity: i16) {
        let mut state = self.state.lock().unwrap();
        let changed = {
            let mut record = self.record.lock().unwrap();
            let new = Status { status, severity };
            let changed = record.status != new;
            record.status = new;
            changed
        };
        if changed {
            state.notify(&self.name, MonitorMask::from_bits(MonitorMask::ALARM));
        }
    }

    fn set_property(&self, update: impl FnOnce(&mut Record)) {
        let mut state = self.state.lock().unwrap();
        update(&mut self.record.lock().unwrap());
        state.notify(&self.name, MonitorMask::from_bits(MonitorMask::PROPERTY));
    }

    pub fn set_units(&self, units: &str) {
        self.set_property(|r| r.units = units.to_string());
    }

    pub fn set_precision(&self, precision: i16) {
        self.set_property(|r| r.precision = precision);
    }

    pub fn set_enum_strings(&self, labels: &[&str]) {
        self.set_property(|r| {
            r.labels = labels
                .iter()
                .take(MAX_ENUM_STATES)
                .map(|l| l.to_string())
                .collect()
        });
    }

    /// Set display, alarm and warning limits, each as `(lower, upper)`
    pub fn set_limits(&self, display: (f64, f64), alarm: (f64, f64), warning: (f64, f64)) {
        self.set_property(|r| {
            r.limits = Limits {
                display_limits: display,
                alarm_limits: alarm,
                warning_limits: warning,
            }
        });
    }

    pub fn set_control_limits(&self, lower: f64, upper: f64) {
        self.set_property(|r| r.control = (lower, upper));
    }

    pub fn set_access(&self, access: Access) {
        let mut state = self.state.lock().unwrap();
        self.record.lock().unwrap().access = access;
        for id in state.channels_named(&self.name) {
            let Some(entry) = state.channels.get(&id) else {
                continue;
            };
            if entry.connected {
                let events = entry.events.clone();
                state.schedule(
                    &events,
                    TransportEvent::AccessRights {
                        channel: id,
                        access,
                    },
                );
            }
        }
    }

    /// Take the record off the network, or bring it back
    pub fn set_online(&self, online: bool) {
        let mut state = self.state.lock().unwrap();
        self.record.lock().unwrap().online = online;
        for id in state.channels_named(&self.name) {
            if online {
                let connected = state.channels.get(&id).is_some_and(|c| c.connected);
                if !connected {
                    state.connect_channel(id);
                }
            } else {
                state.disconnect_channel(id);
            }
        }
    }

    pub fn set_responsive(&self, responsive: bool) {
        let _state = self.state.lock().unwrap();
        self.record.lock().unwrap().responsive = responsive;
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;

    fn drain(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn connects_and_answers_reads() {
        let transport = MemoryTransport::new();
        transport.add_pv("TEST", 42i16).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = transport.create_channel("TEST", tx);
        transport.pend_event(Duration::ZERO);
        let events = drain(&mut rx);
        assert!(matches!(
            events[0],
            TransportEvent::Connection {
                connected: true,
                ..
            }
        ));
        assert_eq!(transport.field_type(id), Some(DbrBasicType::Int));
        assert_eq!(transport.element_count(id), 1);

        let data_type = DbrType::new(DbrBasicType::Double, DbrCategory::Time);
        transport.get(id, data_type, 0, IoId(7)).unwrap();
        transport.pend_event(Duration::ZERO);
        let events = drain(&mut rx);
        let TransportEvent::ReadComplete {
            ioid,
            result: Ok(payload),
        } = &events[0]
        else {
            panic!("Expected a read reply, got {events:?}");
        };
        assert_eq!(*ioid, IoId(7));
        let dbr = Dbr::from_bytes(payload.data_type, payload.count, &payload.data).unwrap();
        assert_eq!(dbr.value(), &DbrValue::Double(vec![42.0]));
    }

    #[test]
    fn unknown_names_never_connect() {
        let transport = MemoryTransport::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = transport.create_channel("BAD:NAME", tx);
        transport.pend_event(Duration::from_millis(5));
        assert!(drain(&mut rx).is_empty());
        assert!(!transport.is_connected(id));
    }

    #[test]
    fn access_is_enforced() {
        let transport = MemoryTransport::new();
        let pv = transport.add_pv("LOCKED", 1i32).unwrap();
        pv.set_access(Access::Read);
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = transport.create_channel("LOCKED", tx);
        assert_eq!(
            transport.put(id, &2i32.into()),
            Err(ErrorCondition::NoWtAccess)
        );
        assert_eq!(pv.load(), DbrValue::Long(vec![1]));
    }

    #[test]
    fn enum_labels_are_served_as_strings() {
        let transport = MemoryTransport::new();
        let pv = transport.add_pv("MODE", DbrValue::Enum(vec![1])).unwrap();
        pv.set_enum_strings(&["Off", "On"]);
        pv.store("Off").unwrap();
        assert_eq!(pv.load(), DbrValue::Enum(vec![0]));
        let dbr = pv
            .record
            .lock()
            .unwrap()
            .load_for_ca(DbrType::new(DbrBasicType::String, DbrCategory::Basic), 0)
            .unwrap();
        assert_eq!(dbr.value(), &DbrValue::String(vec!["Off".into()]));
    }
}
