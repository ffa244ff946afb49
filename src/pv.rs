//! The high level PV object: a named channel with cached value, metadata and
//! callbacks, monitored automatically when it is small enough.

use std::{
    collections::BTreeMap,
    fmt,
    marker::PhantomData,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, SystemTime},
};

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::{
    channel::{AccessListener, ConnectedChannel, ConnectionListener},
    context::{Context, ContextInner},
    dbr::{DbrBasicType, DbrValue},
    decode::{ArrayMode, DecodeMode, Metadata, Reading, Value, as_string},
    error::CaError,
    subscription::{Subscription, should_auto_monitor},
    tracker::{PutCallback, PutOutcome},
    transport::{Access, MonitorMask},
};

/// Called with `(name, reading)` for every monitor update of a PV
pub type PvCallback = Arc<dyn Fn(&str, &Reading) + Send + Sync>;

/// Identifies a callback registered on a [`Pv`], for removing it again
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CallbackId(u32);

/// How a PV is requested and monitored
#[derive(Debug, Clone, Default)]
pub struct PvOptions {
    /// Which metadata accompanies values
    pub form: DecodeMode,
    /// Force monitoring on or off; by default small PVs are monitored
    pub auto_monitor: Option<bool>,
    /// Elements to request, or zero for all of them
    pub count: usize,
    /// Mask for the automatic monitor, instead of the configured default
    pub monitor_mask: Option<MonitorMask>,
    pub connection_timeout: Option<Duration>,
    pub array_mode: ArrayMode,
}

/// Per-call options for [`Pv::get_with`]
#[derive(Debug, Copy, Clone)]
pub struct GetOptions {
    pub count: usize,
    /// Answer from the latest monitor update when there is one
    pub use_monitor: bool,
    pub timeout: Option<Duration>,
    pub array_mode: Option<ArrayMode>,
}

impl Default for GetOptions {
    fn default() -> Self {
        GetOptions {
            count: 0,
            use_monitor: true,
            timeout: None,
            array_mode: None,
        }
    }
}

#[derive(Default)]
struct PvState {
    connected: bool,
    channel: Option<ConnectedChannel>,
    access: Access,
    reading: Option<Reading>,
    meta: Metadata,
    monitor: Option<Subscription>,
    /// The listeners this PV has on its channel, while the channel is cached
    listeners: Option<(ConnectionListener, AccessListener)>,
    /// Callbacks or update streams need a monitor regardless of size
    wants_monitor: bool,
    next_callback: u32,
    callbacks: BTreeMap<CallbackId, PvCallback>,
    connection_callbacks: BTreeMap<CallbackId, ConnectionListener>,
    access_callbacks: BTreeMap<CallbackId, AccessListener>,
}

impl PvState {
    fn is_monitored(&self) -> bool {
        self.monitor.as_ref().is_some_and(Subscription::is_active)
    }

    fn next_id(&mut self) -> CallbackId {
        self.next_callback = self.next_callback.wrapping_add(1);
        CallbackId(self.next_callback)
    }
}

struct PvInner {
    name: String,
    options: PvOptions,
    context: Weak<ContextInner>,
    state: Mutex<PvState>,
    updates: Mutex<Option<broadcast::Sender<Reading>>>,
    released: AtomicBool,
}

/// A process variable, shared by everyone who asked for the same name and form
#[derive(Clone)]
pub struct Pv(Arc<PvInner>);

impl fmt::Debug for Pv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pv")
            .field("name", &self.0.name)
            .field("form", &self.0.options.form)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl PartialEq for Pv {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Context {
    /// The PV for `name` in the form `options.form`, created on first use
    ///
    /// Later calls with the same name and form return the same PV and ignore
    /// `options`.
    pub fn get_pv(&self, name: &str, options: PvOptions) -> Result<Pv, CaError> {
        self.ensure_alive()?;
        let key = (name.to_string(), options.form);
        let pv = {
            let mut pvs = self.inner.pvs.lock().unwrap();
            if let Some(pv) = pvs.get(&key) {
                return Ok(pv.clone());
            }
            let (updates, _) = broadcast::channel(self.inner.config.update_capacity);
            let pv = Pv(Arc::new(PvInner {
                name: name.to_string(),
                options,
                context: self.downgrade(),
                state: Mutex::new(PvState::default()),
                updates: Mutex::new(Some(updates)),
                released: AtomicBool::new(false),
            }));
            pvs.insert(key.clone(), pv.clone());
            pv
        };
        if let Err(e) = pv.ensure_listening(self) {
            self.inner.pvs.lock().unwrap().remove(&key);
            return Err(e);
        }
        debug!("Created PV {name} ({:?})", pv.0.options.form);
        Ok(pv)
    }

    /// Tell the PVs of a cleared channel that it has gone
    pub(crate) fn detach_pvs(&self, name: &str) {
        let pvs: Vec<Pv> = self
            .inner
            .pvs
            .lock()
            .unwrap()
            .iter()
            .filter(|((pv_name, _), _)| pv_name == name)
            .map(|(_, pv)| pv.clone())
            .collect();
        for pv in pvs {
            pv.on_channel_closed();
        }
    }
}

impl Pv {
    /// Listen to the channel, creating it if needed. Does nothing if already listening.
    fn ensure_listening(&self, context: &Context) -> Result<(), CaError> {
        let (connection, access) = {
            let mut state = self.0.state.lock().unwrap();
            if state.listeners.is_some() {
                return Ok(());
            }
            let weak = Arc::downgrade(&self.0);
            let connection: ConnectionListener = Arc::new(move |_: &str, connected: bool| {
                if let Some(inner) = weak.upgrade() {
                    Pv(inner).on_connection(connected);
                }
            });
            let weak = Arc::downgrade(&self.0);
            let access: AccessListener = Arc::new(move |_: &str, access: Access| {
                if let Some(inner) = weak.upgrade() {
                    Pv(inner).on_access(access);
                }
            });
            state.listeners = Some((connection.clone(), access.clone()));
            (connection, access)
        };
        let installed = context
            .create_channel(&self.0.name, Some(connection))
            .and_then(|_| context.add_access_listener(&self.0.name, access));
        if installed.is_err() {
            self.0.state.lock().unwrap().listeners = None;
        }
        installed
    }

    /// The channel was cleared from under this PV; forget it until asked again
    fn on_channel_closed(&self) {
        if self.is_released() {
            return;
        }
        let (monitor, callbacks) = {
            let mut state = self.0.state.lock().unwrap();
            let was_connected = state.connected;
            state.listeners = None;
            state.channel = None;
            state.connected = false;
            state.reading = None;
            let callbacks: Vec<ConnectionListener> = if was_connected {
                state.connection_callbacks.values().cloned().collect()
            } else {
                Vec::new()
            };
            (state.monitor.take(), callbacks)
        };
        if let Some(monitor) = monitor {
            monitor.unsubscribe();
        }
        debug!("Channel of PV {} was cleared", self.0.name);
        for callback in callbacks {
            callback(&self.0.name, false);
        }
    }

    fn is_released(&self) -> bool {
        self.0.released.load(Ordering::SeqCst)
    }

    fn on_connection(&self, connected: bool) {
        if self.is_released() {
            return;
        }
        let Ok(context) = self.context() else {
            return;
        };
        let (to_monitor, callbacks) = {
            let mut state = self.0.state.lock().unwrap();
            state.connected = connected;
            let mut to_monitor = None;
            if connected {
                state.channel = context.connected(&self.0.name);
                if let Some(channel) = &state.channel {
                    let wanted = state.wants_monitor
                        || should_auto_monitor(
                            self.0.options.auto_monitor,
                            channel.count,
                            context.config().auto_monitor_max_elements,
                        );
                    if wanted && !state.is_monitored() {
                        to_monitor = Some(channel.clone());
                    }
                }
            }
            let callbacks: Vec<ConnectionListener> =
                state.connection_callbacks.values().cloned().collect();
            (to_monitor, callbacks)
        };
        if let Some(channel) = to_monitor
            && let Err(e) = self.start_monitor(&context, &channel)
        {
            warn!("Could not monitor {}: {e}", self.0.name);
        }
        for callback in callbacks {
            callback(&self.0.name, connected);
        }
    }

    fn on_access(&self, access: Access) {
        if self.is_released() {
            return;
        }
        let callbacks: Vec<AccessListener> = {
            let mut state = self.0.state.lock().unwrap();
            state.access = access;
            state.access_callbacks.values().cloned().collect()
        };
        for callback in callbacks {
            callback(&self.0.name, access);
        }
    }

    fn on_update(&self, reading: &Reading) {
        if self.is_released() {
            return;
        }
        let callbacks: Vec<PvCallback> = {
            let mut state = self.0.state.lock().unwrap();
            state.meta.merge(&reading.meta);
            state.reading = Some(reading.clone());
            state.callbacks.values().cloned().collect()
        };
        if let Some(updates) = self.0.updates.lock().unwrap().as_ref() {
            // Nobody listening is not an error
            let _ = updates.send(reading.clone());
        }
        for callback in callbacks {
            callback(&self.0.name, reading);
        }
    }

    fn start_monitor(&self, context: &Context, channel: &ConnectedChannel) -> Result<(), CaError> {
        let weak = Arc::downgrade(&self.0);
        let mask = self
            .0
            .options
            .monitor_mask
            .unwrap_or(context.config().monitor_mask);
        let subscription = context.subscribe_with(
            channel,
            self.0.options.form,
            self.0.options.array_mode,
            self.0.options.count,
            mask,
            Arc::new(move |_: &str, reading: &Reading| {
                if let Some(inner) = weak.upgrade() {
                    Pv(inner).on_update(reading);
                }
            }),
        )?;
        let mut state = self.0.state.lock().unwrap();
        if state.is_monitored() {
            drop(state);
            subscription.unsubscribe();
        } else {
            debug!("Monitoring {}", self.0.name);
            state.monitor = Some(subscription);
        }
        Ok(())
    }

    /// Start a monitor now if connected, otherwise once connected
    fn ensure_monitored(&self) {
        let to_monitor = {
            let mut state = self.0.state.lock().unwrap();
            state.wants_monitor = true;
            match (&state.channel, state.connected) {
                (Some(channel), true) if !state.is_monitored() => Some(channel.clone()),
                _ => None,
            }
        };
        if let Some(channel) = to_monitor
            && let Ok(context) = self.context()
            && let Err(e) = self.start_monitor(&context, &channel)
        {
            warn!("Could not monitor {}: {e}", self.0.name);
        }
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn form(&self) -> DecodeMode {
        self.0.options.form
    }

    pub fn options(&self) -> &PvOptions {
        &self.0.options
    }

    pub fn context(&self) -> Result<Context, CaError> {
        Context::from_weak(&self.0.context)
    }

    pub fn is_connected(&self) -> bool {
        self.0.state.lock().unwrap().connected
    }

    pub fn is_monitored(&self) -> bool {
        self.0.state.lock().unwrap().is_monitored()
    }

    /// Wait until connected, by default for the PV's or the context's timeout
    pub fn wait_for_connection(
        &self,
        timeout: Option<Duration>,
    ) -> Result<ConnectedChannel, CaError> {
        if self.is_released() {
            return Err(CaError::ChannelClosed(self.0.name.clone()));
        }
        let timeout = timeout.or(self.0.options.connection_timeout);
        let context = self.context()?;
        self.ensure_listening(&context)?;
        context.wait_for_connect(&self.0.name, timeout)
    }

    /// The current value; the latest monitor update if the PV is monitored
    pub fn get(&self) -> Result<Value, CaError> {
        Ok(self.get_with(GetOptions::default())?.value)
    }

    /// The current value with its metadata
    pub fn get_with(&self, options: GetOptions) -> Result<Reading, CaError> {
        let channel = self.wait_for_connection(None)?;
        let array_mode = options.array_mode.unwrap_or(self.0.options.array_mode);
        let whole = options.count == 0 || options.count == self.0.options.count;
        if options.use_monitor && whole && array_mode == self.0.options.array_mode {
            let state = self.0.state.lock().unwrap();
            if state.is_monitored()
                && let Some(reading) = &state.reading
            {
                return Ok(reading.clone());
            }
        }
        let count = if options.count == 0 {
            self.0.options.count
        } else {
            options.count
        };
        let reading = self.fetch(&channel, self.0.options.form, array_mode, count, options.timeout)?;
        let mut state = self.0.state.lock().unwrap();
        state.meta.merge(&reading.meta);
        if !state.is_monitored() {
            state.reading = Some(reading.clone());
        }
        Ok(reading)
    }

    fn fetch(
        &self,
        channel: &ConnectedChannel,
        mode: DecodeMode,
        array_mode: ArrayMode,
        count: usize,
        timeout: Option<Duration>,
    ) -> Result<Reading, CaError> {
        let context = self.context()?;
        context.get_with(channel, mode, array_mode, count, false, None)?;
        context.complete(channel, mode, timeout)
    }

    /// The current value rendered as text, using enum labels and display precision
    pub fn get_string(&self) -> Result<String, CaError> {
        self.get_string_with(GetOptions::default())
    }

    pub fn get_string_with(&self, options: GetOptions) -> Result<String, CaError> {
        let reading = self.get_with(options)?;
        let needs_ctrl = {
            let state = self.0.state.lock().unwrap();
            match state.channel.as_ref().map(|c| c.native_type) {
                Some(DbrBasicType::Float | DbrBasicType::Double) => state.meta.precision.is_none(),
                Some(DbrBasicType::Enum) => state.meta.enum_strs.is_none(),
                _ => false,
            }
        };
        if needs_ctrl {
            self.get_ctrlvars(None)?;
        }
        let mut meta = self.metadata();
        meta.merge(&reading.meta);
        Ok(as_string(&reading.value, reading.data_type, reading.count, &meta))
    }

    /// Fetch the CTRL metadata: units, precision, limits and enum labels
    pub fn get_ctrlvars(&self, timeout: Option<Duration>) -> Result<Metadata, CaError> {
        self.fetch_metadata(DecodeMode::Ctrl, timeout)
    }

    /// Fetch the TIME metadata: alarm status, severity and timestamp
    pub fn get_timevars(&self, timeout: Option<Duration>) -> Result<Metadata, CaError> {
        self.fetch_metadata(DecodeMode::Time, timeout)
    }

    fn fetch_metadata(
        &self,
        mode: DecodeMode,
        timeout: Option<Duration>,
    ) -> Result<Metadata, CaError> {
        let channel = self.wait_for_connection(None)?;
        let reading = self.fetch(&channel, mode, ArrayMode::default(), 1, timeout)?;
        let mut state = self.0.state.lock().unwrap();
        state.meta.merge(&reading.meta);
        Ok(state.meta.clone())
    }

    /// Write a value, optionally waiting for the server to confirm it
    ///
    /// A string written to an enum PV is matched against its labels first.
    pub fn put(
        &self,
        value: impl Into<Value>,
        wait: bool,
        timeout: Option<Duration>,
    ) -> Result<PutOutcome, CaError> {
        self.put_inner(value.into(), wait, timeout, None)
    }

    /// Write a value and call `callback` with the outcome once it is confirmed
    pub fn put_with_callback<F>(
        &self,
        value: impl Into<Value>,
        callback: F,
    ) -> Result<PutOutcome, CaError>
    where
        F: FnOnce(&str, Result<(), CaError>) + Send + 'static,
    {
        self.put_inner(value.into(), false, None, Some(Box::new(callback)))
    }

    fn put_inner(
        &self,
        value: Value,
        wait: bool,
        timeout: Option<Duration>,
        callback: Option<PutCallback>,
    ) -> Result<PutOutcome, CaError> {
        let channel = self.wait_for_connection(None)?;
        let value = match value {
            Value::String(label) if channel.native_type == DbrBasicType::Enum => {
                self.enum_index(&label)?
                    .map_or(Value::String(label), Value::Enum)
            }
            value => value,
        };
        self.context()?
            .put(&channel, value, wait, timeout, callback)
    }

    fn enum_index(&self, label: &str) -> Result<Option<u16>, CaError> {
        let known = self.0.state.lock().unwrap().meta.enum_strs.clone();
        let labels = match known {
            Some(labels) => labels,
            None => self.get_ctrlvars(None)?.enum_strs.unwrap_or_default(),
        };
        Ok(labels.iter().position(|l| l == label).map(|i| i as u16))
    }

    /// Call `callback` on every monitor update, monitoring the PV if it is not yet
    pub fn add_callback<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&str, &Reading) + Send + Sync + 'static,
    {
        let id = {
            let mut state = self.0.state.lock().unwrap();
            let id = state.next_id();
            state.callbacks.insert(id, Arc::new(callback));
            id
        };
        self.ensure_monitored();
        id
    }

    pub fn remove_callback(&self, id: CallbackId) -> bool {
        self.0.state.lock().unwrap().callbacks.remove(&id).is_some()
    }

    pub fn clear_callbacks(&self) {
        self.0.state.lock().unwrap().callbacks.clear();
    }

    /// Call `callback` with `(name, connected)` on every connection change
    pub fn add_connection_callback<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&str, bool) + Send + Sync + 'static,
    {
        let mut state = self.0.state.lock().unwrap();
        let id = state.next_id();
        state.connection_callbacks.insert(id, Arc::new(callback));
        id
    }

    pub fn remove_connection_callback(&self, id: CallbackId) -> bool {
        let mut state = self.0.state.lock().unwrap();
        state.connection_callbacks.remove(&id).is_some()
    }

    /// Call `callback` with the new rights whenever access rights change
    pub fn add_access_callback<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&str, Access) + Send + Sync + 'static,
    {
        let mut state = self.0.state.lock().unwrap();
        let id = state.next_id();
        state.access_callbacks.insert(id, Arc::new(callback));
        id
    }

    pub fn remove_access_callback(&self, id: CallbackId) -> bool {
        let mut state = self.0.state.lock().unwrap();
        state.access_callbacks.remove(&id).is_some()
    }

    /// A stream of updates converted to `T`, starting with the next update
    ///
    /// Monitors the PV if it is not already.
    pub fn updates<T>(&self) -> Result<PvUpdates<T>, CaError>
    where
        T: for<'a> TryFrom<&'a DbrValue>,
    {
        let receiver = self
            .0
            .updates
            .lock()
            .unwrap()
            .as_ref()
            .map(broadcast::Sender::subscribe)
            .ok_or_else(|| CaError::ChannelClosed(self.0.name.clone()))?;
        self.ensure_monitored();
        Ok(PvUpdates::new(receiver))
    }

    /// The latest known value, without any network traffic
    pub fn value(&self) -> Option<Value> {
        let state = self.0.state.lock().unwrap();
        state.reading.as_ref().map(|r| r.value.clone())
    }

    /// Everything known about the PV's metadata so far
    pub fn metadata(&self) -> Metadata {
        self.0.state.lock().unwrap().meta.clone()
    }

    pub fn severity(&self) -> Option<i16> {
        self.0.state.lock().unwrap().meta.severity
    }

    pub fn status(&self) -> Option<i16> {
        self.0.state.lock().unwrap().meta.status
    }

    pub fn timestamp(&self) -> Option<SystemTime> {
        self.0.state.lock().unwrap().meta.timestamp
    }

    pub fn units(&self) -> Option<String> {
        self.0.state.lock().unwrap().meta.units.clone()
    }

    pub fn precision(&self) -> Option<i16> {
        self.0.state.lock().unwrap().meta.precision
    }

    pub fn enum_strs(&self) -> Option<Vec<String>> {
        self.0.state.lock().unwrap().meta.enum_strs.clone()
    }

    pub fn native_type(&self) -> Option<DbrBasicType> {
        let state = self.0.state.lock().unwrap();
        state.channel.as_ref().map(|c| c.native_type)
    }

    pub fn count(&self) -> Option<usize> {
        let state = self.0.state.lock().unwrap();
        state.channel.as_ref().map(|c| c.count)
    }

    pub fn host(&self) -> Option<String> {
        let state = self.0.state.lock().unwrap();
        state.channel.as_ref().and_then(|c| c.host.clone())
    }

    pub fn access(&self) -> Access {
        self.0.state.lock().unwrap().access
    }

    /// Stop monitoring, drop every callback and forget this PV
    ///
    /// The channel is cleared too, unless something else still listens to it or
    /// monitors it. Asking the context for the PV again creates a fresh one.
    pub fn disconnect(&self) {
        let listeners = self.0.state.lock().unwrap().listeners.take();
        self.release();
        let Ok(context) = self.context() else {
            return;
        };
        context
            .inner
            .pvs
            .lock()
            .unwrap()
            .retain(|_, pv| !Arc::ptr_eq(&pv.0, &self.0));
        if let Some((connection, access)) = listeners {
            context.remove_listeners(&self.0.name, &connection, &access);
        }
        if !context.channel_in_use(&self.0.name) && context.subscription_count(&self.0.name) == 0 {
            context.close_channel(&self.0.name);
        }
    }

    pub(crate) fn release(&self) {
        if self.0.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let monitor = {
            let mut state = self.0.state.lock().unwrap();
            state.callbacks.clear();
            state.connection_callbacks.clear();
            state.access_callbacks.clear();
            state.connected = false;
            state.channel = None;
            state.monitor.take()
        };
        if let Some(monitor) = monitor {
            monitor.unsubscribe();
        }
        // Closes every update stream
        self.0.updates.lock().unwrap().take();
        debug!("Released PV {}", self.0.name);
    }
}

/// Error from [`PvUpdates::recv`]
#[derive(Debug, Error)]
pub enum UpdateRecvError {
    #[error("PV has been disconnected")]
    Closed,
    #[error("Receiver lagged by {0} updates")]
    Lagged(u64),
    #[error("Could not convert update to the requested type")]
    NoConvert(Box<Reading>),
}

impl From<broadcast::error::RecvError> for UpdateRecvError {
    fn from(err: broadcast::error::RecvError) -> Self {
        match err {
            broadcast::error::RecvError::Closed => Self::Closed,
            broadcast::error::RecvError::Lagged(n) => Self::Lagged(n),
        }
    }
}

/// Error from [`PvUpdates::try_recv`]
#[derive(Debug, Error)]
pub enum UpdateTryRecvError {
    #[error("No updates outstanding")]
    Empty,
    #[error("PV has been disconnected")]
    Closed,
    #[error("Receiver lagged by {0} updates")]
    Lagged(u64),
    #[error("Could not convert update to the requested type")]
    NoConvert(Box<Reading>),
}

impl From<broadcast::error::TryRecvError> for UpdateTryRecvError {
    fn from(err: broadcast::error::TryRecvError) -> Self {
        match err {
            broadcast::error::TryRecvError::Empty => Self::Empty,
            broadcast::error::TryRecvError::Closed => Self::Closed,
            broadcast::error::TryRecvError::Lagged(n) => Self::Lagged(n),
        }
    }
}

/// Typed stream of a PV's updates, usable from both async and blocking code
pub struct PvUpdates<T>
where
    T: for<'a> TryFrom<&'a DbrValue>,
{
    inner: broadcast::Receiver<Reading>,
    _phantom: PhantomData<T>,
}

impl<T> PvUpdates<T>
where
    T: for<'a> TryFrom<&'a DbrValue>,
{
    fn new(inner: broadcast::Receiver<Reading>) -> Self {
        Self {
            inner,
            _phantom: PhantomData,
        }
    }

    fn convert(reading: Reading) -> Result<T, Box<Reading>> {
        T::try_from(&reading.value.to_dbr_value()).map_err(|_| Box::new(reading))
    }

    /// Wait for the next update, blocking the thread
    ///
    /// Must not be called from inside an async runtime.
    pub fn blocking_recv(&mut self) -> Result<T, UpdateRecvError> {
        let reading = self.inner.blocking_recv()?;
        Self::convert(reading).map_err(UpdateRecvError::NoConvert)
    }

    pub async fn recv(&mut self) -> Result<T, UpdateRecvError> {
        let reading = self.inner.recv().await?;
        Self::convert(reading).map_err(UpdateRecvError::NoConvert)
    }

    pub fn try_recv(&mut self) -> Result<T, UpdateTryRecvError> {
        let reading = self.inner.try_recv()?;
        Self::convert(reading).map_err(UpdateTryRecvError::NoConvert)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// A second stream of the same PV, starting from the next update
    pub fn resubscribe(&self) -> Self {
        Self::new(self.inner.resubscribe())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::{ClientConfig, ContextRegistry, channel::ChannelState, transport::MemoryTransport};

    fn context(transport: &MemoryTransport, config: ClientConfig) -> Context {
        let transport = transport.clone();
        ContextRegistry::new(config, move || Arc::new(transport.clone())).create_context(false)
    }

    #[test]
    fn same_name_and_form_share_a_pv() {
        let transport = MemoryTransport::new();
        transport.add_pv("TEMP", 1.0f64).unwrap();
        let context = context(&transport, ClientConfig::default());
        let a = context.get_pv("TEMP", PvOptions::default()).unwrap();
        let b = context.get_pv("TEMP", PvOptions::default()).unwrap();
        assert_eq!(a, b);
        let ctrl = context
            .get_pv(
                "TEMP",
                PvOptions {
                    form: DecodeMode::Ctrl,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_ne!(a, ctrl);
        assert_eq!(transport.channel_count(), 1);
    }

    #[test]
    fn small_pvs_are_monitored_on_connect() {
        let transport = MemoryTransport::new();
        transport.add_pv("SMALL", vec![0i32; 4]).unwrap();
        transport.add_pv("LARGE", vec![0i32; 64]).unwrap();
        let context = context(
            &transport,
            ClientConfig::default().auto_monitor_max_elements(16),
        );
        let small = context.get_pv("SMALL", PvOptions::default()).unwrap();
        let large = context.get_pv("LARGE", PvOptions::default()).unwrap();
        small.wait_for_connection(None).unwrap();
        large.wait_for_connection(None).unwrap();
        context.pend_event(Duration::from_millis(5)).unwrap();
        assert!(small.is_monitored());
        assert!(!large.is_monitored());
        assert_eq!(transport.monitor_count("SMALL"), 1);
        assert_eq!(transport.monitor_count("LARGE"), 0);
        assert_eq!(
            large.get().unwrap(),
            Value::Array(DbrValue::Long(vec![0; 64]))
        );
    }

    #[test]
    fn enum_labels_and_strings() {
        let transport = MemoryTransport::new();
        let mode = transport.add_pv("MODE", DbrValue::Enum(vec![0])).unwrap();
        mode.set_enum_strings(&["Off", "On", "Auto"]);
        let context = context(&transport, ClientConfig::default());
        let pv = context.get_pv("MODE", PvOptions::default()).unwrap();
        assert_eq!(pv.put("Auto", true, None).unwrap(), PutOutcome::Done);
        assert_eq!(mode.load(), DbrValue::Enum(vec![2]));
        assert_eq!(pv.get_string().unwrap(), "Auto");
        assert_eq!(
            pv.enum_strs(),
            Some(vec!["Off".to_string(), "On".into(), "Auto".into()])
        );
    }

    #[test]
    fn precision_applies_to_strings() {
        let transport = MemoryTransport::new();
        let temp = transport.add_pv("TEMP", 23.456f64).unwrap();
        temp.set_precision(1);
        temp.set_units("degC");
        let context = context(&transport, ClientConfig::default());
        let pv = context.get_pv("TEMP", PvOptions::default()).unwrap();
        assert_eq!(pv.get_string().unwrap(), "23.5");
        let meta = pv.get_ctrlvars(None).unwrap();
        assert_eq!(meta.units.as_deref(), Some("degC"));
        assert_eq!(pv.units().as_deref(), Some("degC"));
    }

    #[test]
    fn callbacks_can_be_removed() {
        let transport = MemoryTransport::new();
        let source = transport.add_pv("COUNT", 0i32).unwrap();
        let context = context(&transport, ClientConfig::default());
        let pv = context
            .get_pv(
                "COUNT",
                PvOptions {
                    auto_monitor: Some(false),
                    ..Default::default()
                },
            )
            .unwrap();
        pv.wait_for_connection(None).unwrap();
        assert!(!pv.is_monitored());

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let id = pv.add_callback(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(pv.is_monitored());
        context.pend_event(Duration::from_millis(5)).unwrap();
        source.store(1).unwrap();
        context.pend_event(Duration::from_millis(5)).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        assert!(pv.remove_callback(id));
        assert!(!pv.remove_callback(id));
        source.store(2).unwrap();
        context.pend_event(Duration::from_millis(5)).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(pv.value(), Some(Value::Integer(2)));
    }

    #[test]
    fn disconnect_forgets_the_pv() {
        let transport = MemoryTransport::new();
        transport.add_pv("GONE", 1i16).unwrap();
        let context = context(&transport, ClientConfig::default());
        let pv = context.get_pv("GONE", PvOptions::default()).unwrap();
        pv.wait_for_connection(None).unwrap();
        let mut updates = pv.updates::<i16>().unwrap();
        pv.disconnect();
        assert!(matches!(
            updates.try_recv(),
            Err(UpdateTryRecvError::Closed)
        ));
        assert!(matches!(pv.get(), Err(CaError::ChannelClosed(_))));
        assert_eq!(transport.channel_count(), 0);
        let again = context.get_pv("GONE", PvOptions::default()).unwrap();
        assert_ne!(again, pv);
        assert_eq!(again.get().unwrap(), Value::Integer(1));
    }
    #[test]
    fn disconnect_leaves_other_users_alone() {
        let transport = MemoryTransport::new();
        let source = transport.add_pv("SHARED", 0i32).unwrap();
        let context = context(&transport, ClientConfig::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let monitor = context
            .camonitor("SHARED", move |_, reading| {
                sink.lock().unwrap().push(reading.value.clone())
            })
            .unwrap();
        let plain = context.get_pv("SHARED", PvOptions::default()).unwrap();
        let timed = context
            .get_pv(
                "SHARED",
                PvOptions {
                    form: DecodeMode::Time,
                    ..Default::default()
                },
            )
            .unwrap();
        plain.wait_for_connection(None).unwrap();
        timed.wait_for_connection(None).unwrap();

        plain.disconnect();
        assert!(monitor.is_active());
        assert!(timed.is_monitored());
        timed.disconnect();
        assert!(monitor.is_active());
        assert_eq!(
            context.channel_state("SHARED"),
            Some(ChannelState::Connected)
        );
        assert_eq!(transport.monitor_count("SHARED"), 1);

        source.store(7).unwrap();
        context.pend_event(Duration::from_millis(5)).unwrap();
        assert_eq!(seen.lock().unwrap().last(), Some(&Value::Integer(7)));

        assert!(context.camonitor_clear("SHARED"));
        let last = context.get_pv("SHARED", PvOptions::default()).unwrap();
        last.wait_for_connection(None).unwrap();
        last.disconnect();
        assert_eq!(context.channel_state("SHARED"), None);
    }

    #[test]
    fn clearing_the_channel_drops_the_cached_value() {
        let transport = MemoryTransport::new();
        let source = transport.add_pv("X", 1i32).unwrap();
        let context = context(&transport, ClientConfig::default());
        let pv = context.get_pv("X", PvOptions::default()).unwrap();
        assert_eq!(pv.get().unwrap(), Value::Integer(1));
        assert!(pv.is_monitored());

        context.clear_channel("X").unwrap();
        assert!(!pv.is_monitored());
        assert!(!pv.is_connected());
        assert_eq!(pv.value(), None);

        source.store(2).unwrap();
        assert_eq!(pv.get().unwrap(), Value::Integer(2));
        assert!(pv.is_monitored());
        context.pend_event(Duration::from_millis(5)).unwrap();
        source.store(3).unwrap();
        context.pend_event(Duration::from_millis(5)).unwrap();
        assert_eq!(pv.value(), Some(Value::Integer(3)));
        assert_eq!(transport.monitor_count("X"), 1);
    }
}
