//! The per-context channel cache, and the connection state machine of its entries.
//!
//! Every channel name has at most one [`CachedChannel`] per context. Its state moves
//! `Unconnected → ConnectPending → Connected`, falls back to `ConnectPending` when the
//! server goes away, and ends in `Closed` once cleared. All mutation happens under
//! the cache lock; listeners are called after it is released.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use tracing::{debug, debug_span, trace, warn};

use crate::{
    context::{Context, ensure_blocking_allowed},
    dbr::DbrBasicType,
    error::{CaError, ErrorCondition},
    transport::{Access, ChannelId},
};

/// Called with `(name, connected)` on every connection transition
pub type ConnectionListener = Arc<dyn Fn(&str, bool) + Send + Sync>;
/// Called with `(name, access)` whenever access rights are reported
pub type AccessListener = Arc<dyn Fn(&str, Access) + Send + Sync>;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChannelState {
    Unconnected,
    ConnectPending,
    Connected,
    Closed,
}

pub(crate) struct CachedChannel {
    name: String,
    id: ChannelId,
    state: ChannelState,
    last_transition: Instant,
    failures: u32,
    /// The current connection attempt has already been counted as failed
    attempt_failed: bool,
    listeners: Vec<ConnectionListener>,
    access_listeners: Vec<AccessListener>,
    native_type: Option<DbrBasicType>,
    count: usize,
    access: Access,
    host: Option<String>,
}

impl CachedChannel {
    fn new(name: &str, id: ChannelId, listeners: Vec<ConnectionListener>) -> Self {
        CachedChannel {
            name: name.to_string(),
            id,
            state: ChannelState::Unconnected,
            last_transition: Instant::now(),
            failures: 0,
            attempt_failed: false,
            listeners,
            access_listeners: Vec::new(),
            native_type: None,
            count: 0,
            access: Access::None,
            host: None,
        }
    }

    fn transition(&mut self, to: ChannelState) {
        trace!("{}: {:?} -> {to:?}", self.name, self.state);
        self.state = to;
        self.last_transition = Instant::now();
    }

    /// Count the current attempt as failed, once
    fn record_failure(&mut self) {
        if !self.attempt_failed {
            self.attempt_failed = true;
            self.failures += 1;
        }
        self.last_transition = Instant::now();
    }

    fn snapshot(&self) -> Option<ConnectedChannel> {
        if self.state != ChannelState::Connected {
            return None;
        }
        Some(ConnectedChannel {
            name: self.name.clone(),
            id: self.id,
            native_type: self.native_type?,
            count: self.count,
            access: self.access,
            host: self.host.clone(),
        })
    }

    fn info(&self) -> ChannelInfo {
        ChannelInfo {
            name: self.name.clone(),
            state: self.state,
            native_type: self.native_type,
            count: self.count,
            access: self.access,
            host: self.host.clone(),
            failures: self.failures,
            last_transition: self.last_transition,
        }
    }
}

#[derive(Default)]
struct ChannelTable {
    by_name: HashMap<String, CachedChannel>,
    by_id: HashMap<ChannelId, String>,
}

impl ChannelTable {
    fn by_id_mut(&mut self, id: ChannelId) -> Option<&mut CachedChannel> {
        let name = self.by_id.get(&id)?;
        self.by_name.get_mut(name)
    }
}

#[derive(Default)]
pub(crate) struct ChannelCache {
    table: Mutex<ChannelTable>,
}

/// Proof that a channel was connected, with what it reported at that moment
///
/// Only produced by a successful connect, and required by every get, put and
/// subscribe.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectedChannel {
    pub name: String,
    pub(crate) id: ChannelId,
    pub native_type: DbrBasicType,
    pub count: usize,
    pub access: Access,
    pub host: Option<String>,
}

impl ConnectedChannel {
    pub fn id(&self) -> ChannelId {
        self.id
    }
}

/// A point-in-time view of a cached channel
#[derive(Debug, Clone)]
pub struct ChannelInfo {
    pub name: String,
    pub state: ChannelState,
    pub native_type: Option<DbrBasicType>,
    pub count: usize,
    pub access: Access,
    pub host: Option<String>,
    /// Consecutive failed connection attempts or losses
    pub failures: u32,
    pub last_transition: Instant,
}

impl Context {
    /// Start connecting to a channel, or join an existing connection attempt
    ///
    /// Returns the transport handle; repeated calls for one name return the same
    /// handle. A listener added to an already connected channel is called with
    /// `(name, true)` before this returns.
    pub fn create_channel(
        &self,
        name: &str,
        listener: Option<ConnectionListener>,
    ) -> Result<ChannelId, CaError> {
        self.ensure_alive()?;
        let (id, notify) = {
            let mut table = self.inner.channels.table.lock().unwrap();
            if let Some(channel) = table.by_name.get_mut(name) {
                let mut notify = None;
                if let Some(listener) = listener {
                    if channel.state == ChannelState::Connected {
                        notify = Some(listener.clone());
                    }
                    channel.listeners.push(listener);
                }
                (channel.id, notify)
            } else {
                let _span = debug_span!("create_channel", name).entered();
                let id = self
                    .inner
                    .transport
                    .create_channel(name, self.inner.events_tx.clone());
                debug!("Created channel {id:?}");
                let mut channel = CachedChannel::new(name, id, listener.into_iter().collect());
                channel.transition(ChannelState::ConnectPending);
                table.by_id.insert(id, name.to_string());
                table.by_name.insert(name.to_string(), channel);
                (id, None)
            }
        };
        if let Some(listener) = notify {
            listener(name, true);
        }
        Ok(id)
    }

    /// Add an access rights listener, calling it at once if rights are known
    pub fn add_access_listener(
        &self,
        name: &str,
        listener: AccessListener,
    ) -> Result<(), CaError> {
        let current = {
            let mut table = self.inner.channels.table.lock().unwrap();
            let channel = table
                .by_name
                .get_mut(name)
                .ok_or_else(|| CaError::ChannelClosed(name.to_string()))?;
            channel.access_listeners.push(listener.clone());
            (channel.state == ChannelState::Connected).then_some(channel.access)
        };
        if let Some(access) = current {
            listener(name, access);
        }
        Ok(())
    }

    /// Close a channel, cancelling its monitors and failing its pending operations
    pub fn clear_channel(&self, name: &str) -> Result<(), CaError> {
        self.ensure_alive()?;
        if self.close_channel(name) {
            Ok(())
        } else {
            Err(CaError::ChannelClosed(name.to_string()))
        }
    }

    pub(crate) fn close_channel(&self, name: &str) -> bool {
        let removed = {
            let mut table = self.inner.channels.table.lock().unwrap();
            let removed = table.by_name.remove(name);
            if let Some(channel) = &removed {
                table.by_id.remove(&channel.id);
            }
            removed
        };
        let Some(mut channel) = removed else {
            return false;
        };
        let _span = debug_span!("clear_channel", name).entered();
        channel.transition(ChannelState::Closed);
        self.cancel_subscriptions_for(channel.id);
        self.fail_operations_for(channel.id, CaError::ChannelClosed(name.to_string()));
        self.detach_pvs(name);
        self.inner.transport.clear_channel(channel.id);
        debug!("Channel closed");
        true
    }

    /// Drop one connection listener and one access listener, matched by identity
    pub(crate) fn remove_listeners(
        &self,
        name: &str,
        connection: &ConnectionListener,
        access: &AccessListener,
    ) {
        let mut table = self.inner.channels.table.lock().unwrap();
        if let Some(channel) = table.by_name.get_mut(name) {
            channel.listeners.retain(|l| !Arc::ptr_eq(l, connection));
            channel.access_listeners.retain(|l| !Arc::ptr_eq(l, access));
        }
    }

    /// Whether anyone still listens to the channel's connection or access rights
    pub(crate) fn channel_in_use(&self, name: &str) -> bool {
        let table = self.inner.channels.table.lock().unwrap();
        table
            .by_name
            .get(name)
            .is_some_and(|c| !c.listeners.is_empty() || !c.access_listeners.is_empty())
    }

    /// Wait until a channel is connected, creating it if needed
    ///
    /// On timeout [`CaError::NotConnected`] is returned and the attempt counted as
    /// failed, once however often it is waited on. The channel stays cached, so a
    /// later call carries on waiting.
    pub fn wait_for_connect(
        &self,
        name: &str,
        timeout: Option<Duration>,
    ) -> Result<ConnectedChannel, CaError> {
        if let Some(channel) = self.connected(name) {
            return Ok(channel);
        }
        ensure_blocking_allowed("wait_for_connect")?;
        self.create_channel(name, None)?;
        let timeout = timeout.unwrap_or(self.inner.config.connect_timeout);
        self.wait_until(timeout, || self.connected(name).is_some());
        if let Some(channel) = self.connected(name) {
            return Ok(channel);
        }
        self.ensure_alive()?;
        {
            let mut table = self.inner.channels.table.lock().unwrap();
            if let Some(channel) = table.by_name.get_mut(name) {
                channel.record_failure();
            }
        }
        warn!("Channel {name} did not connect within {timeout:?}");
        Err(CaError::NotConnected {
            name: name.to_string(),
            timeout,
        })
    }

    /// A snapshot of the channel if it is connected right now
    pub fn connected(&self, name: &str) -> Option<ConnectedChannel> {
        let table = self.inner.channels.table.lock().unwrap();
        table.by_name.get(name).and_then(CachedChannel::snapshot)
    }

    /// Fail with [`CaError::ChannelClosed`] if the channel behind a snapshot is gone
    pub(crate) fn ensure_open(&self, channel: &ConnectedChannel) -> Result<(), CaError> {
        self.ensure_alive()?;
        let table = self.inner.channels.table.lock().unwrap();
        match table.by_name.get(&channel.name) {
            Some(cached) if cached.id == channel.id => Ok(()),
            _ => Err(CaError::ChannelClosed(channel.name.clone())),
        }
    }

    pub fn channel_state(&self, name: &str) -> Option<ChannelState> {
        let table = self.inner.channels.table.lock().unwrap();
        table.by_name.get(name).map(|c| c.state)
    }

    pub fn failure_count(&self, name: &str) -> Option<u32> {
        let table = self.inner.channels.table.lock().unwrap();
        table.by_name.get(name).map(|c| c.failures)
    }

    pub fn channel_info(&self, name: &str) -> Option<ChannelInfo> {
        let table = self.inner.channels.table.lock().unwrap();
        table.by_name.get(name).map(CachedChannel::info)
    }

    pub fn channel_names(&self) -> Vec<String> {
        let table = self.inner.channels.table.lock().unwrap();
        table.by_name.keys().cloned().collect()
    }

    pub(crate) fn channel_name(&self, id: ChannelId) -> Option<String> {
        let table = self.inner.channels.table.lock().unwrap();
        table.by_id.get(&id).cloned()
    }

    pub(crate) fn handle_connection(&self, id: ChannelId, connected: bool) {
        let transport = &self.inner.transport;
        let (name, listeners) = {
            let mut table = self.inner.channels.table.lock().unwrap();
            let Some(channel) = table.by_id_mut(id) else {
                trace!("Connection event for unknown channel {id:?}");
                return;
            };
            let _span = debug_span!("connection", name = %channel.name).entered();
            if connected {
                if channel.state == ChannelState::Connected {
                    return;
                }
                channel.transition(ChannelState::Connected);
                channel.failures = 0;
                channel.attempt_failed = false;
                channel.native_type = transport.field_type(id);
                channel.count = transport.element_count(id);
                channel.access = transport.access(id);
                channel.host = transport.host_name(id);
                debug!(
                    "Connected: {:?} x {} on {:?}",
                    channel.native_type, channel.count, channel.host
                );
            } else {
                if channel.state != ChannelState::Connected {
                    return;
                }
                channel.transition(ChannelState::ConnectPending);
                channel.record_failure();
                debug!("Disconnected");
            }
            (channel.name.clone(), channel.listeners.clone())
        };
        if !connected {
            self.fail_operations_for(
                id,
                CaError::Protocol {
                    operation: "connection",
                    name: name.clone(),
                    status: ErrorCondition::Disconn,
                    message: transport.message(ErrorCondition::Disconn),
                },
            );
        }
        for listener in listeners {
            listener(&name, connected);
        }
    }

    pub(crate) fn handle_access_rights(&self, id: ChannelId, access: Access) {
        let (name, listeners) = {
            let mut table = self.inner.channels.table.lock().unwrap();
            let Some(channel) = table.by_id_mut(id) else {
                return;
            };
            channel.access = access;
            (channel.name.clone(), channel.access_listeners.clone())
        };
        trace!("Access rights for {name}: {access:?}");
        for listener in listeners {
            listener(&name, access);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{ClientConfig, ContextRegistry, transport::MemoryTransport};

    fn context(transport: &MemoryTransport) -> Context {
        let transport = transport.clone();
        ContextRegistry::new(ClientConfig::default().preemptive(false), move || {
            Arc::new(transport.clone())
        })
        .create_context(false)
    }

    #[test]
    fn states_follow_the_server() {
        let transport = MemoryTransport::new();
        let pv = transport.add_pv("TEST", 1.0f64).unwrap();
        let context = context(&transport);
        context.create_channel("TEST", None).unwrap();
        assert_eq!(
            context.channel_state("TEST"),
            Some(ChannelState::ConnectPending)
        );
        let channel = context
            .wait_for_connect("TEST", Some(Duration::from_secs(1)))
            .unwrap();
        assert_eq!(channel.native_type, DbrBasicType::Double);
        assert_eq!(channel.access, Access::ReadWrite);

        pv.set_online(false);
        context.pend_event(Duration::from_millis(5)).unwrap();
        assert_eq!(
            context.channel_state("TEST"),
            Some(ChannelState::ConnectPending)
        );
        assert_eq!(context.failure_count("TEST"), Some(1));

        pv.set_online(true);
        context
            .wait_for_connect("TEST", Some(Duration::from_secs(1)))
            .unwrap();
        assert_eq!(context.failure_count("TEST"), Some(0));

        context.clear_channel("TEST").unwrap();
        assert_eq!(context.channel_state("TEST"), None);
        assert!(matches!(
            context.clear_channel("TEST"),
            Err(CaError::ChannelClosed(_))
        ));
        assert_eq!(transport.channel_count(), 0);
    }

    #[test]
    fn failures_count_each_attempt_once() {
        let transport = MemoryTransport::new();
        let context = context(&transport);
        for _ in 0..3 {
            assert!(matches!(
                context.wait_for_connect("LATE", Some(Duration::from_millis(5))),
                Err(CaError::NotConnected { .. })
            ));
        }
        assert_eq!(context.failure_count("LATE"), Some(1));

        let pv = transport.add_pv("LATE", 1i32).unwrap();
        context.wait_for_connect("LATE", None).unwrap();
        assert_eq!(context.failure_count("LATE"), Some(0));
        pv.set_online(false);
        context.pend_event(Duration::from_millis(5)).unwrap();
        let _ = context.wait_for_connect("LATE", Some(Duration::from_millis(5)));
        assert_eq!(context.failure_count("LATE"), Some(1));
    }

    #[test]
    fn new_entries_start_unconnected() {
        let mut channel = CachedChannel::new("TEST", ChannelId(1), Vec::new());
        assert_eq!(channel.state, ChannelState::Unconnected);
        assert_eq!(channel.snapshot(), None);
        channel.transition(ChannelState::ConnectPending);
        assert_eq!(channel.info().state, ChannelState::ConnectPending);
    }

    #[test]
    fn listeners_see_every_transition() {
        let transport = MemoryTransport::new();
        let pv = transport.add_pv("TEST", 1i32).unwrap();
        let context = context(&transport);
        let transitions = Arc::new(Mutex::new(Vec::new()));
        let seen = transitions.clone();
        context
            .create_channel(
                "TEST",
                Some(Arc::new(move |_: &str, up: bool| {
                    seen.lock().unwrap().push(up)
                })),
            )
            .unwrap();
        context.wait_for_connect("TEST", None).unwrap();
        pv.set_online(false);
        context.pend_event(Duration::from_millis(5)).unwrap();
        assert_eq!(*transitions.lock().unwrap(), vec![true, false]);
    }

    #[test]
    fn access_listeners() {
        let transport = MemoryTransport::new();
        let pv = transport.add_pv("TEST", 1i32).unwrap();
        let context = context(&transport);
        context.wait_for_connect("TEST", None).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        context
            .add_access_listener(
                "TEST",
                Arc::new(move |_: &str, _: Access| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        pv.set_access(Access::Read);
        context.pend_event(Duration::from_millis(5)).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            context.channel_info("TEST").unwrap().access,
            Access::Read
        );
    }
}
