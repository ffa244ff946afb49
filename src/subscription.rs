//! Long-lived monitors and the delivery of their updates.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicBool, Ordering},
    },
};

use tracing::{debug, debug_span, trace, warn};

use crate::{
    channel::ConnectedChannel,
    context::{Context, ContextInner},
    decode::{ArrayMode, DecodeMode, Reading, decode},
    error::{CaError, ErrorCondition},
    transport::{ChannelId, MonitorId, MonitorMask, RawPayload},
};

/// Called with `(name, reading)` for every update of a subscription
pub type MonitorCallback = Arc<dyn Fn(&str, &Reading) + Send + Sync>;

struct SubscriptionEntry {
    name: String,
    channel: ChannelId,
    mode: DecodeMode,
    array_mode: ArrayMode,
    callback: MonitorCallback,
    active: Arc<AtomicBool>,
}

#[derive(Default)]
pub(crate) struct SubscriptionManager {
    entries: Mutex<HashMap<MonitorId, SubscriptionEntry>>,
}

/// Handle to one monitor
///
/// Clones share the monitor. Dropping a handle does not cancel anything; call
/// [`Subscription::unsubscribe`], or clear the channel.
#[derive(Clone)]
pub struct Subscription {
    context: Weak<ContextInner>,
    monitor: MonitorId,
    name: String,
    active: Arc<AtomicBool>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("name", &self.name)
            .field("monitor", &self.monitor)
            .field("active", &self.is_active())
            .finish()
    }
}

impl Subscription {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> MonitorId {
        self.monitor
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Cancel the monitor. Calling this again does nothing.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        let Some(inner) = self.context.upgrade() else {
            return;
        };
        inner.subscriptions.entries.lock().unwrap().remove(&self.monitor);
        inner.transport.unsubscribe(self.monitor);
        debug!("Unsubscribed {} ({:?})", self.name, self.monitor);
    }
}

/// Whether a channel of `count` elements should be monitored without being asked
///
/// `requested` is an explicit opt in or out, which always wins.
pub(crate) fn should_auto_monitor(requested: Option<bool>, count: usize, max_elements: usize) -> bool {
    requested.unwrap_or(count < max_elements)
}

impl Context {
    /// Subscribe to updates of a connected channel
    ///
    /// The callback receives every update in the order the transport received
    /// them, starting with the current value.
    pub fn subscribe<F>(
        &self,
        channel: &ConnectedChannel,
        mode: DecodeMode,
        mask: MonitorMask,
        callback: F,
    ) -> Result<Subscription, CaError>
    where
        F: Fn(&str, &Reading) + Send + Sync + 'static,
    {
        self.subscribe_with(channel, mode, ArrayMode::default(), 0, mask, Arc::new(callback))
    }

    /// Subscribe with explicit array handling and element count (zero for native)
    pub fn subscribe_with(
        &self,
        channel: &ConnectedChannel,
        mode: DecodeMode,
        array_mode: ArrayMode,
        count: usize,
        mask: MonitorMask,
        callback: MonitorCallback,
    ) -> Result<Subscription, CaError> {
        self.ensure_open(channel)?;
        let _span = debug_span!("subscribe", name = %channel.name).entered();
        let wire_type = mode.wire_type(channel.native_type);
        // Holding the lock keeps the first update from being looked up before
        // the entry exists
        let mut entries = self.inner.subscriptions.entries.lock().unwrap();
        let monitor = self
            .inner
            .transport
            .subscribe(channel.id, wire_type, count, mask)
            .map_err(|status| CaError::Protocol {
                operation: "subscribe",
                name: channel.name.clone(),
                status,
                message: self.inner.transport.message(status),
            })?;
        let active = Arc::new(AtomicBool::new(true));
        entries.insert(
            monitor,
            SubscriptionEntry {
                name: channel.name.clone(),
                channel: channel.id,
                mode,
                array_mode,
                callback,
                active: active.clone(),
            },
        );
        debug!("Subscribed as {monitor:?} with {wire_type}, mask {:#x}", mask.bits());
        Ok(Subscription {
            context: self.downgrade(),
            monitor,
            name: channel.name.clone(),
            active,
        })
    }

    pub(crate) fn cancel_subscriptions_for(&self, channel: ChannelId) {
        let removed: Vec<(MonitorId, SubscriptionEntry)> = {
            let mut entries = self.inner.subscriptions.entries.lock().unwrap();
            let monitors: Vec<MonitorId> = entries
                .iter()
                .filter(|(_, e)| e.channel == channel)
                .map(|(m, _)| *m)
                .collect();
            monitors
                .into_iter()
                .filter_map(|m| entries.remove(&m).map(|e| (m, e)))
                .collect()
        };
        for (monitor, entry) in removed {
            entry.active.store(false, Ordering::SeqCst);
            self.inner.transport.unsubscribe(monitor);
            trace!("Cancelled {monitor:?} of {}", entry.name);
        }
    }

    /// Number of live subscriptions on a channel
    pub fn subscription_count(&self, name: &str) -> usize {
        let entries = self.inner.subscriptions.entries.lock().unwrap();
        entries.values().filter(|e| e.name == name).count()
    }

    pub(crate) fn handle_monitor(
        &self,
        monitor: MonitorId,
        result: Result<RawPayload, ErrorCondition>,
    ) {
        let target = {
            let entries = self.inner.subscriptions.entries.lock().unwrap();
            entries.get(&monitor).map(|e| {
                (
                    e.name.clone(),
                    e.mode,
                    e.array_mode,
                    e.callback.clone(),
                    e.active.clone(),
                )
            })
        };
        let Some((name, mode, array_mode, callback, active)) = target else {
            trace!("Dropping update for cancelled {monitor:?}");
            return;
        };
        let payload = match result {
            Ok(payload) => payload,
            Err(status) => {
                warn!(
                    "Monitor update for {name} failed: {}",
                    self.inner.transport.message(status)
                );
                return;
            }
        };
        match decode(&payload.data, payload.count, payload.data_type, array_mode) {
            Ok(reading) => {
                trace!("Update for {name} ({mode:?}): {:?}", reading.value);
                // The subscription may have been cancelled since the lookup
                if active.load(Ordering::SeqCst) {
                    callback(&name, &reading);
                }
            }
            Err(e) => warn!("Could not decode update for {name}: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{ClientConfig, ContextRegistry, decode::Value, transport::MemoryTransport};

    #[test]
    fn auto_monitor_policy() {
        assert!(should_auto_monitor(None, 1, 65536));
        assert!(!should_auto_monitor(None, 100_000, 65536));
        assert!(!should_auto_monitor(Some(false), 1, 65536));
        assert!(should_auto_monitor(Some(true), 100_000, 65536));
    }

    #[test]
    fn updates_arrive_in_order_until_cancelled() {
        let transport = MemoryTransport::new();
        let pv = transport.add_pv("COUNTER", 0i32).unwrap();
        let factory = transport.clone();
        let context = ContextRegistry::new(ClientConfig::default(), move || {
            Arc::new(factory.clone())
        })
        .create_context(false);
        let channel = context.wait_for_connect("COUNTER", None).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let sub = context
            .subscribe(
                &channel,
                DecodeMode::Time,
                MonitorMask::default(),
                move |_, reading| sink.lock().unwrap().push(reading.value.clone()),
            )
            .unwrap();
        for i in 1..=3 {
            pv.store(i).unwrap();
        }
        context.pend_event(Duration::from_millis(10)).unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            (0..=3).map(Value::Integer).collect::<Vec<_>>()
        );

        sub.unsubscribe();
        sub.unsubscribe();
        assert!(!sub.is_active());
        pv.store(4).unwrap();
        context.pend_event(Duration::from_millis(10)).unwrap();
        assert_eq!(seen.lock().unwrap().len(), 4);
        assert_eq!(transport.monitor_count("COUNTER"), 0);
    }
}
