//! Runtime configuration shared by every context of a registry.

use std::time::Duration;

use crate::{
    transport::MonitorMask,
    utils::{
        get_default_auto_monitor_max_elements, get_default_connect_timeout,
        get_default_preemptive,
    },
};

/// Tunables for a [`crate::ContextRegistry`]
///
/// Built with [`ClientConfig::default`] or [`ClientConfig::from_env`], then adjusted
/// with the builder-style setters:
///
/// ```
/// # use std::time::Duration;
/// use epicars_runtime::ClientConfig;
/// let config = ClientConfig::default()
///     .connect_timeout(Duration::from_millis(500))
///     .preemptive(false);
/// ```
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub(crate) connect_timeout: Duration,
    pub(crate) put_timeout: Duration,
    pub(crate) get_timeout: Duration,
    pub(crate) auto_monitor_max_elements: usize,
    pub(crate) poll_interval: Duration,
    pub(crate) monitor_mask: MonitorMask,
    pub(crate) preemptive: bool,
    pub(crate) update_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
            put_timeout: Duration::from_secs(30),
            get_timeout: Duration::from_secs(1),
            auto_monitor_max_elements: 65536,
            poll_interval: Duration::from_millis(1),
            monitor_mask: MonitorMask::default(),
            preemptive: true,
            update_capacity: 32,
        }
    }
}

impl ClientConfig {
    /// Defaults, overridden by `CA_CONNECT_TIMEOUT`, `CA_AUTO_MONITOR_MAX_ELEMENTS`
    /// and `CA_PREEMPTIVE_CALLBACK` where set
    pub fn from_env() -> Self {
        Self {
            connect_timeout: get_default_connect_timeout(),
            auto_monitor_max_elements: get_default_auto_monitor_max_elements(),
            preemptive: get_default_preemptive(),
            ..Default::default()
        }
    }
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
    pub fn put_timeout(mut self, timeout: Duration) -> Self {
        self.put_timeout = timeout;
        self
    }
    /// Base timeout for a get, before scaling by element count
    pub fn get_timeout(mut self, timeout: Duration) -> Self {
        self.get_timeout = timeout;
        self
    }
    pub fn auto_monitor_max_elements(mut self, count: usize) -> Self {
        self.auto_monitor_max_elements = count;
        self
    }
    /// Length of each slice of event processing inside blocking calls
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_micros(100));
        self
    }
    pub fn monitor_mask(mut self, mask: MonitorMask) -> Self {
        self.monitor_mask = mask;
        self
    }
    pub fn preemptive(mut self, preemptive: bool) -> Self {
        self.preemptive = preemptive;
        self
    }
    /// Number of updates buffered for each [`crate::PvUpdates`] receiver
    pub fn update_capacity(mut self, capacity: usize) -> Self {
        self.update_capacity = capacity.max(1);
        self
    }

    pub fn default_connect_timeout(&self) -> Duration {
        self.connect_timeout
    }
    pub fn default_put_timeout(&self) -> Duration {
        self.put_timeout
    }

    /// Get timeout for a request of `count` elements: base + log10(count) seconds
    pub fn get_timeout_for(&self, count: usize) -> Duration {
        let scale = (count.max(1) as f64).log10();
        self.get_timeout + Duration::from_secs_f64(scale)
    }
}
