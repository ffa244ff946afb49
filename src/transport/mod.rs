//! The boundary to whatever actually speaks CA on the wire.
//!
//! A [`Transport`] owns channel handles, issues requests and reports every
//! asynchronous outcome as a [`TransportEvent`] posted onto the sender it was given
//! when the channel was created. Nothing in a transport ever calls back into the
//! runtime directly; the owning [`crate::Context`] drains its queue from one
//! dispatcher.

use std::time::Duration;

use tokio::sync::mpsc;

use crate::{
    dbr::{DbrBasicType, DbrType, DbrValue},
    error::ErrorCondition,
};

mod memory;

pub use memory::{MemoryPv, MemoryTransport, PvAlreadyExists};

/// Transport handle for one channel
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u32);

/// Transport handle for one monitor (event subscription)
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MonitorId(pub u32);

/// Identifies one get or callback put until its completion arrives
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IoId(pub u32);

/// Access rights a server grants this client on a channel
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum Access {
    #[default]
    None = 0,
    Read = 1,
    Write = 2,
    ReadWrite = 3,
}

impl Access {
    pub fn can_read(&self) -> bool {
        matches!(self, Access::Read | Access::ReadWrite)
    }
    pub fn can_write(&self) -> bool {
        matches!(self, Access::Write | Access::ReadWrite)
    }
}

/// Selects which kinds of record change a monitor is notified of
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct MonitorMask {
    /// `DBE_VALUE`, a change beyond the monitor deadband
    pub value: bool,
    /// `DBE_LOG`, a change beyond the archive deadband
    pub log: bool,
    /// `DBE_ALARM`, a change in alarm status or severity
    pub alarm: bool,
    /// `DBE_PROPERTY`, a change in metadata such as units or limits
    pub property: bool,
}

impl MonitorMask {
    pub const VALUE: u16 = 0x01;
    pub const LOG: u16 = 0x02;
    pub const ALARM: u16 = 0x04;
    pub const PROPERTY: u16 = 0x08;

    pub fn bits(&self) -> u16 {
        let mut bits = 0;
        if self.value {
            bits |= Self::VALUE;
        }
        if self.log {
            bits |= Self::LOG;
        }
        if self.alarm {
            bits |= Self::ALARM;
        }
        if self.property {
            bits |= Self::PROPERTY;
        }
        bits
    }

    pub fn from_bits(bits: u16) -> Self {
        Self {
            value: bits & Self::VALUE != 0,
            log: bits & Self::LOG != 0,
            alarm: bits & Self::ALARM != 0,
            property: bits & Self::PROPERTY != 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bits() == 0
    }
}

impl Default for MonitorMask {
    fn default() -> Self {
        Self::from_bits(Self::VALUE | Self::ALARM)
    }
}

/// A DBR payload exactly as a transport received it
#[derive(Debug, Clone, PartialEq)]
pub struct RawPayload {
    pub data_type: DbrType,
    pub count: usize,
    pub data: Vec<u8>,
}

/// Asynchronous outcomes reported by a transport
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connection {
        channel: ChannelId,
        connected: bool,
    },
    AccessRights {
        channel: ChannelId,
        access: Access,
    },
    ReadComplete {
        ioid: IoId,
        result: Result<RawPayload, ErrorCondition>,
    },
    WriteComplete {
        ioid: IoId,
        status: ErrorCondition,
    },
    Monitor {
        monitor: MonitorId,
        result: Result<RawPayload, ErrorCondition>,
    },
}

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

/// Primitives a CA implementation provides to the runtime
///
/// Requests return immediately. Anything that completes later is reported through
/// the [`EventSender`] registered for the channel. A `count` of zero asks for the
/// native element count of the channel.
pub trait Transport: Send + Sync {
    /// Start connecting a channel. Connection changes are posted to `events`.
    fn create_channel(&self, name: &str, events: EventSender) -> ChannelId;
    fn clear_channel(&self, channel: ChannelId);

    fn is_connected(&self, channel: ChannelId) -> bool;
    fn field_type(&self, channel: ChannelId) -> Option<DbrBasicType>;
    fn element_count(&self, channel: ChannelId) -> usize;
    fn host_name(&self, channel: ChannelId) -> Option<String>;
    fn access(&self, channel: ChannelId) -> Access;

    /// Request a read, answered by [`TransportEvent::ReadComplete`] with `ioid`
    fn get(
        &self,
        channel: ChannelId,
        data_type: DbrType,
        count: usize,
        ioid: IoId,
    ) -> Result<(), ErrorCondition>;
    /// Write without asking for completion
    fn put(&self, channel: ChannelId, value: &DbrValue) -> Result<(), ErrorCondition>;
    /// Write, answered by [`TransportEvent::WriteComplete`] with `ioid`
    fn put_with_callback(
        &self,
        channel: ChannelId,
        value: &DbrValue,
        ioid: IoId,
    ) -> Result<(), ErrorCondition>;

    fn subscribe(
        &self,
        channel: ChannelId,
        data_type: DbrType,
        count: usize,
        mask: MonitorMask,
    ) -> Result<MonitorId, ErrorCondition>;
    fn unsubscribe(&self, monitor: MonitorId);

    /// Process outstanding transport work for at most `timeout`
    fn pend_event(&self, timeout: Duration);
    /// Send any buffered requests
    fn flush_io(&self) {}
    /// Human readable text for a status code
    fn message(&self, status: ErrorCondition) -> String {
        status.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monitor_mask_bits() {
        let mask = MonitorMask::default();
        assert_eq!(mask.bits(), 5);
        assert!(mask.value && mask.alarm && !mask.log && !mask.property);
        assert_eq!(MonitorMask::from_bits(0x0f).bits(), 0x0f);
        assert!(MonitorMask::from_bits(0).is_empty());
    }

    #[test]
    fn access_rights() {
        assert!(Access::ReadWrite.can_write());
        assert!(Access::Read.can_read());
        assert!(!Access::Read.can_write());
        assert!(!Access::default().can_read());
    }
}
