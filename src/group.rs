//! Synchronous groups: gets and puts issued together and completed together.
//!
//! ```no_run
//! # use std::time::Duration;
//! # use epicars_runtime::{Context, decode::DecodeMode};
//! # fn run(context: &Context) -> Result<(), epicars_runtime::CaError> {
//! let a = context.wait_for_connect("A", None)?;
//! let b = context.wait_for_connect("B", None)?;
//! let group = context.create_group()?;
//! let slot = group.get(&a, DecodeMode::Native, 0)?;
//! group.put(&b, 1.5)?;
//! group.block(Duration::from_secs(1))?;
//! println!("{:?}", group.value(slot));
//! # Ok(())
//! # }
//! ```

use std::{sync::Weak, time::Duration};

use tracing::debug;

use crate::{
    channel::ConnectedChannel,
    context::{Context, ContextInner, ensure_blocking_allowed},
    decode::{DecodeMode, Reading, Value},
    error::CaError,
    transport::IoId,
};

/// Where the result of one grouped get will be found
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct GroupSlot(IoId);

/// A set of operations whose completion is awaited as one
///
/// Dropping the group forgets its operations.
#[derive(Debug)]
pub struct SyncGroup {
    context: Weak<ContextInner>,
    id: u32,
}

impl Context {
    pub fn create_group(&self) -> Result<SyncGroup, CaError> {
        self.ensure_alive()?;
        let id = self.next_group_id();
        debug!("Created synchronous group {id}");
        Ok(SyncGroup {
            context: self.downgrade(),
            id,
        })
    }
}

impl SyncGroup {
    pub fn id(&self) -> u32 {
        self.id
    }

    fn context(&self) -> Result<Context, CaError> {
        Context::from_weak(&self.context)
    }

    /// Queue a get; its value is available from [`SyncGroup::value`] once complete
    ///
    /// Nothing is sent until [`SyncGroup::block`] or [`SyncGroup::test`].
    pub fn get(
        &self,
        channel: &ConnectedChannel,
        mode: DecodeMode,
        count: usize,
    ) -> Result<GroupSlot, CaError> {
        let ioid = self.context()?.group_get(self.id, channel, mode, count)?;
        Ok(GroupSlot(ioid))
    }

    /// Queue a put. Completion is only reported through [`SyncGroup::block`].
    pub fn put(&self, channel: &ConnectedChannel, value: impl Into<Value>) -> Result<(), CaError> {
        self.context()?.group_put(self.id, channel, value.into())?;
        Ok(())
    }

    /// Wait for every operation added since the last reset
    ///
    /// Fails with [`CaError::Timeout`] if any is still outstanding at the deadline,
    /// or with the first failure reported by a member.
    pub fn block(&self, timeout: Duration) -> Result<(), CaError> {
        ensure_blocking_allowed("group block")?;
        let context = self.context()?;
        context.flush_io();
        if !context.wait_until(timeout, || context.group_settled(self.id)) {
            return Err(CaError::Timeout {
                operation: "group block",
                name: format!("group {}", self.id),
                timeout,
            });
        }
        match context.group_failure(self.id) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Whether every operation has completed, without waiting
    pub fn test(&self) -> bool {
        let Ok(context) = self.context() else {
            return false;
        };
        context.flush_io();
        context.poll_nonblocking();
        context.group_settled(self.id)
    }

    /// The value read by a grouped get, once it has arrived
    pub fn value(&self, slot: GroupSlot) -> Option<Reading> {
        self.context().ok()?.group_reading(slot.0)
    }

    /// Forget every operation; answers still in flight are discarded
    pub fn reset(&self) {
        if let Some(inner) = self.context.upgrade() {
            Context { inner }.forget_group(self.id);
        }
    }

    pub fn delete(self) {}
}

impl Drop for SyncGroup {
    fn drop(&mut self) {
        self.reset();
    }
}
