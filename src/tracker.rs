//! Pending gets and callback puts, and the delivery of their completions.
//!
//! Every request that expects an answer gets an [`IoId`]. The answer arrives as a
//! transport event and is stored against that id until whoever is waiting for it
//! collects the result. A channel has at most one in-flight get of its own for each
//! requested type; callers asking again while one is outstanding share it.

use std::{collections::HashMap, sync::Mutex, time::Duration};

use tracing::{debug, trace, warn};

use crate::{
    channel::ConnectedChannel,
    context::{Context, ensure_blocking_allowed},
    dbr::{DbrType, DbrValue},
    decode::{ArrayMode, DecodeMode, Reading, Value, decode},
    error::{CaError, ErrorCondition},
    transport::{ChannelId, IoId, RawPayload},
    utils::wrapping_inplace_add,
};

/// Called once with `(name, result)` when a callback put completes
pub type PutCallback = Box<dyn FnOnce(&str, Result<(), CaError>) + Send>;

/// Result of a get that may not have been waited for
#[derive(Debug, Clone, PartialEq)]
pub enum GetOutcome {
    Ready(Reading),
    /// Requested; collect it later with [`Context::complete`]
    Incomplete,
}

/// Result of a put that succeeded as far as the caller asked to know
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    /// Handed to the transport; completion is not being tracked by the caller
    Sent,
    /// The server confirmed the write
    Done,
}

#[derive(Debug)]
enum OpState<T> {
    Pending,
    Complete(T),
    Failed(CaError),
}

impl<T> OpState<T> {
    fn is_pending(&self) -> bool {
        matches!(self, OpState::Pending)
    }
}

struct PendingGet {
    name: String,
    channel: ChannelId,
    count: usize,
    array_mode: ArrayMode,
    state: OpState<Reading>,
    /// Callers currently blocked in [`Context::complete`]
    waiters: usize,
    group: Option<u32>,
}

struct PendingPut {
    name: String,
    channel: ChannelId,
    callback: Option<PutCallback>,
    state: OpState<()>,
    group: Option<u32>,
}

#[derive(Default)]
struct TrackerState {
    next_ioid: u32,
    next_group: u32,
    gets: HashMap<IoId, PendingGet>,
    puts: HashMap<IoId, PendingPut>,
    /// The get each channel currently shares between callers, per requested type
    channel_gets: HashMap<(ChannelId, DbrType), IoId>,
}

impl TrackerState {
    fn next_ioid(&mut self) -> IoId {
        IoId(wrapping_inplace_add(&mut self.next_ioid))
    }

    /// The shared get of a channel, if it is still worth joining
    fn joinable_get(&mut self, key: (ChannelId, DbrType)) -> Option<IoId> {
        let ioid = *self.channel_gets.get(&key)?;
        match self.gets.get(&ioid) {
            Some(get) if get.state.is_pending() || get.waiters > 0 => Some(ioid),
            _ => {
                // Answered earlier and never collected
                self.gets.remove(&ioid);
                self.channel_gets.remove(&key);
                None
            }
        }
    }
}

#[derive(Default)]
pub(crate) struct CompletionTracker {
    inner: Mutex<TrackerState>,
}

impl Context {
    pub(crate) fn protocol_error(
        &self,
        operation: &'static str,
        name: &str,
        status: ErrorCondition,
    ) -> CaError {
        CaError::Protocol {
            operation,
            name: name.to_string(),
            status,
            message: self.inner.transport.message(status),
        }
    }

    fn effective_count(channel: &ConnectedChannel, count: usize) -> usize {
        if count == 0 { channel.count } else { count }
    }

    /// Read a channel, in its native type promoted according to `mode`
    ///
    /// A `count` of zero reads every element. With `wait`, blocks until the value
    /// arrives or `timeout` passes (by default one second plus `log10(count)`);
    /// otherwise returns [`GetOutcome::Incomplete`] and the value is collected with
    /// [`Context::complete`].
    pub fn get(
        &self,
        channel: &ConnectedChannel,
        mode: DecodeMode,
        count: usize,
        wait: bool,
        timeout: Option<Duration>,
    ) -> Result<GetOutcome, CaError> {
        self.get_with(channel, mode, ArrayMode::default(), count, wait, timeout)
    }

    /// [`Context::get`] with a choice of array representation
    pub fn get_with(
        &self,
        channel: &ConnectedChannel,
        mode: DecodeMode,
        array_mode: ArrayMode,
        count: usize,
        wait: bool,
        timeout: Option<Duration>,
    ) -> Result<GetOutcome, CaError> {
        if wait {
            ensure_blocking_allowed("get")?;
        }
        self.ensure_open(channel)?;
        let wire_type = mode.wire_type(channel.native_type);
        {
            let mut state = self.inner.tracker.inner.lock().unwrap();
            if let Some(ioid) = state.joinable_get((channel.id, wire_type)) {
                trace!("Sharing pending get {ioid:?} of {}", channel.name);
            } else {
                let ioid = self.issue_get(&mut state, channel, wire_type, array_mode, count, None)?;
                state.channel_gets.insert((channel.id, wire_type), ioid);
                drop(state);
                self.flush_io();
            }
        }
        if !wait {
            return Ok(GetOutcome::Incomplete);
        }
        self.complete(channel, mode, timeout).map(GetOutcome::Ready)
    }

    fn issue_get(
        &self,
        state: &mut TrackerState,
        channel: &ConnectedChannel,
        wire_type: DbrType,
        array_mode: ArrayMode,
        count: usize,
        group: Option<u32>,
    ) -> Result<IoId, CaError> {
        let ioid = state.next_ioid();
        self.inner
            .transport
            .get(channel.id, wire_type, count, ioid)
            .map_err(|status| self.protocol_error("get", &channel.name, status))?;
        debug!("Requested {wire_type} of {} as {ioid:?}", channel.name);
        state.gets.insert(
            ioid,
            PendingGet {
                name: channel.name.clone(),
                channel: channel.id,
                count: Self::effective_count(channel, count),
                array_mode,
                state: OpState::Pending,
                waiters: 0,
                group,
            },
        );
        Ok(ioid)
    }

    /// Wait for the get pending on a channel in `mode` and return its value
    ///
    /// Fails with [`CaError::NothingPending`] if no such get was issued. On timeout
    /// the request is abandoned; a reply arriving later is discarded.
    pub fn complete(
        &self,
        channel: &ConnectedChannel,
        mode: DecodeMode,
        timeout: Option<Duration>,
    ) -> Result<Reading, CaError> {
        ensure_blocking_allowed("get")?;
        let key = (channel.id, mode.wire_type(channel.native_type));
        let (ioid, count) = {
            let mut state = self.inner.tracker.inner.lock().unwrap();
            let ioid = state
                .channel_gets
                .get(&key)
                .copied()
                .ok_or_else(|| CaError::NothingPending(channel.name.clone()))?;
            let get = state
                .gets
                .get_mut(&ioid)
                .ok_or_else(|| CaError::NothingPending(channel.name.clone()))?;
            get.waiters += 1;
            (ioid, get.count)
        };
        let timeout = timeout.unwrap_or_else(|| self.inner.config.get_timeout_for(count));
        self.wait_until(timeout, || self.get_settled(ioid));

        let mut state = self.inner.tracker.inner.lock().unwrap();
        let Some(get) = state.gets.get_mut(&ioid) else {
            return Err(CaError::NothingPending(channel.name.clone()));
        };
        get.waiters -= 1;
        let result = match &get.state {
            OpState::Complete(reading) => Ok(reading.clone()),
            OpState::Failed(e) => Err(e.clone()),
            OpState::Pending => Err(CaError::Timeout {
                operation: "get",
                name: channel.name.clone(),
                timeout,
            }),
        };
        // The last waiter out clears the pending get
        if get.waiters == 0 {
            state.gets.remove(&ioid);
            if state.channel_gets.get(&key) == Some(&ioid) {
                state.channel_gets.remove(&key);
            }
        }
        if let Err(e) = &result
            && e.is_timeout()
        {
            warn!("{e}");
        }
        result
    }

    /// Whether a get in `mode` is in flight on a channel
    pub fn get_pending(&self, channel: &ConnectedChannel, mode: DecodeMode) -> bool {
        let key = (channel.id, mode.wire_type(channel.native_type));
        let state = self.inner.tracker.inner.lock().unwrap();
        state
            .channel_gets
            .get(&key)
            .and_then(|ioid| state.gets.get(ioid))
            .is_some_and(|get| get.state.is_pending())
    }

    fn get_settled(&self, ioid: IoId) -> bool {
        let state = self.inner.tracker.inner.lock().unwrap();
        state.gets.get(&ioid).is_none_or(|get| !get.state.is_pending())
    }

    fn put_settled(&self, ioid: IoId) -> bool {
        let state = self.inner.tracker.inner.lock().unwrap();
        state.puts.get(&ioid).is_none_or(|put| !put.state.is_pending())
    }

    /// Write to a channel
    ///
    /// The value is converted to the channel's native type first. Without `wait`
    /// or a callback the write is fire-and-forget. With `wait`, blocks until the
    /// server confirms it or `timeout` (by default the configured put timeout)
    /// passes. A callback is called with the outcome instead, and takes precedence
    /// over `wait`.
    pub fn put(
        &self,
        channel: &ConnectedChannel,
        value: impl Into<Value>,
        wait: bool,
        timeout: Option<Duration>,
        callback: Option<PutCallback>,
    ) -> Result<PutOutcome, CaError> {
        let blocking = wait && callback.is_none();
        if blocking {
            ensure_blocking_allowed("put")?;
        }
        self.ensure_open(channel)?;
        let data = self.convert_for_put(channel, value.into())?;

        if !blocking && callback.is_none() {
            self.inner
                .transport
                .put(channel.id, &data)
                .map_err(|status| self.protocol_error("put", &channel.name, status))?;
            self.flush_io();
            return Ok(PutOutcome::Sent);
        }
        if wait {
            trace!("Put to {} has a callback; not waiting", channel.name);
        }
        let has_callback = callback.is_some();
        let ioid = {
            let mut state = self.inner.tracker.inner.lock().unwrap();
            self.issue_put(&mut state, channel, &data, callback, None)?
        };
        self.flush_io();
        if has_callback {
            return Ok(PutOutcome::Sent);
        }

        let timeout = timeout.unwrap_or(self.inner.config.put_timeout);
        self.wait_until(timeout, || self.put_settled(ioid));
        let put = self.inner.tracker.inner.lock().unwrap().puts.remove(&ioid);
        match put.map(|p| p.state) {
            Some(OpState::Complete(())) => Ok(PutOutcome::Done),
            Some(OpState::Failed(e)) => Err(e),
            Some(OpState::Pending) | None => {
                warn!("Put to {} not confirmed within {timeout:?}", channel.name);
                Err(CaError::Timeout {
                    operation: "put",
                    name: channel.name.clone(),
                    timeout,
                })
            }
        }
    }

    fn convert_for_put(
        &self,
        channel: &ConnectedChannel,
        value: Value,
    ) -> Result<DbrValue, CaError> {
        value
            .to_native(channel.native_type)
            .map_err(|status| self.protocol_error("put", &channel.name, status))
    }

    fn issue_put(
        &self,
        state: &mut TrackerState,
        channel: &ConnectedChannel,
        data: &DbrValue,
        callback: Option<PutCallback>,
        group: Option<u32>,
    ) -> Result<IoId, CaError> {
        let ioid = state.next_ioid();
        self.inner
            .transport
            .put_with_callback(channel.id, data, ioid)
            .map_err(|status| self.protocol_error("put", &channel.name, status))?;
        debug!("Writing {} as {ioid:?}", channel.name);
        state.puts.insert(
            ioid,
            PendingPut {
                name: channel.name.clone(),
                channel: channel.id,
                callback,
                state: OpState::Pending,
                group,
            },
        );
        Ok(ioid)
    }

    pub(crate) fn handle_read(&self, ioid: IoId, result: Result<RawPayload, ErrorCondition>) {
        let mut state = self.inner.tracker.inner.lock().unwrap();
        let Some(get) = state.gets.get_mut(&ioid) else {
            trace!("Dropping reply to abandoned {ioid:?}");
            return;
        };
        get.state = match result {
            Ok(payload) => {
                match decode(&payload.data, payload.count, payload.data_type, get.array_mode) {
                    Ok(reading) => OpState::Complete(reading),
                    Err(e) => {
                        warn!("Could not decode reply for {}: {e}", get.name);
                        OpState::Failed(e.into())
                    }
                }
            }
            Err(status) => OpState::Failed(self.protocol_error("get", &get.name, status)),
        };
        trace!("Get {ioid:?} of {} settled", get.name);
    }

    pub(crate) fn handle_write(&self, ioid: IoId, status: ErrorCondition) {
        let callback = {
            let mut state = self.inner.tracker.inner.lock().unwrap();
            let Some(put) = state.puts.get_mut(&ioid) else {
                trace!("Dropping confirmation of abandoned {ioid:?}");
                return;
            };
            let result = if status.is_normal() {
                Ok(())
            } else {
                Err(self.protocol_error("put", &put.name, status))
            };
            match put.callback.take() {
                Some(callback) => {
                    let name = put.name.clone();
                    state.puts.remove(&ioid);
                    Some((callback, name, result))
                }
                None => {
                    put.state = match result {
                        Ok(()) => OpState::Complete(()),
                        Err(e) => OpState::Failed(e),
                    };
                    None
                }
            }
        };
        if let Some((callback, name, result)) = callback {
            callback(&name, result);
        }
    }

    /// Fail everything outstanding on a channel with `error`
    ///
    /// Put callbacks are called with the error. Once the channel has left the cache,
    /// gets that nobody is waiting for are forgotten.
    pub(crate) fn fail_operations_for(&self, channel: ChannelId, error: CaError) {
        let gone = self.channel_name(channel).is_none();
        let callbacks: Vec<(PutCallback, String)> = {
            let mut state = self.inner.tracker.inner.lock().unwrap();
            for get in state.gets.values_mut().filter(|g| g.channel == channel) {
                if get.state.is_pending() {
                    get.state = OpState::Failed(error.clone());
                }
            }
            if gone {
                state
                    .gets
                    .retain(|_, g| g.channel != channel || g.waiters > 0 || g.group.is_some());
                state.channel_gets.retain(|(c, _), _| *c != channel);
            }
            let with_callbacks: Vec<IoId> = state
                .puts
                .iter()
                .filter(|(_, p)| p.channel == channel && p.callback.is_some())
                .map(|(ioid, _)| *ioid)
                .collect();
            for put in state.puts.values_mut().filter(|p| p.channel == channel) {
                if put.state.is_pending() {
                    put.state = OpState::Failed(error.clone());
                }
            }
            with_callbacks
                .into_iter()
                .filter_map(|ioid| state.puts.remove(&ioid))
                .filter_map(|mut p| p.callback.take().map(|c| (c, p.name)))
                .collect()
        };
        for (callback, name) in callbacks {
            callback(&name, Err(error.clone()));
        }
    }

    /// Send everything issued so far. Requests are only queued until this is called.
    pub(crate) fn flush_io(&self) {
        self.inner.transport.flush_io();
    }

    pub(crate) fn next_group_id(&self) -> u32 {
        let mut state = self.inner.tracker.inner.lock().unwrap();
        wrapping_inplace_add(&mut state.next_group)
    }

    pub(crate) fn group_get(
        &self,
        group: u32,
        channel: &ConnectedChannel,
        mode: DecodeMode,
        count: usize,
    ) -> Result<IoId, CaError> {
        self.ensure_open(channel)?;
        let wire_type = mode.wire_type(channel.native_type);
        let mut state = self.inner.tracker.inner.lock().unwrap();
        self.issue_get(&mut state, channel, wire_type, ArrayMode::default(), count, Some(group))
    }

    pub(crate) fn group_put(
        &self,
        group: u32,
        channel: &ConnectedChannel,
        value: Value,
    ) -> Result<IoId, CaError> {
        self.ensure_open(channel)?;
        let data = self.convert_for_put(channel, value)?;
        let mut state = self.inner.tracker.inner.lock().unwrap();
        self.issue_put(&mut state, channel, &data, None, Some(group))
    }

    /// Whether every operation of a group has an answer
    pub(crate) fn group_settled(&self, group: u32) -> bool {
        let state = self.inner.tracker.inner.lock().unwrap();
        let gets = state
            .gets
            .values()
            .filter(|g| g.group == Some(group))
            .all(|g| !g.state.is_pending());
        let puts = state
            .puts
            .values()
            .filter(|p| p.group == Some(group))
            .all(|p| !p.state.is_pending());
        gets && puts
    }

    /// The first failure among a group's operations, in issue order
    pub(crate) fn group_failure(&self, group: u32) -> Option<CaError> {
        let state = self.inner.tracker.inner.lock().unwrap();
        let mut failures: Vec<(IoId, &CaError)> = state
            .gets
            .iter()
            .filter(|(_, g)| g.group == Some(group))
            .filter_map(|(ioid, g)| match &g.state {
                OpState::Failed(e) => Some((*ioid, e)),
                _ => None,
            })
            .chain(
                state
                    .puts
                    .iter()
                    .filter(|(_, p)| p.group == Some(group))
                    .filter_map(|(ioid, p)| match &p.state {
                        OpState::Failed(e) => Some((*ioid, e)),
                        _ => None,
                    }),
            )
            .collect();
        failures.sort_by_key(|(ioid, _)| *ioid);
        failures.first().map(|(_, e)| (*e).clone())
    }

    pub(crate) fn group_reading(&self, ioid: IoId) -> Option<Reading> {
        let state = self.inner.tracker.inner.lock().unwrap();
        match &state.gets.get(&ioid)?.state {
            OpState::Complete(reading) => Some(reading.clone()),
            _ => None,
        }
    }

    /// Forget every operation of a group; late answers are discarded
    pub(crate) fn forget_group(&self, group: u32) {
        let mut state = self.inner.tracker.inner.lock().unwrap();
        state.gets.retain(|_, g| g.group != Some(group));
        state.puts.retain(|_, p| p.group != Some(group));
    }
}
