//! One-call conveniences in the manner of the classic `caget`/`caput`/`camonitor`
//! tools.
//!
//! These never fail loudly: any problem is logged with `warn!` and reported as
//! `None`. The methods act on a given [`Context`]; the free functions of the same
//! names use the current context of the global [`ContextRegistry`].

use std::{fmt::Write, time::{Duration, UNIX_EPOCH}};

use tracing::warn;

use crate::{
    context::{Context, ContextRegistry},
    dbr::DbrBasicType,
    decode::{ArrayMode, DecodeMode, Reading, Value},
    error::CaError,
    pv::{GetOptions, PvOptions},
    subscription::Subscription,
    tracker::PutOutcome,
    transport::Access,
};

/// Options for [`Context::caget`]
#[derive(Debug, Clone, Default)]
pub struct CagetOptions {
    /// Render the value as text, with enum labels and display precision
    pub as_string: bool,
    /// Elements to read, or zero for all of them
    pub count: usize,
    /// Answer from the latest monitor update instead of reading afresh
    pub use_monitor: bool,
    pub timeout: Option<Duration>,
    pub connection_timeout: Option<Duration>,
    pub form: DecodeMode,
    pub array_mode: ArrayMode,
}

fn log_failure<T>(operation: &str, name: &str, result: Result<T, CaError>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("{operation} {name}: {e}");
            None
        }
    }
}

fn access_text(access: Access) -> &'static str {
    match access {
        Access::None => "no access",
        Access::Read => "read-only",
        Access::Write => "write-only",
        Access::ReadWrite => "read/write",
    }
}

impl Context {
    /// Read a PV once, connecting to it first if needed
    pub fn caget(&self, name: &str, options: CagetOptions) -> Option<Value> {
        log_failure("caget", name, self.try_caget(name, &options))
    }

    fn try_caget(&self, name: &str, options: &CagetOptions) -> Result<Value, CaError> {
        let pv = self.get_pv(
            name,
            PvOptions {
                form: options.form,
                connection_timeout: options.connection_timeout,
                array_mode: options.array_mode,
                ..Default::default()
            },
        )?;
        let get = GetOptions {
            count: options.count,
            use_monitor: options.use_monitor,
            timeout: options.timeout,
            array_mode: Some(options.array_mode),
        };
        if options.as_string {
            pv.get_string_with(get).map(Value::String)
        } else {
            Ok(pv.get_with(get)?.value)
        }
    }

    /// Write a PV, optionally waiting for the server to confirm it
    pub fn caput(
        &self,
        name: &str,
        value: impl Into<Value>,
        wait: bool,
        timeout: Option<Duration>,
    ) -> Option<PutOutcome> {
        let result = self
            .get_pv(name, PvOptions::default())
            .and_then(|pv| pv.put(value, wait, timeout));
        log_failure("caput", name, result)
    }

    /// Monitor a PV, replacing any monitor an earlier call installed on it
    pub fn camonitor<F>(&self, name: &str, callback: F) -> Option<Subscription>
    where
        F: Fn(&str, &Reading) + Send + Sync + 'static,
    {
        let result = self.wait_for_connect(name, None).and_then(|channel| {
            self.subscribe(
                &channel,
                DecodeMode::Time,
                self.inner.config.monitor_mask,
                callback,
            )
        });
        let subscription = log_failure("camonitor", name, result)?;
        let previous = self
            .inner
            .camonitors
            .lock()
            .unwrap()
            .insert(name.to_string(), subscription.clone());
        if let Some(previous) = previous {
            previous.unsubscribe();
        }
        Some(subscription)
    }

    /// Stop a monitor started by [`Context::camonitor`]. False if there was none.
    pub fn camonitor_clear(&self, name: &str) -> bool {
        let removed = self.inner.camonitors.lock().unwrap().remove(name);
        match removed {
            Some(subscription) => {
                subscription.unsubscribe();
                true
            }
            None => false,
        }
    }

    /// A multi-line summary of a PV's connection, value and metadata
    pub fn cainfo(&self, name: &str) -> Option<String> {
        log_failure("cainfo", name, self.try_cainfo(name))
    }

    fn try_cainfo(&self, name: &str) -> Result<String, CaError> {
        let pv = self.get_pv(name, PvOptions::default())?;
        let channel = pv.wait_for_connection(None)?;
        let reading = pv.get_with(GetOptions {
            use_monitor: false,
            ..Default::default()
        })?;
        let meta = pv.get_ctrlvars(None)?;
        let text = pv.get_string()?;

        // Writing to a String cannot fail
        let mut info = String::new();
        let wire_type = DecodeMode::Ctrl.wire_type(channel.native_type);
        let _ = writeln!(info, "== {name}  ({wire_type}) ==");
        let _ = writeln!(info, "   value      = {text}");
        let _ = writeln!(info, "   count      = {}", channel.count);
        let _ = writeln!(info, "   type       = {}", channel.native_type);
        if let Some(units) = meta.units.as_deref().filter(|u| !u.is_empty()) {
            let _ = writeln!(info, "   units      = {units}");
        }
        if matches!(
            channel.native_type,
            DbrBasicType::Float | DbrBasicType::Double
        ) && let Some(precision) = meta.precision
        {
            let _ = writeln!(info, "   precision  = {precision}");
        }
        if let Some(host) = &channel.host {
            let _ = writeln!(info, "   host       = {host}");
        }
        let _ = writeln!(info, "   access     = {}", access_text(pv.access()));
        let _ = writeln!(info, "   status     = {}", reading.meta.status.unwrap_or(0));
        let _ = writeln!(info, "   severity   = {}", reading.severity());
        if let Some(timestamp) = reading.meta.timestamp
            && let Ok(since_epoch) = timestamp.duration_since(UNIX_EPOCH)
        {
            let _ = writeln!(info, "   timestamp  = {:.6}", since_epoch.as_secs_f64());
        }
        let limits = [
            ("disp", meta.display_limits),
            ("alarm", meta.alarm_limits),
            ("warning", meta.warning_limits),
            ("ctrl", meta.control_limits),
        ];
        for (kind, pair) in limits {
            if let Some((lower, upper)) = pair {
                let _ = writeln!(info, "   upper_{kind}_limit = {upper}");
                let _ = writeln!(info, "   lower_{kind}_limit = {lower}");
            }
        }
        if let Some(labels) = &meta.enum_strs {
            let _ = writeln!(info, "   enum strings:");
            for (index, label) in labels.iter().enumerate() {
                let _ = writeln!(info, "       {index} = {label}");
            }
        }
        let monitored = if pv.is_monitored() { "is" } else { "is not" };
        let _ = writeln!(info, "   PV {monitored} internally monitored");
        Ok(info)
    }
}

fn global_context(operation: &str, name: &str) -> Option<Context> {
    let context = ContextRegistry::global()
        .ok_or(CaError::NoContext)
        .and_then(ContextRegistry::context);
    log_failure(operation, name, context)
}

/// [`Context::caget`] on the current context of the global registry
pub fn caget(name: &str, options: CagetOptions) -> Option<Value> {
    global_context("caget", name)?.caget(name, options)
}

/// [`Context::caput`] on the current context of the global registry
pub fn caput(
    name: &str,
    value: impl Into<Value>,
    wait: bool,
    timeout: Option<Duration>,
) -> Option<PutOutcome> {
    global_context("caput", name)?.caput(name, value, wait, timeout)
}

/// [`Context::camonitor`] on the current context of the global registry
pub fn camonitor<F>(name: &str, callback: F) -> Option<Subscription>
where
    F: Fn(&str, &Reading) + Send + Sync + 'static,
{
    global_context("camonitor", name)?.camonitor(name, callback)
}

/// [`Context::camonitor_clear`] on the current context of the global registry
pub fn camonitor_clear(name: &str) -> bool {
    global_context("camonitor_clear", name).is_some_and(|c| c.camonitor_clear(name))
}

/// [`Context::cainfo`] on the current context of the global registry
pub fn cainfo(name: &str) -> Option<String> {
    global_context("cainfo", name)?.cainfo(name)
}
