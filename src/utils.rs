use num::{FromPrimitive, traits::WrappingAdd};
use std::{env, time::Duration};

/// Increments a mutable reference in place, and returns the original value
pub(crate) fn wrapping_inplace_add<T: WrappingAdd + FromPrimitive + Copy>(value: &mut T) -> T {
    let id = *value;
    if let Some(one) = T::from_u8(1) {
        *value = value.wrapping_add(&one);
    }
    id
}

/// Get the connection timeout, either from environment or default 2.0 seconds
pub fn get_default_connect_timeout() -> Duration {
    connect_timeout_from(env::var("CA_CONNECT_TIMEOUT").ok().as_deref())
}

/// Seconds as text, at least 10ms. Unparseable or unrepresentable values give 2s.
fn connect_timeout_from(value: Option<&str>) -> Duration {
    value
        .and_then(|v| v.trim().parse::<f32>().ok())
        .filter(|secs| secs.is_finite())
        .and_then(|secs| Duration::try_from_secs_f32(secs.max(0.01)).ok())
        .unwrap_or(Duration::from_secs(2))
}

/// Element count below which a PV is monitored automatically, default 65536
pub fn get_default_auto_monitor_max_elements() -> usize {
    env::var("CA_AUTO_MONITOR_MAX_ELEMENTS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(65536usize)
        .max(1)
}

/// Whether new contexts deliver events from a background thread, default yes
pub fn get_default_preemptive() -> bool {
    env::var("CA_PREEMPTIVE_CALLBACK")
        .map(|v| {
            !(v.eq_ignore_ascii_case("no") || v.eq_ignore_ascii_case("false") || v == "0")
        })
        .unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapping_ids() {
        let mut id = u32::MAX;
        assert_eq!(wrapping_inplace_add(&mut id), u32::MAX);
        assert_eq!(wrapping_inplace_add(&mut id), 0);
        assert_eq!(id, 1);
    }

    #[test]
    fn connect_timeout_text() {
        assert_eq!(connect_timeout_from(None), Duration::from_secs(2));
        assert_eq!(connect_timeout_from(Some("0.5")), Duration::from_millis(500));
        assert_eq!(connect_timeout_from(Some("0")), Duration::from_secs_f32(0.01));
        assert_eq!(connect_timeout_from(Some("soon")), Duration::from_secs(2));
        for huge in ["1e40", "inf", "3e38", "NaN"] {
            assert_eq!(connect_timeout_from(Some(huge)), Duration::from_secs(2));
        }
    }
}
