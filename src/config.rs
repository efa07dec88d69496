//! Process-init-time tunables.
//!
//! The base protocol in spec.md leaves most of these as "e.g." constants
//! (16 resurrectable waiters, a 10 second awakener deadline, ...). Gathering
//! them here lets an embedding image loader ship a `RuntimeConfig` as data
//! instead of the core hard-coding magic numbers.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Which coordinator implementation backs `gc_stop_the_world` / `gc_start_the_world`.
///
/// See §9: the safepoint and signal flavours share §4.B/§4.C/§4.H and differ
/// only in how a thread is made to notice a pending stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoordinatorVariant {
    /// Page-fault/poll driven rendezvous (§4.D, §4.E).
    Safepoint,
    /// `SIG_STOP_FOR_GC`-driven rendezvous.
    Signal,
    /// Probe platform capability at `Runtime::init` and resolve to a concrete
    /// variant before any thread is created. Never appears on a live `Runtime`.
    Auto,
}

impl Default for CoordinatorVariant {
    fn default() -> Self {
        CoordinatorVariant::Auto
    }
}

/// Tunables gathered at `Runtime::init` time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Maximum number of parked thread records the resurrection pool may hold.
    pub max_resurrectable_waiters: usize,

    /// Post-mortem FIFO is drained once its length exceeds this threshold.
    pub post_mortem_drain_threshold: usize,

    /// How long the resurrection pool's responsible awakener waits before
    /// reaping one victim.
    #[serde(with = "duration_millis")]
    pub awakener_timeout: Duration,

    /// Stack size requested for every spawned OS thread.
    pub thread_stack_size: usize,

    /// Coordinator implementation to use.
    pub coordinator_variant: CoordinatorVariant,

    /// Size, in bytes, of the safepoint page and each thread's CSP page.
    /// Must be a multiple of the platform page size; the platform adapter
    /// rounds up if it is not.
    pub csp_page_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            max_resurrectable_waiters: 16,
            post_mortem_drain_threshold: 8,
            awakener_timeout: Duration::from_secs(10),
            thread_stack_size: 8 * 1024 * 1024,
            coordinator_variant: CoordinatorVariant::Auto,
            csp_page_size: 4096,
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (d.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_json() {
        let cfg = RuntimeConfig::default();
        let json = serde_json::to_string(&cfg).expect("serialize");
        let back: RuntimeConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(cfg, back);
    }

    #[test]
    fn overriding_a_single_field_keeps_the_rest_default() {
        let cfg = RuntimeConfig {
            max_resurrectable_waiters: 4,
            ..Default::default()
        };
        assert_eq!(cfg.max_resurrectable_waiters, 4);
        assert_eq!(cfg.thread_stack_size, RuntimeConfig::default().thread_stack_size);
    }
}
