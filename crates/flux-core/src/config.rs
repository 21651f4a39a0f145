//! Typed configuration for the primitives in this crate.
//!
//! Broker config parsing is out of scope, but every primitive still needs a
//! typed way to receive its own parameters (topology scheme + size, a
//! reduction's timeout/flags, a reactor's tick granularity) instead of
//! hand-assembled Rust at every call site. These structs gain
//! `serde`/`serde_json` (de)serialization behind the `std_json` feature.

use crate::reduce::ReduceFlags;

#[cfg_attr(feature = "std_json", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopologyConfig {
    /// `"kary:2"`, `"mincrit"`, `"mincrit:4"`, `"binomial"`, `"custom"`.
    pub uri: String,
    pub size: u32,
}

impl TopologyConfig {
    pub fn new(uri: impl Into<String>, size: u32) -> Self {
        TopologyConfig { uri: uri.into(), size }
    }
}

#[cfg_attr(feature = "std_json", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReductionConfig {
    pub timed_flush: bool,
    pub hwm_flush: bool,
    pub timeout_msec: u64,
}

impl ReductionConfig {
    pub fn immediate() -> Self {
        ReductionConfig { timed_flush: false, hwm_flush: false, timeout_msec: 0 }
    }

    pub fn to_flags(self) -> ReduceFlags {
        let mut flags = ReduceFlags::empty();
        if self.timed_flush {
            flags |= ReduceFlags::TIMED_FLUSH;
        }
        if self.hwm_flush {
            flags |= ReduceFlags::HWM_FLUSH;
        }
        // Neither bit set means immediate — the empty set already says that.
        flags
    }
}

impl Default for ReductionConfig {
    fn default() -> Self {
        ReductionConfig::immediate()
    }
}

#[cfg_attr(feature = "std_json", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReactorConfig {
    /// Granularity of the shipped `TokioReactor`'s idle-tick sleep while
    /// `run()` waits for the next watcher/timer event.
    pub tick_granularity_micros: u64,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        ReactorConfig { tick_granularity_micros: 1_000 }
    }
}

#[cfg(all(test, feature = "std_json"))]
mod tests {
    use super::*;

    #[test]
    fn reduction_config_round_trips_through_json() {
        let cfg = ReductionConfig { timed_flush: true, hwm_flush: false, timeout_msec: 250 };
        let json = serde_json::to_string(&cfg).unwrap();
        let back: ReductionConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg, back);
    }

    #[test]
    fn default_reduction_config_maps_to_immediate_flag() {
        assert_eq!(ReductionConfig::default().to_flags(), ReduceFlags::empty());
    }

    #[test]
    fn topology_config_serializes_uri_and_size() {
        let cfg = TopologyConfig::new("kary:2", 6);
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(json.contains("\"kary:2\""));
        assert!(json.contains("\"size\":6"));
    }
}
