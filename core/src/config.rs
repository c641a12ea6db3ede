//! Emulator configuration, loaded from a config file or defaulted.

use serde::Deserialize;

/// Emulator-wide tunables. Deserializable so a host binary can load it from
/// a TOML/JSON config file; every field defaults to the value the reference
/// implementation hard-codes.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Number of scheduler workers. Worker 0 is always syscall/atomic-capable.
    pub worker_count: usize,
    /// Ticks granted to a userspace-only worker's slice.
    pub default_slice_ticks: u64,
    /// Ticks granted when running on the atomic-capable worker.
    pub atomic_slice_ticks: u64,
    /// `log2` of the page size; only 12 (4 KiB) is currently supported.
    pub page_shift: u32,
    /// Lower bound of the address space a guest process may map into.
    pub user_start: u64,
    /// Upper bound (exclusive) of the mappable address space.
    pub user_end: u64,
    /// Whether call/ret/syscall events are recorded for profiling output.
    pub profiling_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_count: 4,
            default_slice_ticks: emu_sched::DEFAULT_SLICE_TICKS,
            atomic_slice_ticks: emu_sched::ATOMIC_SLICE_TICKS,
            page_shift: emu_addr::PAGE_SHIFT,
            user_start: 0,
            user_end: 0x0000_7fff_ffff_ffff,
            profiling_enabled: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_scheduler_constants() {
        let cfg = Config::default();
        assert_eq!(cfg.default_slice_ticks, emu_sched::DEFAULT_SLICE_TICKS);
        assert_eq!(cfg.atomic_slice_ticks, emu_sched::ATOMIC_SLICE_TICKS);
        assert_eq!(cfg.page_shift, 12);
    }

    #[test]
    fn deserializes_partial_overrides_with_serde_default() {
        let cfg: Config = serde_json::from_str(r#"{"worker_count": 1}"#).unwrap();
        assert_eq!(cfg.worker_count, 1);
        assert_eq!(cfg.user_end, Config::default().user_end);
    }
}
