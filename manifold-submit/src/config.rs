//! Manager configuration and its platform-dependent resolution.

use crate::hal::{GpuInfo, SysmemLink};

pub const NUM_GPFIFO_ENTRIES_DEFAULT: u32 = 1024;
pub const NUM_GPFIFO_ENTRIES_MIN: u32 = 32;
pub const NUM_GPFIFO_ENTRIES_MAX: u32 = 1024 * 1024;

/// Placement of a channel-visible allocation.
///
/// `Auto` defers the decision to the resolution step, which picks based on
/// the GPU's memory configuration and link type.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub enum RingLocation {
    Sys,
    Vid,
    #[default]
    Auto,
}

impl RingLocation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sys => "sys",
            Self::Vid => "vid",
            Self::Auto => "auto",
        }
    }

    /// Parses a location knob. Unrecognized values reset to `Auto` with a
    /// log line, so `parse(s).as_str()` is either `s` or `"auto"`.
    pub fn parse(value: &str) -> Self {
        match value {
            "sys" => Self::Sys,
            "vid" => Self::Vid,
            "auto" => Self::Auto,
            other => {
                log::info!("Invalid location value '{}', using auto instead", other);
                Self::Auto
            }
        }
    }
}

impl std::fmt::Display for RingLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User-facing knobs, supplied once at manager construction.
#[derive(Clone, Debug)]
pub struct ManagerConfig {
    /// GPFIFO ring capacity per channel. Clamped to
    /// [`NUM_GPFIFO_ENTRIES_MIN`, `NUM_GPFIFO_ENTRIES_MAX`]; values that are
    /// not a power of two fall back to the default.
    pub num_gpfifo_entries: u32,
    pub gpfifo_loc: RingLocation,
    pub gpput_loc: RingLocation,
    pub pushbuffer_loc: RingLocation,
    /// Record cross-channel acquire values per push for debugging.
    pub track_push_acquires: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            num_gpfifo_entries: NUM_GPFIFO_ENTRIES_DEFAULT,
            gpfifo_loc: RingLocation::Auto,
            gpput_loc: RingLocation::Auto,
            pushbuffer_loc: RingLocation::Auto,
            track_push_acquires: false,
        }
    }
}

/// Effective configuration after clamping and platform overrides.
#[derive(Clone, Debug)]
pub(crate) struct ResolvedConfig {
    pub num_gpfifo_entries: u32,
    pub gpfifo_loc: RingLocation,
    pub gpput_loc: RingLocation,
    pub pushbuffer_loc: RingLocation,
}

pub(crate) fn resolve(config: &ManagerConfig, gpu: &GpuInfo) -> ResolvedConfig {
    let mut resolved = ResolvedConfig {
        num_gpfifo_entries: config.num_gpfifo_entries,
        gpfifo_loc: RingLocation::Sys,
        gpput_loc: RingLocation::Sys,
        pushbuffer_loc: RingLocation::Sys,
    };

    // 1- Number of GPFIFO entries
    resolved.num_gpfifo_entries = config
        .num_gpfifo_entries
        .clamp(NUM_GPFIFO_ENTRIES_MIN, NUM_GPFIFO_ENTRIES_MAX);

    if !resolved.num_gpfifo_entries.is_power_of_two() {
        resolved.num_gpfifo_entries = NUM_GPFIFO_ENTRIES_DEFAULT;
    }

    if resolved.num_gpfifo_entries != config.num_gpfifo_entries {
        log::info!(
            "Invalid value for num_gpfifo_entries = {}, using {} instead",
            config.num_gpfifo_entries,
            resolved.num_gpfifo_entries
        );
    }

    // 2- Allocation locations

    // A GPU with no local memory can only place them in sysmem.
    if gpu.vidmem_size == 0 {
        return resolved;
    }

    if config.pushbuffer_loc == RingLocation::Vid {
        // Mapped GPU memory needs dedicated IO copies on AArch64, which the
        // push encoding paths do not issue.
        if gpu.platform_aarch64 {
            log::info!("pushbuffer_loc = vid is not supported on AArch64, using sys instead");
        } else {
            resolved.pushbuffer_loc = RingLocation::Vid;
        }
    }

    // 3- GPFIFO/GPPUT location
    if !gpu.gpfifo_in_vidmem_supported {
        resolved.gpfifo_loc = RingLocation::Auto;
        resolved.gpput_loc = RingLocation::Auto;
        return resolved;
    }

    // Vidmem by default for latency; a fast coherent sysmem link makes the
    // GPFIFO cheaper to keep host-side.
    resolved.gpfifo_loc = RingLocation::Vid;
    resolved.gpput_loc = RingLocation::Vid;

    if gpu.sysmem_link >= SysmemLink::Nvlink2 {
        resolved.gpfifo_loc = RingLocation::Sys;
    }

    if config.gpfifo_loc != RingLocation::Auto {
        resolved.gpfifo_loc = config.gpfifo_loc;
    }

    if config.gpput_loc != RingLocation::Auto {
        resolved.gpput_loc = config.gpput_loc;

        if resolved.gpput_loc == RingLocation::Sys {
            log::warn!("CAUTION: allocating GPPUT in sysmem is not supported and may crash your system");
        }
    }

    resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::VirtMode;

    fn gpu_with_vidmem() -> GpuInfo {
        GpuInfo {
            name: "test".to_string(),
            vidmem_size: 8 << 30,
            sysmem_link: SysmemLink::Pcie,
            gpfifo_in_vidmem_supported: true,
            virt_mode: VirtMode::None,
            ecc_enabled: false,
            ecc_error_notifier: None,
            platform_aarch64: false,
        }
    }

    #[test]
    fn parse_is_idempotent() {
        for input in ["sys", "vid", "auto", "bogus", ""] {
            let parsed = RingLocation::parse(input);
            assert!(parsed.as_str() == input || parsed.as_str() == "auto");
            assert_eq!(RingLocation::parse(parsed.as_str()), parsed);
        }
    }

    #[test]
    fn entry_count_below_min_clamps_up() {
        let config = ManagerConfig {
            num_gpfifo_entries: 20,
            ..Default::default()
        };
        assert_eq!(resolve(&config, &gpu_with_vidmem()).num_gpfifo_entries, 32);
    }

    #[test]
    fn entry_count_non_power_of_two_resets_to_default() {
        let config = ManagerConfig {
            num_gpfifo_entries: 1500,
            ..Default::default()
        };
        assert_eq!(resolve(&config, &gpu_with_vidmem()).num_gpfifo_entries, 1024);
    }

    #[test]
    fn entry_count_above_max_clamps_down() {
        let config = ManagerConfig {
            num_gpfifo_entries: 1 << 24,
            ..Default::default()
        };
        assert_eq!(resolve(&config, &gpu_with_vidmem()).num_gpfifo_entries, 1 << 20);
    }

    #[test]
    fn no_vidmem_forces_everything_to_sys() {
        let config = ManagerConfig {
            gpfifo_loc: RingLocation::Vid,
            gpput_loc: RingLocation::Vid,
            pushbuffer_loc: RingLocation::Vid,
            ..Default::default()
        };
        let mut gpu = gpu_with_vidmem();
        gpu.vidmem_size = 0;
        let resolved = resolve(&config, &gpu);
        assert_eq!(resolved.gpfifo_loc, RingLocation::Sys);
        assert_eq!(resolved.gpput_loc, RingLocation::Sys);
        assert_eq!(resolved.pushbuffer_loc, RingLocation::Sys);
    }

    #[test]
    fn pushbuffer_vid_rejected_on_aarch64() {
        let config = ManagerConfig {
            pushbuffer_loc: RingLocation::Vid,
            ..Default::default()
        };
        let mut gpu = gpu_with_vidmem();
        gpu.platform_aarch64 = true;
        assert_eq!(resolve(&config, &gpu).pushbuffer_loc, RingLocation::Sys);

        gpu.platform_aarch64 = false;
        assert_eq!(resolve(&config, &gpu).pushbuffer_loc, RingLocation::Vid);
    }

    #[test]
    fn gpfifo_defaults_degrade_without_vidmem_support() {
        let mut gpu = gpu_with_vidmem();
        gpu.gpfifo_in_vidmem_supported = false;
        let resolved = resolve(&ManagerConfig::default(), &gpu);
        assert_eq!(resolved.gpfifo_loc, RingLocation::Auto);
        assert_eq!(resolved.gpput_loc, RingLocation::Auto);
    }

    #[test]
    fn coherent_link_prefers_sysmem_gpfifo() {
        let mut gpu = gpu_with_vidmem();
        assert_eq!(
            resolve(&ManagerConfig::default(), &gpu).gpfifo_loc,
            RingLocation::Vid
        );

        gpu.sysmem_link = SysmemLink::Nvlink3;
        let resolved = resolve(&ManagerConfig::default(), &gpu);
        assert_eq!(resolved.gpfifo_loc, RingLocation::Sys);
        assert_eq!(resolved.gpput_loc, RingLocation::Vid);
    }
}
