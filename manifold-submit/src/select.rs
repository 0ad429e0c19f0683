//! Copy-engine capability scoring and selection.
//!
//! Every channel type gets the engine that fits it best: sysmem-facing types
//! want fast sysmem access, peer types want physical-engine width, and
//! `Memops` wants whatever is least loaded. Each pick bumps the chosen
//! engine's usage count, so the fixed selection order spreads load across
//! engines.

use strum::{EnumCount, IntoEnumIterator};

use crate::{ChannelType, Result, SubmitError};

pub const MAX_COPY_ENGINES: usize = 64;

bitflags::bitflags! {
    /// Capability bits of one logical copy engine.
    #[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
    pub struct CeCaps: u32 {
        const SUPPORTED = 1 << 0;
        /// Graphics-coupled engine; never used for submission.
        const GRCE = 1 << 1;
        /// Can reach system memory at all.
        const SYSMEM = 1 << 2;
        /// Fast sysmem reads.
        const SYSMEM_READ = 1 << 3;
        /// Fast sysmem writes.
        const SYSMEM_WRITE = 1 << 4;
        const P2P = 1 << 5;
        /// Carries NVLINK peer traffic; left alone when alternatives exist.
        const NVLINK_P2P = 1 << 6;
        /// Shares its physical engines with other logical engines.
        const SHARED = 1 << 7;
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct CopyEngineCaps {
    pub caps: CeCaps,
    /// Physical copy engines backing this logical one, as a bitmask.
    pub pce_mask: u32,
}

impl CopyEngineCaps {
    fn has(&self, flag: CeCaps) -> i32 {
        self.caps.contains(flag) as i32
    }

    fn pce_count(&self) -> i32 {
        self.pce_mask.count_ones() as i32
    }
}

pub(crate) struct CeSelection {
    /// Preferred CE per channel type, indexed by `ChannelType as usize`.
    pub preferred: [u32; ChannelType::COUNT],
    /// Every CE usable for at least one type, not only the chosen ones.
    pub usable_mask: u64,
}

fn usable_for_type(ty: ChannelType, ce: &CopyEngineCaps) -> bool {
    if !ce.caps.contains(CeCaps::SUPPORTED) || ce.caps.contains(CeCaps::GRCE) {
        return false;
    }

    match ty {
        ChannelType::CpuToGpu | ChannelType::GpuToCpu => ce.caps.contains(CeCaps::SYSMEM),
        ChannelType::GpuInternal | ChannelType::Memops => true,
        ChannelType::GpuToGpu => ce.caps.contains(CeCaps::P2P),
    }
}

fn usage_count(ce: u32, preferred: &[u32; ChannelType::COUNT]) -> i32 {
    preferred.iter().filter(|&&chosen| chosen == ce).count() as i32
}

/// Negative when the first engine should be preferred for `ty`.
fn compare_for_type(
    table: &[CopyEngineCaps],
    ty: ChannelType,
    first: u32,
    second: u32,
    preferred: &[u32; ChannelType::COUNT],
) -> i32 {
    debug_assert!(first != second);
    let cap0 = &table[first as usize];
    let cap1 = &table[second as usize];
    debug_assert!(usable_for_type(ty, cap0) && usable_for_type(ty, cap1));

    match ty {
        ChannelType::CpuToGpu => {
            // Fast sysmem reads matter most for host-to-device traffic.
            if cap0.has(CeCaps::SYSMEM_READ) != cap1.has(CeCaps::SYSMEM_READ) {
                return cap1.has(CeCaps::SYSMEM_READ) - cap0.has(CeCaps::SYSMEM_READ);
            }
            if cap0.has(CeCaps::NVLINK_P2P) != cap1.has(CeCaps::NVLINK_P2P) {
                return cap0.has(CeCaps::NVLINK_P2P) - cap1.has(CeCaps::NVLINK_P2P);
            }
        }
        ChannelType::GpuToCpu => {
            if cap0.has(CeCaps::SYSMEM_WRITE) != cap1.has(CeCaps::SYSMEM_WRITE) {
                return cap1.has(CeCaps::SYSMEM_WRITE) - cap0.has(CeCaps::SYSMEM_WRITE);
            }
            if cap0.has(CeCaps::NVLINK_P2P) != cap1.has(CeCaps::NVLINK_P2P) {
                return cap0.has(CeCaps::NVLINK_P2P) - cap1.has(CeCaps::NVLINK_P2P);
            }
        }
        ChannelType::GpuToGpu => {
            // The engine with the most physical engines wins.
            let pce_diff = cap1.pce_count() - cap0.pce_count();
            if pce_diff != 0 {
                return pce_diff;
            }
        }
        ChannelType::GpuInternal => {
            // Physical-engine count is the stand-in for local bandwidth.
            let pce_diff = cap1.pce_count() - cap0.pce_count();
            if pce_diff != 0 {
                return pce_diff;
            }
            // Leave NVLINK engines to the peer channel type when possible.
            if cap0.has(CeCaps::NVLINK_P2P) != cap1.has(CeCaps::NVLINK_P2P) {
                return cap0.has(CeCaps::NVLINK_P2P) - cap1.has(CeCaps::NVLINK_P2P);
            }
        }
        ChannelType::Memops => {
            // Latency-bound; the default usage-count ordering below already
            // prefers the least used engine.
        }
    }

    let usage0 = usage_count(first, preferred);
    let usage1 = usage_count(second, preferred);
    if usage0 != usage1 {
        return usage0 - usage1;
    }

    if cap0.has(CeCaps::SHARED) != cap1.has(CeCaps::SHARED) {
        return cap0.has(CeCaps::SHARED) - cap1.has(CeCaps::SHARED);
    }

    first as i32 - second as i32
}

/// Identifies usable engines and picks the preferred one per channel type,
/// in the fixed selection order of `ChannelType`'s declaration.
pub(crate) fn pick_copy_engines(table: &[CopyEngineCaps]) -> Result<CeSelection> {
    debug_assert!(table.len() <= MAX_COPY_ENGINES);

    // The sentinel never equals a real index, so it contributes no usage.
    let mut preferred = [MAX_COPY_ENGINES as u32; ChannelType::COUNT];
    let mut usable_mask = 0u64;

    for ty in ChannelType::iter() {
        let mut best: Option<u32> = None;

        for (index, ce) in table.iter().enumerate() {
            let index = index as u32;
            if !usable_for_type(ty, ce) {
                continue;
            }

            usable_mask |= 1u64 << index;

            best = match best {
                None => Some(index),
                Some(current) if compare_for_type(table, ty, index, current, &preferred) < 0 => {
                    Some(index)
                }
                other => other,
            };
        }

        let Some(best) = best else {
            log::error!(
                "Failed to find a suitable copy engine for channel type {}",
                ty.as_str()
            );
            return Err(SubmitError::NotSupported);
        };

        preferred[ty as usize] = best;
    }

    Ok(CeSelection {
        preferred,
        usable_mask,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ce(caps: CeCaps, pce_mask: u32) -> CopyEngineCaps {
        CopyEngineCaps {
            caps: caps | CeCaps::SUPPORTED,
            pce_mask,
        }
    }

    #[test]
    fn no_usable_engine_is_not_supported() {
        // Unsupported and graphics-coupled engines never qualify.
        let table = [
            CopyEngineCaps::default(),
            ce(CeCaps::GRCE | CeCaps::SYSMEM | CeCaps::P2P, 1),
        ];
        assert_eq!(pick_copy_engines(&table).err(), Some(SubmitError::NotSupported));

        // Sysmem-capable but no P2P anywhere: GpuToGpu has no engine.
        let table = [ce(CeCaps::SYSMEM, 1)];
        assert_eq!(pick_copy_engines(&table).err(), Some(SubmitError::NotSupported));
    }

    #[test]
    fn single_engine_takes_every_type() {
        let table = [ce(CeCaps::SYSMEM | CeCaps::P2P, 0b1)];
        let selection = pick_copy_engines(&table).unwrap();
        assert_eq!(selection.preferred, [0; ChannelType::COUNT]);
        assert_eq!(selection.usable_mask, 0b1);
    }

    #[test]
    fn selection_is_deterministic_and_spreads_load() {
        let table = [
            ce(CeCaps::SYSMEM, 0),
            ce(
                CeCaps::SYSMEM | CeCaps::P2P | CeCaps::NVLINK_P2P,
                0x0000_00ff,
            ),
            ce(CeCaps::P2P, 0x0000_ffff),
        ];

        let selection = pick_copy_engines(&table).unwrap();
        assert_eq!(selection.preferred[ChannelType::CpuToGpu as usize], 0);
        assert_eq!(selection.preferred[ChannelType::GpuToCpu as usize], 0);
        assert_eq!(selection.preferred[ChannelType::GpuInternal as usize], 2);
        assert_eq!(selection.preferred[ChannelType::GpuToGpu as usize], 2);
        assert_eq!(selection.preferred[ChannelType::Memops as usize], 1);
        assert_eq!(selection.usable_mask, 0b111);
    }

    #[test]
    fn fast_sysmem_access_beats_index_order() {
        let table = [
            ce(CeCaps::SYSMEM | CeCaps::P2P, 1),
            ce(CeCaps::SYSMEM | CeCaps::SYSMEM_READ | CeCaps::P2P, 1),
            ce(CeCaps::SYSMEM | CeCaps::SYSMEM_WRITE | CeCaps::P2P, 1),
        ];
        let selection = pick_copy_engines(&table).unwrap();
        assert_eq!(selection.preferred[ChannelType::CpuToGpu as usize], 1);
        assert_eq!(selection.preferred[ChannelType::GpuToCpu as usize], 2);
    }

    #[test]
    fn shared_engines_lose_ties() {
        let table = [
            ce(CeCaps::SYSMEM | CeCaps::P2P | CeCaps::SHARED, 1),
            ce(CeCaps::SYSMEM | CeCaps::P2P, 1),
        ];
        let selection = pick_copy_engines(&table).unwrap();
        // First pick has equal usage; the non-shared engine wins.
        assert_eq!(selection.preferred[ChannelType::CpuToGpu as usize], 1);
    }
}
