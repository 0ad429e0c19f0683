//! The channel manager: owns the pools, runs copy-engine selection, and
//! aggregates progress, errors and teardown.

use std::panic::Location;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use strum::{EnumCount, IntoEnumIterator};

use crate::channel::{Channel, ChannelReport};
use crate::config::{self, ManagerConfig, ResolvedConfig};
use crate::hal::{Device, GpuInfo, VirtMode};
use crate::pool::ChannelPool;
use crate::push::Push;
use crate::select::{self, CopyEngineCaps};
use crate::spin_wait::SpinWait;
use crate::{ChannelType, ErrorCell, Result};

/// Upper bound on peer GPU indices the peer-pool table can hold.
pub const MAX_PEER_GPUS: usize = 32;

const NO_POOL: usize = usize::MAX;

/// State every channel needs a handle to: the GPU description, the resolved
/// configuration, the collaborator bundle and the process-wide fatal flag.
pub(crate) struct ManagerShared {
    pub gpu: GpuInfo,
    pub conf: ResolvedConfig,
    pub ops: Device,
    pub fatal: ErrorCell,
    pub track_acquires: bool,
}

pub struct ChannelManager {
    shared: Arc<ManagerShared>,
    pools: Vec<ChannelPool>,
    /// Usable-CE bitmask; pool index of CE `i` is the popcount of the mask
    /// below bit `i`.
    ce_mask: u64,
    default_for_type: [usize; ChannelType::COUNT],
    /// Peer GPU index -> pool index, installed after peer discovery.
    /// `NO_POOL` falls back to the default GpuToGpu pool.
    gpu_to_gpu: Box<[AtomicUsize]>,
}

impl ChannelManager {
    /// Builds the full pool set: selection picks a preferred CE per channel
    /// type, but a pool is created for every usable CE so that later policy
    /// changes (a peer pair appearing) can repurpose an idle pool without
    /// reallocating channels.
    pub fn new(
        gpu: GpuInfo,
        ops: Device,
        config: &ManagerConfig,
        ce_caps: &[CopyEngineCaps],
    ) -> Result<ChannelManager> {
        let conf = config::resolve(config, &gpu);
        log::info!(
            "Creating channel manager for {}: {} GPFIFO entries, gpfifo {}, gpput {}, pushbuffer {}",
            gpu.name,
            conf.num_gpfifo_entries,
            conf.gpfifo_loc,
            conf.gpput_loc,
            conf.pushbuffer_loc
        );

        let uses_proxy_pool = gpu.virt_mode == VirtMode::SriovHeavy;
        let shared = Arc::new(ManagerShared {
            gpu,
            conf,
            ops,
            fatal: ErrorCell::new(),
            track_acquires: config.track_push_acquires,
        });

        let selection = select::pick_copy_engines(ce_caps)?;

        let mut pools = Vec::with_capacity(selection.usable_mask.count_ones() as usize + 1);
        for ce in 0..select::MAX_COPY_ENGINES as u32 {
            if selection.usable_mask & (1u64 << ce) != 0 {
                pools.push(ChannelPool::create(&shared, ce, false)?);
            }
        }

        let mut default_for_type = [0usize; ChannelType::COUNT];
        for ty in ChannelType::iter() {
            let ce = selection.preferred[ty as usize];
            default_for_type[ty as usize] = Self::rank(selection.usable_mask, ce);
        }

        // Under SR-IOV heavy, a dedicated single-channel proxy pool serves
        // Memops through the plugin.
        if uses_proxy_pool {
            let ce = selection.preferred[ChannelType::Memops as usize];
            default_for_type[ChannelType::Memops as usize] = pools.len();
            pools.push(ChannelPool::create(&shared, ce, true)?);
        }

        let gpu_to_gpu = (0..MAX_PEER_GPUS)
            .map(|_| AtomicUsize::new(NO_POOL))
            .collect();

        Ok(ChannelManager {
            shared,
            pools,
            ce_mask: selection.usable_mask,
            default_for_type,
            gpu_to_gpu,
        })
    }

    fn rank(mask: u64, ce: u32) -> usize {
        (mask & ((1u64 << ce) - 1)).count_ones() as usize
    }

    pub fn pool_for_type(&self, ty: ChannelType) -> &ChannelPool {
        &self.pools[self.default_for_type[ty as usize]]
    }

    pub fn pools(&self) -> &[ChannelPool] {
        &self.pools
    }

    /// Routes future peer copies to `peer_gpu_index` through the pool of
    /// `ce`, which must be usable and cannot be the proxy pool. Until this
    /// is called, the default GpuToGpu pool serves them.
    pub fn set_peer_copy_engine(&self, peer_gpu_index: usize, ce: u32) {
        debug_assert!(peer_gpu_index < MAX_PEER_GPUS);
        debug_assert!(self.ce_mask & (1u64 << ce) != 0);

        let pool_index = Self::rank(self.ce_mask, ce);
        debug_assert!(!self.pools[pool_index].is_proxy());
        debug_assert_eq!(self.pools[pool_index].ce_index(), ce);
        self.gpu_to_gpu[peer_gpu_index].store(pool_index, Ordering::Release);
    }

    //-------------------------------------------------------------------------
    // Reservation
    //-------------------------------------------------------------------------

    /// Reserves a slot on any channel of the pool bound to `ty`.
    pub fn reserve(&self, ty: ChannelType) -> Result<Arc<Channel>> {
        Self::reserve_in_pool(self.pool_for_type(ty))
    }

    /// Reserves for a peer copy, using the peer's dedicated pool when one
    /// was installed.
    pub fn reserve_gpu_to_gpu(&self, peer_gpu_index: usize) -> Result<Arc<Channel>> {
        let pool = match self
            .gpu_to_gpu
            .get(peer_gpu_index)
            .map(|slot| slot.load(Ordering::Acquire))
        {
            Some(index) if index != NO_POOL => &self.pools[index],
            _ => self.pool_for_type(ChannelType::GpuToGpu),
        };
        Self::reserve_in_pool(pool)
    }

    fn reserve_in_pool(pool: &ChannelPool) -> Result<Arc<Channel>> {
        // TODO: prefer idle/less busy channels over plain array order.
        for channel in pool.channels() {
            if channel.get_status().is_ok() && channel.try_claim() {
                return Ok(channel.clone());
            }
        }

        let mut spin = SpinWait::new();
        loop {
            for channel in pool.channels() {
                channel.update_progress();

                // A drained ring does not make a faulted channel claimable.
                if channel.get_status().is_ok() && channel.try_claim() {
                    return Ok(channel.clone());
                }

                channel.check_errors()?;
                spin.spin();
            }
        }
    }

    /// Reserves on the `ty` pool and begins a push in one step.
    #[track_caller]
    pub fn begin_push(&self, ty: ChannelType, description: &str) -> Result<Push> {
        let location = Location::caller();
        let channel = self.reserve(ty)?;
        channel.begin_push_at(description, location)
    }

    #[track_caller]
    pub fn begin_push_gpu_to_gpu(&self, peer_gpu_index: usize, description: &str) -> Result<Push> {
        let location = Location::caller();
        let channel = self.reserve_gpu_to_gpu(peer_gpu_index)?;
        channel.begin_push_at(description, location)
    }

    //-------------------------------------------------------------------------
    // Progress and Errors
    //-------------------------------------------------------------------------

    /// One progress pass over every channel; returns the total still
    /// pending.
    pub fn update_progress(&self) -> u32 {
        self.pools
            .iter()
            .flat_map(|pool| pool.channels())
            .map(|channel| channel.update_progress())
            .sum()
    }

    /// Spins until all channels drain or an error is observed.
    pub fn wait(&self) -> Result<()> {
        if self.update_progress() == 0 {
            return self.check_errors();
        }

        let mut spin = SpinWait::new();
        loop {
            if self.update_progress() == 0 {
                return Ok(());
            }
            spin.spin();
            self.check_errors()?;
        }
    }

    /// Global error first, then every channel. The first channel fault
    /// latches into the manager-wide fatal flag.
    pub fn check_errors(&self) -> Result<()> {
        if let Some(error) = self.shared.fatal.get() {
            return Err(error);
        }

        for pool in &self.pools {
            for channel in pool.channels() {
                channel.check_errors()?;
            }
        }

        Ok(())
    }

    pub fn fatal_error(&self) -> Option<crate::SubmitError> {
        self.shared.fatal.get()
    }

    /// Pending pushes across all channels, without finished-push context.
    pub fn report(&self) -> ManagerReport {
        ManagerReport {
            channels: self
                .pools
                .iter()
                .flat_map(|pool| pool.channels())
                .map(|channel| channel.report_with_finished(0))
                .collect(),
        }
    }
}

impl Drop for ChannelManager {
    fn drop(&mut self) {
        // Pools go down in reverse creation order; each pool drains its
        // channels the same way.
        while self.pools.pop().is_some() {}
    }
}

#[derive(Clone, Debug)]
pub struct ManagerReport {
    pub channels: Vec<ChannelReport>,
}
