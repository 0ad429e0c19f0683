//! Collaborator interfaces.
//!
//! The engine consumes four external services: the pushbuffer allocator that
//! hands out command regions, the command encoders (copy-engine and host
//! methods), the resource manager that creates hardware channels, and the
//! semaphore allocator. All of them are trait objects so deployments and
//! tests can swap implementations without touching the engine.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::channel::GpfifoEntry;
use crate::config::RingLocation;
use crate::push::Push;
use crate::Result;

//=============================================================================
// GPU Description
//=============================================================================

/// Host/GPU interconnect class, ordered by coherence and bandwidth.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum SysmemLink {
    Pcie,
    Nvlink1,
    Nvlink2,
    Nvlink3,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum VirtMode {
    None,
    /// Hypervisor passthrough where a plugin proxies privileged submission.
    SriovHeavy,
}

/// Static facts about the GPU the manager drives.
#[derive(Clone, Debug)]
pub struct GpuInfo {
    pub name: String,
    /// Local memory size in bytes; zero means no vidmem at all.
    pub vidmem_size: u64,
    pub sysmem_link: SysmemLink,
    pub gpfifo_in_vidmem_supported: bool,
    pub virt_mode: VirtMode,
    pub ecc_enabled: bool,
    /// GPU-written word that goes nonzero when an ECC error is raised.
    pub ecc_error_notifier: Option<Arc<AtomicU32>>,
    pub platform_aarch64: bool,
}

impl Default for GpuInfo {
    fn default() -> Self {
        Self {
            name: "GPU".to_string(),
            vidmem_size: 0,
            sysmem_link: SysmemLink::Pcie,
            gpfifo_in_vidmem_supported: false,
            virt_mode: VirtMode::None,
            ecc_enabled: false,
            ecc_error_notifier: None,
            platform_aarch64: cfg!(target_arch = "aarch64"),
        }
    }
}

//=============================================================================
// Resource Manager
//=============================================================================

pub type ChannelHandle = u64;

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum AddressSpace {
    Default,
    /// Restricted address space used by proxy channels under SR-IOV heavy.
    Proxy,
}

#[derive(Clone, Debug)]
pub struct ChannelAllocParams {
    pub num_gpfifo_entries: u32,
    pub gpfifo_loc: RingLocation,
    pub gpput_loc: RingLocation,
    pub engine_index: u32,
}

/// What the resource manager reports back for an allocated channel.
#[derive(Clone)]
pub struct ChannelInfo {
    /// The hardware GPFIFO table; one GP-entry word per ring slot.
    pub gpfifo: Arc<[AtomicU64]>,
    /// GPU/RM-written word; nonzero means the channel has faulted.
    pub error_notifier: Arc<AtomicU32>,
    pub hw_runlist_id: u32,
    pub hw_channel_id: u32,
}

pub trait ResourceManager: Send + Sync {
    fn channel_allocate(
        &self,
        address_space: AddressSpace,
        params: &ChannelAllocParams,
    ) -> Result<(ChannelHandle, ChannelInfo)>;

    fn channel_destroy(&self, handle: ChannelHandle);
}

//=============================================================================
// Semaphore Allocation
//=============================================================================

/// A GPU-visible 32-bit payload word plus the address the GPU releases to.
pub struct GpuSemaphore {
    gpu_va: u64,
    payload: Arc<AtomicU32>,
}

impl GpuSemaphore {
    pub fn new(gpu_va: u64, payload: Arc<AtomicU32>) -> Self {
        Self { gpu_va, payload }
    }

    pub fn gpu_va(&self) -> u64 {
        self.gpu_va
    }

    pub fn read_payload(&self) -> u32 {
        self.payload.load(Ordering::Acquire)
    }
}

pub trait SemaphorePool: Send + Sync {
    fn alloc(&self) -> Result<GpuSemaphore>;
}

//=============================================================================
// Pushbuffer
//=============================================================================

/// The external pushbuffer chunk allocator.
///
/// `begin_push` reserves a contiguous region and records its token on the
/// push; `end_push` transfers the region onto the channel's in-flight list;
/// `mark_completed` releases it for reuse once the owning GPFIFO entry is
/// reclaimed.
pub trait PushbufferOps: Send + Sync {
    fn begin_push(&self, push: &mut Push) -> Result<()>;
    fn end_push(&self, push: &Push, entry: &GpfifoEntry);
    fn mark_completed(&self, entry: &GpfifoEntry);

    fn gpu_va_for_push(&self, push: &Push) -> u64;
    fn offset_for_push(&self, push: &Push) -> u64;
    fn size_of_push(&self, push: &Push) -> u32;
}

//=============================================================================
// Command Encoders
//=============================================================================

/// Copy-engine method encoder.
pub trait CopyEngineHal: Send + Sync {
    /// Appends a release of `payload` to the 32-bit semaphore at `gpu_va`.
    fn semaphore_release(&self, push: &mut Push, gpu_va: u64, payload: u32);
    /// One-shot per-channel init methods, run in the bootstrap push.
    fn init(&self, push: &mut Push);
}

/// Host (PBDMA) method encoder.
pub trait HostHal: Send + Sync {
    /// Encodes one GP-entry naming a pushbuffer region into `slot`.
    fn set_gpfifo_entry(&self, slot: &AtomicU64, pushbuffer_va: u64, size: u32);
    /// Writes the GPPUT doorbell; the GPU may start consuming immediately.
    fn write_gpu_put(&self, info: &ChannelInfo, put: u32);
    /// One-shot per-channel init methods, run in the bootstrap push.
    fn init(&self, push: &mut Push);
}

//=============================================================================
// Collaborator Bundle
//=============================================================================

/// Everything hardware-specific the manager needs, gathered once at
/// construction.
#[derive(Clone)]
pub struct Device {
    pub rm: Arc<dyn ResourceManager>,
    pub pushbuffer: Arc<dyn PushbufferOps>,
    pub ce_hal: Arc<dyn CopyEngineHal>,
    pub host_hal: Arc<dyn HostHal>,
    pub semaphores: Arc<dyn SemaphorePool>,
}
