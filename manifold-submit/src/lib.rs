//! GPU channel submission engine for Manifold
//!
//! Multiplexes logical work streams ("channels") onto hardware copy-engine
//! queues. Producers reserve a ring slot, encode commands into an externally
//! managed pushbuffer region, and publish the work through a GPFIFO entry and
//! a GPPUT doorbell. Completion is tracked per channel with a monotonically
//! increasing semaphore value released by the GPU after each push.
//!
//! The engine owns the rings, the tracking semaphores and the copy-engine
//! selection policy. Everything hardware-specific lives behind collaborator
//! traits: the pushbuffer allocator ([`PushbufferOps`]), the command
//! encoders ([`CopyEngineHal`], [`HostHal`]), the resource manager that
//! creates hardware channels ([`ResourceManager`]), and the semaphore
//! allocator ([`SemaphorePool`]).

mod channel;
mod config;
mod hal;
mod manager;
mod pool;
mod push;
mod select;
mod semaphore;
mod spin_wait;

pub use channel::{Channel, ChannelReport, ChannelState, GpfifoEntry, PushReport};
pub use config::{
    ManagerConfig, RingLocation, NUM_GPFIFO_ENTRIES_DEFAULT, NUM_GPFIFO_ENTRIES_MAX,
    NUM_GPFIFO_ENTRIES_MIN,
};
pub use hal::{
    AddressSpace, ChannelAllocParams, ChannelHandle, ChannelInfo, CopyEngineHal, Device, GpuInfo,
    GpuSemaphore, HostHal, PushbufferOps, ResourceManager, SemaphorePool, SysmemLink, VirtMode,
};
pub use manager::{ChannelManager, ManagerReport, MAX_PEER_GPUS};
pub use pool::ChannelPool;
pub use push::{Push, PushAcquire, MAX_PUSH_ACQUIRES};
pub use select::{CeCaps, CopyEngineCaps, MAX_COPY_ENGINES};
pub use semaphore::TrackingSemaphore;

use std::sync::atomic::{AtomicU8, Ordering};

//=============================================================================
// Channel Types
//=============================================================================

/// The logical kind of work a channel carries. Each type is bound to the
/// pool of the copy engine best suited for it.
///
/// The declaration order is the selection order: every pick bumps the chosen
/// engine's usage count, so later types are biased toward less loaded
/// engines. `Memops` goes last to get the lightest-loaded one.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
#[derive(strum::EnumCount, strum::EnumIter, strum::IntoStaticStr)]
pub enum ChannelType {
    CpuToGpu,
    GpuToCpu,
    GpuInternal,
    GpuToGpu,
    Memops,
}

impl ChannelType {
    pub fn as_str(&self) -> &'static str {
        (*self).into()
    }
}

//=============================================================================
// Errors
//=============================================================================

/// GPU-reported channel faults.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum ChannelError {
    /// Channel fault with no finer classification.
    Rc,
    /// ECC error observed while inspecting a channel fault.
    Ecc,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum SubmitError {
    /// A collaborator failed to allocate rings, regions or semaphores.
    OutOfMemory,
    /// No usable copy engine for a required channel type.
    NotSupported,
    /// An OS-level facility was unavailable.
    OperatingSystem,
    /// A sticky GPU-reported channel fault.
    Channel(ChannelError),
    /// Fallback; reaching it in reservation indicates a bug.
    Generic,
}

impl std::fmt::Display for SubmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::NotSupported => write!(f, "not supported"),
            Self::OperatingSystem => write!(f, "operating system error"),
            Self::Channel(ChannelError::Rc) => write!(f, "channel RC error"),
            Self::Channel(ChannelError::Ecc) => write!(f, "channel ECC error"),
            Self::Generic => write!(f, "generic error"),
        }
    }
}

impl std::error::Error for SubmitError {}

pub type Result<T, E = SubmitError> = std::result::Result<T, E>;

//=============================================================================
// Sticky Error Cell
//=============================================================================

/// Write-once atomic error slot. The first recorded error wins; later ones
/// are dropped. Used for both the per-channel fault latch and the
/// manager-wide fatal flag.
pub(crate) struct ErrorCell(AtomicU8);

impl ErrorCell {
    const NONE: u8 = 0;

    pub fn new() -> Self {
        Self(AtomicU8::new(Self::NONE))
    }

    fn encode(error: SubmitError) -> u8 {
        match error {
            SubmitError::OutOfMemory => 1,
            SubmitError::NotSupported => 2,
            SubmitError::OperatingSystem => 3,
            SubmitError::Channel(ChannelError::Rc) => 4,
            SubmitError::Channel(ChannelError::Ecc) => 5,
            SubmitError::Generic => 6,
        }
    }

    fn decode(code: u8) -> Option<SubmitError> {
        match code {
            Self::NONE => None,
            1 => Some(SubmitError::OutOfMemory),
            2 => Some(SubmitError::NotSupported),
            3 => Some(SubmitError::OperatingSystem),
            4 => Some(SubmitError::Channel(ChannelError::Rc)),
            5 => Some(SubmitError::Channel(ChannelError::Ecc)),
            _ => Some(SubmitError::Generic),
        }
    }

    pub fn set_once(&self, error: SubmitError) {
        let _ = self.0.compare_exchange(
            Self::NONE,
            Self::encode(error),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub fn get(&self) -> Option<SubmitError> {
        Self::decode(self.0.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::EnumCount;

    #[test]
    fn channel_type_names() {
        assert_eq!(ChannelType::COUNT, 5);
        assert_eq!(ChannelType::CpuToGpu.as_str(), "CpuToGpu");
        assert_eq!(ChannelType::Memops.as_str(), "Memops");
    }

    #[test]
    fn error_cell_first_write_wins() {
        let cell = ErrorCell::new();
        assert_eq!(cell.get(), None);
        cell.set_once(SubmitError::Channel(ChannelError::Rc));
        cell.set_once(SubmitError::Channel(ChannelError::Ecc));
        assert_eq!(cell.get(), Some(SubmitError::Channel(ChannelError::Rc)));
    }

    #[test]
    fn error_cell_round_trips_every_kind() {
        for error in [
            SubmitError::OutOfMemory,
            SubmitError::NotSupported,
            SubmitError::OperatingSystem,
            SubmitError::Channel(ChannelError::Rc),
            SubmitError::Channel(ChannelError::Ecc),
            SubmitError::Generic,
        ] {
            let cell = ErrorCell::new();
            cell.set_once(error);
            assert_eq!(cell.get(), Some(error));
        }
    }
}
