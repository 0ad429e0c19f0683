//! Push descriptors and their diagnostic metadata.

use std::panic::Location;
use std::sync::Arc;

use crate::channel::Channel;
use crate::Result;

/// Cap on recorded cross-channel acquires per push; extra ones only bump a
/// counter.
pub const MAX_PUSH_ACQUIRES: usize = 8;

pub(crate) const INVALID_PUSH_INFO: u32 = u32::MAX;

//=============================================================================
// Push Metadata
//=============================================================================

/// A semaphore value another channel's work must reach before this push may
/// execute. Recorded for debugging only; the engine does not enforce it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PushAcquire {
    pub gpu_index: u32,
    pub runlist_id: u32,
    pub channel_id: u32,
    pub value: u64,
}

#[derive(Default)]
pub(crate) struct AcquireSet {
    pub values: Vec<PushAcquire>,
    /// How many acquires beyond [`MAX_PUSH_ACQUIRES`] were recorded.
    pub dropped: u32,
}

impl AcquireSet {
    pub fn record(&mut self, acquire: PushAcquire) {
        if self.values.len() < MAX_PUSH_ACQUIRES {
            self.values.push(acquire);
        } else {
            self.dropped += 1;
        }
    }
}

/// Diagnostic record for one in-flight push. Drawn from the channel's pool
/// at begin, returned when the owning GPFIFO entry is reclaimed. The content
/// stays readable after return, until the record is reused, so reports can
/// show recently finished pushes.
pub(crate) struct PushInfo {
    pub description: String,
    pub location: Option<&'static Location<'static>>,
    pub on_complete: Option<Box<dyn FnOnce(u64) + Send>>,
    pub acquires: Option<AcquireSet>,
}

impl PushInfo {
    pub fn new() -> Self {
        Self {
            description: String::new(),
            location: None,
            on_complete: None,
            acquires: None,
        }
    }
}

//=============================================================================
// Push
//=============================================================================

/// One client-level unit of submission: begin, encode through the HAL, end.
///
/// Holds a claimed ring slot from the moment it is created. `end` publishes
/// the work; dropping an un-ended push releases the claim without submitting
/// anything.
pub struct Push {
    pub(crate) channel: Arc<Channel>,
    pub(crate) info_index: u32,
    pub(crate) region_token: u64,
    pub(crate) tracking_value: u64,
    pub(crate) ended: bool,
}

impl Push {
    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    /// Opaque pushbuffer region identity, set by
    /// [`PushbufferOps::begin_push`](crate::PushbufferOps::begin_push).
    pub fn region_token(&self) -> u64 {
        self.region_token
    }

    pub fn set_region_token(&mut self, token: u64) {
        self.region_token = token;
    }

    /// Registers a callback invoked once, outside the pool lock, when this
    /// push's slot is reclaimed. The argument is the push's release value.
    pub fn on_complete(&mut self, callback: Box<dyn FnOnce(u64) + Send>) {
        self.channel.set_push_on_complete(self.info_index, callback);
    }

    /// Records a cross-channel acquire for debugging. A no-op unless the
    /// manager was configured to track acquires.
    pub fn record_acquire(&mut self, acquire: PushAcquire) {
        self.channel.record_push_acquire(self.info_index, acquire);
    }

    /// Publishes the push: appends the tracking-semaphore release, installs
    /// the GPFIFO entry and rings the doorbell. Returns the release value.
    pub fn end(mut self) -> u64 {
        let value = self.channel.clone().end_push(&mut self);
        self.ended = true;
        value
    }

    /// Ends the push and spins until the GPU reports it complete.
    pub fn end_and_wait(self) -> Result<()> {
        let channel = self.channel.clone();
        let value = self.end();
        channel.wait_for(value)
    }
}

impl Drop for Push {
    fn drop(&mut self) {
        if !self.ended {
            self.channel.abandon_push(self);
        }
    }
}
