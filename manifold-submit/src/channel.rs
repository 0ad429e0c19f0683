//! Channels: GPFIFO ring bookkeeping, reservation, submission, progress.
//!
//! A channel multiplexes client pushes onto one hardware queue. The host
//! fills ring slots at `cpu_put`; `gpu_get` trails it, advancing only when
//! the tracking semaphore shows the slot's release value complete. One slot
//! stays empty as a sentinel, so `cpu_put == gpu_get` always means idle.
//!
//! All ring indices, reservation counters and push-info records of a pool's
//! channels are guarded by that pool's single spinlock.

use std::panic::Location;
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use crate::config::RingLocation;
use crate::hal::{AddressSpace, ChannelAllocParams, ChannelHandle, ChannelInfo};
use crate::manager::ManagerShared;
use crate::pool::PoolCore;
use crate::push::{AcquireSet, Push, PushAcquire, PushInfo, INVALID_PUSH_INFO};
use crate::semaphore::TrackingSemaphore;
use crate::spin_wait::SpinWait;
use crate::{ChannelError, ErrorCell, Result, SubmitError};

/// Completing more entries than this per progress update would hold the pool
/// lock for too long; reservation paths call update_progress repeatedly
/// anyway.
const MAX_UPDATE_COMPLETED: u32 = 8;

//=============================================================================
// GPFIFO Entries
//=============================================================================

/// Host-side record of one published ring slot.
#[derive(Clone, Copy, Debug, Default)]
pub struct GpfifoEntry {
    pub(crate) tracking_value: u64,
    pub(crate) pushbuffer_offset: u64,
    pub(crate) pushbuffer_size: u32,
    pub(crate) push_info: u32,
}

impl GpfifoEntry {
    /// The semaphore value whose completion retires this entry.
    pub fn tracking_value(&self) -> u64 {
        self.tracking_value
    }

    pub fn pushbuffer_offset(&self) -> u64 {
        self.pushbuffer_offset
    }

    pub fn pushbuffer_size(&self) -> u32 {
        self.pushbuffer_size
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum UpdateMode {
    /// Only retire entries whose release value has completed.
    Completed,
    /// Retire everything, regardless of completion. Teardown only.
    ForceAll,
}

//=============================================================================
// Ring State
//=============================================================================

/// The mutable half of a channel. Lives inside the owning pool's lock.
pub(crate) struct RingState {
    /// Next slot the host will fill.
    cpu_put: u32,
    /// Next slot the host believes the GPU has not finished.
    gpu_get: u32,
    /// Slots reserved but not yet ended; they logically occupy positions
    /// starting at `cpu_put` but are invisible to the GPU.
    current_pushes: u32,
    entries: Box<[GpfifoEntry]>,
    infos: Box<[PushInfo]>,
    free_infos: Vec<u32>,
}

impl RingState {
    pub fn new(capacity: u32) -> Self {
        Self {
            cpu_put: 0,
            gpu_get: 0,
            current_pushes: 0,
            entries: vec![GpfifoEntry::default(); capacity as usize].into_boxed_slice(),
            infos: (0..capacity).map(|_| PushInfo::new()).collect(),
            free_infos: (0..capacity).rev().collect(),
        }
    }

    fn capacity(&self) -> u32 {
        self.entries.len() as u32
    }

    // One slot is kept empty so a full ring is distinguishable from an
    // empty one.
    fn is_available(&self) -> bool {
        (self.cpu_put + self.current_pushes + 1) % self.capacity() != self.gpu_get
    }

    fn pending(&self) -> u32 {
        if self.cpu_put >= self.gpu_get {
            self.cpu_put - self.gpu_get
        } else {
            self.capacity() - self.gpu_get + self.cpu_put
        }
    }
}

//=============================================================================
// Channel
//=============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    /// No queued work outstanding and no reservations held.
    Idle,
    Active,
    /// Error notifier set or an RM-side fault observed; terminal.
    Faulted,
}

pub struct Channel {
    index: usize,
    pool: Arc<PoolCore>,
    shared: Arc<ManagerShared>,
    pub(crate) tracking: TrackingSemaphore,
    handle: ChannelHandle,
    info: ChannelInfo,
    name: String,
    fault: ErrorCell,
}

impl Channel {
    pub(crate) fn create(
        shared: &Arc<ManagerShared>,
        pool: &Arc<PoolCore>,
        index: usize,
    ) -> Result<Channel> {
        let semaphore = shared.ops.semaphores.alloc().map_err(|error| {
            log::error!(
                "Tracking semaphore allocation failed: {}, GPU {}",
                error,
                shared.gpu.name
            );
            error
        })?;

        let params = ChannelAllocParams {
            num_gpfifo_entries: shared.conf.num_gpfifo_entries,
            gpfifo_loc: shared.conf.gpfifo_loc,
            gpput_loc: shared.conf.gpput_loc,
            engine_index: pool.ce_index,
        };
        let address_space = if pool.is_proxy {
            AddressSpace::Proxy
        } else {
            AddressSpace::Default
        };
        let (handle, info) = shared
            .ops
            .rm
            .channel_allocate(address_space, &params)
            .map_err(|error| {
                log::error!("Channel allocation failed: {}, GPU {}", error, shared.gpu.name);
                error
            })?;

        let name = format!(
            "ID {}:{} ({:#x}:{:#x}) CE {}",
            info.hw_runlist_id, info.hw_channel_id, info.hw_runlist_id, info.hw_channel_id,
            pool.ce_index
        );

        {
            let mut rings = pool.rings.lock();
            debug_assert_eq!(rings.len(), index);
            rings.push(RingState::new(shared.conf.num_gpfifo_entries));
        }

        Ok(Channel {
            index,
            pool: pool.clone(),
            shared: shared.clone(),
            tracking: TrackingSemaphore::new(semaphore),
            handle,
            info,
            name,
            fault: ErrorCell::new(),
        })
    }

    /// Runs the one-shot engine init methods in a bootstrap push and waits
    /// for them.
    pub(crate) fn init(self: &Arc<Self>) -> Result<()> {
        self.reserve()?;
        let mut push = self.begin_push("Init channel")?;
        self.shared.ops.ce_hal.init(&mut push);
        self.shared.ops.host_hal.init(&mut push);
        push.end_and_wait().map_err(|error| {
            log::error!("Channel init failed: {}, channel {}", error, self.name);
            error
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> u32 {
        self.shared.conf.num_gpfifo_entries
    }

    pub fn tracking(&self) -> &TrackingSemaphore {
        &self.tracking
    }

    /// The resource manager's view of the hardware channel.
    pub fn hw_channel_info(&self) -> &ChannelInfo {
        &self.info
    }

    //-------------------------------------------------------------------------
    // Reservation
    //-------------------------------------------------------------------------

    /// Claims a ring slot if one is free right now.
    pub(crate) fn try_claim(&self) -> bool {
        let mut rings = self.pool.rings.lock();
        let ring = &mut rings[self.index];
        if ring.is_available() {
            ring.current_pushes += 1;
            true
        } else {
            false
        }
    }

    fn release_claim(&self) {
        let mut rings = self.pool.rings.lock();
        let ring = &mut rings[self.index];
        debug_assert!(ring.current_pushes > 0);
        ring.current_pushes = ring.current_pushes.saturating_sub(1);
    }

    /// Claims a ring slot, spinning until capacity frees up or the channel
    /// faults. Never sleeps on a kernel primitive. A faulted channel
    /// refuses new work immediately.
    pub fn reserve(&self) -> Result<()> {
        self.check_errors()?;

        if self.try_claim() {
            return Ok(());
        }

        self.update_progress();

        let mut spin = SpinWait::new();
        loop {
            if self.try_claim() {
                return Ok(());
            }
            spin.spin();
            self.check_errors()?;
            self.update_progress();
        }
    }

    //-------------------------------------------------------------------------
    // Push Lifecycle
    //-------------------------------------------------------------------------

    /// Starts a push on an already reserved slot: draws a pushbuffer region
    /// and a push-info record. The ring itself is untouched until `end`.
    #[track_caller]
    pub fn begin_push(self: &Arc<Self>, description: &str) -> Result<Push> {
        self.begin_push_at(description, Location::caller())
    }

    pub(crate) fn begin_push_at(
        self: &Arc<Self>,
        description: &str,
        location: &'static Location<'static>,
    ) -> Result<Push> {
        let mut push = Push {
            channel: self.clone(),
            info_index: INVALID_PUSH_INFO,
            region_token: 0,
            tracking_value: 0,
            ended: false,
        };

        if let Err(error) = self.shared.ops.pushbuffer.begin_push(&mut push) {
            // No region to surrender; just give the claimed slot back.
            push.ended = true;
            self.release_claim();
            return Err(error);
        }

        // Cannot run dry: there are as many records as ring slots and the
        // caller holds a slot claim.
        let Some(info_index) = self.take_push_info(description, location) else {
            log::error!("Push info pool empty on channel {}", self.name);
            return Err(SubmitError::Generic);
        };
        push.info_index = info_index;

        Ok(push)
    }

    fn take_push_info(
        &self,
        description: &str,
        location: &'static Location<'static>,
    ) -> Option<u32> {
        let mut rings = self.pool.rings.lock();
        let ring = &mut rings[self.index];
        let index = ring.free_infos.pop()?;

        let info = &mut ring.infos[index as usize];
        debug_assert!(info.on_complete.is_none());
        info.description.clear();
        info.description.push_str(description);
        info.location = Some(location);
        info.acquires = self.shared.track_acquires.then(AcquireSet::default);

        Some(index)
    }

    pub(crate) fn set_push_on_complete(
        &self,
        info_index: u32,
        callback: Box<dyn FnOnce(u64) + Send>,
    ) {
        if info_index == INVALID_PUSH_INFO {
            return;
        }
        let mut rings = self.pool.rings.lock();
        rings[self.index].infos[info_index as usize].on_complete = Some(callback);
    }

    pub(crate) fn record_push_acquire(&self, info_index: u32, acquire: PushAcquire) {
        if info_index == INVALID_PUSH_INFO {
            return;
        }
        let mut rings = self.pool.rings.lock();
        if let Some(set) = rings[self.index].infos[info_index as usize].acquires.as_mut() {
            set.record(acquire);
        }
    }

    /// Publishes a push: appends the tracking-semaphore release, installs
    /// the GPFIFO entry and rings the GPPUT doorbell.
    pub(crate) fn end_push(&self, push: &mut Push) -> u64 {
        let pushbuffer = &self.shared.ops.pushbuffer;

        let mut rings = self.pool.rings.lock();
        let ring = &mut rings[self.index];

        let new_tracking_value = self.tracking.reserve_next();
        let new_payload = new_tracking_value as u32;
        let semaphore_va = self.tracking.gpu_va();
        self.shared
            .ops
            .ce_hal
            .semaphore_release(push, semaphore_va, new_payload);

        let push_size = pushbuffer.size_of_push(push);
        let pushbuffer_va = pushbuffer.gpu_va_for_push(push);
        let pushbuffer_offset = pushbuffer.offset_for_push(push);

        let capacity = ring.capacity();
        let cpu_put = ring.cpu_put;
        let new_cpu_put = (cpu_put + 1) % capacity;

        ring.entries[cpu_put as usize] = GpfifoEntry {
            tracking_value: new_tracking_value,
            pushbuffer_offset,
            pushbuffer_size: push_size,
            push_info: push.info_index,
        };

        debug_assert!(ring.current_pushes > 0);
        ring.current_pushes -= 1;

        self.shared.ops.host_hal.set_gpfifo_entry(
            &self.info.gpfifo[cpu_put as usize],
            pushbuffer_va,
            push_size,
        );

        // All pushbuffer and GP-entry stores must be visible to the GPU
        // before the GPPUT publication.
        fence(Ordering::Release);

        ring.cpu_put = new_cpu_put;
        self.shared.ops.host_hal.write_gpu_put(&self.info, new_cpu_put);

        // The pushbuffer must learn about the submission before the lock
        // drops: the moment the channel is unlocked, a progress update may
        // already observe this entry complete.
        pushbuffer.end_push(push, &ring.entries[cpu_put as usize]);

        drop(rings);

        // Full fence after the unlock; works around throughput anomalies
        // observed on some platforms.
        fence(Ordering::SeqCst);

        push.tracking_value = new_tracking_value;
        push.info_index = INVALID_PUSH_INFO;

        new_tracking_value
    }

    /// Unwinds a push that was begun but never ended: releases the slot
    /// claim, recycles the push-info record and surrenders the pushbuffer
    /// region. Nothing is submitted.
    pub(crate) fn abandon_push(&self, push: &Push) {
        {
            let mut rings = self.pool.rings.lock();
            let ring = &mut rings[self.index];
            if push.info_index != INVALID_PUSH_INFO {
                ring.infos[push.info_index as usize].on_complete = None;
                ring.free_infos.push(push.info_index);
            }
            debug_assert!(ring.current_pushes > 0);
            ring.current_pushes = ring.current_pushes.saturating_sub(1);
        }

        let pushbuffer = &self.shared.ops.pushbuffer;
        let placeholder = GpfifoEntry {
            tracking_value: 0,
            pushbuffer_offset: pushbuffer.offset_for_push(push),
            pushbuffer_size: pushbuffer.size_of_push(push),
            push_info: INVALID_PUSH_INFO,
        };
        pushbuffer.mark_completed(&placeholder);

        log::warn!("Abandoned push without ending it, channel {}", self.name);
    }

    //-------------------------------------------------------------------------
    // Progress
    //-------------------------------------------------------------------------

    /// Retires a few completed entries and returns how many are still
    /// pending.
    pub fn update_progress(&self) -> u32 {
        self.update_progress_with_max(MAX_UPDATE_COMPLETED, UpdateMode::Completed)
    }

    /// Retires every completed entry. Longer critical section; drain and
    /// error paths only.
    pub fn update_progress_all(&self) -> u32 {
        self.update_progress_with_max(self.capacity(), UpdateMode::Completed)
    }

    pub(crate) fn update_progress_with_max(&self, max_to_complete: u32, mode: UpdateMode) -> u32 {
        let completed_value = self.tracking.refresh();

        let mut callbacks: Vec<(Box<dyn FnOnce(u64) + Send>, u64)> = Vec::new();

        let mut rings = self.pool.rings.lock();
        let ring = &mut rings[self.index];

        let capacity = ring.capacity();
        let cpu_put = ring.cpu_put;
        let mut gpu_get = ring.gpu_get;
        let mut completed_count = 0;

        while gpu_get != cpu_put && completed_count < max_to_complete {
            let (tracking_value, info_index) = {
                let entry = &ring.entries[gpu_get as usize];
                (entry.tracking_value, entry.push_info)
            };

            if mode == UpdateMode::Completed && tracking_value > completed_value {
                break;
            }

            self.shared
                .ops
                .pushbuffer
                .mark_completed(&ring.entries[gpu_get as usize]);

            // Forced reclamation does not mean the work ran; completion
            // callbacks are dropped, not invoked.
            let callback = ring.infos[info_index as usize].on_complete.take();
            if mode == UpdateMode::Completed {
                if let Some(callback) = callback {
                    callbacks.push((callback, tracking_value));
                }
            }
            ring.free_infos.push(info_index);

            gpu_get = (gpu_get + 1) % capacity;
            completed_count += 1;
        }

        ring.gpu_get = gpu_get;
        let pending = ring.pending();

        drop(rings);

        for (callback, value) in callbacks {
            callback(value);
        }

        pending
    }

    /// Spins until `value` completes, reclaiming progress along the way.
    pub fn wait_for(&self, value: u64) -> Result<()> {
        let mut spin = SpinWait::new();
        while self.tracking.refresh() < value {
            self.check_errors()?;
            self.update_progress();
            spin.spin();
        }
        self.update_progress();
        Ok(())
    }

    //-------------------------------------------------------------------------
    // State and Errors
    //-------------------------------------------------------------------------

    pub fn state(&self) -> ChannelState {
        if self.get_status().is_err() {
            return ChannelState::Faulted;
        }
        let rings = self.pool.rings.lock();
        let ring = &rings[self.index];
        if ring.current_pushes == 0 && self.tracking.is_idle() {
            ChannelState::Idle
        } else {
            ChannelState::Active
        }
    }

    /// Current fault status. Does not latch; `check_errors` does.
    pub fn get_status(&self) -> Result<()> {
        if let Some(error) = self.fault.get() {
            return Err(error);
        }

        if self.info.error_notifier.load(Ordering::Acquire) == 0 {
            return Ok(());
        }

        // Refine the kind with the ECC notifier. The notification order is
        // not guaranteed, so it is only consulted once a channel error has
        // been seen.
        let gpu = &self.shared.gpu;
        let ecc = gpu.ecc_enabled
            && gpu
                .ecc_error_notifier
                .as_ref()
                .map_or(false, |notifier| notifier.load(Ordering::Acquire) != 0);

        if ecc {
            Err(SubmitError::Channel(ChannelError::Ecc))
        } else {
            Err(SubmitError::Channel(ChannelError::Rc))
        }
    }

    /// Checks for a channel fault; on the first observation, latches it,
    /// reports the likely culprit push and raises the manager-wide fatal
    /// flag. Faults are sticky until the channel is destroyed.
    pub fn check_errors(&self) -> Result<()> {
        let Err(error) = self.get_status() else {
            return Ok(());
        };

        let already_latched = self.fault.get().is_some();
        self.fault.set_once(error);

        if !already_latched {
            log::error!(
                "Detected a channel error, channel {} GPU {}",
                self.name,
                self.shared.gpu.name
            );
            if let Some(fatal) = self.fatal_entry() {
                match &fatal.source {
                    Some(source) => log::error!(
                        "Channel error likely caused by push '{}' started at {}",
                        fatal.description,
                        source
                    ),
                    None => log::error!(
                        "Channel error likely caused by push '{}'",
                        fatal.description
                    ),
                }
            }
            self.shared.fatal.set_once(error);
        }

        Err(error)
    }

    /// The first pending entry after completed work is reclaimed: the push
    /// most likely responsible for a fault. Best effort; the entry may be
    /// reused concurrently.
    pub fn fatal_entry(&self) -> Option<PushReport> {
        let pending = self.update_progress_with_max(self.capacity(), UpdateMode::Completed);
        if pending == 0 {
            return None;
        }

        let completed_value = self.tracking.completed_value();
        let rings = self.pool.rings.lock();
        let ring = &rings[self.index];
        if ring.gpu_get == ring.cpu_put {
            return None;
        }
        let entry = &ring.entries[ring.gpu_get as usize];
        Some(Self::push_report(ring, entry, completed_value))
    }

    //-------------------------------------------------------------------------
    // Reporting
    //-------------------------------------------------------------------------

    fn push_report(ring: &RingState, entry: &GpfifoEntry, completed_value: u64) -> PushReport {
        let info = &ring.infos[entry.push_info as usize];
        PushReport {
            description: info.description.clone(),
            source: info
                .location
                .map(|location| format!("{}:{}", location.file(), location.line())),
            releasing: entry.tracking_value,
            finished: entry.tracking_value <= completed_value,
            acquires: info
                .acquires
                .as_ref()
                .map(|set| set.values.clone())
                .unwrap_or_default(),
            acquires_dropped: info.acquires.as_ref().map_or(0, |set| set.dropped),
        }
    }

    /// Snapshot for inspection: counters, locations and the pending pushes
    /// plus up to five recently finished ones whose slots haven't been
    /// reused.
    pub fn report(&self) -> ChannelReport {
        self.report_with_finished(5)
    }

    pub(crate) fn report_with_finished(&self, finished_count: u64) -> ChannelReport {
        let completed_value = self.tracking.refresh();

        let rings = self.pool.rings.lock();
        let ring = &rings[self.index];

        let capacity = ring.capacity();
        let mut pushes = Vec::new();
        let mut gpu_get = ring.gpu_get;
        while gpu_get != ring.cpu_put {
            let entry = &ring.entries[gpu_get as usize];
            if entry.tracking_value + finished_count > completed_value {
                pushes.push(Self::push_report(ring, entry, completed_value));
            }
            gpu_get = (gpu_get + 1) % capacity;
        }

        ChannelReport {
            name: self.name.clone(),
            completed: completed_value,
            queued: self.tracking.queued_value(),
            gpfifo_count: capacity,
            gpfifo_loc: self.shared.conf.gpfifo_loc,
            gpput_loc: self.shared.conf.gpput_loc,
            gpu_get: ring.gpu_get,
            cpu_put: ring.cpu_put,
            semaphore_gpu_va: self.tracking.gpu_va(),
            pushes,
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if self.tracking.queued_value() > 0 {
            if self.get_status().is_ok()
                && self.shared.fatal.get().is_none()
                && !self.tracking.is_idle()
            {
                log::warn!(
                    "Destroying channel {} with incomplete work queued",
                    self.name
                );
            }

            // Release every remaining pushbuffer region; after a fault the
            // in-flight semaphore values cannot be trusted anyway.
            self.update_progress_with_max(self.capacity(), UpdateMode::ForceAll);
        }

        self.shared.ops.rm.channel_destroy(self.handle);
    }
}

//=============================================================================
// Reports
//=============================================================================

#[derive(Clone, Debug)]
pub struct PushReport {
    pub description: String,
    /// `file:line` of the `begin_push` call site.
    pub source: Option<String>,
    /// The tracking-semaphore value this push releases.
    pub releasing: u64,
    pub finished: bool,
    pub acquires: Vec<PushAcquire>,
    /// Acquires recorded beyond the per-push cap.
    pub acquires_dropped: u32,
}

#[derive(Clone, Debug)]
pub struct ChannelReport {
    pub name: String,
    pub completed: u64,
    pub queued: u64,
    pub gpfifo_count: u32,
    pub gpfifo_loc: RingLocation,
    pub gpput_loc: RingLocation,
    pub gpu_get: u32,
    pub cpu_put: u32,
    pub semaphore_gpu_va: u64,
    pub pushes: Vec<PushReport>,
}
