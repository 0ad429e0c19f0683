//! Channel pools: the unit of locking.
//!
//! A pool groups the channels bound to one copy engine behind a single
//! spinlock. Reservers pick any channel of the pool opportunistically, so
//! one lock keeps the scan fair and avoids ordering between the channels of
//! a pool. The lock is strictly leaf-level: nothing else is acquired while
//! it is held.

use std::sync::Arc;

use crate::channel::{Channel, RingState};
use crate::manager::ManagerShared;
use crate::Result;

/// The proxy deployment supports a single channel per pool.
pub(crate) const CHANNELS_PER_POOL: usize = 2;

pub(crate) struct PoolCore {
    pub ce_index: u32,
    pub is_proxy: bool,
    /// Ring and push-info state of every channel in the pool, indexed by
    /// the channel's position in the array.
    pub rings: spin::Mutex<Vec<RingState>>,
}

pub struct ChannelPool {
    core: Arc<PoolCore>,
    channels: Vec<Arc<Channel>>,
}

impl ChannelPool {
    pub(crate) fn create(
        shared: &Arc<ManagerShared>,
        ce_index: u32,
        is_proxy: bool,
    ) -> Result<ChannelPool> {
        let core = Arc::new(PoolCore {
            ce_index,
            is_proxy,
            rings: spin::Mutex::new(Vec::new()),
        });

        let num_channels = if is_proxy { 1 } else { CHANNELS_PER_POOL };

        let mut pool = ChannelPool {
            core: core.clone(),
            channels: Vec::with_capacity(num_channels),
        };

        for index in 0..num_channels {
            let channel = Arc::new(Channel::create(shared, &core, index)?);
            channel.init()?;
            pool.channels.push(channel);
        }

        Ok(pool)
    }

    pub fn ce_index(&self) -> u32 {
        self.core.ce_index
    }

    pub fn is_proxy(&self) -> bool {
        self.core.is_proxy
    }

    pub fn channels(&self) -> &[Arc<Channel>] {
        &self.channels
    }
}

impl Drop for ChannelPool {
    fn drop(&mut self) {
        // Tear channels down in reverse creation order.
        while self.channels.pop().is_some() {}
    }
}
