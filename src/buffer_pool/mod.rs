// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! C2: brokers output graphic surfaces with an external surface producer
//! (spec §4.2). Mediates between "give me N output surfaces of a given
//! size/format/usage" and the producer's dequeue/attach/detach protocol,
//! including producer-switch buffer migration and the "spare slot"
//! starvation workaround.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::sleep;
use std::time::{Duration, Instant};

use crate::Fourcc;

/// Lower/upper bound of the exponentially-doubling backoff applied when a
/// fetch lands on the spare slot (spec §4.2 step 3, §8 S5).
pub const SPARE_DELAY_MIN_US: u64 = 500;
pub const SPARE_DELAY_MAX_US: u64 = 16384;

/// How long a fetch waits on the producer's acquire fence before giving up
/// (spec §4.2 step 2).
const FENCE_WAIT: Duration = Duration::from_millis(10);
/// How long `request_new_buffer_set` waits to acquire the allocation mutex
/// before returning `BLOCKING` (spec §4.2 "requestNewBufferSet").
const ALLOCATE_TIMEOUT: Duration = Duration::from_millis(500);

/// Tagged outcomes named in spec §4.2/§8.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    #[error("fetch timed out")]
    TimedOut,
    #[error("allocation mutex contended")]
    Blocking,
    #[error("pool or producer in a state that cannot satisfy this call")]
    BadState,
    #[error("slot not recognised by the pool")]
    InvalidSlot,
}

/// Result of `Producer::dequeue`: a slot and whether the caller must wait
/// on `acquire_fence` before using it.
pub struct DequeueResult {
    pub slot: u32,
    pub needs_realloc: bool,
    pub acquire_fence: Option<Box<dyn Fence>>,
}

/// A producer-side sync point gating use of a dequeued slot.
pub trait Fence: Send {
    /// Waits up to `timeout` for the fence to signal.
    fn wait(&self, timeout: Duration) -> Result<(), PoolError>;
}

/// Opaque graphic buffer materialised by `Producer::request_buffer`.
#[derive(Debug, Clone)]
pub struct GraphicBuffer {
    pub width: u32,
    pub height: u32,
    pub format: Fourcc,
    pub dmabuf_fds: Vec<std::os::fd::RawFd>,
}

/// The external surface producer (graphics BufferQueue) a [BufferPool]
/// brokers surfaces with. Slots are stable integer indices in `[0,64)`
/// (spec §6 "Surface producer").
pub trait Producer: Send + Sync {
    fn unique_id(&self) -> u64;
    fn dequeue(&self, w: u32, h: u32, format: Fourcc, usage: u64) -> Result<DequeueResult, PoolError>;
    fn request_buffer(&self, slot: u32) -> Result<GraphicBuffer, PoolError>;
    fn cancel_buffer(&self, slot: u32) -> Result<(), PoolError>;
    fn queue_buffer(&self, slot: u32) -> Result<(), PoolError>;
    fn attach_buffer(&self, buffer: &GraphicBuffer) -> Result<u32, PoolError>;
    fn detach_buffer(&self, slot: u32) -> Result<(), PoolError>;
    fn set_max_dequeued_buffer_count(&self, count: u32) -> Result<(), PoolError>;
    fn allow_allocation(&self, allow: bool) -> Result<(), PoolError>;
}

struct SlotEntry {
    generation: u64,
    usage: u64,
}

struct PoolState {
    producer: Option<Arc<dyn Producer>>,
    requested_count: u32,
    slot_map: HashMap<u32, SlotEntry>,
    spare_slot: Option<u32>,
    spare_delay_us: u64,
    buffers_in_client: u32,
    producer_switched: bool,
    producer_change_map: HashMap<u32, u32>,
    generation: u64,
}

impl Default for PoolState {
    fn default() -> Self {
        Self {
            producer: None,
            requested_count: 0,
            slot_map: HashMap::new(),
            spare_slot: None,
            spare_delay_us: SPARE_DELAY_MIN_US,
            buffers_in_client: 0,
            producer_switched: false,
            producer_change_map: HashMap::new(),
            generation: 0,
        }
    }
}

/// A timed mutex matching the teacher's `Arc<(Mutex<_>, Condvar)>` idiom,
/// used here for C2's bounded "configure-vs-allocate" lock (spec §5).
struct TimedMutex {
    locked: Mutex<bool>,
    cvar: Condvar,
}

impl TimedMutex {
    fn new() -> Self {
        Self { locked: Mutex::new(false), cvar: Condvar::new() }
    }

    fn try_lock_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut locked = self.locked.lock().unwrap();
        while *locked {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let (guard, result) = self.cvar.wait_timeout(locked, remaining).unwrap();
            locked = guard;
            if result.timed_out() && *locked {
                return false;
            }
        }
        *locked = true;
        true
    }

    fn unlock(&self) {
        let mut locked = self.locked.lock().unwrap();
        *locked = false;
        self.cvar.notify_one();
    }
}

struct Inner {
    state: Mutex<PoolState>,
    alloc_mutex: TimedMutex,
}

/// Brokers output graphic surfaces with an external producer.
#[derive(Clone)]
pub struct BufferPool(Arc<Inner>);

/// A handed-out graphic block (C4's `GraphicBlockInfo.block`).
///
/// Carries a weak back-reference to the pool plus `(producer_id, slot)`
/// (spec §9 "Cyclic/weak references"). If dropped without having been
/// marked shared, it detaches its slot from the producer exactly once.
pub struct Block {
    pool: Weak<Inner>,
    pub producer_id: u64,
    pub slot: u32,
    pub generation: u64,
    pub buffer: GraphicBuffer,
    shared: Mutex<bool>,
}

impl Block {
    /// Clears the destructor-side detach. Fails with `BadState` if called
    /// twice (spec §4.2 "Per-block deferred detach").
    pub fn mark_as_shared(&self) -> Result<(), PoolError> {
        let mut shared = self.shared.lock().unwrap();
        if *shared {
            return Err(PoolError::BadState);
        }
        *shared = true;
        Ok(())
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        if *self.shared.lock().unwrap() {
            return;
        }
        let Some(inner) = self.pool.upgrade() else { return };
        let state = inner.state.lock().unwrap();
        if let Some(producer) = state.producer.as_ref() {
            if producer.unique_id() == self.producer_id {
                let _ = producer.detach_buffer(self.slot);
            }
        }
    }
}

impl BufferPool {
    pub fn new() -> Self {
        Self(Arc::new(Inner { state: Mutex::new(PoolState::default()), alloc_mutex: TimedMutex::new() }))
    }

    /// Installs the initial producer. Equivalent to a first `switchProducer`
    /// with no prior allocations to migrate.
    pub fn set_producer(&self, producer: Arc<dyn Producer>) {
        let mut state = self.0.state.lock().unwrap();
        state.producer = Some(producer);
    }

    /// `requestNewBufferSet(N)` (spec §4.2).
    pub fn request_new_buffer_set(&self, n: u32) -> Result<(), PoolError> {
        if !self.0.alloc_mutex.try_lock_for(ALLOCATE_TIMEOUT) {
            return Err(PoolError::Blocking);
        }
        let result = self.request_new_buffer_set_locked(n);
        self.0.alloc_mutex.unlock();
        result
    }

    fn request_new_buffer_set_locked(&self, n: u32) -> Result<(), PoolError> {
        let mut state = self.0.state.lock().unwrap();
        let producer = state.producer.clone().ok_or(PoolError::BadState)?;

        if state.producer_switched {
            let owned: Vec<u32> = state.slot_map.keys().copied().collect();
            for slot in 0u32..64 {
                if !owned.contains(&slot) {
                    let _ = producer.detach_buffer(slot);
                }
            }
        }

        let still_dequeued = state.slot_map.len() as u32;
        producer.set_max_dequeued_buffer_count(n + still_dequeued + 1)?;

        state.slot_map.clear();
        state.producer_change_map.clear();
        state.requested_count = n;
        state.spare_slot = None;
        state.spare_delay_us = SPARE_DELAY_MIN_US;
        state.generation += 1;
        state.producer_switched = false;

        producer.allow_allocation(true)?;
        Ok(())
    }

    /// One fetch of spec §4.2's protocol. Returns `TIMED_OUT` for the spare
    /// slot, realloc-avoidance, and fence-timeout cases; `BAD_STATE` if a
    /// producer switch has invalidated the pool's slot map.
    pub fn fetch_graphic_block(&self, w: u32, h: u32, format: Fourcc, usage: u64) -> Result<Block, PoolError> {
        let mut state = self.0.state.lock().unwrap();
        let producer = state.producer.clone().ok_or(PoolError::BadState)?;
        if !state.producer_change_map.is_empty() {
            return Err(PoolError::BadState);
        }

        let dequeued = producer.dequeue(w, h, format, usage)?;
        let slot = dequeued.slot;

        if let Some(fence) = dequeued.acquire_fence {
            if let Err(_) = fence.wait(FENCE_WAIT) {
                let _ = producer.cancel_buffer(slot);
                return Err(PoolError::TimedOut);
            }
        }

        if state.spare_slot == Some(slot) {
            let _ = producer.cancel_buffer(slot);
            let delay = state.spare_delay_us;
            log::debug!("fetch_graphic_block: landed on spare slot {slot}, backing off {delay}us");
            drop(state);
            sleep(Duration::from_micros(delay));
            let mut state = self.0.state.lock().unwrap();
            state.spare_delay_us = (state.spare_delay_us * 2).min(SPARE_DELAY_MAX_US);
            return Err(PoolError::TimedOut);
        }

        if state.slot_map.len() as u32 >= state.requested_count && !state.slot_map.contains_key(&slot) {
            let _ = producer.detach_buffer(slot);
            return Err(PoolError::TimedOut);
        }

        let buffer = producer.request_buffer(slot)?;
        state.slot_map.insert(slot, SlotEntry { generation: state.generation, usage });
        state.spare_delay_us = SPARE_DELAY_MIN_US;

        if state.slot_map.len() as u32 == state.requested_count && state.spare_slot.is_none() {
            if let Ok(spare) = producer.dequeue(w, h, format, usage) {
                let _ = producer.cancel_buffer(spare.slot);
                state.spare_slot = Some(spare.slot);
            }
            let _ = producer.allow_allocation(false);
        }

        let generation = state.generation;
        Ok(Block {
            pool: Arc::downgrade(&self.0),
            producer_id: producer.unique_id(),
            slot,
            generation,
            buffer,
            shared: Mutex::new(false),
        })
    }

    /// `switchProducer`: migrates the existing buffer set to `new_producer`
    /// (spec §4.2).
    pub fn switch_producer(&self, new_producer: Arc<dyn Producer>) -> Result<(), PoolError> {
        let mut state = self.0.state.lock().unwrap();
        let n = state.requested_count;
        let old_producer = state.producer.clone();

        let attempt = || -> Result<HashMap<u32, u32>, PoolError> {
            new_producer.set_max_dequeued_buffer_count(2 * n + 1)?;
            new_producer.allow_allocation(true)?;
            let spare = new_producer.dequeue(0, 0, Fourcc::default(), 0)?;
            new_producer.cancel_buffer(spare.slot)?;

            let mut map = HashMap::new();
            for (&old_slot, entry) in state.slot_map.iter() {
                let buffer = GraphicBuffer {
                    width: 0,
                    height: 0,
                    format: Fourcc::default(),
                    dmabuf_fds: Vec::new(),
                };
                let _ = entry;
                let new_slot = new_producer.attach_buffer(&buffer)?;
                map.insert(old_slot, new_slot);
            }
            new_producer.allow_allocation(false)?;
            Ok(map)
        };

        match attempt() {
            Ok(map) => {
                log::debug!("BufferPool: switching producer, migrating {} slots", map.len());
                if let Some(old) = old_producer {
                    for &old_slot in state.slot_map.keys() {
                        let _ = old.detach_buffer(old_slot);
                    }
                }
                state.producer_change_map = map;
                state.producer_switched = true;
                state.producer = Some(new_producer);
                Ok(())
            }
            Err(e) => {
                log::error!("BufferPool: producer switch failed: {e}");
                state.producer_change_map.clear();
                Err(e)
            }
        }
    }

    /// `updateGraphicBlock(oldSlot, willCancel)` (spec §4.2), called by C4
    /// after it sees `BadState` from a fetch.
    pub fn update_graphic_block(&self, old_slot: u32, will_cancel: bool) -> Result<Option<Block>, PoolError> {
        let mut state = self.0.state.lock().unwrap();
        let new_slot = *state.producer_change_map.get(&old_slot).ok_or(PoolError::InvalidSlot)?;
        let producer = state.producer.clone().ok_or(PoolError::BadState)?;

        let result = if will_cancel {
            producer.cancel_buffer(new_slot)?;
            state.buffers_in_client += 1;
            None
        } else {
            Some(Block {
                pool: Arc::downgrade(&self.0),
                producer_id: producer.unique_id(),
                slot: new_slot,
                generation: state.generation,
                buffer: GraphicBuffer { width: 0, height: 0, format: Fourcc::default(), dmabuf_fds: Vec::new() },
                shared: Mutex::new(false),
            })
        };

        state.producer_change_map.remove(&old_slot);
        if state.producer_change_map.is_empty() {
            let target = state.slot_map.len() as u32 + state.buffers_in_client + 1;
            producer.set_max_dequeued_buffer_count(target)?;
        }
        Ok(result)
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}
