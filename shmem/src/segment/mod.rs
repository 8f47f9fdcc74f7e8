//! Named, fixed-capacity shared memory segment.
//!
//! A segment is created (or attached) by name and must be [`Segment::setup`]
//! before use. Every read and write happens inside one locked critical
//! section, so a reader never observes a partially written payload.

use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::core::lock::{lock_info, process_alive, LockInfo, SegmentGuard, SegmentLock};
use crate::core::{
    current_pid, Region, SegmentHeader, ShmemConfig, SEGMENT_MAGIC, STATE_FRESH,
    STATE_INITIALISING, STATE_READY,
};
use crate::errors::{IpcError, Result};

struct Mapped {
    // Declared first so it is dropped before the mapping it points into.
    lock: Option<SegmentLock>,
    region: Region,
}

pub struct Segment {
    name: String,
    config: ShmemConfig,
    mapped: Option<Mapped>,
}

impl Segment {
    /// Creates the named segment, or attaches to it when it already exists.
    ///
    /// Attaching adopts the existing capacity; asking for more than the
    /// existing segment holds is a `NameConflict`.
    pub fn create(cfg: &ShmemConfig, name: &str, capacity: usize) -> Result<Segment> {
        let region = Region::open_or_create(cfg, name, capacity)?;
        Ok(Segment {
            name: name.to_string(),
            config: cfg.clone(),
            mapped: Some(Mapped { lock: None, region }),
        })
    }

    /// Initialises the header if this is the first caller to claim it.
    ///
    /// Returns `Ok(false)` when another handle already completed setup; that
    /// is success, and this handle is attached to the existing lock.
    pub fn setup(&mut self) -> Result<bool> {
        let timeout = self.config.lock_timeout();
        let name = self.name.clone();
        let mapped = self.mapped.as_mut().ok_or_else(|| IpcError::Closed(name.clone()))?;
        if mapped.lock.is_some() {
            return Ok(false);
        }

        let header = mapped.region.header();
        let mut deadline = Instant::now() + timeout;
        loop {
            match header.state.compare_exchange(
                STATE_FRESH,
                STATE_INITIALISING,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    header.holder_pid.store(current_pid(), Ordering::Release);
                    let lock = match SegmentLock::init(&mapped.region, timeout) {
                        Ok(lock) => lock,
                        Err(e) => {
                            release_claim(header);
                            return Err(e);
                        }
                    };
                    header.locked.store(0, Ordering::Release);
                    header.dirty.store(0, Ordering::Release);
                    header.epoch.store(0, Ordering::Release);
                    header.acquired_at_ms.store(0, Ordering::Release);
                    header.capacity.store(mapped.region.capacity() as u64, Ordering::Release);
                    header.occupied.store(0, Ordering::Release);
                    header.generation.store(0, Ordering::Release);
                    header.magic.store(SEGMENT_MAGIC, Ordering::Release);
                    header.holder_pid.store(0, Ordering::Release);
                    header.state.store(STATE_READY, Ordering::Release);
                    mapped.lock = Some(lock);
                    info!(name = %name, capacity = mapped.region.capacity(), "segment set up");
                    return Ok(true);
                }
                Err(STATE_READY) => {
                    if header.magic.load(Ordering::Acquire) != SEGMENT_MAGIC {
                        return Err(IpcError::Corrupted(format!(
                            "segment '{}' has an unknown header",
                            name
                        )));
                    }
                    mapped.lock = Some(SegmentLock::attach(&mapped.region, timeout)?);
                    debug!(name = %name, "segment already set up, attached");
                    return Ok(false);
                }
                Err(_) => {
                    if Instant::now() < deadline {
                        thread::sleep(Duration::from_millis(1));
                        continue;
                    }
                    let initialiser = header.holder_pid.load(Ordering::Acquire);
                    if initialiser != 0 && !process_alive(initialiser) {
                        // The initialiser died; release its claim and compete again.
                        let _ = header.state.compare_exchange(
                            STATE_INITIALISING,
                            STATE_FRESH,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        );
                        deadline = Instant::now() + timeout;
                        continue;
                    }
                    return Err(IpcError::LockTimeout(timeout));
                }
            }
        }
    }

    pub fn write(&self, payload: &[u8]) -> Result<()> {
        let mut guard = self.lock()?;
        if payload.len() > guard.capacity() {
            return Err(IpcError::TooLarge {
                len: payload.len(),
                capacity: guard.capacity(),
            });
        }
        let previous = guard.occupied();
        let region = guard.payload_mut();
        region[..payload.len()].copy_from_slice(payload);
        if previous > payload.len() {
            region[payload.len()..previous].fill(0);
        }
        guard.set_occupied(payload.len())?;
        let generation = guard.bump_generation();
        op_event!(self.config.verbose, name = %self.name, len = payload.len(), generation, "segment write");
        Ok(())
    }

    pub fn write_str(&self, payload: &str) -> Result<()> {
        self.write(payload.as_bytes())
    }

    /// Copies out exactly the occupied bytes. An empty segment is `Empty`.
    pub fn read(&self) -> Result<Vec<u8>> {
        self.read_versioned().map(|(_, bytes)| bytes)
    }

    pub fn read_string(&self) -> Result<String> {
        Ok(String::from_utf8(self.read()?)?)
    }

    /// Reads the payload together with the generation it was written at.
    pub fn read_versioned(&self) -> Result<(u64, Vec<u8>)> {
        let guard = self.lock()?;
        let occupied = guard.occupied();
        if occupied == 0 {
            return Err(IpcError::Empty(self.name.clone()));
        }
        let bytes = guard.payload()[..occupied].to_vec();
        op_event!(self.config.verbose, name = %self.name, len = occupied, "segment read");
        Ok((guard.generation(), bytes))
    }

    /// Returns the payload only when a write happened after `since`.
    pub fn read_if_changed(&self, since: u64) -> Result<Option<(u64, Vec<u8>)>> {
        let guard = self.lock()?;
        let generation = guard.generation();
        if generation == since {
            return Ok(None);
        }
        let occupied = guard.occupied();
        Ok(Some((generation, guard.payload()[..occupied].to_vec())))
    }

    pub fn generation(&self) -> Result<u64> {
        Ok(self.lock()?.generation())
    }

    pub fn clear(&self) -> Result<()> {
        let mut guard = self.lock()?;
        let occupied = guard.occupied();
        guard.payload_mut()[..occupied].fill(0);
        guard.set_occupied(0)?;
        guard.bump_generation();
        op_event!(self.config.verbose, name = %self.name, "segment cleared");
        Ok(())
    }

    /// Best-effort diagnostic; never use it to synchronise.
    pub fn is_locked(&self) -> bool {
        self.mapped
            .as_ref()
            .map(|m| m.region.header().locked.load(Ordering::Acquire) != 0)
            .unwrap_or(false)
    }

    pub fn lock_info(&self) -> Option<LockInfo> {
        self.mapped.as_ref().and_then(|m| lock_info(&m.region))
    }

    /// Releases this process's view. The named resource stays alive.
    pub fn close(&mut self) {
        if self.mapped.take().is_some() {
            debug!(name = %self.name, "segment closed");
        }
    }

    /// Removes the named resource system-wide. Calling it again is a no-op.
    pub fn unlink(&mut self) -> Result<()> {
        match self.mapped.take() {
            Some(Mapped { lock, region }) => {
                drop(lock);
                region.destroy()?;
            }
            None => Region::destroy_by_name(&self.config, &self.name)?,
        }
        info!(name = %self.name, "segment unlinked");
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.mapped.as_ref().map(|m| m.region.capacity()).unwrap_or(0)
    }

    pub fn is_setup(&self) -> bool {
        self.mapped.as_ref().map(|m| m.lock.is_some()).unwrap_or(false)
    }

    /// True when this handle created the named resource.
    pub fn is_creator(&self) -> bool {
        self.mapped.as_ref().map(|m| m.region.created()).unwrap_or(false)
    }

    pub(crate) fn config(&self) -> &ShmemConfig {
        &self.config
    }

    /// Opens one critical section. Every shared access goes through here.
    pub(crate) fn lock(&self) -> Result<SegmentGuard<'_>> {
        let mapped = self
            .mapped
            .as_ref()
            .ok_or_else(|| IpcError::Closed(self.name.clone()))?;
        let lock = mapped
            .lock
            .as_ref()
            .ok_or_else(|| IpcError::NotSetUp(self.name.clone()))?;
        lock.acquire(&mapped.region, &self.name)
    }
}

/// Gives a setup claim back so a later `setup` can compete again.
fn release_claim(header: &SegmentHeader) {
    header.holder_pid.store(0, Ordering::Release);
    header.state.store(STATE_FRESH, Ordering::Release);
}
