use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use raw_sync::locks::{LockGuard, LockImpl, LockInit, Mutex};
use raw_sync::Timeout;
use tracing::{debug, warn};

use super::{current_pid, now_ms, Region, MUTEX_REGION};
use crate::errors::{os_result, IpcError, Result};

/// Who holds a segment lock right now, as recorded in the header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockInfo {
    pub holder_pid: u32,
    pub held_for: Duration,
}

/// The process-shared mutex living at the start of a segment.
pub(crate) struct SegmentLock {
    mutex: Box<dyn LockImpl>,
    timeout: Duration,
}

impl SegmentLock {
    /// Initialises a fresh mutex. Only the setup winner calls this.
    pub fn init(region: &Region, timeout: Duration) -> Result<SegmentLock> {
        let mutex = init_mutex(region)?;
        Ok(SegmentLock { mutex, timeout })
    }

    pub fn attach(region: &Region, timeout: Duration) -> Result<SegmentLock> {
        let (mutex, used) = unsafe { Mutex::from_existing(region.mutex_ptr(), region.payload_ptr()) }
            .map_err(IpcError::lock)?;
        if used > MUTEX_REGION {
            return Err(IpcError::AllocationFailed(format!(
                "mutex needs {} bytes, {} reserved",
                used, MUTEX_REGION
            )));
        }
        Ok(SegmentLock { mutex, timeout })
    }

    /// Blocks up to the configured timeout. A holder that died while holding
    /// the lock is taken over once; a live holder is never pre-empted.
    pub fn acquire<'a>(&'a self, region: &'a Region, name: &str) -> Result<SegmentGuard<'a>> {
        let header = region.header();
        let epoch = header.epoch.load(Ordering::Acquire);
        let started = Instant::now();

        match self.mutex.try_lock(Timeout::Val(self.timeout)) {
            Ok(inner) => return Ok(SegmentGuard::enter(region, inner, false)),
            Err(e) if started.elapsed() < self.timeout => return Err(IpcError::lock(e)),
            Err(_) => {}
        }

        let holder = header.holder_pid.load(Ordering::Acquire);
        if holder == 0 || process_alive(holder) {
            if let Some(info) = lock_info(region) {
                debug!(name, holder = info.holder_pid, held_for = ?info.held_for, "lock timeout");
            }
            return Err(IpcError::LockTimeout(self.timeout));
        }

        let discarded = take_over(region, name, holder, epoch)?;
        // A waiter parked on the abandoned mutex is not woken by the
        // re-initialisation, so it gets a second round.
        for _ in 0..2 {
            if let Ok(inner) = self.mutex.try_lock(Timeout::Val(self.timeout)) {
                return Ok(SegmentGuard::enter(region, inner, discarded));
            }
        }
        Err(IpcError::LockTimeout(self.timeout))
    }
}

fn init_mutex(region: &Region) -> Result<Box<dyn LockImpl>> {
    let (mutex, used) =
        unsafe { Mutex::new(region.mutex_ptr(), region.payload_ptr()) }.map_err(IpcError::lock)?;
    if used > MUTEX_REGION {
        return Err(IpcError::AllocationFailed(format!(
            "mutex needs {} bytes, {} reserved",
            used, MUTEX_REGION
        )));
    }
    Ok(mutex)
}

/// Re-initialises the mutex abandoned by `dead_pid`. Exactly one waiter wins
/// the epoch swap; the others just retry. Returns whether the payload was discarded.
fn take_over(region: &Region, name: &str, dead_pid: u32, epoch: u32) -> Result<bool> {
    let header = region.header();
    if header
        .epoch
        .compare_exchange(epoch, epoch.wrapping_add(1), Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return Ok(false);
    }

    warn!(name, dead_pid, "taking over lock abandoned by a dead process");
    // The mutex stays held by the dead process until re-initialised below, so
    // nobody else can enter while the header is reset.
    let discarded = header.dirty.swap(0, Ordering::AcqRel) != 0;
    if discarded {
        warn!(name, "holder died mid-mutation, discarding segment contents");
        unsafe { region.payload_mut() }.fill(0);
        header.occupied.store(0, Ordering::Release);
        header.generation.fetch_add(1, Ordering::AcqRel);
    }
    header.holder_pid.store(0, Ordering::Release);
    header.locked.store(0, Ordering::Release);

    // Last step: the fresh handle points at the same memory and the existing
    // handles keep working.
    drop(init_mutex(region)?);
    Ok(discarded)
}

pub(crate) fn lock_info(region: &Region) -> Option<LockInfo> {
    let header = region.header();
    if header.locked.load(Ordering::Acquire) == 0 {
        return None;
    }
    let acquired = header.acquired_at_ms.load(Ordering::Acquire);
    Some(LockInfo {
        holder_pid: header.holder_pid.load(Ordering::Acquire),
        held_for: Duration::from_millis(now_ms().saturating_sub(acquired)),
    })
}

#[cfg(unix)]
pub(crate) fn process_alive(pid: u32) -> bool {
    let ret = unsafe { libc::kill(pid as libc::pid_t, 0) };
    match os_result(ret) {
        Ok(()) => true,
        // EPERM still means the process exists.
        Err(e) => e.raw_os_error() != Some(libc::ESRCH),
    }
}

#[cfg(not(unix))]
pub(crate) fn process_alive(_pid: u32) -> bool {
    let _ = os_result;
    true
}

/// Scoped critical section over one segment. Dropping it releases the lock.
pub(crate) struct SegmentGuard<'a> {
    region: &'a Region,
    _inner: LockGuard<'a>,
    recovered: bool,
}

impl<'a> SegmentGuard<'a> {
    fn enter(region: &'a Region, inner: LockGuard<'a>, recovered: bool) -> SegmentGuard<'a> {
        let header = region.header();
        header.holder_pid.store(current_pid(), Ordering::Release);
        header.acquired_at_ms.store(now_ms(), Ordering::Release);
        header.locked.store(1, Ordering::Release);
        SegmentGuard {
            region,
            _inner: inner,
            recovered,
        }
    }

    /// True when this acquisition discarded contents left by a dead holder.
    pub fn recovered(&self) -> bool {
        self.recovered
    }

    pub fn capacity(&self) -> usize {
        self.region.capacity()
    }

    pub fn payload(&self) -> &[u8] {
        unsafe { self.region.payload() }
    }

    /// Marks the segment dirty until the guard drops.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        self.region.header().dirty.store(1, Ordering::Release);
        unsafe { self.region.payload_mut() }
    }

    pub fn occupied(&self) -> usize {
        self.region.header().occupied.load(Ordering::Acquire) as usize
    }

    pub fn set_occupied(&mut self, occupied: usize) -> Result<()> {
        if occupied > self.capacity() {
            return Err(IpcError::TooLarge {
                len: occupied,
                capacity: self.capacity(),
            });
        }
        let header = self.region.header();
        header.dirty.store(1, Ordering::Release);
        header.occupied.store(occupied as u64, Ordering::Release);
        Ok(())
    }

    pub fn generation(&self) -> u64 {
        self.region.header().generation.load(Ordering::Acquire)
    }

    pub fn bump_generation(&mut self) -> u64 {
        self.region.header().generation.fetch_add(1, Ordering::AcqRel) + 1
    }
}

impl Drop for SegmentGuard<'_> {
    fn drop(&mut self) {
        // Runs before the inner guard releases the mutex.
        let header = self.region.header();
        header.dirty.store(0, Ordering::Release);
        header.locked.store(0, Ordering::Release);
        header.holder_pid.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_process_is_alive() {
        assert!(process_alive(current_pid()));
    }

    #[cfg(unix)]
    #[test]
    fn reaped_child_is_dead() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        assert!(!process_alive(pid));
    }
}
