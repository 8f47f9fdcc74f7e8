use std::fs;
use std::io;
use std::mem;
use std::path::PathBuf;
use std::process;
use std::slice;
use std::sync::atomic::{AtomicU32, AtomicU64};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use ::shared_memory::{Shmem, ShmemConf, ShmemError};
use serde_derive::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::{normalize, IpcError, Result};

pub(crate) mod lock;

pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 1000;

// Mapping layout: [mutex | header | payload]. The mapping itself is page aligned.
pub(crate) const MUTEX_REGION: usize = 128;
pub(crate) const HEADER_REGION: usize = 128;
pub(crate) const PAYLOAD_OFFSET: usize = MUTEX_REGION + HEADER_REGION;

pub(crate) const SEGMENT_MAGIC: u64 = 0x5849_5043_5345_4731; // "XIPCSEG1"

pub(crate) const STATE_FRESH: u32 = 0;
pub(crate) const STATE_INITIALISING: u32 = 1;
pub(crate) const STATE_READY: u32 = 2;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShmemConfig {
    /// Directory holding the link files that name each segment.
    pub data_dir: String,
    pub lock_timeout_ms: u64,
    pub verbose: bool,
}

impl Default for ShmemConfig {
    fn default() -> Self {
        ShmemConfig {
            data_dir: std::env::temp_dir().to_string_lossy().into_owned(),
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            verbose: false,
        }
    }
}

impl ShmemConfig {
    pub fn builder() -> ShmemConfigBuilder {
        ShmemConfigBuilder {
            inner: ShmemConfig::default(),
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.data_dir.is_empty() {
            return Err(IpcError::Config("data_dir must not be empty".into()));
        }
        if self.lock_timeout_ms == 0 {
            return Err(IpcError::Config("lock_timeout_ms must be greater than 0".into()));
        }
        Ok(())
    }

    pub(crate) fn link_path(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name.contains('/') || name.contains('\\') || name.contains('\0') {
            return Err(IpcError::Config(format!("invalid resource name '{}'", name)));
        }
        Ok(PathBuf::from(&self.data_dir).join(name))
    }
}

pub struct ShmemConfigBuilder {
    inner: ShmemConfig,
}

impl ShmemConfigBuilder {
    pub fn data_dir(mut self, data_dir: String) -> Self {
        self.inner.data_dir = data_dir;
        self
    }

    pub fn lock_timeout_ms(mut self, lock_timeout_ms: u64) -> Self {
        self.inner.lock_timeout_ms = lock_timeout_ms;
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.inner.verbose = verbose;
        self
    }

    pub fn build(self) -> Result<ShmemConfig> {
        self.inner.validate()?;
        Ok(self.inner)
    }
}

/// Fixed header shared by every process that maps the segment.
#[repr(C)]
pub(crate) struct SegmentHeader {
    pub magic: AtomicU64,
    pub state: AtomicU32,
    pub holder_pid: AtomicU32,
    pub locked: AtomicU32,
    pub dirty: AtomicU32,
    pub epoch: AtomicU32,
    _reserved: AtomicU32,
    pub acquired_at_ms: AtomicU64,
    pub capacity: AtomicU64,
    pub occupied: AtomicU64,
    pub generation: AtomicU64,
}

const _: () = assert!(mem::size_of::<SegmentHeader>() <= HEADER_REGION);

/// A mapped segment: the shared_memory handle plus its fixed layout.
pub(crate) struct Region {
    shmem: Shmem,
    link: PathBuf,
    capacity: usize,
    created: bool,
}

impl Region {
    /// Creates the named mapping, or attaches when the link already exists.
    pub fn open_or_create(cfg: &ShmemConfig, name: &str, capacity: usize) -> Result<Region> {
        cfg.validate()?;
        if capacity == 0 {
            return Err(IpcError::AllocationFailed(format!(
                "segment '{}' needs a capacity greater than 0",
                name
            )));
        }
        let size = PAYLOAD_OFFSET
            .checked_add(capacity)
            .ok_or_else(|| IpcError::AllocationFailed(format!("capacity {} overflows", capacity)))?;
        let link = cfg.link_path(name)?;

        let mut deadline = Instant::now() + cfg.lock_timeout();
        let mut dangling_removed = false;
        loop {
            match ShmemConf::new().size(size).flink(&link).create() {
                Ok(mut shmem) => {
                    // Only an explicit unlink destroys the mapping.
                    shmem.set_owner(false);
                    info!(name, size, os_id = shmem.get_os_id(), "created segment");
                    return Ok(Region {
                        shmem,
                        link,
                        capacity,
                        created: true,
                    });
                }
                Err(ShmemError::LinkExists) => {}
                Err(e) => return Err(map_create_error(name, e)),
            }

            match ShmemConf::new().flink(&link).open() {
                Ok(shmem) => return Region::attached(shmem, link, name, capacity),
                Err(ShmemError::LinkDoesNotExist) => continue,
                // The creator may not have finished writing the link yet.
                Err(e @ ShmemError::LinkReadFailed(_))
                | Err(e @ ShmemError::FlinkInvalidOsId)
                | Err(e @ ShmemError::MapOpenFailed(_)) => {
                    if Instant::now() < deadline {
                        thread::sleep(Duration::from_millis(1));
                        continue;
                    }
                    if dangling_removed {
                        return Err(e.into());
                    }
                    warn!(name, error = %e, "removing dangling segment link");
                    remove_link(&link)?;
                    dangling_removed = true;
                    deadline = Instant::now() + cfg.lock_timeout();
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn attached(shmem: Shmem, link: PathBuf, name: &str, requested: usize) -> Result<Region> {
        let existing = shmem.len().saturating_sub(PAYLOAD_OFFSET);
        if existing < requested {
            return Err(IpcError::NameConflict {
                name: name.to_string(),
                reason: format!(
                    "existing segment holds {} bytes, {} requested",
                    existing, requested
                ),
            });
        }
        debug!(name, capacity = existing, os_id = shmem.get_os_id(), "attached segment");
        Ok(Region {
            shmem,
            link,
            capacity: existing,
            created: false,
        })
    }

    /// Unlinks the named resource without having it mapped. Missing resources are fine.
    pub fn destroy_by_name(cfg: &ShmemConfig, name: &str) -> Result<()> {
        let link = cfg.link_path(name)?;
        match ShmemConf::new().flink(&link).open() {
            Ok(shmem) => {
                let region = Region {
                    shmem,
                    link,
                    capacity: 0,
                    created: false,
                };
                region.destroy()
            }
            Err(ShmemError::LinkDoesNotExist) => Ok(()),
            Err(e) => {
                debug!(name, error = %e, "mapping already gone, removing link");
                remove_link(&link)
            }
        }
    }

    pub fn destroy(mut self) -> Result<()> {
        // A link naming another mapping belongs to a segment recreated after ours was unlinked.
        let ours = match fs::read_to_string(&self.link) {
            Ok(os_id) => os_id.trim_end_matches('\0').trim() == self.shmem.get_os_id(),
            Err(e) => e.kind() != io::ErrorKind::NotFound,
        };
        if !ours {
            debug!(link = %self.link.display(), "link already removed or reused");
            return Ok(());
        }
        self.shmem.set_owner(true);
        let link = self.link.clone();
        drop(self);
        remove_link(&link)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn created(&self) -> bool {
        self.created
    }

    pub fn header(&self) -> &SegmentHeader {
        // The mapping is page aligned and at least PAYLOAD_OFFSET long.
        unsafe { &*(self.shmem.as_ptr().add(MUTEX_REGION) as *const SegmentHeader) }
    }

    pub fn mutex_ptr(&self) -> *mut u8 {
        self.shmem.as_ptr()
    }

    pub fn payload_ptr(&self) -> *mut u8 {
        unsafe { self.shmem.as_ptr().add(PAYLOAD_OFFSET) }
    }

    /// Raw payload view. Callers must hold the segment lock.
    pub unsafe fn payload(&self) -> &[u8] {
        slice::from_raw_parts(self.payload_ptr(), self.capacity)
    }

    /// Raw mutable payload view. Callers must hold the segment lock.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn payload_mut(&self) -> &mut [u8] {
        slice::from_raw_parts_mut(self.payload_ptr(), self.capacity)
    }
}

fn map_create_error(name: &str, err: ShmemError) -> IpcError {
    match err {
        ShmemError::MappingIdExists => IpcError::NameConflict {
            name: name.to_string(),
            reason: "os mapping id already in use".into(),
        },
        ShmemError::MapCreateFailed(code) => IpcError::AllocationFailed(format!(
            "creating mapping for '{}' failed with os error {}",
            name, code
        )),
        e => e.into(),
    }
}

fn remove_link(link: &PathBuf) -> Result<()> {
    match fs::remove_file(link) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Ok(normalize(e)?),
    }
}

pub(crate) fn current_pid() -> u32 {
    process::id()
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;
    use tempfile::tempdir;

    #[test]
    fn builder_rejects_zero_timeout() {
        let result = ShmemConfig::builder().lock_timeout_ms(0).build();
        assert!(matches!(result, Err(IpcError::Config(_))));
    }

    #[test]
    fn builder_keeps_values() -> std::result::Result<(), Box<dyn Error>> {
        let cfg = ShmemConfig::builder()
            .data_dir("/tmp/xipc".to_string())
            .lock_timeout_ms(250)
            .verbose(true)
            .build()?;
        assert_eq!(cfg.lock_timeout(), Duration::from_millis(250));
        assert!(cfg.verbose);
        assert_eq!(cfg.link_path("q1")?, PathBuf::from("/tmp/xipc/q1"));
        Ok(())
    }

    #[test]
    fn names_with_separators_are_rejected() {
        let cfg = ShmemConfig::default();
        assert!(cfg.link_path("a/b").is_err());
        assert!(cfg.link_path("").is_err());
    }

    #[test]
    fn second_open_attaches_and_checks_capacity() -> std::result::Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        let cfg = ShmemConfig::builder()
            .data_dir(dir.path().to_string_lossy().into_owned())
            .build()?;
        let first = Region::open_or_create(&cfg, "region", 512)?;
        assert!(first.created());

        let second = Region::open_or_create(&cfg, "region", 128)?;
        assert!(!second.created());
        assert_eq!(second.capacity(), 512);

        let conflict = Region::open_or_create(&cfg, "region", 4096);
        assert!(matches!(conflict, Err(IpcError::NameConflict { .. })));

        drop(second);
        first.destroy()?;
        Region::destroy_by_name(&cfg, "region")?;
        Ok(())
    }
}
