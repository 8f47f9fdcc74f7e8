//! Bounded ring of fixed-size item slots over a [`Segment`].
//!
//! The ring header lives at the start of the segment payload, followed by
//! `capacity` slots of `[len: u32 LE][item_size bytes]`:
//!
//! ```text
//! magic u32 | mode u32 | capacity u64 | item_size u64 | head u64 | tail u64 | count u64
//! ```
//!
//! Every operation is one critical section on the segment lock.

use std::convert::TryInto;

use serde_derive::{Deserialize, Serialize};
use tracing::info;

use crate::codec::Cursor;
use crate::core::ShmemConfig;
use crate::errors::{IpcError, Result};
use crate::segment::Segment;

mod ring;

use ring::Ring;

pub const DEFAULT_CAPACITY: usize = 16;
pub const DEFAULT_ITEM_SIZE: usize = 256;

const RING_MAGIC: u32 = 0x4452_4e47; // "DRNG"
const RING_HEADER_LEN: usize = 48;
const SLOT_LEN_PREFIX: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Fifo,
    Lifo,
    Deque,
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Fifo
    }
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Fifo => "FIFO",
            Mode::Lifo => "LIFO",
            Mode::Deque => "DEQUE",
        }
    }

    fn code(self) -> u32 {
        match self {
            Mode::Fifo => 1,
            Mode::Lifo => 2,
            Mode::Deque => 3,
        }
    }

    fn from_code(code: u32) -> Option<Mode> {
        match code {
            1 => Some(Mode::Fifo),
            2 => Some(Mode::Lifo),
            3 => Some(Mode::Deque),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispenserOptions {
    pub name: String,
    pub mode: Mode,
    pub capacity: usize,
    pub item_size: usize,
}

impl Default for DispenserOptions {
    fn default() -> Self {
        DispenserOptions {
            name: "dispenser".to_string(),
            mode: Mode::Fifo,
            capacity: DEFAULT_CAPACITY,
            item_size: DEFAULT_ITEM_SIZE,
        }
    }
}

/// Ring bookkeeping as stored in shared memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct RingHeader {
    mode: Mode,
    item_size: usize,
    ring: Ring,
}

impl RingHeader {
    fn load(payload: &[u8], name: &str) -> Result<RingHeader> {
        let mut cursor = Cursor::new(payload);
        if payload.len() < RING_HEADER_LEN || cursor.u32()? != RING_MAGIC {
            return Err(IpcError::NotSetUp(name.to_string()));
        }
        let mode = Mode::from_code(cursor.u32()?)
            .ok_or_else(|| IpcError::Corrupted(format!("'{}' has an unknown mode", name)))?;
        let capacity = to_usize(cursor.u64()?)?;
        let item_size = to_usize(cursor.u64()?)?;
        let ring = Ring {
            head: to_usize(cursor.u64()?)?,
            tail: to_usize(cursor.u64()?)?,
            count: to_usize(cursor.u64()?)?,
            capacity,
        };
        let fits = required_bytes(capacity, item_size)
            .map(|n| n <= payload.len())
            .unwrap_or(false);
        if !ring.is_consistent() || !fits {
            return Err(IpcError::Corrupted(format!(
                "'{}' ring indices are inconsistent: {:?}",
                name, ring
            )));
        }
        Ok(RingHeader {
            mode,
            item_size,
            ring,
        })
    }

    fn store(&self, payload: &mut [u8]) {
        let fields = [
            self.ring.capacity as u64,
            self.item_size as u64,
            self.ring.head as u64,
            self.ring.tail as u64,
            self.ring.count as u64,
        ];
        payload[0..4].copy_from_slice(&RING_MAGIC.to_le_bytes());
        payload[4..8].copy_from_slice(&self.mode.code().to_le_bytes());
        for (i, field) in fields.iter().enumerate() {
            let at = 8 + i * 8;
            payload[at..at + 8].copy_from_slice(&field.to_le_bytes());
        }
    }

    fn stride(&self) -> usize {
        SLOT_LEN_PREFIX + self.item_size
    }

    fn slot_range(&self, slot: usize) -> std::ops::Range<usize> {
        let start = RING_HEADER_LEN + slot * self.stride();
        start..start + self.stride()
    }

    /// Logical bytes in use: header plus one stride per stored item.
    fn used_bytes(&self) -> usize {
        RING_HEADER_LEN + self.ring.count * self.stride()
    }

    fn read_slot(&self, payload: &[u8], slot: usize, name: &str) -> Result<Vec<u8>> {
        let bytes = &payload[self.slot_range(slot)];
        let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        if len > self.item_size {
            return Err(IpcError::Corrupted(format!(
                "'{}' slot {} claims {} bytes, slots hold {}",
                name, slot, len, self.item_size
            )));
        }
        Ok(bytes[SLOT_LEN_PREFIX..SLOT_LEN_PREFIX + len].to_vec())
    }

    fn write_slot(&self, payload: &mut [u8], slot: usize, item: &[u8]) {
        let range = self.slot_range(slot);
        let bytes = &mut payload[range];
        bytes[..SLOT_LEN_PREFIX].copy_from_slice(&(item.len() as u32).to_le_bytes());
        bytes[SLOT_LEN_PREFIX..SLOT_LEN_PREFIX + item.len()].copy_from_slice(item);
    }
}

fn to_usize(v: u64) -> Result<usize> {
    v.try_into()
        .map_err(|_| IpcError::Corrupted(format!("value {} does not fit in usize", v)))
}

fn resolve_geometry(capacity: usize, item_size: usize) -> (usize, usize) {
    let capacity = if capacity == 0 { DEFAULT_CAPACITY } else { capacity };
    let item_size = if item_size == 0 { DEFAULT_ITEM_SIZE } else { item_size };
    (capacity, item_size)
}

/// Segment payload bytes needed for a ring of this geometry.
pub fn required_bytes(capacity: usize, item_size: usize) -> Option<usize> {
    SLOT_LEN_PREFIX
        .checked_add(item_size)?
        .checked_mul(capacity)?
        .checked_add(RING_HEADER_LEN)
}

#[derive(Clone, Copy)]
enum End {
    Front,
    Back,
}

pub struct Dispenser {
    name: String,
    mode: Mode,
    segment: Segment,
    geometry: Option<(usize, usize)>,
    verbose: bool,
}

impl Dispenser {
    /// Creates or attaches the backing segment. The ring exists only after [`Dispenser::setup`].
    pub fn create(cfg: &ShmemConfig, name: &str, mode: Mode, segment_bytes: usize) -> Result<Dispenser> {
        let segment = Segment::create(cfg, name, segment_bytes)?;
        Ok(Dispenser {
            name: name.to_string(),
            mode,
            segment,
            geometry: None,
            verbose: cfg.verbose,
        })
    }

    /// Creates a segment sized exactly for the ring and sets it up.
    pub fn with_capacity(
        cfg: &ShmemConfig,
        name: &str,
        mode: Mode,
        capacity: usize,
        item_size: usize,
    ) -> Result<Dispenser> {
        let (capacity, item_size) = resolve_geometry(capacity, item_size);
        let bytes = required_bytes(capacity, item_size).ok_or_else(|| {
            IpcError::AllocationFailed(format!(
                "{} slots of {} bytes overflow the address space",
                capacity, item_size
            ))
        })?;
        let mut dispenser = Dispenser::create(cfg, name, mode, bytes)?;
        dispenser.setup(capacity, item_size)?;
        Ok(dispenser)
    }

    pub fn from_options(cfg: &ShmemConfig, opts: &DispenserOptions) -> Result<Dispenser> {
        Dispenser::with_capacity(cfg, &opts.name, opts.mode, opts.capacity, opts.item_size)
    }

    /// Lays out the ring, or validates the one already there.
    ///
    /// Zero capacity or item size select the defaults. Returns `Ok(false)` if
    /// another handle already set up an identical ring.
    pub fn setup(&mut self, capacity: usize, item_size: usize) -> Result<bool> {
        let (capacity, item_size) = resolve_geometry(capacity, item_size);
        self.segment.setup()?;
        let needed = required_bytes(capacity, item_size).unwrap_or(usize::MAX);
        if needed > self.segment.capacity() {
            return Err(IpcError::TooLarge {
                len: needed,
                capacity: self.segment.capacity(),
            });
        }

        let mut guard = self.segment.lock()?;
        match RingHeader::load(guard.payload(), &self.name) {
            Ok(existing) => {
                if existing.mode != self.mode
                    || existing.ring.capacity != capacity
                    || existing.item_size != item_size
                {
                    return Err(IpcError::NameConflict {
                        name: self.name.clone(),
                        reason: format!(
                            "existing {} ring of {}x{} bytes, requested {} ring of {}x{} bytes",
                            existing.mode.as_str(),
                            existing.ring.capacity,
                            existing.item_size,
                            self.mode.as_str(),
                            capacity,
                            item_size
                        ),
                    });
                }
                drop(guard);
                self.geometry = Some((capacity, item_size));
                Ok(false)
            }
            Err(IpcError::NotSetUp(_)) => {
                let header = RingHeader {
                    mode: self.mode,
                    item_size,
                    ring: Ring::new(capacity),
                };
                header.store(guard.payload_mut());
                guard.set_occupied(header.used_bytes())?;
                guard.bump_generation();
                drop(guard);
                self.geometry = Some((capacity, item_size));
                info!(name = %self.name, mode = self.mode.as_str(), capacity, item_size, "dispenser set up");
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    pub fn add(&self, item: &[u8]) -> Result<()> {
        self.insert(item, End::Back)
    }

    pub fn add_str(&self, item: &str) -> Result<()> {
        self.add(item.as_bytes())
    }

    pub fn add_front(&self, item: &[u8]) -> Result<()> {
        self.require_deque("add_front")?;
        self.insert(item, End::Front)
    }

    pub fn add_front_str(&self, item: &str) -> Result<()> {
        self.add_front(item.as_bytes())
    }

    /// Removes the next item: oldest for FIFO/DEQUE, newest for LIFO.
    pub fn dispense(&self) -> Result<Vec<u8>> {
        self.remove(self.dispense_end())
    }

    pub fn dispense_string(&self) -> Result<String> {
        Ok(String::from_utf8(self.dispense()?)?)
    }

    pub fn dispense_back(&self) -> Result<Vec<u8>> {
        self.require_deque("dispense_back")?;
        self.remove(End::Back)
    }

    pub fn dispense_back_string(&self) -> Result<String> {
        Ok(String::from_utf8(self.dispense_back()?)?)
    }

    pub fn peek(&self) -> Result<Vec<u8>> {
        self.look(self.dispense_end())
    }

    pub fn peek_string(&self) -> Result<String> {
        Ok(String::from_utf8(self.peek()?)?)
    }

    pub fn peek_back(&self) -> Result<Vec<u8>> {
        self.require_deque("peek_back")?;
        self.look(End::Back)
    }

    pub fn peek_back_string(&self) -> Result<String> {
        Ok(String::from_utf8(self.peek_back()?)?)
    }

    pub fn len(&self) -> Result<usize> {
        let guard = self.segment.lock()?;
        Ok(RingHeader::load(guard.payload(), &self.name)?.ring.count)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn is_full(&self) -> Result<bool> {
        let guard = self.segment.lock()?;
        Ok(RingHeader::load(guard.payload(), &self.name)?.ring.is_full())
    }

    /// Resets the indices. Slot bytes are left as they are.
    pub fn clear(&self) -> Result<()> {
        let mut guard = self.segment.lock()?;
        let mut header = RingHeader::load(guard.payload(), &self.name)?;
        header.ring.clear();
        header.store(guard.payload_mut());
        guard.set_occupied(header.used_bytes())?;
        guard.bump_generation();
        op_event!(self.verbose, name = %self.name, "dispenser cleared");
        Ok(())
    }

    pub fn close(&mut self) {
        self.segment.close();
        self.geometry = None;
    }

    pub fn unlink(&mut self) -> Result<()> {
        self.geometry = None;
        self.segment.unlink()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Item capacity, known once set up.
    pub fn capacity(&self) -> Option<usize> {
        self.geometry.map(|(capacity, _)| capacity)
    }

    pub fn item_size(&self) -> Option<usize> {
        self.geometry.map(|(_, item_size)| item_size)
    }

    pub fn segment(&self) -> &Segment {
        &self.segment
    }

    /// Pops the back item only if `matches` accepts it, in one critical section.
    pub(crate) fn remove_back_if<F>(&self, matches: F) -> Result<Option<Vec<u8>>>
    where
        F: FnOnce(&[u8]) -> bool,
    {
        let mut guard = self.segment.lock()?;
        let mut header = RingHeader::load(guard.payload(), &self.name)?;
        let slot = match header.ring.back() {
            Some(slot) => slot,
            None => return Ok(None),
        };
        let item = header.read_slot(guard.payload(), slot, &self.name)?;
        if !matches(&item) {
            return Ok(None);
        }
        header.ring.pop_back();
        header.store(guard.payload_mut());
        guard.set_occupied(header.used_bytes())?;
        guard.bump_generation();
        op_event!(self.verbose, name = %self.name, len = item.len(), "dispenser reclaimed back item");
        Ok(Some(item))
    }

    fn dispense_end(&self) -> End {
        match self.mode {
            Mode::Lifo => End::Back,
            Mode::Fifo | Mode::Deque => End::Front,
        }
    }

    fn require_deque(&self, op: &'static str) -> Result<()> {
        match self.mode {
            Mode::Deque => Ok(()),
            mode => Err(IpcError::InvalidMode {
                op,
                mode: mode.as_str(),
            }),
        }
    }

    fn insert(&self, item: &[u8], end: End) -> Result<()> {
        if let Some((_, item_size)) = self.geometry {
            if item.len() > item_size {
                return Err(IpcError::ItemTooLarge {
                    len: item.len(),
                    item_size,
                });
            }
        }
        let mut guard = self.segment.lock()?;
        let mut header = RingHeader::load(guard.payload(), &self.name)?;
        if item.len() > header.item_size {
            return Err(IpcError::ItemTooLarge {
                len: item.len(),
                item_size: header.item_size,
            });
        }
        let slot = match end {
            End::Back => header.ring.push_back(),
            End::Front => header.ring.push_front(),
        }
        .ok_or_else(|| IpcError::Full(self.name.clone()))?;

        let payload = guard.payload_mut();
        header.write_slot(payload, slot, item);
        header.store(payload);
        guard.set_occupied(header.used_bytes())?;
        let generation = guard.bump_generation();
        op_event!(self.verbose, name = %self.name, slot, len = item.len(), count = header.ring.count, generation, "dispenser add");
        Ok(())
    }

    fn remove(&self, end: End) -> Result<Vec<u8>> {
        let mut guard = self.segment.lock()?;
        let mut header = RingHeader::load(guard.payload(), &self.name)?;
        let slot = match end {
            End::Front => header.ring.front(),
            End::Back => header.ring.back(),
        }
        .ok_or_else(|| IpcError::Empty(self.name.clone()))?;
        // Read before touching the indices so a corrupt slot leaves the ring as it was.
        let item = header.read_slot(guard.payload(), slot, &self.name)?;
        match end {
            End::Front => header.ring.pop_front(),
            End::Back => header.ring.pop_back(),
        };
        header.store(guard.payload_mut());
        guard.set_occupied(header.used_bytes())?;
        let generation = guard.bump_generation();
        op_event!(self.verbose, name = %self.name, slot, len = item.len(), count = header.ring.count, generation, "dispenser dispense");
        Ok(item)
    }

    fn look(&self, end: End) -> Result<Vec<u8>> {
        let guard = self.segment.lock()?;
        let header = RingHeader::load(guard.payload(), &self.name)?;
        let slot = match end {
            End::Front => header.ring.front(),
            End::Back => header.ring.back(),
        }
        .ok_or_else(|| IpcError::Empty(self.name.clone()))?;
        header.read_slot(guard.payload(), slot, &self.name)
    }
}
