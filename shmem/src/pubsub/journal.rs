//! Shared message log behind a PubSub name.
//!
//! ```text
//! header   magic u32 | cursors u32 | capacity u64 | item_size u64 | oldest u64 | next_id u64 | reserved u64
//! cursors  cursors x [pid u32 | active u32 | position u64]
//! records  capacity x [id u64 | len u32 | item_size bytes]
//! ```
//!
//! Record `id` lives in slot `id % capacity`. Reading never removes a record;
//! each subscribing handle owns one cursor, and a record is reclaimed only
//! when a new one needs its slot and every live cursor has moved past it.

use std::convert::TryInto;
use std::ops::Range;

use tracing::{info, warn};

use crate::codec::Cursor;
use crate::core::lock::process_alive;
use crate::core::{current_pid, ShmemConfig};
use crate::errors::{IpcError, Result};
use crate::segment::Segment;

/// Subscribing handles one log can track at once.
pub const MAX_SUBSCRIBERS: usize = 32;

const LOG_MAGIC: u32 = 0x5053_4c47; // "PSLG"
const LOG_HEADER_LEN: usize = 48;
const CURSOR_LEN: usize = 16;
const RECORD_PREFIX: usize = 8 + 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct LogHeader {
    cursors: usize,
    capacity: usize,
    item_size: usize,
    oldest: u64,
    next_id: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct CursorSlot {
    pid: u32,
    active: bool,
    position: u64,
}

impl LogHeader {
    fn load(payload: &[u8], name: &str) -> Result<LogHeader> {
        let mut cursor = Cursor::new(payload);
        if payload.len() < LOG_HEADER_LEN || cursor.u32()? != LOG_MAGIC {
            return Err(IpcError::NotSetUp(name.to_string()));
        }
        let header = LogHeader {
            cursors: cursor.u32()? as usize,
            capacity: to_usize(cursor.u64()?)?,
            item_size: to_usize(cursor.u64()?)?,
            oldest: cursor.u64()?,
            next_id: cursor.u64()?,
        };
        let fits = layout_bytes(header.cursors, header.capacity, header.item_size)
            .map(|n| n <= payload.len())
            .unwrap_or(false);
        if header.capacity == 0
            || header.oldest > header.next_id
            || header.next_id - header.oldest > header.capacity as u64
            || !fits
        {
            return Err(IpcError::Corrupted(format!(
                "'{}' log header is inconsistent: {:?}",
                name, header
            )));
        }
        Ok(header)
    }

    fn store(&self, payload: &mut [u8]) {
        payload[0..4].copy_from_slice(&LOG_MAGIC.to_le_bytes());
        payload[4..8].copy_from_slice(&(self.cursors as u32).to_le_bytes());
        let fields = [
            self.capacity as u64,
            self.item_size as u64,
            self.oldest,
            self.next_id,
            0,
        ];
        for (i, field) in fields.iter().enumerate() {
            let at = 8 + i * 8;
            payload[at..at + 8].copy_from_slice(&field.to_le_bytes());
        }
    }

    fn len(&self) -> usize {
        (self.next_id - self.oldest) as usize
    }

    fn stride(&self) -> usize {
        RECORD_PREFIX + self.item_size
    }

    fn records_start(&self) -> usize {
        LOG_HEADER_LEN + self.cursors * CURSOR_LEN
    }

    fn used_bytes(&self) -> usize {
        self.records_start() + self.len() * self.stride()
    }

    fn cursor_range(&self, index: usize) -> Range<usize> {
        let start = LOG_HEADER_LEN + index * CURSOR_LEN;
        start..start + CURSOR_LEN
    }

    fn record_range(&self, id: u64) -> Range<usize> {
        let slot = (id % self.capacity as u64) as usize;
        let start = self.records_start() + slot * self.stride();
        start..start + self.stride()
    }

    fn load_cursor(&self, payload: &[u8], index: usize) -> Result<CursorSlot> {
        let mut cursor = Cursor::new(&payload[self.cursor_range(index)]);
        Ok(CursorSlot {
            pid: cursor.u32()?,
            active: cursor.u32()? != 0,
            position: cursor.u64()?,
        })
    }

    fn store_cursor(&self, payload: &mut [u8], index: usize, slot: CursorSlot) {
        let bytes = &mut payload[self.cursor_range(index)];
        bytes[0..4].copy_from_slice(&slot.pid.to_le_bytes());
        bytes[4..8].copy_from_slice(&u32::from(slot.active).to_le_bytes());
        bytes[8..16].copy_from_slice(&slot.position.to_le_bytes());
    }

    fn read_record(&self, payload: &[u8], id: u64, name: &str) -> Result<Vec<u8>> {
        let mut cursor = Cursor::new(&payload[self.record_range(id)]);
        let stored = cursor.u64()?;
        let len = cursor.u32()? as usize;
        if stored != id || len > self.item_size {
            return Err(IpcError::Corrupted(format!(
                "'{}' record {} holds id {} with {} bytes",
                name, id, stored, len
            )));
        }
        Ok(cursor.take(len)?.to_vec())
    }

    fn write_record(&self, payload: &mut [u8], id: u64, item: &[u8]) {
        let bytes = &mut payload[self.record_range(id)];
        bytes[0..8].copy_from_slice(&id.to_le_bytes());
        bytes[8..RECORD_PREFIX].copy_from_slice(&(item.len() as u32).to_le_bytes());
        bytes[RECORD_PREFIX..RECORD_PREFIX + item.len()].copy_from_slice(item);
    }

    /// Oldest id some live cursor still needs. Cursors of dead processes are freed.
    fn reclaim_floor(&self, payload: &mut [u8], name: &str) -> Result<u64> {
        let mut floor = self.next_id;
        for index in 0..self.cursors {
            let slot = self.load_cursor(payload, index)?;
            if !slot.active {
                continue;
            }
            if !process_alive(slot.pid) {
                warn!(name, pid = slot.pid, "releasing cursor of a dead subscriber");
                self.store_cursor(payload, index, CursorSlot::default());
                continue;
            }
            floor = floor.min(slot.position);
        }
        Ok(floor.max(self.oldest))
    }
}

fn to_usize(v: u64) -> Result<usize> {
    v.try_into()
        .map_err(|_| IpcError::Corrupted(format!("value {} does not fit in usize", v)))
}

fn layout_bytes(cursors: usize, capacity: usize, item_size: usize) -> Option<usize> {
    RECORD_PREFIX
        .checked_add(item_size)?
        .checked_mul(capacity)?
        .checked_add(cursors.checked_mul(CURSOR_LEN)?)?
        .checked_add(LOG_HEADER_LEN)
}

/// Segment payload bytes needed for a log of this geometry.
pub fn required_bytes(capacity: usize, item_size: usize) -> Option<usize> {
    layout_bytes(MAX_SUBSCRIBERS, capacity, item_size)
}

pub(crate) struct MessageLog {
    name: String,
    segment: Segment,
    verbose: bool,
}

impl MessageLog {
    pub fn create(cfg: &ShmemConfig, name: &str, segment_bytes: usize) -> Result<MessageLog> {
        Ok(MessageLog {
            name: name.to_string(),
            segment: Segment::create(cfg, name, segment_bytes)?,
            verbose: cfg.verbose,
        })
    }

    /// Lays out an empty log, or checks the geometry of the one already there.
    pub fn setup(&mut self, capacity: usize, item_size: usize) -> Result<bool> {
        self.segment.setup()?;
        let needed = required_bytes(capacity, item_size).unwrap_or(usize::MAX);
        if capacity == 0 || needed > self.segment.capacity() {
            return Err(IpcError::TooLarge {
                len: needed,
                capacity: self.segment.capacity(),
            });
        }

        let mut guard = self.segment.lock()?;
        match LogHeader::load(guard.payload(), &self.name) {
            Ok(existing) => {
                if existing.capacity != capacity || existing.item_size != item_size {
                    return Err(IpcError::NameConflict {
                        name: self.name.clone(),
                        reason: format!(
                            "existing log of {}x{} bytes, requested {}x{} bytes",
                            existing.capacity, existing.item_size, capacity, item_size
                        ),
                    });
                }
                Ok(false)
            }
            Err(IpcError::NotSetUp(_)) => {
                let header = LogHeader {
                    cursors: MAX_SUBSCRIBERS,
                    capacity,
                    item_size,
                    oldest: 0,
                    next_id: 0,
                };
                let payload = guard.payload_mut();
                payload[..header.records_start()].fill(0);
                header.store(payload);
                guard.set_occupied(header.used_bytes())?;
                guard.bump_generation();
                info!(name = %self.name, capacity, item_size, "message log set up");
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    /// Appends one record and returns its id.
    ///
    /// `Full` once `capacity` records are retained and the slowest live
    /// cursor has not moved past the oldest.
    pub fn append(&self, item: &[u8]) -> Result<u64> {
        let mut guard = self.segment.lock()?;
        let mut header = LogHeader::load(guard.payload(), &self.name)?;
        if item.len() > header.item_size {
            return Err(IpcError::ItemTooLarge {
                len: item.len(),
                item_size: header.item_size,
            });
        }
        if header.len() == header.capacity {
            header.oldest = header.reclaim_floor(guard.payload_mut(), &self.name)?;
            if header.len() == header.capacity {
                return Err(IpcError::Full(self.name.clone()));
            }
        }

        let id = header.next_id;
        header.next_id += 1;
        let payload = guard.payload_mut();
        header.write_record(payload, id, item);
        header.store(payload);
        guard.set_occupied(header.used_bytes())?;
        let generation = guard.bump_generation();
        op_event!(self.verbose, name = %self.name, id, len = item.len(), retained = header.len(), generation, "log append");
        Ok(id)
    }

    /// Claims a cursor starting at the next record to be appended.
    pub fn register(&self) -> Result<usize> {
        let mut guard = self.segment.lock()?;
        let header = LogHeader::load(guard.payload(), &self.name)?;
        let payload = guard.payload_mut();
        for index in 0..header.cursors {
            let slot = header.load_cursor(payload, index)?;
            if slot.active && process_alive(slot.pid) {
                continue;
            }
            let claimed = CursorSlot {
                pid: current_pid(),
                active: true,
                position: header.next_id,
            };
            header.store_cursor(payload, index, claimed);
            op_event!(self.verbose, name = %self.name, cursor = index, position = header.next_id, "cursor registered");
            return Ok(index);
        }
        Err(IpcError::Full(format!("{} (all {} cursors in use)", self.name, header.cursors)))
    }

    pub fn release(&self, index: usize) -> Result<()> {
        let mut guard = self.segment.lock()?;
        let header = LogHeader::load(guard.payload(), &self.name)?;
        if index >= header.cursors {
            return Err(IpcError::ResourceNotFound(format!("{} cursor {}", self.name, index)));
        }
        let payload = guard.payload_mut();
        if header.load_cursor(payload, index)?.pid == current_pid() {
            header.store_cursor(payload, index, CursorSlot::default());
        }
        op_event!(self.verbose, name = %self.name, cursor = index, "cursor released");
        Ok(())
    }

    /// Reads the record under cursor `index` and moves the cursor on, as long
    /// as its id is below `end`.
    pub fn next_for(&self, index: usize, end: u64) -> Result<Option<Vec<u8>>> {
        let mut guard = self.segment.lock()?;
        let header = LogHeader::load(guard.payload(), &self.name)?;
        let mut slot = self.owned_cursor(&header, guard.payload(), index)?;
        if slot.position < header.oldest {
            warn!(name = %self.name, missed = header.oldest - slot.position, "cursor fell behind reclaimed records");
            slot.position = header.oldest;
        }
        let item = if slot.position < end.min(header.next_id) {
            let item = header.read_record(guard.payload(), slot.position, &self.name)?;
            slot.position += 1;
            Some(item)
        } else {
            None
        };
        header.store_cursor(guard.payload_mut(), index, slot);
        Ok(item)
    }

    /// Id the next appended record will get.
    pub fn head(&self) -> Result<u64> {
        let guard = self.segment.lock()?;
        Ok(LogHeader::load(guard.payload(), &self.name)?.next_id)
    }

    /// Records cursor `index` has not read yet.
    pub fn backlog(&self, index: usize) -> Result<usize> {
        let guard = self.segment.lock()?;
        let header = LogHeader::load(guard.payload(), &self.name)?;
        let slot = self.owned_cursor(&header, guard.payload(), index)?;
        Ok((header.next_id - slot.position.max(header.oldest)) as usize)
    }

    /// Records still held in shared memory.
    pub fn len(&self) -> Result<usize> {
        let guard = self.segment.lock()?;
        Ok(LogHeader::load(guard.payload(), &self.name)?.len())
    }

    pub fn close(&mut self) {
        self.segment.close();
    }

    pub fn unlink(&mut self) -> Result<()> {
        self.segment.unlink()
    }

    pub fn is_open(&self) -> bool {
        self.segment.is_setup()
    }

    fn owned_cursor(&self, header: &LogHeader, payload: &[u8], index: usize) -> Result<CursorSlot> {
        if index < header.cursors {
            let slot = header.load_cursor(payload, index)?;
            if slot.active && slot.pid == current_pid() {
                return Ok(slot);
            }
        }
        Err(IpcError::ResourceNotFound(format!("{} cursor {}", self.name, index)))
    }
}
