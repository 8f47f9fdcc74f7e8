//! Little-endian framing shared by the patterns.
//!
//! A keyed record is `[key_len: u16][key][value_len: u32][value]`; pubsub
//! puts one record in each log slot, the store packs records back to
//! back. A reply envelope is `[seq: u64][status: u8][payload]`.

use std::convert::TryInto;

use crate::errors::{IpcError, Result};

pub(crate) const RECORD_OVERHEAD: usize = 2 + 4;
pub(crate) const ENVELOPE_OVERHEAD: usize = 8 + 1;

/// Bounds-checked cursor over a byte slice.
pub(crate) struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8]) -> Cursor<'a> {
        Cursor { buf, pos: 0 }
    }

    pub fn is_done(&self) -> bool {
        self.pos >= self.buf.len()
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| {
                IpcError::Corrupted(format!(
                    "need {} bytes at offset {}, only {} available",
                    n,
                    self.pos,
                    self.buf.len() - self.pos
                ))
            })?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().map_err(corrupt)?))
    }

    pub fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().map_err(corrupt)?))
    }

    pub fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().map_err(corrupt)?))
    }

    pub fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos.min(self.buf.len())..];
        self.pos = self.buf.len();
        out
    }
}

fn corrupt<E: std::fmt::Display>(e: E) -> IpcError {
    IpcError::Corrupted(e.to_string())
}

pub(crate) fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(IpcError::InvalidKey("key must not be empty".into()));
    }
    if key.len() > u16::MAX as usize {
        return Err(IpcError::InvalidKey(format!(
            "key of {} bytes exceeds {} bytes",
            key.len(),
            u16::MAX
        )));
    }
    Ok(())
}

pub(crate) fn record_len(key: &str, value: &[u8]) -> usize {
    RECORD_OVERHEAD + key.len() + value.len()
}

pub(crate) fn encode_record(out: &mut Vec<u8>, key: &str, value: &[u8]) -> Result<()> {
    validate_key(key)?;
    let value_len: u32 = value.len().try_into().map_err(|_| IpcError::TooLarge {
        len: value.len(),
        capacity: u32::MAX as usize,
    })?;
    out.reserve(record_len(key, value));
    out.extend_from_slice(&(key.len() as u16).to_le_bytes());
    out.extend_from_slice(key.as_bytes());
    out.extend_from_slice(&value_len.to_le_bytes());
    out.extend_from_slice(value);
    Ok(())
}

/// Iterates records packed back to back; stops at the first malformed one.
pub(crate) struct Records<'a> {
    cursor: Cursor<'a>,
    failed: bool,
}

impl<'a> Records<'a> {
    pub fn new(buf: &'a [u8]) -> Records<'a> {
        Records {
            cursor: Cursor::new(buf),
            failed: false,
        }
    }

    fn read_one(&mut self) -> Result<(&'a str, &'a [u8])> {
        let key_len = self.cursor.u16()? as usize;
        let key = std::str::from_utf8(self.cursor.take(key_len)?).map_err(corrupt)?;
        let value_len = self.cursor.u32()? as usize;
        let value = self.cursor.take(value_len)?;
        Ok((key, value))
    }
}

impl<'a> Iterator for Records<'a> {
    type Item = Result<(&'a str, &'a [u8])>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.cursor.is_done() {
            return None;
        }
        let item = self.read_one();
        self.failed = item.is_err();
        Some(item)
    }
}

pub(crate) fn decode_record(buf: &[u8]) -> Result<(String, Vec<u8>)> {
    let mut records = Records::new(buf);
    let (key, value) = records
        .next()
        .unwrap_or_else(|| Err(IpcError::Corrupted("empty record".into())))?;
    if records.next().is_some() {
        return Err(IpcError::Corrupted("trailing bytes after record".into()));
    }
    Ok((key.to_string(), value.to_vec()))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Status {
    Ok,
    Unanswered,
}

impl Status {
    fn code(self) -> u8 {
        match self {
            Status::Ok => 0,
            Status::Unanswered => 1,
        }
    }

    fn from_code(code: u8) -> Result<Status> {
        match code {
            0 => Ok(Status::Ok),
            1 => Ok(Status::Unanswered),
            other => Err(IpcError::Corrupted(format!("unknown status {}", other))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Envelope {
    pub seq: u64,
    pub status: Status,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn encode(seq: u64, status: Status, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(ENVELOPE_OVERHEAD + payload.len());
        out.extend_from_slice(&seq.to_le_bytes());
        out.push(status.code());
        out.extend_from_slice(payload);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Envelope> {
        let mut cursor = Cursor::new(buf);
        let seq = cursor.u64()?;
        let status = Status::from_code(cursor.u8()?)?;
        Ok(Envelope {
            seq,
            status,
            payload: cursor.rest().to_vec(),
        })
    }

    /// Reads only the sequence number.
    pub fn peek_seq(buf: &[u8]) -> Result<u64> {
        Cursor::new(buf).u64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_records_iterate_in_order() -> Result<()> {
        let mut buf = Vec::new();
        encode_record(&mut buf, "alpha", b"1")?;
        encode_record(&mut buf, "beta", b"")?;
        encode_record(&mut buf, "gamma", b"333")?;
        let got: Vec<(&str, &[u8])> = Records::new(&buf).collect::<Result<_>>()?;
        assert_eq!(
            got,
            vec![("alpha", &b"1"[..]), ("beta", &b""[..]), ("gamma", &b"333"[..])]
        );
        assert_eq!(buf.len(), record_len("alpha", b"1") + record_len("beta", b"") + record_len("gamma", b"333"));
        Ok(())
    }

    #[test]
    fn truncated_record_is_corrupted() -> Result<()> {
        let mut buf = Vec::new();
        encode_record(&mut buf, "topic", b"payload")?;
        buf.truncate(buf.len() - 2);
        assert!(matches!(decode_record(&buf), Err(IpcError::Corrupted(_))));
        let mut records = Records::new(&buf);
        assert!(records.next().unwrap().is_err());
        assert!(records.next().is_none());
        Ok(())
    }

    #[test]
    fn empty_key_is_invalid() {
        let mut buf = Vec::new();
        assert!(matches!(encode_record(&mut buf, "", b"x"), Err(IpcError::InvalidKey(_))));
        assert!(buf.is_empty());
    }

    #[test]
    fn envelope_keeps_status() -> Result<()> {
        let raw = Envelope::encode(42, Status::Unanswered, b"");
        assert_eq!(Envelope::peek_seq(&raw)?, 42);
        let env = Envelope::decode(&raw)?;
        assert_eq!(env.status, Status::Unanswered);
        assert!(env.payload.is_empty());
        assert!(Envelope::decode(&raw[..5]).is_err());
        Ok(())
    }
}
