use std::{
    convert::TryInto,
    error::Error,
    sync::{
        atomic::{AtomicBool, Ordering as AtomicOrdering},
        Arc,
    },
    thread,
    time::Duration,
};

use super::{test_config, unique_name};
use crate::{IpcError, Segment};

#[derive(Debug, Clone, PartialEq)]
struct TornReadTestMessage {
    id: u64,
    data: Vec<u8>,
}

impl TornReadTestMessage {
    fn new(id: u64, size: usize) -> Self {
        let val = (id % 250) as u8;
        TornReadTestMessage {
            id,
            data: vec![val; size],
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&self.id.to_le_bytes());
        bytes.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&self.data);
        bytes
    }

    fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 12 {
            return None;
        }
        let id = u64::from_le_bytes(bytes[0..8].try_into().ok()?);
        let data_len = u32::from_le_bytes(bytes[8..12].try_into().ok()?) as usize;
        if bytes.len() != 12 + data_len {
            return None;
        }
        Some(TornReadTestMessage {
            id,
            data: bytes[12..].to_vec(),
        })
    }

    fn is_consistent(&self) -> bool {
        let expected_val = (self.id % 250) as u8;
        self.data.iter().all(|&byte| byte == expected_val)
    }
}

#[test]
fn test_torn_read_test_message_serialization() {
    let original_msg = TornReadTestMessage::new(12345, 32);
    let bytes = original_msg.to_bytes();
    let deserialized_msg = TornReadTestMessage::from_bytes(&bytes).expect("Deserialization failed");
    assert_eq!(original_msg, deserialized_msg);
    assert!(deserialized_msg.is_consistent());

    let mut inconsistent_data = original_msg.data.clone();
    inconsistent_data[0] = inconsistent_data[0].wrapping_add(1);
    let inconsistent_msg = TornReadTestMessage {
        id: original_msg.id,
        data: inconsistent_data,
    };
    assert!(!inconsistent_msg.is_consistent());
    assert!(TornReadTestMessage::from_bytes(&bytes[..bytes.len() - 1]).is_none());
}

// Writers alternate between two payload sizes so a torn read would show up
// either as mixed bytes or as a length mismatch.
#[test]
fn test_segment_reads_are_never_torn() -> Result<(), Box<dyn Error>> {
    let (cfg, _temp_dir) = test_config()?;
    let name = unique_name("torn");
    let sizes = [64_usize, 4000];

    let mut owner = Segment::create(&cfg, &name, 4096 + 64)?;
    owner.setup()?;

    let stop_flag = Arc::new(AtomicBool::new(false));

    let writer_thread = thread::spawn({
        let cfg = cfg.clone();
        let name = name.clone();
        let stop_flag = Arc::clone(&stop_flag);
        move || -> Result<u64, IpcError> {
            let mut segment = Segment::create(&cfg, &name, 1)?;
            segment.setup()?;
            let mut id = 0_u64;
            while !stop_flag.load(AtomicOrdering::Relaxed) {
                id += 1;
                let msg = TornReadTestMessage::new(id, sizes[(id % 2) as usize]);
                segment.write(&msg.to_bytes())?;
                thread::sleep(Duration::from_micros(50));
            }
            segment.close();
            Ok(id)
        }
    });

    let reader_thread = thread::spawn({
        let cfg = cfg.clone();
        let name = name.clone();
        let stop_flag = Arc::clone(&stop_flag);
        move || -> Result<(usize, usize), IpcError> {
            let mut segment = Segment::create(&cfg, &name, 1)?;
            segment.setup()?;
            let mut consistent_reads = 0_usize;
            let mut torn_reads_detected = 0_usize;
            while !stop_flag.load(AtomicOrdering::Relaxed) {
                match segment.read() {
                    Ok(bytes) => match TornReadTestMessage::from_bytes(&bytes) {
                        Some(msg) if msg.is_consistent() => consistent_reads += 1,
                        _ => torn_reads_detected += 1,
                    },
                    Err(IpcError::Empty(_)) => {}
                    Err(e) => return Err(e),
                }
                thread::sleep(Duration::from_micros(70));
            }
            segment.close();
            Ok((consistent_reads, torn_reads_detected))
        }
    });

    thread::sleep(Duration::from_secs(2));
    stop_flag.store(true, AtomicOrdering::Relaxed);

    let written = writer_thread.join().expect("Writer thread panicked")?;
    let (consistent_reads, torn_reads_detected) =
        reader_thread.join().expect("Reader thread panicked")?;

    println!(
        "written: {}, consistent reads: {}, torn reads: {}",
        written, consistent_reads, torn_reads_detected
    );
    assert!(written > 0);
    assert!(consistent_reads > 0, "reader never observed a write");
    assert_eq!(torn_reads_detected, 0);

    owner.unlink()?;
    Ok(())
}
