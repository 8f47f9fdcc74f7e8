use std::collections::HashMap;
use std::error::Error;
use std::thread;

use super::{test_config, unique_name};
use crate::{Dispenser, IpcError, Mode};

const PRODUCERS: usize = 4;
const ITEMS_PER_PRODUCER: usize = 200;

fn item(producer: usize, seq: usize) -> String {
    format!("{}:{}", producer, seq)
}

fn parse(item: &str) -> Option<(usize, usize)> {
    let (producer, seq) = item.split_once(':')?;
    Some((producer.parse().ok()?, seq.parse().ok()?))
}

#[test]
fn producers_into_one_fifo_lose_nothing() -> Result<(), Box<dyn Error>> {
    let (cfg, _temp_dir) = test_config()?;
    let name = unique_name("producers");
    let mut owner = Dispenser::with_capacity(
        &cfg,
        &name,
        Mode::Fifo,
        PRODUCERS * ITEMS_PER_PRODUCER,
        16,
    )?;

    let handles: Vec<_> = (0..PRODUCERS)
        .map(|producer| {
            let cfg = cfg.clone();
            let name = name.clone();
            thread::spawn(move || -> Result<(), IpcError> {
                let mut q = Dispenser::create(&cfg, &name, Mode::Fifo, 1)?;
                q.setup(PRODUCERS * ITEMS_PER_PRODUCER, 16)?;
                for seq in 0..ITEMS_PER_PRODUCER {
                    q.add_str(&item(producer, seq))?;
                }
                q.close();
                Ok(())
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("producer panicked")?;
    }

    assert!(owner.is_full()?);
    let mut next_seq: HashMap<usize, usize> = HashMap::new();
    let mut total = 0;
    loop {
        let got = match owner.dispense_string() {
            Ok(got) => got,
            Err(IpcError::Empty(_)) => break,
            Err(e) => return Err(e.into()),
        };
        let (producer, seq) = parse(&got).ok_or("malformed item")?;
        let expected = next_seq.entry(producer).or_insert(0);
        assert_eq!(seq, *expected, "producer {} out of order", producer);
        *expected += 1;
        total += 1;
    }
    assert_eq!(total, PRODUCERS * ITEMS_PER_PRODUCER);
    assert!(next_seq.values().all(|n| *n == ITEMS_PER_PRODUCER));

    owner.unlink()?;
    Ok(())
}

#[test]
fn lifo_consumer_sees_each_run_reversed() -> Result<(), Box<dyn Error>> {
    let (cfg, _temp_dir) = test_config()?;
    let name = unique_name("stack_run");
    let mut stack = Dispenser::with_capacity(&cfg, &name, Mode::Lifo, 8, 8)?;

    let producer = thread::spawn({
        let cfg = cfg.clone();
        let name = name.clone();
        move || -> Result<(), IpcError> {
            let mut s = Dispenser::create(&cfg, &name, Mode::Lifo, 1)?;
            s.setup(8, 8)?;
            for v in ["r1", "r2", "r3"] {
                s.add_str(v)?;
            }
            s.close();
            Ok(())
        }
    });
    producer.join().expect("producer panicked")?;

    let drained: Vec<String> = (0..3)
        .map(|_| stack.dispense_string())
        .collect::<Result<_, _>>()?;
    assert_eq!(drained, vec!["r3", "r2", "r1"]);
    stack.unlink()?;
    Ok(())
}
