use std::error::Error;
use std::io::{self, BufRead};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use clap::{self, Parser};
use serde_derive::{Deserialize, Serialize};
use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crossipc::{Dispenser, DispenserOptions, IpcError, Mode, ShmemConfig};

const END_MARKER: &str = " 🐓 🏰 🥕 ";

#[derive(clap::Parser)]
#[clap()]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "crossipc-producer.toml")]
    config: String,
    /// Fill the dispenser once, then drain it and check the order.
    #[clap(long = "drain-after-add")]
    drain_after_add: bool,
    #[clap(long = "pause-after-add")]
    pause_after_add: bool,
}

#[derive(Serialize, Deserialize)]
#[serde(default)]
struct ProducerConfig {
    shmem: ShmemConfig,
    dispenser: DispenserOptions,
    messages: usize,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        ProducerConfig {
            shmem: ShmemConfig::default(),
            dispenser: DispenserOptions::default(),
            messages: 1_000_000,
        }
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let opts: Opts = Opts::parse();
    let cfg: ProducerConfig = confy::load_path(&opts.config)?;
    cfg.shmem.validate()?;
    let closing = shutdown_flag()?;

    let mut dispenser = Dispenser::from_options(&cfg.shmem, &cfg.dispenser)?;
    info!(
        name = dispenser.name(),
        mode = dispenser.mode().as_str(),
        capacity = ?dispenser.capacity(),
        "producer attached"
    );

    if opts.drain_after_add {
        let ok = fill_and_drain(&dispenser, &closing)?;
        dispenser.unlink()?;
        if !ok {
            return Err("drained items did not match the added ones".into());
        }
    } else {
        run(&dispenser, cfg.messages, &closing)?;
        dispenser.close();
    }

    if opts.pause_after_add {
        println!("[Producer] Operations finished. Pausing. Press Enter to exit fully.");
        io::stdin().lock().read_line(&mut String::new())?;
    }
    Ok(())
}

fn shutdown_flag() -> io::Result<Arc<AtomicBool>> {
    let flag = Arc::new(AtomicBool::new(false));
    let mut signals = Signals::new(&[SIGHUP, SIGINT, SIGQUIT, SIGTERM])?;
    let closing = Arc::clone(&flag);
    thread::spawn(move || {
        for _ in signals.forever() {
            // Checked between operations so a critical section always completes.
            closing.store(true, Ordering::SeqCst);
        }
    });
    Ok(flag)
}

// Retries while the consumer catches up.
fn add_blocking(dispenser: &Dispenser, item: &str, closing: &AtomicBool) -> Result<bool, IpcError> {
    loop {
        if closing.load(Ordering::Relaxed) {
            return Ok(false);
        }
        match dispenser.add_str(item) {
            Ok(()) => return Ok(true),
            Err(e) if e.is_transient() => thread::yield_now(),
            Err(e) => return Err(e),
        }
    }
}

fn run(dispenser: &Dispenser, messages: usize, closing: &AtomicBool) -> Result<(), Box<dyn Error>> {
    let start = Instant::now();
    let mut called = 0usize;
    while called < messages {
        if !add_blocking(dispenser, &called.to_string(), closing)? {
            warn!(called, "interrupted, stopping early");
            break;
        }
        if called % 100_000 == 0 {
            eprint!("\rTotal {} ops", called);
        }
        called += 1;
    }
    if add_blocking(dispenser, END_MARKER, closing)? {
        called += 1;
    }

    let duration = start.elapsed();
    let iops = ((called as f64) / (duration.as_millis().max(1) as f64)) * 1_000f64;
    println!(
        "\n{:#?}K messages add/s. Total time: {:#?}",
        (iops / 1000f64) as u64,
        duration
    );
    Ok(())
}

/// Adds until full (wrapping the ring at least once), then drains and compares.
fn fill_and_drain(dispenser: &Dispenser, closing: &AtomicBool) -> Result<bool, Box<dyn Error>> {
    let capacity = dispenser.capacity().unwrap_or(0);
    let mut expected = std::collections::VecDeque::new();

    // Cycle half the ring first so head and tail wrap.
    for i in 0..capacity / 2 {
        dispenser.add_str(&format!("warmup-{}", i))?;
        dispenser.dispense()?;
    }
    let mut i = 0usize;
    while !closing.load(Ordering::Relaxed) {
        let item = i.to_string();
        match dispenser.add_str(&item) {
            Ok(()) => expected.push_back(item),
            Err(IpcError::Full(_)) => break,
            Err(e) => return Err(e.into()),
        }
        i += 1;
    }
    println!("[Add Phase] Added {} items, dispenser full: {}", expected.len(), dispenser.is_full()?);

    let mut ok = true;
    loop {
        let got = match dispenser.dispense_string() {
            Ok(got) => got,
            Err(IpcError::Empty(_)) => break,
            Err(e) => return Err(e.into()),
        };
        let want = match dispenser.mode() {
            Mode::Lifo => expected.pop_back(),
            Mode::Fifo | Mode::Deque => expected.pop_front(),
        };
        if want.as_deref() != Some(got.as_str()) {
            eprintln!("[Drain Phase] MISMATCH: got '{}', expected {:?}", got, want);
            ok = false;
        }
    }
    if !expected.is_empty() {
        eprintln!("[Drain Phase] {} items never came back", expected.len());
        ok = false;
    }
    if ok {
        println!("[Drain Phase] All drained items verified successfully!");
    }
    Ok(ok)
}
