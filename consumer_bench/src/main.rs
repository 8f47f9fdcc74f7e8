use std::error::Error;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use clap::Parser;
use serde_derive::{Deserialize, Serialize};
use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crossipc::{Dispenser, DispenserOptions, IpcError, ShmemConfig};

const END_MARKER: &str = " 🐓 🏰 🥕 ";

#[derive(clap::Parser)]
#[clap()]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "crossipc-consumer.toml")]
    config: String,
    /// Remove the dispenser once the end marker arrives.
    #[clap(long)]
    unlink: bool,
}

#[derive(Default, Serialize, Deserialize)]
#[serde(default)]
struct ConsumerConfig {
    shmem: ShmemConfig,
    dispenser: DispenserOptions,
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let opts: Opts = Opts::parse();
    let cfg: ConsumerConfig = confy::load_path(&opts.config)?;
    let closing = Arc::new(AtomicBool::new(false));
    let mut signals = Signals::new(&[SIGHUP, SIGINT, SIGQUIT, SIGTERM])?;
    thread::spawn({
        let closing = Arc::clone(&closing);
        move || {
            for _ in signals.forever() {
                closing.store(true, Ordering::SeqCst);
            }
        }
    });

    let mut dispenser = Dispenser::from_options(&cfg.shmem, &cfg.dispenser)?;
    info!(name = dispenser.name(), mode = dispenser.mode().as_str(), "consumer attached");
    run(&dispenser, &closing)?;
    if opts.unlink {
        dispenser.unlink()?;
    } else {
        dispenser.close();
    }
    Ok(())
}

fn run(dispenser: &Dispenser, closing: &AtomicBool) -> Result<(), Box<dyn Error>> {
    let start = Instant::now();
    let mut called = 0usize;
    while !closing.load(Ordering::Relaxed) {
        let message = match dispenser.dispense_string() {
            Ok(message) => message,
            Err(IpcError::Empty(_)) | Err(IpcError::LockTimeout(_)) => {
                thread::yield_now();
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        if called % 100_000 == 0 {
            eprint!("\rTotal {} ops (current value: {})", called, message);
        }
        called += 1;
        if message == END_MARKER {
            println!("\nFinished after {} messages", called);
            break;
        }
    }
    let duration = start.elapsed();
    let iops = ((called as f64) / (duration.as_millis().max(1) as f64)) * 1_000f64;
    println!(
        "\n{:#?}K messages dispense/s. Total time: {:#?}",
        (iops / 1000f64) as u64,
        duration
    );
    Ok(())
}
