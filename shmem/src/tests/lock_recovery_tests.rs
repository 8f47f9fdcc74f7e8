use std::error::Error;
use std::sync::mpsc;
use std::thread;

use tempfile::{tempdir, TempDir};

use crate::core::{current_pid, ShmemConfig};
use crate::errors::IpcError;
use crate::segment::Segment;
use crate::tests::unique_name;

fn short_timeout_config() -> Result<(ShmemConfig, TempDir), Box<dyn Error>> {
    let dir = tempdir()?;
    let cfg = ShmemConfig::builder()
        .data_dir(dir.path().to_string_lossy().into_owned())
        .lock_timeout_ms(200)
        .build()?;
    Ok((cfg, dir))
}

#[test]
fn live_holder_is_never_preempted() -> Result<(), Box<dyn Error>> {
    let (cfg, _dir) = short_timeout_config()?;
    let name = unique_name("lock_live");
    let mut seg = Segment::create(&cfg, &name, 64)?;
    seg.setup()?;

    let (held_tx, held_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let holder = thread::spawn({
        let cfg = cfg.clone();
        let name = name.clone();
        move || -> Result<(), IpcError> {
            let mut seg = Segment::create(&cfg, &name, 64)?;
            seg.setup()?;
            {
                let mut guard = seg.lock()?;
                guard.payload_mut()[..6].copy_from_slice(b"holder");
                guard.set_occupied(6)?;
                guard.bump_generation();
                let _ = held_tx.send(());
                let _ = release_rx.recv();
            }
            seg.close();
            Ok(())
        }
    });

    held_rx.recv()?;
    assert!(seg.is_locked());
    assert_eq!(seg.lock_info().map(|info| info.holder_pid), Some(current_pid()));
    assert!(matches!(seg.write_str("intruder"), Err(IpcError::LockTimeout(_))));
    assert!(matches!(seg.read(), Err(IpcError::LockTimeout(_))));

    release_tx.send(())?;
    holder.join().map_err(|_| "holder thread panicked")??;
    assert_eq!(seg.read_string()?, "holder");
    assert!(!seg.is_locked());
    seg.unlink()?;
    Ok(())
}

// Forks a child that takes the lock, optionally scribbles on the payload, and
// exits without releasing it.
#[cfg(unix)]
fn die_holding_lock(seg: &Segment, scribble: bool) -> Result<(), Box<dyn Error>> {
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    if pid == 0 {
        // Child: no allocation, no unwinding.
        if let Ok(mut guard) = seg.lock() {
            if scribble {
                guard.payload_mut()[0] = b'X';
            }
            std::mem::forget(guard);
        }
        unsafe { libc::_exit(0) };
    }
    let mut status = 0;
    if unsafe { libc::waitpid(pid, &mut status, 0) } != pid {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

#[cfg(unix)]
#[test]
fn dead_holder_mid_mutation_is_taken_over_and_discarded() -> Result<(), Box<dyn Error>> {
    let (cfg, _dir) = short_timeout_config()?;
    let mut seg = Segment::create(&cfg, &unique_name("lock_dirty"), 64)?;
    seg.setup()?;
    seg.write_str("before")?;
    let generation = seg.generation()?;

    die_holding_lock(&seg, true)?;
    assert!(seg.is_locked());

    assert!(matches!(seg.read(), Err(IpcError::Empty(_))));
    assert_eq!(seg.generation()?, generation + 1);
    assert!(!seg.is_locked());
    seg.write_str("after")?;
    assert_eq!(seg.read_string()?, "after");
    seg.unlink()?;
    Ok(())
}

#[cfg(unix)]
#[test]
fn dead_holder_without_mutation_keeps_payload() -> Result<(), Box<dyn Error>> {
    let (cfg, _dir) = short_timeout_config()?;
    let mut seg = Segment::create(&cfg, &unique_name("lock_clean"), 64)?;
    seg.setup()?;
    seg.write_str("kept")?;
    let generation = seg.generation()?;

    die_holding_lock(&seg, false)?;

    assert_eq!(seg.read_string()?, "kept");
    assert_eq!(seg.generation()?, generation);
    seg.write_str("next")?;
    assert_eq!(seg.read_string()?, "next");
    seg.unlink()?;
    Ok(())
}
