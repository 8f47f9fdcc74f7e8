use std::error::Error;
use std::sync::{
    atomic::{AtomicBool, Ordering as AtomicOrdering},
    Arc,
};
use std::thread;
use std::time::Duration;

use super::{test_config, unique_name};
use crate::{IpcError, ReqResp, ReqRespOptions};

fn options(prefix: String, response_timeout_ms: u64) -> ReqRespOptions {
    ReqRespOptions {
        prefix,
        capacity: 4,
        max_message_size: 128,
        response_timeout_ms,
        poll_interval_ms: 1,
    }
}

#[test]
fn client_and_server_threads_exchange_requests() -> Result<(), Box<dyn Error>> {
    const REQUESTS: usize = 50;
    let (cfg, _temp_dir) = test_config()?;
    let opts = options(unique_name("rr_threads"), 5000);
    let stop_flag = Arc::new(AtomicBool::new(false));

    let server = thread::spawn({
        let cfg = cfg.clone();
        let opts = opts.clone();
        let stop_flag = Arc::clone(&stop_flag);
        move || -> Result<usize, IpcError> {
            let mut server = ReqResp::new(&cfg, opts);
            server.setup_server("upper")?;
            server.respond("upper", |payload| payload.to_ascii_uppercase())?;
            let mut served = 0;
            while !stop_flag.load(AtomicOrdering::Relaxed) {
                served += server.serve()?;
                thread::sleep(Duration::from_micros(200));
            }
            server.close();
            Ok(served)
        }
    });

    let mut client = ReqResp::new(&cfg, opts);
    client.setup_client("upper")?;
    for i in 0..REQUESTS {
        let reply = client.request_str("upper", &format!("msg-{}", i))?;
        assert_eq!(reply, format!("MSG-{}", i));
    }

    stop_flag.store(true, AtomicOrdering::Relaxed);
    let served = server.join().expect("server thread panicked")?;
    assert_eq!(served, REQUESTS);
    client.unlink()?;
    Ok(())
}

// The server takes the first request but answers only after the client gave
// up; the client must skip that late answer on its next call.
#[test]
fn late_response_is_discarded_as_stale() -> Result<(), Box<dyn Error>> {
    let (cfg, _temp_dir) = test_config()?;
    let opts = options(unique_name("rr_stale"), 200);
    let taken = Arc::new(AtomicBool::new(false));
    let stale_sent = Arc::new(AtomicBool::new(false));

    let server = thread::spawn({
        let cfg = cfg.clone();
        let opts = opts.clone();
        let taken = Arc::clone(&taken);
        let stale_sent = Arc::clone(&stale_sent);
        move || -> Result<(), IpcError> {
            let mut server = ReqResp::new(&cfg, opts);
            server.setup_server("slow")?;
            let first = loop {
                if let Some(request) = server.poll_requests().next() {
                    break request?;
                }
                thread::sleep(Duration::from_millis(1));
            };
            taken.store(true, AtomicOrdering::SeqCst);
            thread::sleep(Duration::from_millis(400));
            server.reply(&first, b"too late")?;
            stale_sent.store(true, AtomicOrdering::SeqCst);

            server.respond("slow", |_| b"fresh".to_vec())?;
            while server.serve()? == 0 {
                thread::sleep(Duration::from_millis(1));
            }
            server.close();
            Ok(())
        }
    });

    let mut client = ReqResp::new(&cfg, opts);
    client.setup_client("slow")?;
    assert!(matches!(client.request_str("slow", "first"), Err(IpcError::Timeout(_))));
    assert!(taken.load(AtomicOrdering::SeqCst));
    while !stale_sent.load(AtomicOrdering::SeqCst) {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(client.request_str("slow", "second")?, "fresh");

    server.join().expect("server thread panicked")?;
    client.unlink()?;
    Ok(())
}
