//! Correlated request/response over a pair of dispensers per identifier.
//!
//! For identifier `id` the request channel is `<prefix>.<id>.req` (DEQUE) and
//! the response channel `<prefix>.<id>.resp` (FIFO). Both carry
//! `[seq: u64][status: u8][payload]` envelopes; a response answers the
//! request with the same `seq`. Nothing runs in the background: the server
//! side must call [`ReqResp::serve`] or [`ReqResp::poll_requests`].

use std::collections::HashMap;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use serde_derive::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::codec::{Envelope, Status, ENVELOPE_OVERHEAD};
use crate::core::ShmemConfig;
use crate::dispenser::{Dispenser, Mode};
use crate::errors::{IpcError, Result};

// Unique per process: pid in the high half, a counter in the low half.
static NEXT_SEQ: Lazy<AtomicU64> = Lazy::new(|| AtomicU64::new(u64::from(process::id()) << 32));

fn next_seq() -> u64 {
    NEXT_SEQ.fetch_add(1, Ordering::Relaxed) + 1
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReqRespOptions {
    /// Prefix of the channel names.
    pub prefix: String,
    /// Requests (and responses) each channel holds.
    pub capacity: usize,
    pub max_message_size: usize,
    /// How long `request` waits for the matching response.
    pub response_timeout_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for ReqRespOptions {
    fn default() -> Self {
        ReqRespOptions {
            prefix: "reqresp".to_string(),
            capacity: 8,
            max_message_size: 1024,
            response_timeout_ms: 5000,
            poll_interval_ms: 1,
        }
    }
}

impl ReqRespOptions {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

/// A request taken off a server's channel, waiting for [`ReqResp::reply`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IncomingRequest {
    pub id: String,
    pub seq: u64,
    pub payload: Vec<u8>,
}

struct Channels {
    requests: Dispenser,
    responses: Dispenser,
}

impl Channels {
    fn open(cfg: &ShmemConfig, options: &ReqRespOptions, id: &str) -> Result<Channels> {
        let item_size = options.max_message_size + ENVELOPE_OVERHEAD;
        let requests = Dispenser::with_capacity(
            cfg,
            &format!("{}.{}.req", options.prefix, id),
            Mode::Deque,
            options.capacity,
            item_size,
        )?;
        let responses = Dispenser::with_capacity(
            cfg,
            &format!("{}.{}.resp", options.prefix, id),
            Mode::Fifo,
            options.capacity,
            item_size,
        )?;
        Ok(Channels {
            requests,
            responses,
        })
    }

    fn close(&mut self) {
        self.requests.close();
        self.responses.close();
    }

    fn unlink(&mut self) -> Result<()> {
        self.requests.unlink()?;
        self.responses.unlink()
    }
}

type Handler = Box<dyn FnMut(&[u8]) -> Vec<u8>>;

pub struct ReqResp {
    config: ShmemConfig,
    options: ReqRespOptions,
    servers: HashMap<String, Channels>,
    clients: HashMap<String, Channels>,
    handlers: HashMap<String, Handler>,
}

impl ReqResp {
    pub fn new(cfg: &ShmemConfig, options: ReqRespOptions) -> ReqResp {
        ReqResp {
            config: cfg.clone(),
            options,
            servers: HashMap::new(),
            clients: HashMap::new(),
            handlers: HashMap::new(),
        }
    }

    /// Binds the server side of `id`, creating the channel pair if needed.
    pub fn setup_server(&mut self, id: &str) -> Result<()> {
        if !self.servers.contains_key(id) {
            let channels = Channels::open(&self.config, &self.options, id)?;
            self.servers.insert(id.to_string(), channels);
            info!(id, "reqresp server bound");
        }
        Ok(())
    }

    pub fn setup_client(&mut self, id: &str) -> Result<()> {
        if !self.clients.contains_key(id) {
            let channels = Channels::open(&self.config, &self.options, id)?;
            self.clients.insert(id.to_string(), channels);
            info!(id, "reqresp client bound");
        }
        Ok(())
    }

    /// Sends `message` and blocks until the matching response or the response timeout.
    ///
    /// On any failure after the request went out (timeout included) the
    /// request is taken back if no server picked it up yet, so the channel is
    /// left as if the call never happened.
    pub fn request(&self, id: &str, message: &[u8]) -> Result<Vec<u8>> {
        let channels = self
            .clients
            .get(id)
            .ok_or_else(|| IpcError::ResourceNotFound(id.to_string()))?;
        self.check_size(message)?;

        let seq = next_seq();
        channels
            .requests
            .add(&Envelope::encode(seq, Status::Ok, message))?;
        op_event!(self.config.verbose, id, seq, len = message.len(), "request sent");

        let err = match self.await_response(channels, id, seq) {
            Ok(response) => return Ok(response),
            Err(e) => e,
        };
        let reclaimed = channels
            .requests
            .remove_back_if(|raw| Envelope::peek_seq(raw).map(|s| s == seq).unwrap_or(false));
        match reclaimed {
            Ok(Some(_)) => debug!(id, seq, error = %err, "reclaimed unserved request"),
            Ok(None) => {
                if let IpcError::Timeout(_) = err {
                    warn!(id, seq, "request timed out after a server took it");
                }
            }
            Err(e) => warn!(id, seq, error = %e, "could not reclaim request"),
        }
        Err(err)
    }

    fn await_response(&self, channels: &Channels, id: &str, seq: u64) -> Result<Vec<u8>> {
        let timeout = self.options.response_timeout();
        let deadline = Instant::now() + timeout;
        let interval = Duration::from_millis(self.options.poll_interval_ms);
        loop {
            match channels.responses.dispense() {
                Ok(raw) => {
                    let response = Envelope::decode(&raw)?;
                    if response.seq != seq {
                        debug!(id, stale = response.seq, waiting = seq, "discarding stale response");
                        continue;
                    }
                    return match response.status {
                        Status::Ok => Ok(response.payload),
                        Status::Unanswered => Err(IpcError::NoResponse(id.to_string())),
                    };
                }
                Err(IpcError::Empty(_)) => {}
                Err(e) => return Err(e),
            }
            if Instant::now() >= deadline {
                return Err(IpcError::Timeout(timeout));
            }
            thread::sleep(interval);
        }
    }

    pub fn request_str(&self, id: &str, message: &str) -> Result<String> {
        Ok(String::from_utf8(self.request(id, message.as_bytes())?)?)
    }

    /// Registers the handler [`ReqResp::serve`] calls for requests on `id`.
    pub fn respond<F>(&mut self, id: &str, handler: F) -> Result<()>
    where
        F: FnMut(&[u8]) -> Vec<u8> + 'static,
    {
        if !self.servers.contains_key(id) {
            return Err(IpcError::ResourceNotFound(id.to_string()));
        }
        self.handlers.insert(id.to_string(), Box::new(handler));
        Ok(())
    }

    /// Takes the requests pending right now on every bound server id.
    pub fn poll_requests(&self) -> RequestPoll<'_> {
        let mut ids: Vec<&str> = self.servers.keys().map(String::as_str).collect();
        ids.sort_unstable();
        RequestPoll {
            reqresp: self,
            ids,
            current: 0,
            remaining: None,
        }
    }

    pub fn reply(&self, request: &IncomingRequest, payload: &[u8]) -> Result<()> {
        self.check_size(payload)?;
        self.send_response(&request.id, request.seq, Status::Ok, payload)
    }

    /// Answers every pending request with its registered handler.
    ///
    /// A request for an id without a handler, or whose handler output does
    /// not fit a slot, is answered as unanswered so the client fails fast
    /// with `NoResponse`. Returns the number of requests answered by a handler.
    pub fn serve(&mut self) -> Result<usize> {
        let mut ids: Vec<String> = self.servers.keys().cloned().collect();
        ids.sort_unstable();
        let mut answered = 0;
        for id in ids {
            let mut remaining = match self.servers.get(&id) {
                Some(channels) => channels.requests.len()?,
                None => continue,
            };
            while remaining > 0 {
                remaining -= 1;
                let request = match self.take_request(&id)? {
                    Some(request) => request,
                    None => break,
                };
                let response = self.handlers.get_mut(&id).map(|handler| handler(request.payload.as_slice()));
                match response {
                    Some(payload) if payload.len() <= self.options.max_message_size => {
                        self.send_response(&id, request.seq, Status::Ok, &payload)?;
                        answered += 1;
                    }
                    Some(payload) => {
                        warn!(id = %id, len = payload.len(), max = self.options.max_message_size, "response too large");
                        self.send_response(&id, request.seq, Status::Unanswered, &[])?;
                    }
                    None => {
                        warn!(id = %id, seq = request.seq, "no handler registered");
                        self.send_response(&id, request.seq, Status::Unanswered, &[])?;
                    }
                }
            }
        }
        Ok(answered)
    }

    /// Requests waiting on `id`, from whichever side this handle bound.
    pub fn pending_requests(&self, id: &str) -> Result<usize> {
        self.channels(id)?.requests.len()
    }

    pub fn close(&mut self) {
        for channels in self.servers.values_mut().chain(self.clients.values_mut()) {
            channels.close();
        }
        self.servers.clear();
        self.clients.clear();
        self.handlers.clear();
    }

    /// Removes every channel pair this handle is bound to.
    pub fn unlink(&mut self) -> Result<()> {
        for (_, mut channels) in self.servers.drain().chain(self.clients.drain()) {
            channels.unlink()?;
        }
        self.handlers.clear();
        Ok(())
    }

    pub fn options(&self) -> &ReqRespOptions {
        &self.options
    }

    fn channels(&self, id: &str) -> Result<&Channels> {
        self.servers
            .get(id)
            .or_else(|| self.clients.get(id))
            .ok_or_else(|| IpcError::ResourceNotFound(id.to_string()))
    }

    fn check_size(&self, payload: &[u8]) -> Result<()> {
        if payload.len() > self.options.max_message_size {
            return Err(IpcError::ItemTooLarge {
                len: payload.len(),
                item_size: self.options.max_message_size,
            });
        }
        Ok(())
    }

    fn take_request(&self, id: &str) -> Result<Option<IncomingRequest>> {
        let channels = self
            .servers
            .get(id)
            .ok_or_else(|| IpcError::ResourceNotFound(id.to_string()))?;
        let raw = match channels.requests.dispense() {
            Ok(raw) => raw,
            Err(IpcError::Empty(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let envelope = Envelope::decode(&raw)?;
        op_event!(self.config.verbose, id, seq = envelope.seq, "request taken");
        Ok(Some(IncomingRequest {
            id: id.to_string(),
            seq: envelope.seq,
            payload: envelope.payload,
        }))
    }

    fn send_response(&self, id: &str, seq: u64, status: Status, payload: &[u8]) -> Result<()> {
        let channels = self
            .servers
            .get(id)
            .ok_or_else(|| IpcError::ResourceNotFound(id.to_string()))?;
        channels
            .responses
            .add(&Envelope::encode(seq, status, payload))?;
        op_event!(self.config.verbose, id, seq, ?status, "response sent");
        Ok(())
    }
}

/// Lazy, finite sequence of requests from one [`ReqResp::poll_requests`].
///
/// Each server id is drained up to the backlog it had when the poll reached it.
pub struct RequestPoll<'a> {
    reqresp: &'a ReqResp,
    ids: Vec<&'a str>,
    current: usize,
    remaining: Option<usize>,
}

impl Iterator for RequestPoll<'_> {
    type Item = Result<IncomingRequest>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let id = *self.ids.get(self.current)?;
            let remaining = match self.remaining {
                Some(n) => n,
                None => match self.reqresp.pending_requests(id) {
                    Ok(n) => n,
                    Err(e) => {
                        self.current += 1;
                        return Some(Err(e));
                    }
                },
            };
            if remaining == 0 {
                self.current += 1;
                self.remaining = None;
                continue;
            }
            self.remaining = Some(remaining - 1);
            match self.reqresp.take_request(id) {
                Ok(Some(request)) => return Some(Ok(request)),
                Ok(None) => self.remaining = Some(0),
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
