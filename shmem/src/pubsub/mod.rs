//! Topic routing over a shared message log.
//!
//! Each published message becomes one `[topic_len: u16][topic][len: u32][message]`
//! record in the log. Every handle that subscribes gets its own cursor, so
//! all subscribers of a topic see each message once. Which topics a handle
//! wants, and the handlers that run for them, stay local to that handle.

use std::collections::HashMap;

use serde_derive::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::codec;
use crate::core::ShmemConfig;
use crate::errors::{IpcError, Result};

mod journal;

use journal::MessageLog;
pub use journal::MAX_SUBSCRIBERS;

pub const MAX_TOPIC_LEN: usize = 255;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PubSubOptions {
    /// Messages retained for the slowest subscriber before `publish` reports `Full`.
    pub capacity: usize,
    pub max_message_size: usize,
}

impl Default for PubSubOptions {
    fn default() -> Self {
        PubSubOptions {
            capacity: 64,
            max_message_size: 1024,
        }
    }
}

impl PubSubOptions {
    fn item_size(&self) -> usize {
        self.max_message_size + MAX_TOPIC_LEN + codec::RECORD_OVERHEAD
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PollReport {
    pub delivered: usize,
    pub unhandled: usize,
}

type Handler = Box<dyn FnMut(&str, &[u8])>;

pub struct PubSub {
    name: String,
    log: MessageLog,
    options: PubSubOptions,
    subscriptions: HashMap<String, Option<Handler>>,
    // Cursor claimed on the first subscription.
    cursor: Option<usize>,
    verbose: bool,
}

impl PubSub {
    pub fn create(cfg: &ShmemConfig, name: &str, options: PubSubOptions) -> Result<PubSub> {
        let bytes = journal::required_bytes(options.capacity, options.item_size()).ok_or_else(|| {
            IpcError::AllocationFailed(format!("log '{}' geometry overflows", name))
        })?;
        Ok(PubSub {
            name: name.to_string(),
            log: MessageLog::create(cfg, name, bytes)?,
            options,
            subscriptions: HashMap::new(),
            cursor: None,
            verbose: cfg.verbose,
        })
    }

    pub fn setup(&mut self) -> Result<bool> {
        let item_size = self.options.item_size();
        self.log.setup(self.options.capacity, item_size)
    }

    /// Appends a message every current subscriber of `topic` will see.
    pub fn publish(&self, topic: &str, message: &[u8]) -> Result<()> {
        validate_topic(topic)?;
        if message.len() > self.options.max_message_size {
            return Err(IpcError::ItemTooLarge {
                len: message.len(),
                item_size: self.options.max_message_size,
            });
        }
        let mut record = Vec::with_capacity(codec::record_len(topic, message));
        codec::encode_record(&mut record, topic, message)?;
        let id = self.log.append(&record)?;
        op_event!(self.verbose, name = %self.name, topic, id, len = message.len(), "published");
        Ok(())
    }

    pub fn publish_str(&self, topic: &str, message: &str) -> Result<()> {
        self.publish(topic, message.as_bytes())
    }

    /// Registers interest in `topic`. Existing handlers are kept.
    ///
    /// Only messages published after the first subscription of this handle
    /// are delivered.
    pub fn subscribe(&mut self, topic: &str) -> Result<()> {
        validate_topic(topic)?;
        self.ensure_cursor()?;
        self.subscriptions.entry(topic.to_string()).or_insert(None);
        debug!(name = %self.name, topic, "subscribed");
        Ok(())
    }

    /// Drops the subscription and its handler. Returns whether it existed.
    ///
    /// Dropping the last subscription gives the cursor back, so this handle
    /// no longer holds back publishers.
    pub fn unsubscribe(&mut self, topic: &str) -> Result<bool> {
        let existed = self.subscriptions.remove(topic).is_some();
        if self.subscriptions.is_empty() {
            if let Some(cursor) = self.cursor.take() {
                self.log.release(cursor)?;
            }
        }
        Ok(existed)
    }

    /// Subscribes `topic` and routes its deliveries to `handler` in [`PubSub::dispatch`].
    pub fn register_handler<F>(&mut self, topic: &str, handler: F) -> Result<()>
    where
        F: FnMut(&str, &[u8]) + 'static,
    {
        validate_topic(topic)?;
        self.ensure_cursor()?;
        self.subscriptions
            .insert(topic.to_string(), Some(Box::new(handler)));
        Ok(())
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.subscriptions.contains_key(topic)
    }

    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.subscriptions.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Reads the records this handle has not seen yet.
    ///
    /// The iterator is bounded by the log head observed when it was created;
    /// records published meanwhile wait for the next poll. Records for topics
    /// without a local subscription are skipped and counted in
    /// [`Poll::unhandled`]. A handle with no subscription polls nothing.
    pub fn poll(&self) -> Result<Poll<'_>> {
        let end = match self.cursor {
            Some(_) => self.log.head()?,
            None => 0,
        };
        Ok(Poll {
            pubsub: self,
            end,
            unhandled: 0,
        })
    }

    /// Drains one poll into the registered handlers.
    ///
    /// Subscribed topics without a handler count as unhandled.
    pub fn dispatch(&mut self) -> Result<PollReport> {
        let mut report = PollReport::default();
        let cursor = match self.cursor {
            Some(cursor) => cursor,
            None => return Ok(report),
        };
        let end = self.log.head()?;
        loop {
            let subscriptions = &self.subscriptions;
            let next = take_next(
                &self.log,
                &self.name,
                cursor,
                end,
                &mut report.unhandled,
                |topic| subscriptions.contains_key(topic),
            );
            let delivery = match next {
                Some(delivery) => delivery?,
                None => break,
            };
            match self.subscriptions.get_mut(&delivery.topic) {
                Some(Some(handler)) => {
                    handler(delivery.topic.as_str(), delivery.payload.as_slice());
                    report.delivered += 1;
                }
                _ => report.unhandled += 1,
            }
        }
        if report.delivered + report.unhandled > 0 {
            op_event!(self.verbose, name = %self.name, delivered = report.delivered, unhandled = report.unhandled, "dispatched");
        }
        Ok(report)
    }

    /// Records this handle has yet to poll.
    pub fn pending(&self) -> Result<usize> {
        match self.cursor {
            Some(cursor) => self.log.backlog(cursor),
            None => Ok(0),
        }
    }

    /// Records still held in shared memory for the slowest subscriber.
    pub fn retained(&self) -> Result<usize> {
        self.log.len()
    }

    pub fn close(&mut self) {
        self.release_cursor();
        self.log.close();
    }

    pub fn unlink(&mut self) -> Result<()> {
        self.cursor = None;
        self.log.unlink()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn ensure_cursor(&mut self) -> Result<()> {
        if self.cursor.is_none() {
            self.cursor = Some(self.log.register()?);
        }
        Ok(())
    }

    fn release_cursor(&mut self) {
        if let Some(cursor) = self.cursor.take() {
            if let Err(e) = self.log.release(cursor) {
                warn!(name = %self.name, cursor, error = %e, "could not release cursor");
            }
        }
    }
}

impl Drop for PubSub {
    fn drop(&mut self) {
        if self.log.is_open() {
            self.release_cursor();
        }
    }
}

/// Lazy, finite sequence of deliveries from one [`PubSub::poll`].
pub struct Poll<'a> {
    pubsub: &'a PubSub,
    end: u64,
    unhandled: usize,
}

impl Poll<'_> {
    /// Records read so far whose topic this handle did not subscribe to.
    pub fn unhandled(&self) -> usize {
        self.unhandled
    }
}

impl Iterator for Poll<'_> {
    type Item = Result<Delivery>;

    fn next(&mut self) -> Option<Self::Item> {
        let cursor = self.pubsub.cursor?;
        let subscriptions = &self.pubsub.subscriptions;
        take_next(
            &self.pubsub.log,
            &self.pubsub.name,
            cursor,
            self.end,
            &mut self.unhandled,
            |topic| subscriptions.contains_key(topic),
        )
    }
}

// Reads until a subscribed record turns up or the cursor reaches `end`.
fn take_next<F>(
    log: &MessageLog,
    name: &str,
    cursor: usize,
    end: u64,
    unhandled: &mut usize,
    subscribed: F,
) -> Option<Result<Delivery>>
where
    F: Fn(&str) -> bool,
{
    loop {
        let record = match log.next_for(cursor, end) {
            Ok(Some(record)) => record,
            Ok(None) => return None,
            Err(e) => return Some(Err(e)),
        };
        let (topic, payload) = match codec::decode_record(&record) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(name, error = %e, "skipping malformed record");
                return Some(Err(e));
            }
        };
        if subscribed(&topic) {
            return Some(Ok(Delivery { topic, payload }));
        }
        debug!(name, topic = %topic, "no subscription, record skipped");
        *unhandled += 1;
    }
}

fn validate_topic(topic: &str) -> Result<()> {
    if topic.is_empty() || topic.len() > MAX_TOPIC_LEN {
        return Err(IpcError::InvalidKey(format!(
            "topic must be 1 to {} bytes, got {}",
            MAX_TOPIC_LEN,
            topic.len()
        )));
    }
    Ok(())
}
