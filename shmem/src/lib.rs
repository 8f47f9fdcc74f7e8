// Per-operation events: debug for verbose resources, trace otherwise.
macro_rules! op_event {
    ($verbose:expr, $($arg:tt)+) => {
        if $verbose {
            tracing::debug!($($arg)+)
        } else {
            tracing::trace!($($arg)+)
        }
    };
}

mod codec;
pub mod core;
pub mod dispenser;
mod errors;
pub mod pubsub;
pub mod reqresp;
pub mod segment;
pub mod store;

#[cfg(test)]
mod tests;

pub use crate::core::lock::LockInfo;
pub use crate::core::{ShmemConfig, ShmemConfigBuilder, DEFAULT_LOCK_TIMEOUT_MS};
pub use dispenser::{Dispenser, DispenserOptions, Mode};
pub use errors::{IpcError, Result};
pub use pubsub::{Delivery, PollReport, PubSub, PubSubOptions};
pub use reqresp::{IncomingRequest, ReqResp, ReqRespOptions};
pub use segment::Segment;
pub use store::StoreDict;
