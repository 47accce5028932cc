//! Backend transports for the change feed
//!
//! - `Transport`: the collaborator trait consumed by the connection manager
//! - `MemoryTransport`: in-process feeds, used by tests and embedders
//! - `RedisTransport`: Redis Pub/Sub feeds and key lookups

mod memory;
mod redis;
mod traits;
mod types;

pub use self::memory::MemoryTransport;
pub use self::redis::RedisTransport;
pub use traits::Transport;
pub use types::{SignalStream, TransportError, TransportSignal};
