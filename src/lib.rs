//! relaymq - distributed event emitter
//!
//! Exposes a local emit/listen API while routing events through a message
//! broker: request/response (`ONE`) over shared per-event queues and
//! publish/subscribe (`ALL`) over a topic exchange. The emitter survives
//! connection loss by reconnecting, replaying unconfirmed publishes and
//! recreating queue bindings.

pub mod config;
pub mod connection;
pub mod correlation;
pub mod dispatch;
pub mod emitter;
pub mod error;
pub mod event;
pub mod outbound;
pub mod queues;
pub mod registry;
pub mod transport;
pub mod utils;

pub use config::EmitterConfig;
pub use connection::ConnectionState;
pub use emitter::{Emitter, EmitterEvent};
pub use error::{BoxError, EmitterError, Result};
pub use event::{EventId, EventMode, EventName};
pub use registry::{Listener, ListenerId};
