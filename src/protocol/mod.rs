//! Wire envelopes sent to browser channels
//!
//! Every frame is a JSON object `{ "type": ..., "data": ... }`.

pub mod messages;

pub use messages::{ConnectionStatus, LiveEvent};
