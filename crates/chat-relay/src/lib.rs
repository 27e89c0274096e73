//! chat-relay: streaming chat-completion relay
//!
//! Forwards a conversation to an OpenAI-compatible `/chat/completions`
//! endpoint, decodes the event-stream response incrementally and fans the
//! decoded text out to one consumer per conversation turn.

pub mod config;
pub mod decoder;
pub mod error;
pub mod relay;
pub mod transport;
pub mod types;

pub use config::RelayConfig;
pub use decoder::{Decoded, StreamDecoder, TerminalSignal};
pub use error::{Error, Result};
pub use relay::{Callbacks, ChannelSink, ConversationRelay, TurnEventStream, TurnHandle, TurnSink};
pub use transport::{ByteStream, HttpTransport, Transport};
pub use types::*;
