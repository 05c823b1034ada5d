//! # chatrelay-shared
//!
//! Types shared by the chat relay server and its clients: the relayed
//! [`Message`](types::Message), the JSON wire records exchanged with
//! subscribers, the upstream frame decoder, and the on-disk chat log format.

pub mod constants;
pub mod error;
pub mod log_format;
pub mod protocol;
pub mod types;

pub use error::{ConnectError, DeliveryError, HubError, LogError, ParseError};
pub use log_format::{LogEntry, LogFileName};
pub use protocol::{decode_upstream_frame, DecodedFrame, InboundFrame, MessageRecord};
pub use types::{Message, MessageId};
