//! Shared data model for the Courier messaging gateway.
//!
//! Everything that crosses a crate boundary lives here: channels and their
//! typed configuration access, contact URNs, inbound and outbound messages,
//! status updates, channel events, channel logs with redacted HTTP traces,
//! and the send error taxonomy the sender pool maps onto message statuses.

pub mod channel;
pub mod clog;
pub mod error;
pub mod event;
pub mod logging;
pub mod msg;
pub mod status;
pub mod urns;

pub use channel::{Channel, ChannelType};
pub use clog::{ChannelLog, ChannelLogType, HttpLog, LogError};
pub use error::SendError;
pub use event::{ChannelEvent, ChannelEventType};
pub use msg::{MsgId, MsgIn, MsgOut, NIL_MSG_ID};
pub use status::{MsgStatus, StatusUpdate};
pub use urns::{Urn, UrnError};
