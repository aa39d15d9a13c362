//! The Courier server core.
//!
//! Ties the pieces together: the handler registry and contract, the webhook
//! dispatch path with channel-log capture, the channel cache, the sender
//! pool draining the prioritized queue, and the axum HTTP surface.

pub mod api;
pub mod base;
pub mod cache;
pub mod dispatch;
pub mod handler;
pub mod registry;
pub mod sender;
pub mod trace;

pub use api::{create_router, AppState};
pub use cache::ChannelCache;
pub use handler::{
    ChannelHandler, HandlerError, ReceiveOutcome, ReceivedEvent, SendResult, WebhookRequest,
};
pub use registry::HandlerRegistry;
pub use sender::{Foreman, MsgQueue, SenderPoolConfig};
pub use trace::{request_with_log, Traced};
