//! Handler registry.
//!
//! A process-wide mapping from channel-type tag to handler, built once at
//! boot and injected wherever handlers are resolved. The channel entity
//! holds only the tag; the registry owns the handler.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, warn};

use courier_common::ChannelType;

use crate::handler::ChannelHandler;

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: BTreeMap<ChannelType, Arc<dyn ChannelHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        HandlerRegistry {
            handlers: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, handler: Arc<dyn ChannelHandler>) {
        let channel_type = handler.channel_type();
        info!(channel_type = %channel_type, name = handler.name(), "registered handler");
        if self
            .handlers
            .insert(channel_type.clone(), handler)
            .is_some()
        {
            warn!(channel_type = %channel_type, "handler re-registered, replacing previous");
        }
    }

    pub fn resolve(&self, channel_type: &ChannelType) -> Option<Arc<dyn ChannelHandler>> {
        self.handlers.get(channel_type).cloned()
    }

    /// Registered handlers in tag order, for the index page.
    pub fn handlers(&self) -> impl Iterator<Item = &Arc<dyn ChannelHandler>> {
        self.handlers.values()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
