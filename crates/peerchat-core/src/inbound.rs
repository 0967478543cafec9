//! Registration of chat streams opened by remote peers

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::address::short_peer_id;
use crate::contact::Contact;
use crate::error::ChatResult;
use crate::registry::ContactRegistry;
use crate::transport::{ChatStream, StreamHandler};

/// Stream handler that turns every accepted chat stream into a contact
pub struct InboundHandler {
    registry: Arc<ContactRegistry>,
}

impl InboundHandler {
    pub fn new(registry: Arc<ContactRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl StreamHandler for InboundHandler {
    async fn handle(&self, stream: ChatStream) -> ChatResult<()> {
        info!(peer = %stream.peer, name = %short_peer_id(&stream.peer), "New peer is coming");
        self.registry.add(Contact::new(stream)).await
    }
}
