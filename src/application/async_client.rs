use async_trait::async_trait;
use std::sync::Arc;

use super::protocol::{ContextProtocol, PreparedCall, ProtocolOutput};
use crate::adapter::out_adapters::ReqwestTransport;
use crate::config::ClientConfig;
use crate::domain::{
    AppendResponse, CompressOptions, CompressResponse, CreateContextOptions,
    CreateContextResponse, DeleteResponse, GetContextOptions, GetContextResponse,
    ListContextsResponse, MessagePatch, NewMessage, UltraContextError, UltraContextResult,
    UncompressOptions, UncompressResponse, UpdateResponse, VersionTracker,
};
use crate::ports::in_ports::ContextPort;
use crate::ports::out_ports::Transport;

/// Non-blocking UltraContext client.
///
/// Suspends only while the transport is in flight. Dropping a pending call
/// applies nothing to the version tracker.
#[derive(Debug, Clone)]
pub struct AsyncContextClient<T> {
    transport: T,
    protocol: ContextProtocol,
}

impl AsyncContextClient<ReqwestTransport> {
    /// Client over HTTP, configured from `config`
    pub fn from_config(config: &ClientConfig) -> UltraContextResult<Self> {
        let transport =
            ReqwestTransport::from_config(config).map_err(UltraContextError::Transport)?;
        Ok(Self::new(transport, config))
    }
}

impl<T: Transport> AsyncContextClient<T> {
    /// Client with its own version tracker
    pub fn new(transport: T, config: &ClientConfig) -> Self {
        Self::with_tracker(transport, config, Arc::new(VersionTracker::new()))
    }

    /// Client sharing `tracker` with other clients
    pub fn with_tracker(transport: T, config: &ClientConfig, tracker: Arc<VersionTracker>) -> Self {
        Self {
            transport,
            protocol: ContextProtocol::new(config, tracker),
        }
    }

    pub fn tracker(&self) -> &Arc<VersionTracker> {
        self.protocol.tracker()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    async fn execute<O: ProtocolOutput>(&self, call: PreparedCall<O>) -> UltraContextResult<O> {
        let response = self
            .transport
            .send(call.request().clone())
            .await
            .map_err(UltraContextError::Transport)?;
        self.protocol.complete(call, response)
    }
}

#[async_trait]
impl<T: Transport> ContextPort for AsyncContextClient<T> {
    async fn create(
        &self,
        options: CreateContextOptions,
    ) -> UltraContextResult<CreateContextResponse> {
        let call = self.protocol.prepare_create(options)?;
        self.execute(call).await
    }

    async fn list(&self) -> UltraContextResult<ListContextsResponse> {
        let call = self.protocol.prepare_list()?;
        self.execute(call).await
    }

    async fn get(
        &self,
        context_id: &str,
        options: GetContextOptions,
    ) -> UltraContextResult<GetContextResponse> {
        let call = self.protocol.prepare_get(context_id, options)?;
        self.execute(call).await
    }

    async fn append(
        &self,
        context_id: &str,
        messages: Vec<NewMessage>,
    ) -> UltraContextResult<AppendResponse> {
        let call = self.protocol.prepare_append(context_id, messages)?;
        self.execute(call).await
    }

    async fn update(
        &self,
        context_id: &str,
        patches: Vec<MessagePatch>,
    ) -> UltraContextResult<UpdateResponse> {
        let call = self.protocol.prepare_update(context_id, patches)?;
        self.execute(call).await
    }

    async fn delete(&self, context_id: &str) -> UltraContextResult<DeleteResponse> {
        let call = self.protocol.prepare_delete(context_id)?;
        self.execute(call).await
    }

    async fn compress(
        &self,
        context_id: &str,
        options: CompressOptions,
    ) -> UltraContextResult<CompressResponse> {
        let call = self.protocol.prepare_compress(context_id, options)?;
        self.execute(call).await
    }

    async fn uncompress(
        &self,
        context_id: &str,
        options: UncompressOptions,
    ) -> UltraContextResult<UncompressResponse> {
        let call = self.protocol.prepare_uncompress(context_id, options)?;
        self.execute(call).await
    }
}
