use std::sync::Arc;

use super::protocol::{ContextProtocol, PreparedCall, ProtocolOutput};
use crate::adapter::out_adapters::BlockingReqwestTransport;
use crate::config::ClientConfig;
use crate::domain::{
    AppendResponse, CompressOptions, CompressResponse, CreateContextOptions,
    CreateContextResponse, DeleteResponse, GetContextOptions, GetContextResponse,
    ListContextsResponse, MessagePatch, NewMessage, UltraContextError, UltraContextResult,
    UncompressOptions, UncompressResponse, UpdateResponse, VersionTracker,
};
use crate::ports::out_ports::BlockingTransport;

/// Blocking UltraContext client; same operations and version semantics as
/// [`AsyncContextClient`](super::AsyncContextClient)
#[derive(Debug, Clone)]
pub struct BlockingContextClient<T> {
    transport: T,
    protocol: ContextProtocol,
}

impl BlockingContextClient<BlockingReqwestTransport> {
    /// Client over HTTP, configured from `config`.
    ///
    /// Must not be called from within an async runtime.
    pub fn from_config(config: &ClientConfig) -> UltraContextResult<Self> {
        let transport =
            BlockingReqwestTransport::from_config(config).map_err(UltraContextError::Transport)?;
        Ok(Self::new(transport, config))
    }
}

impl<T: BlockingTransport> BlockingContextClient<T> {
    pub fn new(transport: T, config: &ClientConfig) -> Self {
        Self::with_tracker(transport, config, Arc::new(VersionTracker::new()))
    }

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

    pub fn create(&self, options: CreateContextOptions) -> UltraContextResult<CreateContextResponse> {
        let call = self.protocol.prepare_create(options)?;
        self.execute(call)
    }

    pub fn list(&self) -> UltraContextResult<ListContextsResponse> {
        let call = self.protocol.prepare_list()?;
        self.execute(call)
    }

    pub fn get(
        &self,
        context_id: &str,
        options: GetContextOptions,
    ) -> UltraContextResult<GetContextResponse> {
        let call = self.protocol.prepare_get(context_id, options)?;
        self.execute(call)
    }

    pub fn append(
        &self,
        context_id: &str,
        messages: Vec<NewMessage>,
    ) -> UltraContextResult<AppendResponse> {
        let call = self.protocol.prepare_append(context_id, messages)?;
        self.execute(call)
    }

    pub fn update(
        &self,
        context_id: &str,
        patches: Vec<MessagePatch>,
    ) -> UltraContextResult<UpdateResponse> {
        let call = self.protocol.prepare_update(context_id, patches)?;
        self.execute(call)
    }

    pub fn delete(&self, context_id: &str) -> UltraContextResult<DeleteResponse> {
        let call = self.protocol.prepare_delete(context_id)?;
        self.execute(call)
    }

    pub fn compress(
        &self,
        context_id: &str,
        options: CompressOptions,
    ) -> UltraContextResult<CompressResponse> {
        let call = self.protocol.prepare_compress(context_id, options)?;
        self.execute(call)
    }

    pub fn uncompress(
        &self,
        context_id: &str,
        options: UncompressOptions,
    ) -> UltraContextResult<UncompressResponse> {
        let call = self.protocol.prepare_uncompress(context_id, options)?;
        self.execute(call)
    }

    fn execute<O: ProtocolOutput>(&self, call: PreparedCall<O>) -> UltraContextResult<O> {
        let response = self
            .transport
            .send(call.request().clone())
            .map_err(UltraContextError::Transport)?;
        self.protocol.complete(call, response)
    }
}
