use async_trait::async_trait;

use crate::domain::{
    AppendResponse, CompressOptions, CompressResponse, CreateContextOptions,
    CreateContextResponse, DeleteResponse, GetContextOptions, GetContextResponse,
    ListContextsResponse, MessagePatch, NewMessage, UltraContextResult, UncompressOptions,
    UncompressResponse, UpdateResponse,
};

/// Input port for context operations
#[async_trait]
pub trait ContextPort {
    /// Create a new context
    async fn create(&self, options: CreateContextOptions)
        -> UltraContextResult<CreateContextResponse>;

    /// List all contexts
    async fn list(&self) -> UltraContextResult<ListContextsResponse>;

    /// Read a context's messages, optionally at a past version or with history
    async fn get(
        &self,
        context_id: &str,
        options: GetContextOptions,
    ) -> UltraContextResult<GetContextResponse>;

    /// Append messages to the end of the log
    async fn append(
        &self,
        context_id: &str,
        messages: Vec<NewMessage>,
    ) -> UltraContextResult<AppendResponse>;

    /// Edit existing messages
    async fn update(
        &self,
        context_id: &str,
        patches: Vec<MessagePatch>,
    ) -> UltraContextResult<UpdateResponse>;

    /// Delete a context
    async fn delete(&self, context_id: &str) -> UltraContextResult<DeleteResponse>;

    /// Compact historical messages server-side
    async fn compress(
        &self,
        context_id: &str,
        options: CompressOptions,
    ) -> UltraContextResult<CompressResponse>;

    /// Expand previously compressed messages where the originals were retained
    async fn uncompress(
        &self,
        context_id: &str,
        options: UncompressOptions,
    ) -> UltraContextResult<UncompressResponse>;
}
