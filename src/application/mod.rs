pub mod async_client;
pub mod blocking_client;
pub mod protocol;
pub mod response_mapper;

pub use async_client::AsyncContextClient;
pub use blocking_client::BlockingContextClient;
pub use protocol::{ContextProtocol, PreparedCall, ProtocolOutput};
