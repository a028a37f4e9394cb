#[cfg(any(test, feature = "memory-server"))]
pub mod in_memory_server;
pub mod reqwest_transport;

#[cfg(any(test, feature = "memory-server"))]
pub use in_memory_server::InMemoryContextServer;
pub use reqwest_transport::{BlockingReqwestTransport, ReqwestTransport};
