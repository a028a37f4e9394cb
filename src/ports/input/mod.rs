pub mod context_port;

pub use context_port::ContextPort;
