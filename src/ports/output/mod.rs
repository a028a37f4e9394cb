pub mod transport_port;

pub use transport_port::{
    BlockingTransport, HttpRequest, HttpResponse, Method, Transport,
};

#[cfg(test)]
pub use transport_port::MockBlockingTransport;
