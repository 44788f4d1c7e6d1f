mod listen_endpoint;

pub use listen_endpoint::ListenEndpoint;
