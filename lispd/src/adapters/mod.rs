pub mod raw_socket;

pub use raw_socket::RawIpSink;
