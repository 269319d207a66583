use thiserror::Error;

/// Errors produced by the map-cache and egress data plane.
#[derive(Error, Debug)]
pub enum LispError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("packet too short or malformed: {0}")]
    Parse(String),

    #[error("address family not supported for this operation: {0}")]
    WrongKind(String),

    #[error("outer address family not implemented: {0}")]
    UnsupportedFamily(String),

    #[error("allocation failure: {0}")]
    Allocation(String),

    #[error("sendto failed or returned a short write: {0}")]
    Emission(String),

    #[error("map-reply nonce did not match any outstanding request")]
    NonceMismatch,

    #[error("iterator observed a mutation mid-traversal")]
    ConcurrentModification,

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, LispError>;
