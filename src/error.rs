use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Channel already bound")]
    AlreadyBound,

    #[error("Channel not bound")]
    NotBound,

    #[error("ChannelSet already initialized")]
    AlreadyInitialized,

    #[error("ChannelSet not initialized")]
    NotInitialized,

    #[error("perf_event_open failed: {0}")]
    ResourceOpenFailed(#[source] std::io::Error),

    #[error("Failed to mmap perf buffer: {0}")]
    MappingFailed(#[source] std::io::Error),

    #[error("perf control request '{op}' failed: {source}")]
    ControlRequestFailed {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("epoll failed: {0}")]
    WaitFailed(#[source] std::io::Error),

    #[error("Ring buffer corrupted: {0}")]
    Corrupted(String),
}

pub type Result<T> = std::result::Result<T, Error>;

pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const GENERAL_ERROR: i32 = 1;
    pub const INVALID_ARGUMENTS: i32 = 2;
    pub const RESOURCE_ERROR: i32 = 3;
}

impl Error {
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::InvalidArgument(_) => exit_code::INVALID_ARGUMENTS,
            Error::ResourceOpenFailed(_) | Error::MappingFailed(_) => exit_code::RESOURCE_ERROR,
            _ => exit_code::GENERAL_ERROR,
        }
    }
}
