pub mod buffer;
pub mod channel;
pub mod channel_set;
pub mod cli;
pub mod error;
pub mod hotness;
pub mod perf;
pub mod ring;
pub mod source;

#[cfg(test)]
pub(crate) mod testutil;

pub use channel::{Channel, EventKind, Sample};
pub use channel_set::ChannelSet;
pub use error::{Error, Result};
