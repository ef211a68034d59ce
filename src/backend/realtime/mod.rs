//! Client for the hosted realtime service: one multiplexed socket,
//! channel handles carrying presence, broadcast and row change feeds.

pub mod channel;
pub mod protocol;
mod socket;

pub use channel::{Channel, ChannelBuilder, ChannelEvent};
pub use protocol::{ChangeData, PostgresChangeFilter, PresenceDiff, PresenceState};
pub use socket::RealtimeClient;

#[cfg(test)]
pub(crate) use socket::SocketCommand;
