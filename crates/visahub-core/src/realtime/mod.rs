//! Live update channel.
//!
//! This module provides:
//! - `ChannelManager`: the single duplex connection, its topic registry and
//!   reconnect loop
//! - `Topic` and the client/server message envelopes
//! - `Connector`: the seam that opens connections (`WsConnector` in production)

pub mod channel;
pub mod connector;
pub mod protocol;

pub use channel::{ChannelManager, ConnectionState, UpdateHandler};
pub use connector::{ChannelError, Connection, Connector, Frame, WsConnector};
pub use protocol::{ClientMessage, ServerMessage, Topic};
