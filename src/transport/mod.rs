//! Connection to the broadcast channel and its wire format

mod channel;
pub mod wire;

pub use channel::{Broadcaster, ChannelTransport, TransportEvent};
