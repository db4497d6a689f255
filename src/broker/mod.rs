//! NATS core protocol client that runs over any [`Dialer`](crate::Dialer)
//! stream, typically a [`WebSocketDialer`](crate::WebSocketDialer).

mod client;
pub mod codec;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{
    BrokerClient, BrokerOptions, BrokerOptionsBuilder, BrokerStatus, DisconnectCallback, DiscoveryCallback,
    EventCallback, Message, MessageHandler, Subscription,
};
pub use codec::{NatsCodec, ServerInfo};
