//! Moving messages between endpoints: [messaging_client::MessagingClient] delivers queued
//!  messages over TCP, [listener::MessagingListener] receives them and acknowledges each one.

pub mod listener;
pub mod messaging_client;
pub mod tcp_client;
