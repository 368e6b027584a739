//! At-least-once messaging between two endpoints over TCP.
//!
//! A sending endpoint stores outgoing messages in a durable queue on disk
//!  ([persistence::file_queue::FileQueue]) before they are sent, so they survive crashes and
//!  restarts. A delivery loop ([delivery::messaging_client::MessagingClient]) sends them one at a
//!  time and removes a message from the queue only after the receiving endpoint
//!  ([delivery::listener::MessagingListener]) acknowledged it. Rejected messages and messages that
//!  were in flight when a connection broke are delivered again.
//!
//! The wire format is described in [protocol].

pub mod config;
pub mod delivery;
pub mod messaging;
pub mod persistence;
pub mod protocol;
pub mod util;

#[cfg(test)] mod test_util;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
