pub mod body;
pub mod handler;
pub mod headers;
pub mod serializer;
pub mod transport_message;
