pub mod client;
pub mod config;
pub mod coordinator;
pub mod driver;
pub mod firmware;
pub mod link;
pub mod messages;
pub mod protocol;
pub mod runtime;
pub mod sessions;
