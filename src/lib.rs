pub mod api;
pub mod attachments;
pub mod auth;
pub mod bridge;
pub mod broker;
pub mod classifier;
pub mod config;
pub mod error;
pub mod history;
pub mod protocol;
pub mod pty;
pub mod ratelimit;
pub mod registry;
pub mod sanitize;
pub mod session;
pub mod shutdown;
pub mod store;
