pub mod api;
pub mod backends;
pub mod config;
pub mod driver;
pub mod error;
pub mod events;
pub mod push;
pub mod session;
pub mod state;
pub mod workflow;
