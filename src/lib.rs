pub mod account;
pub mod acme;
pub mod cert;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod crypto;
pub mod dns;
pub mod error;
pub mod interactive;
pub mod issuer;
pub mod state;
pub mod store;
pub mod util;

pub use coordinator::OrderCoordinator;

pub const CRATE_NAME: &str = env!("CARGO_PKG_NAME");
