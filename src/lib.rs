pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod registry;
pub mod rpc;
pub mod scanner;
pub mod server;
pub mod watchlist;
