//! fcgi-gateway - An HTTP gateway that runs FastCGI executables on demand
//!
//! This library turns a directory of standalone executables into a pool of
//! persistently running workers:
//! - Resolves request paths to worker executables, with static file fallback
//! - Spawns a worker on first use, handing it a socket path or a listener on stdin
//! - Replaces workers whose executable changed on disk
//! - Stops workers that stay idle past their timeout
//! - Bridges HTTP requests to workers over the FastCGI protocol

pub mod bridge;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod fcgi;
pub mod gateway;
pub mod launcher;
pub mod process;
pub mod registry;
pub mod static_files;
pub mod transport;
pub mod watcher;

#[cfg(test)]
pub(crate) mod testing;

pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
