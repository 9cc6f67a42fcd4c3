pub mod bridge;
pub mod command;
pub mod config;
pub mod drive;
pub mod error;
pub mod paths;
pub mod push;
pub mod registry;
pub mod transport;
pub mod tree;

#[cfg(feature = "impl-russh")]
pub mod ssh_russh;

pub use error::{Error, Result};
