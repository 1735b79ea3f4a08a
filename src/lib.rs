pub mod client;
pub mod codec;
pub mod command;
pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod pool;
pub mod scan;
pub mod transaction;

#[cfg(test)]
mod test_util;

pub use client::Client;
pub use command::{Command, ToArg};
pub use config::{Config, Hello, PoolConfig};
pub use connection::Connection;
pub use error::{CommandError, ConnectionError, Error};
pub use frame::Frame;
pub use pool::{Pool, PoolStatus, PooledConnection};
pub use scan::{Cursor, ScanOptions, ScanTarget, Scanner};
pub use transaction::{Transaction, TransactionResult, TransactionState};

pub type Result<T> = std::result::Result<T, Error>;
