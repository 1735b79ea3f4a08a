use std::sync::Arc;

use crate::command::Command;
use crate::config::Config;
use crate::connection::Connection;
use crate::error::CommandError;
use crate::frame::Frame;
use crate::pool::{Pool, PooledConnection};
use crate::scan::{ScanOptions, ScanTarget, Scanner};
use crate::transaction::{Transaction, TransactionResult};
use crate::Result;

/// Entry point for applications: a pool of TCP connections to one server.
///
/// Plain calls lease a connection for exactly one round trip, so concurrent callers never share
/// one. Transactions and scans keep their lease until they are dropped.
///
/// ```no_run
/// use rustdis_client::{Client, Command, Config};
///
/// # async fn run() -> rustdis_client::Result<()> {
/// let client = Client::new(Config::from_env());
/// client.execute(&Command::new("SET").arg("greeting").arg("hello")).await?;
///
/// let mut tx = client.transaction().await?;
/// tx.watch(["greeting"]).await?;
/// tx.begin().await?;
/// tx.queue(Command::new("APPEND").arg("greeting").arg(" world")).await?;
/// let results = tx.commit().await?;
/// assert_eq!(results.len(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Client {
    pool: Pool,
}

impl Client {
    /// Connections are opened lazily, on the first call that needs one.
    pub fn new(config: Config) -> Client {
        let pool_config = config.pool.clone();
        let config = Arc::new(config);

        let pool = Pool::new(pool_config, move || {
            let config = config.clone();
            async move { Connection::connect(&config).await }
        });

        Client { pool }
    }

    pub fn from_pool(pool: Pool) -> Client {
        Client { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub async fn connection(&self) -> Result<PooledConnection> {
        self.pool.get().await
    }

    pub async fn execute(&self, cmd: &Command) -> Result<Frame> {
        let mut conn = self.pool.get().await?;
        conn.execute(cmd).await
    }

    /// Pipelines `cmds` on a single connection. See `Connection::execute_batch`.
    pub async fn execute_batch(
        &self,
        cmds: &[Command],
    ) -> Result<Vec<std::result::Result<Frame, CommandError>>> {
        let mut conn = self.pool.get().await?;
        conn.execute_batch(cmds).await
    }

    pub async fn execute_atomic(&self, cmds: &[Command]) -> Result<TransactionResult> {
        let mut conn = self.pool.get().await?;
        conn.execute_atomic(cmds).await
    }

    pub async fn transaction(&self) -> Result<Transaction<PooledConnection>> {
        let conn = self.pool.get().await?;
        Ok(Transaction::new(conn))
    }

    pub async fn scan(
        &self,
        target: ScanTarget,
        options: ScanOptions,
    ) -> Result<Scanner<PooledConnection>> {
        let conn = self.pool.get().await?;
        Ok(Scanner::new(conn, target, options))
    }

    pub fn close(&self) {
        self.pool.close();
    }
}
