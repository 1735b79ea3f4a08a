use std::ops::DerefMut;

use strum_macros::Display;
use tracing::{debug, warn};

use crate::command::{Command, ToArg};
use crate::connection::Connection;
use crate::error::CommandError;
use crate::frame::{self, Frame};
use crate::{Error, Result};

/// Outcome of `EXEC`: one entry per queued command, in queuing order. A command that failed at
/// execution time does not stop the others, so its error sits next to their values.
pub type TransactionResult = Vec<std::result::Result<Frame, CommandError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum TransactionState {
    Idle,
    Queuing,
    Committed,
    Aborted,
}

/// A `MULTI`/`EXEC` block over a connection it holds exclusively until it is dropped.
///
/// ```text
/// Idle --begin--> Queuing --queue--> Queuing --commit--> Committed
///                    |                  |
///                    +----discard-------+--> Aborted
/// ```
///
/// `watch` is only accepted while `Idle`, i.e. before `MULTI`. While queuing, calling
/// `Connection::execute` on the same connection fails with `Error::QueueState`.
///
/// Dropping a transaction that is still queuing, or that still watches keys, leaves server-side
/// state behind on the connection, so the connection is invalidated and a pool will discard it.
pub struct Transaction<C: DerefMut<Target = Connection>> {
    conn: C,
    state: TransactionState,
    queued: Vec<Command>,
    watching: bool,
}

impl<C: DerefMut<Target = Connection>> Transaction<C> {
    pub fn new(conn: C) -> Transaction<C> {
        Transaction {
            conn,
            state: TransactionState::Idle,
            queued: Vec::new(),
            watching: false,
        }
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Commands acknowledged with `QUEUED` so far.
    pub fn queued(&self) -> &[Command] {
        &self.queued
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// `WATCH`es `keys`: if any of them changes before `commit`, the commit fails with
    /// `Error::OptimisticLockFailure`.
    pub async fn watch<I>(&mut self, keys: I) -> Result<()>
    where
        I: IntoIterator,
        I::Item: ToArg,
    {
        self.ensure_state("watch", TransactionState::Idle)?;

        let reply = self.send(&Command::new("WATCH").args(keys)).await?;
        self.expect_status(reply, "OK")?;
        self.watching = true;

        Ok(())
    }

    pub async fn unwatch(&mut self) -> Result<()> {
        self.ensure_state("unwatch", TransactionState::Idle)?;

        let reply = self.send(&Command::new("UNWATCH")).await?;
        self.expect_status(reply, "OK")?;
        self.watching = false;

        Ok(())
    }

    /// Sends `MULTI`.
    pub async fn begin(&mut self) -> Result<()> {
        self.ensure_state("begin", TransactionState::Idle)?;
        if self.conn.in_transaction() {
            return Err(Error::QueueState {
                operation: "begin",
                state: TransactionState::Queuing,
            });
        }

        let reply = self.send(&Command::new("MULTI")).await?;
        self.expect_status(reply, "OK")?;
        self.conn.set_in_transaction(true);
        self.state = TransactionState::Queuing;

        debug!(connection_id = %self.conn.id, "transaction started");
        Ok(())
    }

    /// Sends `cmd` inside the open block. The server only acknowledges it; its result comes back
    /// from `commit`. If the server rejects the command right away the block is discarded and the
    /// transaction ends `Aborted`, while the connection itself stays usable.
    pub async fn queue(&mut self, cmd: Command) -> Result<()> {
        self.ensure_state("queue", TransactionState::Queuing)?;

        let reply = self.send(&cmd).await?;
        match reply {
            Frame::Simple(status) if status == "QUEUED" => {
                self.queued.push(cmd);
                Ok(())
            }
            Frame::Error(message) => {
                // The server would refuse EXEC with EXECABORT anyway.
                debug!(connection_id = %self.conn.id, "command rejected while queuing: {}", message);
                self.state = TransactionState::Aborted;
                self.conn.set_in_transaction(false);
                self.watching = false;
                self.conn.round_trip(&Command::new("DISCARD")).await?;
                Err(CommandError::new(message).into())
            }
            other => Err(self.unexpected("QUEUED", other)),
        }
    }

    /// Sends `EXEC` and returns one result per queued command.
    pub async fn commit(&mut self) -> Result<TransactionResult> {
        self.ensure_state("commit", TransactionState::Queuing)?;

        // EXEC ends the block and drops every WATCH, whatever the outcome.
        let reply = self.send(&Command::new("EXEC")).await;
        self.conn.set_in_transaction(false);
        self.watching = false;
        self.state = TransactionState::Aborted;

        match reply? {
            Frame::Array(replies) if replies.len() == self.queued.len() => {
                self.state = TransactionState::Committed;
                Ok(replies.into_iter().map(Frame::into_result).collect())
            }
            frame if frame.is_null() => {
                debug!(connection_id = %self.conn.id, "transaction aborted by a watched key");
                Err(Error::OptimisticLockFailure)
            }
            Frame::Error(message) => Err(CommandError::new(message).into()),
            other => Err(self.unexpected("one reply per queued command", other)),
        }
    }

    /// Sends `DISCARD` while queuing, or `UNWATCH` if only keys are being watched.
    pub async fn discard(&mut self) -> Result<()> {
        match self.state {
            TransactionState::Queuing => {
                let reply = self.send(&Command::new("DISCARD")).await;
                self.conn.set_in_transaction(false);
                self.watching = false;
                self.state = TransactionState::Aborted;
                self.expect_status(reply?, "OK")
            }
            TransactionState::Idle => {
                if self.watching {
                    self.unwatch().await?;
                }
                self.state = TransactionState::Aborted;
                Ok(())
            }
            state => Err(Error::QueueState {
                operation: "discard",
                state,
            }),
        }
    }

    async fn send(&mut self, cmd: &Command) -> Result<Frame> {
        let reply = self.conn.round_trip(cmd).await;
        if let Err(err) = &reply {
            if err.is_fatal() {
                self.state = TransactionState::Aborted;
                self.conn.set_in_transaction(false);
                self.watching = false;
            }
        }
        reply
    }

    fn ensure_state(&self, operation: &'static str, expected: TransactionState) -> Result<()> {
        if self.state != expected {
            return Err(Error::QueueState {
                operation,
                state: self.state,
            });
        }
        Ok(())
    }

    fn expect_status(&mut self, reply: Frame, status: &'static str) -> Result<()> {
        match reply {
            Frame::Simple(s) if s == status => Ok(()),
            Frame::Error(message) => Err(CommandError::new(message).into()),
            other => Err(self.unexpected(status, other)),
        }
    }

    /// A reply the protocol does not allow here means client and server disagree on the state of
    /// the connection.
    fn unexpected(&mut self, expected: &'static str, actual: Frame) -> Error {
        self.conn.invalidate();
        self.conn.set_in_transaction(false);
        self.watching = false;
        self.state = TransactionState::Aborted;
        frame::Error::unexpected(expected, actual).into()
    }
}

impl<C: DerefMut<Target = Connection>> Drop for Transaction<C> {
    fn drop(&mut self) {
        if self.state == TransactionState::Queuing || self.watching {
            warn!(
                connection_id = %self.conn.id,
                state = %self.state,
                "transaction dropped with server-side state; invalidating connection"
            );
            self.conn.invalidate();
            self.conn.set_in_transaction(false);
        }
    }
}

impl Connection {
    /// Runs `cmds` atomically in a single round trip: `MULTI`, the commands and `EXEC` are
    /// pipelined and the replies demultiplexed. If the server rejects a command while queuing,
    /// nothing runs and that rejection is returned.
    pub async fn execute_atomic(&mut self, cmds: &[Command]) -> Result<TransactionResult> {
        if self.in_transaction() {
            return Err(Error::QueueState {
                operation: "execute atomically",
                state: TransactionState::Queuing,
            });
        }

        let mut batch = Vec::with_capacity(cmds.len() + 2);
        batch.push(Command::new("MULTI"));
        batch.extend(cmds.iter().cloned());
        batch.push(Command::new("EXEC"));

        let mut replies = self.round_trip_batch(&batch).await?.into_iter();

        match replies.next() {
            Some(Frame::Simple(status)) if status == "OK" => {}
            Some(other) => return Err(self.desync("OK", other)),
            None => return Err(self.desync("OK", Frame::Null)),
        }

        let mut rejected = None;
        for reply in replies.by_ref().take(cmds.len()) {
            match reply {
                Frame::Simple(status) if status == "QUEUED" => {}
                Frame::Error(message) => {
                    rejected.get_or_insert(CommandError::new(message));
                }
                other => return Err(self.desync("QUEUED", other)),
            }
        }

        match replies.next() {
            Some(Frame::Array(results)) if results.len() == cmds.len() => {
                Ok(results.into_iter().map(Frame::into_result).collect())
            }
            Some(frame) if frame.is_null() => Err(Error::OptimisticLockFailure),
            Some(Frame::Error(message)) => {
                Err(rejected.unwrap_or_else(|| CommandError::new(message)).into())
            }
            Some(other) => Err(self.desync("one reply per queued command", other)),
            None => Err(self.desync("EXEC reply", Frame::Null)),
        }
    }

    fn desync(&mut self, expected: &'static str, actual: Frame) -> Error {
        self.invalidate();
        frame::Error::unexpected(expected, actual).into()
    }
}
