use std::fmt;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::codec::FrameCodec;
use crate::command::Command;
use crate::config::{Config, Hello};
use crate::error::{CommandError, ConnectionError};
use crate::frame::Frame;
use crate::transaction::TransactionState;
use crate::Result;

/// Any byte stream a connection can run over: a TCP socket, a TLS stream, an in-memory duplex.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Ready,
    // A request has been written and its reply is not fully read yet.
    Busy,
    Broken,
}

/// A single connection to the server.
///
/// Requests are never multiplexed: every call writes its command(s) and reads back exactly as
/// many replies before returning, and `&mut self` keeps a second call from starting meanwhile.
/// Once an I/O or protocol failure happens the stream position is unknown, so the connection
/// refuses any further work and must be dropped.
pub struct Connection {
    pub id: Uuid,
    // Data is read from the socket into the read buffer. When a frame is parsed, the corresponding
    // data is removed from the buffer.
    framed: Framed<Box<dyn Transport>, FrameCodec>,
    state: State,
    in_transaction: bool,
    response_timeout: Option<Duration>,
}

impl Connection {
    pub fn new<T: Transport + 'static>(stream: T) -> Connection {
        let transport: Box<dyn Transport> = Box::new(stream);

        Connection {
            id: Uuid::new_v4(),
            // Allocate the buffer with 4kb of capacity.
            framed: Framed::with_capacity(transport, FrameCodec::new(), 4096),
            state: State::Ready,
            in_transaction: false,
            response_timeout: None,
        }
    }

    /// Opens a TCP connection and runs the configured handshake.
    pub async fn connect(config: &Config) -> Result<Connection> {
        let stream = TcpStream::connect((config.host.as_str(), config.port))
            .await
            .map_err(ConnectionError::Io)?;
        stream.set_nodelay(true).map_err(ConnectionError::Io)?;

        let mut conn = Connection::new(stream)
            .with_max_frame_size(config.max_frame_size)
            .with_response_timeout(config.response_timeout);

        debug!(connection_id = %conn.id, addr = %config.addr(), "connected");

        if let Some(hello) = &config.hello {
            let reply = conn.hello(hello).await?;
            debug!(connection_id = %conn.id, "hello: {:?}", reply);
        }

        Ok(conn)
    }

    pub fn with_response_timeout(mut self, response_timeout: Option<Duration>) -> Connection {
        self.response_timeout = response_timeout;
        self
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Connection {
        *self.framed.codec_mut() = FrameCodec::with_max_frame_size(max_frame_size);
        self
    }

    pub fn is_broken(&self) -> bool {
        self.state != State::Ready
    }

    /// Whether a `MULTI` block is open on this connection.
    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    pub async fn hello(&mut self, hello: &Hello) -> Result<Frame> {
        self.execute(&hello.command()).await
    }

    /// Sends one command and reads its reply. An error reply comes back as `Error::Command` and
    /// leaves the connection usable.
    ///
    /// `MULTI`, `EXEC`, `DISCARD` and `WATCH` are refused with `Error::QueueState`; use
    /// `Transaction` or `execute_atomic` for those.
    #[instrument(
        name = "execute",
        level = "debug",
        skip_all,
        fields(connection_id = %self.id, command = %cmd)
    )]
    pub async fn execute(&mut self, cmd: &Command) -> Result<Frame> {
        self.ensure_plain(std::slice::from_ref(cmd), "execute")?;
        let frame = self.round_trip(cmd).await?;
        Ok(frame.into_result()?)
    }

    /// Pipelines `cmds`: all of them are written before any reply is read. Replies come back in
    /// request order, one per command, each one either a value or the error the server sent for
    /// that command.
    #[instrument(
        name = "execute_batch",
        level = "debug",
        skip_all,
        fields(connection_id = %self.id, commands = cmds.len())
    )]
    pub async fn execute_batch(
        &mut self,
        cmds: &[Command],
    ) -> Result<Vec<std::result::Result<Frame, CommandError>>> {
        self.ensure_plain(cmds, "execute a batch")?;
        let frames = self.round_trip_batch(cmds).await?;
        Ok(frames.into_iter().map(Frame::into_result).collect())
    }

    /// Shuts the transport down. The connection cannot be used afterwards.
    pub async fn close(&mut self) -> Result<()> {
        self.state = State::Broken;
        self.framed.get_mut().shutdown().await?;
        Ok(())
    }

    pub(crate) fn invalidate(&mut self) {
        self.state = State::Broken;
    }

    pub(crate) fn set_in_transaction(&mut self, in_transaction: bool) {
        self.in_transaction = in_transaction;
    }

    /// Same as `execute` but neither checks for an open transaction nor converts error replies.
    pub(crate) async fn round_trip(&mut self, cmd: &Command) -> Result<Frame> {
        let mut frames = self.round_trip_batch(std::slice::from_ref(cmd)).await?;
        frames
            .pop()
            .ok_or_else(|| ConnectionError::Closed.into())
    }

    pub(crate) async fn round_trip_batch(&mut self, cmds: &[Command]) -> Result<Vec<Frame>> {
        self.ensure_usable()?;
        if cmds.is_empty() {
            return Ok(Vec::new());
        }

        self.state = State::Busy;
        let result = match self.response_timeout {
            Some(limit) => match timeout(limit, self.write_and_read(cmds)).await {
                Ok(result) => result,
                Err(_) => Err(ConnectionError::Timeout(limit).into()),
            },
            None => self.write_and_read(cmds).await,
        };

        match &result {
            Err(err) if err.is_fatal() => {
                warn!(connection_id = %self.id, "connection invalidated: {}", err);
                self.state = State::Broken;
                if matches!(err, crate::Error::Connection(ConnectionError::Timeout(_))) {
                    // The late reply would desynchronize every later read, so the stream goes.
                    let _ = self.framed.get_mut().shutdown().await;
                }
            }
            _ => self.state = State::Ready,
        }

        result
    }

    async fn write_and_read(&mut self, cmds: &[Command]) -> Result<Vec<Frame>> {
        for cmd in cmds {
            self.framed.feed(cmd).await?;
        }
        SinkExt::<&Command>::flush(&mut self.framed).await?;

        let mut frames = Vec::with_capacity(cmds.len());
        for _ in cmds {
            frames.push(self.read_frame().await?);
        }

        Ok(frames)
    }

    async fn read_frame(&mut self) -> Result<Frame> {
        match self.framed.next().await {
            Some(result) => result,
            None => Err(ConnectionError::Closed.into()),
        }
    }

    fn ensure_usable(&mut self) -> Result<()> {
        match self.state {
            State::Ready => Ok(()),
            State::Busy => {
                // The previous call was dropped before its reply was read.
                warn!(connection_id = %self.id, "connection invalidated: call cancelled mid-flight");
                self.state = State::Broken;
                Err(ConnectionError::Invalidated.into())
            }
            State::Broken => Err(ConnectionError::Invalidated.into()),
        }
    }

    // Transaction state on the server must match `in_transaction`, or the pool could lease out
    // a connection still inside MULTI.
    fn ensure_plain(&self, cmds: &[Command], operation: &'static str) -> Result<()> {
        if self.in_transaction {
            return Err(crate::Error::QueueState {
                operation,
                state: TransactionState::Queuing,
            });
        }
        if cmds.iter().any(Command::is_transaction_control) {
            return Err(crate::Error::QueueState {
                operation: "send MULTI, EXEC, DISCARD or WATCH outside a transaction",
                state: TransactionState::Idle,
            });
        }
        Ok(())
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("in_transaction", &self.in_transaction)
            .field("response_timeout", &self.response_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::frame;
    use crate::test_util::scripted;
    use bytes::Bytes;

    #[tokio::test]
    async fn execute_returns_the_reply() {
        let (mut conn, server) = scripted(&[b"$3\r\nbar\r\n"]);

        let reply = conn
            .execute(&Command::new("GET").arg("foo"))
            .await
            .unwrap();

        assert_eq!(reply, Frame::Bulk(Bytes::from("bar")));
        assert_eq!(
            server.await.unwrap(),
            vec![vec![Bytes::from("GET"), Bytes::from("foo")]]
        );
    }

    #[tokio::test]
    async fn error_reply_keeps_the_connection_usable() {
        let (mut conn, _server) = scripted(&[
            b"-WRONGTYPE Operation against a key holding the wrong kind of value\r\n",
            b"+PONG\r\n",
        ]);

        let err = conn
            .execute(&Command::new("INCR").arg("list"))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Command(ref e) if e.kind() == "WRONGTYPE"));
        assert!(!conn.is_broken());

        let reply = conn.execute(&Command::new("PING")).await.unwrap();
        assert_eq!(reply, Frame::Simple("PONG".to_string()));
    }

    #[tokio::test]
    async fn null_replies_are_values() {
        let (mut conn, _server) = scripted(&[b"$-1\r\n", b"*-1\r\n", b"$0\r\n\r\n"]);

        let get = Command::new("GET").arg("missing");
        assert_eq!(conn.execute(&get).await.unwrap(), Frame::NullBulk);
        assert_eq!(conn.execute(&get).await.unwrap(), Frame::NullArray);
        assert_eq!(conn.execute(&get).await.unwrap(), Frame::Bulk(Bytes::new()));
    }

    #[tokio::test]
    async fn batch_replies_follow_request_order() {
        let large = vec![b'x'; 100_000];
        let mut large_reply = format!("${}\r\n", large.len()).into_bytes();
        large_reply.extend_from_slice(&large);
        large_reply.extend_from_slice(b"\r\n");
        let large_reply: &'static [u8] = Box::leak(large_reply.into_boxed_slice());

        let (mut conn, server) = scripted(&[
            large_reply,
            b":1\r\n",
            b"-ERR no such key\r\n",
            b"*0\r\n",
        ]);

        let cmds = vec![
            Command::new("GET").arg("large"),
            Command::new("INCR").arg("counter"),
            Command::new("RENAME").arg("nope").arg("other"),
            Command::new("KEYS").arg("none*"),
        ];
        let replies = conn.execute_batch(&cmds).await.unwrap();

        assert_eq!(replies.len(), 4);
        assert_eq!(replies[0], Ok(Frame::Bulk(Bytes::from(large))));
        assert_eq!(replies[1], Ok(Frame::Integer(1)));
        assert_eq!(replies[2].as_ref().unwrap_err().message(), "ERR no such key");
        assert_eq!(replies[3], Ok(Frame::Array(vec![])));

        let requests = server.await.unwrap();
        let names: Vec<Bytes> = requests.into_iter().map(|parts| parts[0].clone()).collect();
        assert_eq!(names, vec!["GET", "INCR", "RENAME", "KEYS"]);
    }

    #[tokio::test]
    async fn empty_batch_does_no_io() {
        let (mut conn, server) = scripted(&[]);

        assert!(conn.execute_batch(&[]).await.unwrap().is_empty());
        drop(conn);
        assert!(server.await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn protocol_error_invalidates_the_connection() {
        let (mut conn, server) = scripted(&[b"?garbage\r\n", b"+OK\r\n"]);

        let err = conn.execute(&Command::new("PING")).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(frame::Error::InvalidDataType(b'?'))
        ));
        assert!(conn.is_broken());

        let err = conn.execute(&Command::new("PING")).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Connection(ConnectionError::Invalidated)
        ));

        drop(conn);
        // The second call never reached the wire.
        assert_eq!(server.await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn closed_peer_invalidates_the_connection() {
        let (mut conn, _server) = scripted(&[]);

        let err = conn.execute(&Command::new("PING")).await.unwrap_err();
        assert!(err.is_fatal());
        assert!(conn.is_broken());

        let err = conn.execute(&Command::new("PING")).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Connection(ConnectionError::Invalidated)
        ));
    }

    #[tokio::test]
    async fn response_timeout_invalidates_the_connection() {
        let (conn, _server) = scripted(&[b""]);
        let mut conn = conn.with_response_timeout(Some(Duration::from_millis(50)));

        let err = conn.execute(&Command::new("PING")).await.unwrap_err();

        assert!(matches!(
            err,
            Error::Connection(ConnectionError::Timeout(_))
        ));
        assert!(conn.is_broken());
    }

    #[tokio::test]
    async fn cancelled_call_invalidates_the_connection() {
        let (mut conn, _server) = scripted(&[b""]);

        let cancelled = tokio::time::timeout(
            Duration::from_millis(50),
            conn.execute(&Command::new("BLPOP").arg("queue").arg(0)),
        )
        .await;
        assert!(cancelled.is_err());

        let err = conn.execute(&Command::new("PING")).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Connection(ConnectionError::Invalidated)
        ));
        assert!(conn.is_broken());
    }

    #[tokio::test]
    async fn execute_is_refused_while_queuing() {
        let (mut conn, server) = scripted(&[]);
        conn.set_in_transaction(true);

        let err = conn.execute(&Command::new("GET").arg("a")).await.unwrap_err();
        assert!(matches!(
            err,
            Error::QueueState {
                state: TransactionState::Queuing,
                ..
            }
        ));

        let err = conn.execute_batch(&[Command::new("PING")]).await.unwrap_err();
        assert!(matches!(err, Error::QueueState { .. }));
        assert!(!conn.is_broken());

        drop(conn);
        assert!(server.await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn transaction_commands_are_refused() {
        let (mut conn, server) = scripted(&[]);

        for name in ["MULTI", "exec", "Discard", "WATCH"] {
            let err = conn.execute(&Command::new(name)).await.unwrap_err();
            assert!(matches!(
                err,
                Error::QueueState {
                    state: TransactionState::Idle,
                    ..
                }
            ));
        }

        let batch = [Command::new("PING"), Command::new("MULTI")];
        let err = conn.execute_batch(&batch).await.unwrap_err();
        assert!(matches!(err, Error::QueueState { .. }));
        assert!(!conn.is_broken());
        assert!(!conn.in_transaction());

        drop(conn);
        assert!(server.await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn hello_switches_protocol() {
        let (mut conn, server) = scripted(&[b"%1\r\n$5\r\nproto\r\n:3\r\n"]);

        let reply = conn.hello(&Hello::default()).await.unwrap();

        assert_eq!(
            reply,
            Frame::Map(vec![(Frame::Bulk(Bytes::from("proto")), Frame::Integer(3))])
        );
        assert_eq!(
            server.await.unwrap(),
            vec![vec![Bytes::from("HELLO"), Bytes::from("3")]]
        );
    }

    #[tokio::test]
    async fn close_shuts_the_connection() {
        let (mut conn, _server) = scripted(&[]);

        conn.close().await.unwrap();

        assert!(conn.is_broken());
        let err = conn.execute(&Command::new("PING")).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Connection(ConnectionError::Invalidated)
        ));
    }
}
