use std::collections::VecDeque;
use std::fmt;
use std::ops::DerefMut;

use bytes::Bytes;
use futures::stream::{self, Stream};
use itertools::Itertools;
use strum_macros::AsRefStr;
use tracing::{instrument, trace};

use crate::command::{Command, ToArg};
use crate::connection::Connection;
use crate::frame::{self, Frame};
use crate::{Error, Result};

const PAGE: &str = "[cursor, items]";

/// What a scan walks over.
#[derive(Debug, Clone, PartialEq, Eq, AsRefStr)]
pub enum ScanTarget {
    /// The whole key space of the selected database.
    #[strum(serialize = "SCAN")]
    Keys,
    /// Field and value pairs of a hash.
    #[strum(serialize = "HSCAN")]
    Hash(Bytes),
    #[strum(serialize = "SSCAN")]
    Set(Bytes),
    /// Member and score pairs of a sorted set.
    #[strum(serialize = "ZSCAN")]
    SortedSet(Bytes),
}

impl ScanTarget {
    fn key(&self) -> Option<&Bytes> {
        match self {
            ScanTarget::Keys => None,
            ScanTarget::Hash(key) | ScanTarget::Set(key) | ScanTarget::SortedSet(key) => Some(key),
        }
    }
}

/// `MATCH`, `COUNT` and `TYPE` arguments. All of them are applied by the server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanOptions {
    pub pattern: Option<Bytes>,
    /// A hint only: a page may hold more or fewer items.
    pub count: Option<u64>,
    /// Only understood by `SCAN`; ignored for the other targets.
    pub type_: Option<String>,
}

impl ScanOptions {
    pub fn new() -> ScanOptions {
        ScanOptions::default()
    }

    pub fn pattern(mut self, pattern: impl ToArg) -> ScanOptions {
        self.pattern = Some(pattern.to_arg());
        self
    }

    pub fn count(mut self, count: u64) -> ScanOptions {
        self.count = Some(count);
        self
    }

    pub fn type_(mut self, type_: impl Into<String>) -> ScanOptions {
        self.type_ = Some(type_.into());
        self
    }
}

/// Continuation token of a scan. It is never interpreted, only handed back to the server, so it
/// can be stored and used later to resume a scan where it stopped.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Cursor(Bytes);

impl Cursor {
    pub fn start() -> Cursor {
        Cursor(Bytes::from_static(b"0"))
    }

    /// `0` both starts a scan and, when the server returns it, ends one.
    pub fn is_start(&self) -> bool {
        self.0.as_ref() == b"0"
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Default for Cursor {
    fn default() -> Self {
        Self::start()
    }
}

impl From<Bytes> for Cursor {
    fn from(bytes: Bytes) -> Cursor {
        Cursor(bytes)
    }
}

impl From<&str> for Cursor {
    fn from(s: &str) -> Cursor {
        Cursor(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<String> for Cursor {
    fn from(s: String) -> Cursor {
        Cursor(Bytes::from(s))
    }
}

impl ToArg for Cursor {
    fn to_arg(&self) -> Bytes {
        self.0.clone()
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/// Lazy iteration over `SCAN`, `HSCAN`, `SSCAN` or `ZSCAN`.
///
/// One round trip is made whenever the items of the previous page run out, and the scan ends the
/// first time the server answers with cursor `0`, which can be the very first page. Items are
/// yielded in the order the server sent them.
///
/// The server only guarantees that an element present for the whole scan is returned at least
/// once. Elements added or removed meanwhile may or may not show up, and any element may show up
/// more than once, so callers that need each element exactly once must de-duplicate.
///
/// Nothing is held on the server between pages: a scanner can be dropped at any point, and a
/// new one started from `cursor()` picks up where it left off.
pub struct Scanner<C: DerefMut<Target = Connection>> {
    conn: C,
    target: ScanTarget,
    options: ScanOptions,
    cursor: Cursor,
    buffer: VecDeque<Bytes>,
    finished: bool,
    round_trips: usize,
}

impl<C: DerefMut<Target = Connection>> Scanner<C> {
    pub fn new(conn: C, target: ScanTarget, options: ScanOptions) -> Scanner<C> {
        Scanner::resume(conn, target, options, Cursor::start())
    }

    /// Continues a scan from a cursor returned earlier by `cursor()`.
    pub fn resume(conn: C, target: ScanTarget, options: ScanOptions, cursor: Cursor) -> Scanner<C> {
        Scanner {
            conn,
            target,
            options,
            cursor,
            buffer: VecDeque::new(),
            finished: false,
            round_trips: 0,
        }
    }

    /// Cursor of the next page to fetch. Items of the current page that were not consumed yet
    /// are not covered by it.
    pub fn cursor(&self) -> &Cursor {
        &self.cursor
    }

    pub fn is_finished(&self) -> bool {
        self.finished && self.buffer.is_empty()
    }

    pub fn round_trips(&self) -> usize {
        self.round_trips
    }

    pub fn into_inner(self) -> C {
        self.conn
    }

    pub async fn next(&mut self) -> Result<Option<Bytes>> {
        loop {
            if let Some(item) = self.buffer.pop_front() {
                return Ok(Some(item));
            }
            if self.finished {
                return Ok(None);
            }
            let page = self.fetch().await?;
            self.buffer.extend(page);
        }
    }

    /// The remaining items of the current page, or the next page. A page can be empty even though
    /// the scan is not over.
    pub async fn next_batch(&mut self) -> Result<Option<Vec<Bytes>>> {
        if !self.buffer.is_empty() {
            return Ok(Some(self.buffer.drain(..).collect()));
        }
        if self.finished {
            return Ok(None);
        }
        self.fetch().await.map(Some)
    }

    /// Next `(field, value)` of a hash or `(member, score)` of a sorted set.
    pub async fn next_pair(&mut self) -> Result<Option<(Bytes, Bytes)>> {
        let first = match self.next().await? {
            Some(first) => first,
            None => return Ok(None),
        };

        match self.next().await? {
            Some(second) => Ok(Some((first, second))),
            None => {
                self.conn.invalidate();
                Err(frame::Error::unexpected("a pair of items", Frame::Bulk(first)).into())
            }
        }
    }

    /// Runs the scan to the end.
    pub async fn collect_all(mut self) -> Result<Vec<Bytes>> {
        let mut items = Vec::new();
        while let Some(batch) = self.next_batch().await? {
            items.extend(batch);
        }
        Ok(items)
    }

    /// Runs the scan to the end. An odd item count invalidates the connection, like `next_pair`.
    pub async fn collect_pairs(mut self) -> Result<Vec<(Bytes, Bytes)>> {
        let mut items = Vec::new();
        while let Some(batch) = self.next_batch().await? {
            items.extend(batch);
        }
        if items.len() % 2 != 0 {
            self.conn.invalidate();
            return Err(frame::Error::unexpected(
                "a pair of items",
                Frame::Array(items.into_iter().map(Frame::Bulk).collect()),
            )
            .into());
        }
        Ok(items.into_iter().tuples().collect())
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes>> {
        stream::try_unfold(self, |mut scanner| async move {
            Ok::<_, Error>(scanner.next().await?.map(|item| (item, scanner)))
        })
    }

    /// Fetches one page and advances the cursor. On failure the cursor stays where it was, so the
    /// same page can be requested again.
    #[instrument(
        name = "scan",
        level = "debug",
        skip_all,
        fields(connection_id = %self.conn.id, command = self.target.as_ref(), cursor = %self.cursor)
    )]
    async fn fetch(&mut self) -> Result<Vec<Bytes>> {
        let cmd = self.command();
        let reply = self.conn.execute(&cmd).await?;
        self.round_trips += 1;

        let (cursor, items) = match parse_page(reply) {
            Ok(page) => page,
            Err(err) => {
                self.conn.invalidate();
                return Err(err.into());
            }
        };

        trace!(next_cursor = %cursor, items = items.len(), "page received");
        self.finished = cursor.is_start();
        self.cursor = cursor;

        Ok(items)
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(self.target.as_ref());
        if let Some(key) = self.target.key() {
            cmd = cmd.arg(key);
        }
        cmd = cmd.arg(&self.cursor);

        if let Some(pattern) = &self.options.pattern {
            cmd = cmd.arg("MATCH").arg(pattern);
        }
        if let Some(count) = self.options.count {
            cmd = cmd.arg("COUNT").arg(count);
        }
        if let (ScanTarget::Keys, Some(type_)) = (&self.target, &self.options.type_) {
            cmd = cmd.arg("TYPE").arg(type_);
        }

        cmd
    }
}

fn parse_page(reply: Frame) -> std::result::Result<(Cursor, Vec<Bytes>), frame::Error> {
    let [cursor, items]: [Frame; 2] = match reply {
        Frame::Array(parts) => parts
            .try_into()
            .map_err(|parts| frame::Error::unexpected(PAGE, Frame::Array(parts)))?,
        other => return Err(frame::Error::unexpected(PAGE, other)),
    };

    let cursor = match cursor {
        Frame::Bulk(bytes) => Cursor(bytes),
        Frame::Simple(s) => Cursor::from(s),
        Frame::Integer(n) => Cursor::from(n.to_string()),
        other => return Err(frame::Error::unexpected("cursor", other)),
    };

    let items = match items {
        Frame::Array(items) | Frame::Set(items) => items,
        other => return Err(frame::Error::unexpected(PAGE, other)),
    };

    let items = items
        .into_iter()
        .map(|item| match item {
            Frame::Bulk(bytes) => Ok(bytes),
            Frame::Simple(s) => Ok(Bytes::from(s)),
            Frame::Integer(n) => Ok(Bytes::from(n.to_string())),
            Frame::Double(d) => Ok(Bytes::from(d.to_string())),
            other => Err(frame::Error::unexpected("scan item", other)),
        })
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok((cursor, items))
}
