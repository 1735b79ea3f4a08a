// https://redis.io/docs/reference/protocol-spec

use std::fmt;

use bytes::Buf;
use bytes::Bytes;
use std::io::Cursor;
use thiserror::Error as ThisError;

use crate::error::CommandError;

static CRLF: &[u8; 2] = b"\r\n";

/// Deepest aggregate nesting accepted in a reply.
pub const MAX_DEPTH: usize = 128;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("not enough data is available to parse an entire frame")]
    Incomplete,
    #[error("invalid frame data type: {0:#04x}")]
    InvalidDataType(u8),
    #[error("invalid length prefix: {0}")]
    InvalidLength(i64),
    #[error("invalid integer")]
    InvalidInteger,
    #[error("invalid double")]
    InvalidDouble,
    #[error("invalid boolean")]
    InvalidBoolean,
    #[error("invalid verbatim string")]
    InvalidVerbatim,
    #[error("invalid UTF-8 string")]
    InvalidUtf8,
    #[error("declared length does not match the CRLF terminator")]
    MissingTerminator,
    #[error("stream ended in the middle of a frame")]
    Truncated,
    #[error("frame size exceeds limit of {0} bytes")]
    FrameTooLarge(usize),
    #[error("aggregates nested deeper than {0} levels")]
    TooDeep(usize),
    #[error("unexpected reply, expected {expected}, got {actual}")]
    UnexpectedReply {
        expected: &'static str,
        actual: Frame,
    },
}

impl Error {
    pub(crate) fn unexpected(expected: &'static str, actual: Frame) -> Error {
        Error::UnexpectedReply { expected, actual }
    }
}

/// A single reply read from the server.
///
/// Null bulk strings, null arrays and the RESP3 null are distinct variants, and all of them are
/// distinct from an empty `Bulk` or `Array`. Bulk payloads are kept as raw bytes.
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Bytes),
    NullBulk,
    Array(Vec<Frame>),
    NullArray,
    // RESP3
    Null,
    Boolean(bool),
    Double(f64),
    BigNumber(String),
    Verbatim { format: String, data: Bytes },
    Map(Vec<(Frame, Frame)>),
    Set(Vec<Frame>),
    Push(Vec<Frame>),
}

// Protocol specification: https://redis.io/docs/reference/protocol-spec/
impl Frame {
    /// Parses exactly one frame starting at the cursor position. On success the cursor is left
    /// on the first byte following the frame.
    /// Aggregates nested deeper than `MAX_DEPTH` fail with `Error::TooDeep`.
    pub fn parse(src: &mut Cursor<&[u8]>) -> Result<Self, Error> {
        Self::parse_at(src, 0)
    }

    fn parse_at(src: &mut Cursor<&[u8]>, depth: usize) -> Result<Self, Error> {
        // The first byte in an RESP-serialized payload always identifies its type.
        // Subsequent bytes constitute the type's contents.
        let first_byte = get_byte(src)?;
        let data_type = DataType::try_from(first_byte)?;

        match data_type {
            DataType::SimpleString => Ok(Frame::Simple(get_string(src)?)),
            DataType::SimpleError => Ok(Frame::Error(get_string(src)?)),
            DataType::Integer => Ok(Frame::Integer(get_integer(src)?)),
            // $<length>\r\n<data>\r\n
            DataType::BulkString => match get_length(src)? {
                None => Ok(Frame::NullBulk),
                Some(length) => Ok(Frame::Bulk(get_exact(src, length)?)),
            },
            // !<length>\r\n<error>\r\n
            DataType::BulkError => match get_length(src)? {
                // NOTE: the protocol does not specify a way to represent a null bulk error
                None => Ok(Frame::Null),
                Some(length) => {
                    let msg = get_exact(src, length)?;
                    Ok(Frame::Error(to_string(&msg)?))
                }
            },
            // =<length>\r\n<format>:<data>\r\n
            DataType::VerbatimString => {
                let length = get_length(src)?.ok_or(Error::InvalidLength(-1))?;
                let data = get_exact(src, length)?;
                if data.len() < 4 || data[3] != b':' {
                    return Err(Error::InvalidVerbatim);
                }
                let format = to_string(&data[..3])?;

                Ok(Frame::Verbatim {
                    format,
                    data: data.slice(4..),
                })
            }
            // *<number-of-elements>\r\n<element-1>...<element-n>
            DataType::Array => match get_length(src)? {
                None => Ok(Frame::NullArray),
                Some(length) => Ok(Frame::Array(parse_elements(src, length, depth)?)),
            },
            DataType::Set => match get_length(src)? {
                None => Ok(Frame::Null),
                Some(length) => Ok(Frame::Set(parse_elements(src, length, depth)?)),
            },
            DataType::Push => match get_length(src)? {
                None => Ok(Frame::Null),
                Some(length) => Ok(Frame::Push(parse_elements(src, length, depth)?)),
            },
            // %<number-of-entries>\r\n<key-1><value-1>...<key-n><value-n>
            DataType::Map => match get_length(src)? {
                None => Ok(Frame::Null),
                Some(length) => {
                    let depth = nested(depth, length)?;
                    let mut pairs = Vec::with_capacity(length.min(src.remaining()));
                    for _ in 0..length {
                        let key = Self::parse_at(src, depth)?;
                        let value = Self::parse_at(src, depth)?;
                        pairs.push((key, value));
                    }
                    Ok(Frame::Map(pairs))
                }
            },
            DataType::Null => {
                if !get_line(src)?.is_empty() {
                    return Err(Error::MissingTerminator);
                }
                Ok(Frame::Null)
            }
            DataType::Boolean => match get_line(src)? {
                b"t" => Ok(Frame::Boolean(true)),
                b"f" => Ok(Frame::Boolean(false)),
                _ => Err(Error::InvalidBoolean),
            },
            DataType::Double => {
                let line = get_line(src)?;
                let string = std::str::from_utf8(line).map_err(|_| Error::InvalidDouble)?;
                let double = string.parse::<f64>().map_err(|_| Error::InvalidDouble)?;
                Ok(Frame::Double(double))
            }
            DataType::BigNumber => {
                let string = to_string(get_line(src)?)?;
                if !is_big_number(&string) {
                    return Err(Error::InvalidInteger);
                }
                Ok(Frame::BigNumber(string))
            }
        }
    }

    /// Every frame the parser can produce serializes back to the same frame. Values with no
    /// exact wire form keep their payload but change shape: error messages containing CRLF are
    /// written as bulk errors, while simple strings containing CRLF, malformed big numbers and
    /// verbatim strings without a three byte format are written as bulk strings.
    pub fn serialize(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        self.write_to(&mut bytes);
        bytes
    }

    fn write_to(&self, bytes: &mut Vec<u8>) {
        match self {
            Frame::Simple(s) if is_line(s) => {
                write_line(bytes, DataType::SimpleString, s.as_bytes())
            }
            Frame::Simple(s) => write_bulk(bytes, DataType::BulkString, s.as_bytes()),
            Frame::Error(s) if is_line(s) => write_line(bytes, DataType::SimpleError, s.as_bytes()),
            Frame::Error(s) => write_bulk(bytes, DataType::BulkError, s.as_bytes()),
            Frame::Integer(i) => write_line(bytes, DataType::Integer, i.to_string().as_bytes()),
            Frame::Bulk(data) => write_bulk(bytes, DataType::BulkString, data),
            Frame::NullBulk => write_line(bytes, DataType::BulkString, b"-1"),
            Frame::Array(frames) => write_aggregate(bytes, DataType::Array, frames),
            Frame::NullArray => write_line(bytes, DataType::Array, b"-1"),
            Frame::Null => write_line(bytes, DataType::Null, b""),
            Frame::Boolean(true) => write_line(bytes, DataType::Boolean, b"t"),
            Frame::Boolean(false) => write_line(bytes, DataType::Boolean, b"f"),
            Frame::Double(d) => write_line(bytes, DataType::Double, format_double(*d).as_bytes()),
            Frame::BigNumber(n) if is_big_number(n) => {
                write_line(bytes, DataType::BigNumber, n.as_bytes())
            }
            Frame::BigNumber(n) => write_bulk(bytes, DataType::BulkString, n.as_bytes()),
            Frame::Verbatim { format, data } if format.len() != 3 => {
                write_bulk(bytes, DataType::BulkString, data)
            }
            Frame::Verbatim { format, data } => {
                let length = format.len() + 1 + data.len();
                write_line(bytes, DataType::VerbatimString, length.to_string().as_bytes());
                bytes.extend_from_slice(format.as_bytes());
                bytes.push(b':');
                bytes.extend_from_slice(data);
                bytes.extend_from_slice(CRLF);
            }
            Frame::Map(pairs) => {
                write_line(bytes, DataType::Map, pairs.len().to_string().as_bytes());
                for (key, value) in pairs {
                    key.write_to(bytes);
                    value.write_to(bytes);
                }
            }
            Frame::Set(frames) => write_aggregate(bytes, DataType::Set, frames),
            Frame::Push(frames) => write_aggregate(bytes, DataType::Push, frames),
        }
    }

    /// Whether the frame is any of the null representations.
    pub fn is_null(&self) -> bool {
        matches!(self, Frame::NullBulk | Frame::NullArray | Frame::Null)
    }

    /// Turns an error reply into a `CommandError`, leaving any other frame untouched. Errors
    /// nested inside aggregates are not inspected.
    pub fn into_result(self) -> Result<Frame, CommandError> {
        match self {
            Frame::Error(message) => Err(CommandError::new(message)),
            frame => Ok(frame),
        }
    }

    /// Raw payload of string-like frames.
    pub fn into_bytes(self) -> Option<Bytes> {
        match self {
            Frame::Bulk(bytes) => Some(bytes),
            Frame::Simple(s) => Some(Bytes::from(s)),
            Frame::Verbatim { data, .. } => Some(data),
            Frame::Integer(i) => Some(Bytes::from(i.to_string())),
            _ => None,
        }
    }

    /// Elements of sequence-like frames.
    pub fn into_array(self) -> Option<Vec<Frame>> {
        match self {
            Frame::Array(frames) | Frame::Set(frames) | Frame::Push(frames) => Some(frames),
            _ => None,
        }
    }
}

impl From<Frame> for Vec<u8> {
    fn from(frame: Frame) -> Self {
        frame.serialize()
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::Simple(s) => write!(f, "{}", s),
            Frame::Error(s) => write!(f, "(error) {}", s),
            Frame::Integer(i) => write!(f, "(integer) {}", i),
            Frame::Bulk(bytes) => write!(f, "{:?}", String::from_utf8_lossy(bytes)),
            Frame::NullBulk | Frame::NullArray | Frame::Null => write!(f, "(nil)"),
            Frame::Boolean(b) => write!(f, "(boolean) {}", b),
            Frame::Double(d) => write!(f, "(double) {}", format_double(*d)),
            Frame::BigNumber(n) => write!(f, "(big number) {}", n),
            Frame::Verbatim { data, .. } => write!(f, "{}", String::from_utf8_lossy(data)),
            Frame::Array(frames) | Frame::Set(frames) | Frame::Push(frames) => {
                if frames.is_empty() {
                    return write!(f, "(empty array)");
                }
                for (i, frame) in frames.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{}) {}", i + 1, frame)?;
                }
                Ok(())
            }
            Frame::Map(pairs) => {
                if pairs.is_empty() {
                    return write!(f, "(empty hash)");
                }
                for (i, (key, value)) in pairs.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{}# {} => {}", i + 1, key, value)?;
                }
                Ok(())
            }
        }
    }
}

fn parse_elements(
    src: &mut Cursor<&[u8]>,
    length: usize,
    depth: usize,
) -> Result<Vec<Frame>, Error> {
    let depth = nested(depth, length)?;
    // Every element takes at least three bytes, so the remaining input bounds the allocation.
    let mut frames = Vec::with_capacity(length.min(src.remaining()));
    for _ in 0..length {
        frames.push(Frame::parse_at(src, depth)?);
    }
    Ok(frames)
}

/// Depth of the children of a non-empty aggregate sitting at `depth`.
fn nested(depth: usize, length: usize) -> Result<usize, Error> {
    if length > 0 && depth >= MAX_DEPTH {
        return Err(Error::TooDeep(MAX_DEPTH));
    }
    Ok(depth + 1)
}

/// Resumable structural check of the frame at the start of a growing buffer.
///
/// Nothing is allocated or copied, and every complete element is looked at once no matter how
/// the frame is split across reads. Only the element being read when the data ran out is
/// examined again on the next call.
#[derive(Debug, Clone, Default)]
pub(crate) struct FrameCheck {
    // Offset just past the last complete element or aggregate header.
    checked: usize,
    // Elements still missing from each open aggregate, outermost first.
    open: Vec<usize>,
}

impl FrameCheck {
    /// Returns the length of the frame once all of it is buffered, `Error::Incomplete` before.
    /// Between calls `buf` may only grow.
    pub(crate) fn advance(&mut self, buf: &[u8], max_size: usize) -> Result<usize, Error> {
        let mut src = Cursor::new(buf);
        src.set_position(self.checked as u64);

        loop {
            let children = check_element(&mut src, max_size)?;
            self.checked = src.position() as usize;

            if children > 0 {
                if self.open.len() >= MAX_DEPTH {
                    return Err(Error::TooDeep(MAX_DEPTH));
                }
                self.open.push(children);
                continue;
            }

            // The element is complete, and so is every aggregate it was the last child of.
            loop {
                match self.open.last_mut() {
                    None => {
                        let length = self.checked;
                        self.reset();
                        return Ok(length);
                    }
                    Some(remaining) => {
                        *remaining -= 1;
                        if *remaining > 0 {
                            break;
                        }
                        self.open.pop();
                    }
                }
            }
        }
    }

    pub(crate) fn reset(&mut self) {
        self.checked = 0;
        self.open.clear();
    }

    #[cfg(test)]
    pub(crate) fn checked(&self) -> usize {
        self.checked
    }
}

/// Moves past one scalar element, or past the header of an aggregate, and returns how many
/// elements the aggregate holds. Declared lengths above `max_size` are rejected right away.
fn check_element(src: &mut Cursor<&[u8]>, max_size: usize) -> Result<usize, Error> {
    let data_type = DataType::try_from(get_byte(src)?)?;

    match data_type {
        DataType::BulkString | DataType::BulkError | DataType::VerbatimString => {
            if let Some(length) = get_length(src)? {
                within(length, max_size)?;
                get_slice(src, length)?;
            }
            Ok(0)
        }
        DataType::Array | DataType::Set | DataType::Push => match get_length(src)? {
            None => Ok(0),
            Some(length) => within(length, max_size),
        },
        DataType::Map => match get_length(src)? {
            None => Ok(0),
            Some(length) => within(length, max_size)?
                .checked_mul(2)
                .ok_or(Error::FrameTooLarge(max_size)),
        },
        DataType::SimpleString
        | DataType::SimpleError
        | DataType::Integer
        | DataType::Null
        | DataType::Boolean
        | DataType::Double
        | DataType::BigNumber => {
            get_line(src)?;
            Ok(0)
        }
    }
}

fn within(length: usize, max_size: usize) -> Result<usize, Error> {
    if length > max_size {
        return Err(Error::FrameTooLarge(max_size));
    }
    Ok(length)
}

fn is_line(s: &str) -> bool {
    !s.contains("\r\n")
}

fn is_big_number(s: &str) -> bool {
    let digits = s.strip_prefix(['+', '-']).unwrap_or(s);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

fn write_line(bytes: &mut Vec<u8>, data_type: DataType, line: &[u8]) {
    bytes.push(u8::from(data_type));
    bytes.extend_from_slice(line);
    bytes.extend_from_slice(CRLF);
}

fn write_bulk(bytes: &mut Vec<u8>, data_type: DataType, data: &[u8]) {
    write_line(bytes, data_type, data.len().to_string().as_bytes());
    bytes.extend_from_slice(data);
    bytes.extend_from_slice(CRLF);
}

fn write_aggregate(bytes: &mut Vec<u8>, data_type: DataType, frames: &[Frame]) {
    write_line(bytes, data_type, frames.len().to_string().as_bytes());
    for frame in frames {
        frame.write_to(bytes);
    }
}

fn format_double(d: f64) -> String {
    if d.is_nan() {
        "nan".to_string()
    } else if d == f64::INFINITY {
        "inf".to_string()
    } else if d == f64::NEG_INFINITY {
        "-inf".to_string()
    } else {
        d.to_string()
    }
}

fn get_line<'a>(src: &mut Cursor<&'a [u8]>) -> Result<&'a [u8], Error> {
    let buf: &'a [u8] = *src.get_ref();
    let start = src.position() as usize;
    if start >= buf.len() {
        return Err(Error::Incomplete);
    }

    let frame_end_position = buf[start..]
        .windows(2)
        .position(|window| window == CRLF)
        .ok_or(Error::Incomplete)
        .map(|index| start + index)?;

    src.set_position((frame_end_position + CRLF.len()) as u64);

    Ok(&buf[start..frame_end_position])
}

/// Reads exactly `length` bytes followed by CRLF. The payload is never scanned for terminators,
/// so it may contain arbitrary bytes.
fn get_exact(src: &mut Cursor<&[u8]>, length: usize) -> Result<Bytes, Error> {
    get_slice(src, length).map(Bytes::copy_from_slice)
}

fn get_slice<'a>(src: &mut Cursor<&'a [u8]>, length: usize) -> Result<&'a [u8], Error> {
    let buf: &'a [u8] = *src.get_ref();
    let start = src.position() as usize;
    let end = start
        .checked_add(length)
        .ok_or(Error::InvalidLength(length as i64))?;

    if buf.len() < end + CRLF.len() {
        return Err(Error::Incomplete);
    }
    if &buf[end..end + CRLF.len()] != CRLF {
        return Err(Error::MissingTerminator);
    }

    src.set_position((end + CRLF.len()) as u64);

    Ok(&buf[start..end])
}

fn get_string(src: &mut Cursor<&[u8]>) -> Result<String, Error> {
    to_string(get_line(src)?)
}

fn get_integer(src: &mut Cursor<&[u8]>) -> Result<i64, Error> {
    let line = get_line(src)?;
    std::str::from_utf8(line)
        .map_err(|_| Error::InvalidInteger)?
        .parse::<i64>()
        .map_err(|_| Error::InvalidInteger)
}

/// Reads a length prefix. `-1` is the RESP2 null marker and yields `None`.
fn get_length(src: &mut Cursor<&[u8]>) -> Result<Option<usize>, Error> {
    match get_integer(src)? {
        -1 => Ok(None),
        length if length < 0 => Err(Error::InvalidLength(length)),
        length => usize::try_from(length)
            .map(Some)
            .map_err(|_| Error::InvalidLength(length)),
    }
}

fn get_byte(src: &mut Cursor<&[u8]>) -> Result<u8, Error> {
    if !src.has_remaining() {
        return Err(Error::Incomplete);
    }
    Ok(src.get_u8())
}

fn to_string(bytes: &[u8]) -> Result<String, Error> {
    String::from_utf8(bytes.to_vec()).map_err(|_| Error::InvalidUtf8)
}

#[derive(Debug)]
enum DataType {
    SimpleString,   // '+'
    BulkString,     // '$'
    VerbatimString, // '='
    SimpleError,    // '-'
    BulkError,      // '!'
    Boolean,        // '#'
    Integer,        // ':'
    Double,         // ','
    BigNumber,      // '('
    Array,          // '*'
    Map,            // '%'
    Set,            // '~'
    Push,           // '>'
    // Due to historical reasons, RESP2 features two specially crafted values for representing null
    // values of bulk strings and arrays. This duality has always been a redundancy that added zero
    // semantical value to the protocol itself. The null type, introduced in RESP3, aims to fix
    // this wrong.
    Null, // '_'
}

impl TryFrom<u8> for DataType {
    type Error = Error;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            b'+' => Ok(Self::SimpleString),
            b'-' => Ok(Self::SimpleError),
            b':' => Ok(Self::Integer),
            b'$' => Ok(Self::BulkString),
            b'!' => Ok(Self::BulkError),
            b'*' => Ok(Self::Array),
            b'_' => Ok(Self::Null),
            b'#' => Ok(Self::Boolean),
            b',' => Ok(Self::Double),
            b'(' => Ok(Self::BigNumber),
            b'=' => Ok(Self::VerbatimString),
            b'%' => Ok(Self::Map),
            b'~' => Ok(Self::Set),
            b'>' => Ok(Self::Push),
            _ => Err(Error::InvalidDataType(byte)),
        }
    }
}

impl From<DataType> for u8 {
    fn from(value: DataType) -> Self {
        match value {
            DataType::SimpleString => b'+',
            DataType::SimpleError => b'-',
            DataType::Integer => b':',
            DataType::BulkString => b'$',
            DataType::BulkError => b'!',
            DataType::Array => b'*',
            DataType::Null => b'_',
            DataType::Boolean => b'#',
            DataType::Double => b',',
            DataType::BigNumber => b'(',
            DataType::VerbatimString => b'=',
            DataType::Map => b'%',
            DataType::Set => b'~',
            DataType::Push => b'>',
        }
    }
}
