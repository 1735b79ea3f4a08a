use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

/// A request to the server: the command name followed by its arguments, all binary safe.
///
/// Commands are built by value and never change once handed to a connection. Building one never
/// touches the network.
///
/// ```
/// use rustdis_client::Command;
///
/// let cmd = Command::new("SET").arg("key").arg(42).arg("EX").arg(10);
/// assert_eq!(cmd.name(), b"SET");
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Command {
    parts: Vec<Bytes>,
}

impl Command {
    pub fn new(name: impl ToArg) -> Command {
        Command {
            parts: vec![name.to_arg()],
        }
    }

    pub fn arg(mut self, arg: impl ToArg) -> Command {
        self.parts.push(arg.to_arg());
        self
    }

    pub fn args<I>(mut self, args: I) -> Command
    where
        I: IntoIterator,
        I::Item: ToArg,
    {
        self.parts.extend(args.into_iter().map(|arg| arg.to_arg()));
        self
    }

    pub fn name(&self) -> &[u8] {
        &self.parts[0]
    }

    /// Whether the command opens, ends or guards a `MULTI` block.
    pub(crate) fn is_transaction_control(&self) -> bool {
        ["MULTI", "EXEC", "DISCARD", "WATCH"]
            .iter()
            .any(|name| self.name().eq_ignore_ascii_case(name.as_bytes()))
    }

    /// Name and arguments, in wire order.
    pub fn parts(&self) -> &[Bytes] {
        &self.parts
    }

    /// Writes the command as a RESP array of bulk strings:
    /// `*<argc>\r\n` then `$<len>\r\n<bytes>\r\n` for every part.
    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        let payload: usize = self.parts.iter().map(|part| part.len() + 16).sum();
        dst.reserve(payload + 16);

        dst.put_u8(b'*');
        dst.put_slice(self.parts.len().to_string().as_bytes());
        dst.put_slice(b"\r\n");
        for part in &self.parts {
            dst.put_u8(b'$');
            dst.put_slice(part.len().to_string().as_bytes());
            dst.put_slice(b"\r\n");
            dst.put_slice(part);
            dst.put_slice(b"\r\n");
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(self.name()))
    }
}

/// Conversion of a value into a single command argument.
pub trait ToArg {
    fn to_arg(&self) -> Bytes;
}

impl<T: ToArg + ?Sized> ToArg for &T {
    fn to_arg(&self) -> Bytes {
        (**self).to_arg()
    }
}

impl ToArg for str {
    fn to_arg(&self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }
}

impl ToArg for String {
    fn to_arg(&self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }
}

impl ToArg for [u8] {
    fn to_arg(&self) -> Bytes {
        Bytes::copy_from_slice(self)
    }
}

impl<const N: usize> ToArg for [u8; N] {
    fn to_arg(&self) -> Bytes {
        Bytes::copy_from_slice(self)
    }
}

impl ToArg for Vec<u8> {
    fn to_arg(&self) -> Bytes {
        Bytes::copy_from_slice(self)
    }
}

impl ToArg for Bytes {
    fn to_arg(&self) -> Bytes {
        self.clone()
    }
}

macro_rules! to_arg_via_to_string {
    ($($t:ty),*) => {
        $(
            impl ToArg for $t {
                fn to_arg(&self) -> Bytes {
                    Bytes::from(self.to_string())
                }
            }
        )*
    };
}

to_arg_via_to_string!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize, f32, f64);
