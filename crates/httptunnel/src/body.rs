use std::fmt;
use std::io::{self, Cursor, Read};

use bytes::Bytes;

/// Request body handed to handlers.
///
/// A body is either a fixed byte buffer (what the terminus reconstructs from the wire) or an
/// arbitrary blocking reader supplied by the caller. Either way it is consumed by reading it
/// once to the end.
pub struct Body {
    kind: Kind,
}

enum Kind {
    Buffered(Cursor<Bytes>),
    Reader(Box<dyn Read + Send + Sync>),
    Closed,
}

impl Body {
    pub fn empty() -> Self {
        Self::from_bytes(Bytes::new())
    }

    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self {
            kind: Kind::Buffered(Cursor::new(bytes.into())),
        }
    }

    pub fn from_reader(reader: impl Read + Send + Sync + 'static) -> Self {
        Self {
            kind: Kind::Reader(Box::new(reader)),
        }
    }

    /// Number of bytes left to read, when it is known up front.
    pub fn remaining_len(&self) -> Option<usize> {
        match &self.kind {
            Kind::Buffered(cursor) => {
                let len = cursor.get_ref().len() as u64;
                Some(len.saturating_sub(cursor.position()) as usize)
            }
            Kind::Reader(_) => None,
            Kind::Closed => Some(0),
        }
    }

    /// Reads whatever is left of the body into memory.
    pub fn read_all(&mut self) -> io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.remaining_len().unwrap_or(0));
        self.read_to_end(&mut out)?;
        Ok(out)
    }

    /// Releases a streaming reader; later reads fail. Closing a buffered body is a no-op.
    pub fn close(&mut self) {
        if let Kind::Reader(_) = self.kind {
            self.kind = Kind::Closed;
        }
    }
}

impl Read for Body {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.kind {
            Kind::Buffered(cursor) => cursor.read(buf),
            Kind::Reader(reader) => reader.read(buf),
            Kind::Closed => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "read on closed body",
            )),
        }
    }
}

impl Default for Body {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            Kind::Buffered(cursor) => f
                .debug_struct("Body")
                .field("len", &cursor.get_ref().len())
                .field("position", &cursor.position())
                .finish(),
            Kind::Reader(_) => f.write_str("Body(<reader>)"),
            Kind::Closed => f.write_str("Body(<closed>)"),
        }
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        Self::from_bytes(bytes)
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Self::from_bytes(bytes)
    }
}

impl From<String> for Body {
    fn from(text: String) -> Self {
        Self::from_bytes(text)
    }
}

impl From<&'static str> for Body {
    fn from(text: &'static str) -> Self {
        Self::from_bytes(text)
    }
}

impl From<&'static [u8]> for Body {
    fn from(bytes: &'static [u8]) -> Self {
        Self::from_bytes(bytes)
    }
}
