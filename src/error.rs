//! Error taxonomy shared by the Message codec, BitChord, and the zlib
//! envelope.

#![deny(missing_docs)]

use std::error::Error as StdError;
use std::fmt;
use std::io;

use crate::message::type_code_str;

/// Everything that can go wrong while encoding or decoding MUSCLE data.
///
/// Socket-level failures inside the transceiver worker are never surfaced
/// through this type; the worker converts them into a `Disconnected` event.
#[derive(Debug)]
pub enum Error {
    /// A flattened Message did not start with the `PM00` protocol version.
    BadProtocolVersion(u32),
    /// A transceiver frame header carried something other than `Enc0`.
    BadMagic(u32),
    /// The input ended before the declared lengths were satisfied.
    TruncatedStream,
    /// Length accounting inside a flattened Message failed.
    MalformedMessage(String),
    /// The requested operation is meaningless for this type code, e.g.
    /// flattening a PNTR field.
    InvalidTypeForOperation(u32),
    /// A BitChord bit or word index past the end.
    IndexOutOfRange {
        /// The offending index.
        index: usize,
        /// Number of valid indices.
        limit: usize,
    },
    /// Compression or decompression failed, or a bad compression level.
    Zlib(String),
    /// An underlying I/O failure.
    Io(io::Error),
}

/// Codec-level result alias.
pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::BadProtocolVersion(v) => {
                write!(f, "bad flattened-Message protocol version {}", v)
            }
            Error::BadMagic(m) => write!(f, "bad message-frame magic {:#010x}", m),
            Error::TruncatedStream => write!(f, "flattened data ended unexpectedly"),
            Error::MalformedMessage(what) => write!(f, "malformed flattened Message: {}", what),
            Error::InvalidTypeForOperation(tc) => {
                write!(f, "operation not valid for type code {}", type_code_str(*tc))
            }
            Error::IndexOutOfRange { index, limit } => {
                write!(f, "index {} out of range (limit {})", index, limit)
            }
            Error::Zlib(what) => write!(f, "zlib error: {}", what),
            Error::Io(err) => write!(f, "i/o error: {}", err),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        // byteorder and read_exact report a short input as UnexpectedEof
        if err.kind() == io::ErrorKind::UnexpectedEof {
            Error::TruncatedStream
        } else {
            Error::Io(err)
        }
    }
}
