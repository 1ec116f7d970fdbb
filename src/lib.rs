//! Client-side implementation of the MUSCLE messaging protocol.
//!
//! Two subsystems make up the crate:
//!
//! - the [`Message`] codec: typed, named, multi-valued, nestable records
//!   with a platform-neutral little-endian flattened form that is
//!   bit-compatible with the wider MUSCLE ecosystem, plus the [`BitChord`]
//!   bit-vector type and the [`zlib`] envelope for compressed Messages;
//! - the [`Transceiver`]: a worker thread owning one TCP endpoint
//!   (outgoing-connect or passive-accept) that frames, transmits, and
//!   reassembles Messages concurrently with the host, delivering
//!   [`Event`]s through a queue and a notification socket.
//!
//! ```
//! use muscle::Message;
//!
//! let mut msg = Message::new(666);
//! msg.put_int32("counts", [1, 2, 3]);
//! msg.put_string("greeting", "hello");
//!
//! let bytes = msg.to_flattened_buffer().unwrap();
//! assert_eq!(bytes.len(), msg.flattened_size());
//!
//! let mut back = Message::new(0);
//! back.set_from_flattened_buffer(&bytes).unwrap();
//! assert_eq!(back, msg);
//! ```

pub mod bitchord;
pub mod error;
pub mod message;
pub mod sockpair;
pub mod transceiver;
pub mod zlib;

pub use bitchord::BitChord;
pub use error::Error;
pub use message::{FieldContents, Flattenable, IntoItems, Message, Point, Rect, TypeCode};
pub use sockpair::{loopback_socket_pair, socket_pair, Sock};
pub use transceiver::{Event, Transceiver};
pub use zlib::{deflate_message, inflate_message};
