//! MUSCLE Messages: typed, named, multi-valued, nestable records and their
//! platform-neutral flattened representation.
//!
//! A [`Message`] is a `what` code plus an insertion-ordered set of named
//! fields, each holding a list of items that all share one type code. The
//! flattened form is little-endian regardless of host byte order and is
//! bit-compatible with every other MUSCLE implementation:
//!
//! ```text
//! u32 protocol_version ('PM00')
//! u32 what
//! u32 num_fields
//! per field:
//!     u32 name_len (UTF-8 bytes + 1)   bytes name   u8 0x00
//!     u32 type_code
//!     u32 payload_size                 bytes payload
//! ```
//!
//! Fixed-width payloads (BOOL through RECT) are bare item arrays; CSTR is a
//! count followed by NUL-terminated strings; MSGG is a sequence of
//! size-prefixed sub-Messages with no leading count; every other tag is a
//! count followed by length-prefixed opaque buffers, which is also how
//! unrecognized tags survive a decode/re-encode round trip.

use std::io::{Read, Write};

use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::{Error, Result};

/// 'PM00', the flattened-Message protocol version.
pub const CURRENT_PROTOCOL_VERSION: u32 = 1347235888;

/// The registry of well-known field type codes.
///
/// Each value is four ASCII characters packed big-endian for readability;
/// on the wire the code is serialized as a little-endian `u32` like every
/// other integer.
#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum TypeCode {
    /// 'ANYT': wildcard for lookups; never valid on the wire.
    Any = 1095653716,
    /// 'BOOL': one byte per item, 0 or 1.
    Bool = 1112493900,
    /// 'BPNT': two 32-bit floats per item.
    Point = 1112559188,
    /// 'BTCH': a flattened [`BitChord`](crate::BitChord).
    BitChord = 1112818504,
    /// 'BYTE': signed 8-bit.
    Int8 = 1113150533,
    /// 'CSTR': UTF-8, NUL-terminated on the wire.
    String = 1129534546,
    /// 'DBLE': IEEE-754 64-bit.
    Double = 1145195589,
    /// 'FLOT': IEEE-754 32-bit.
    Float = 1179406164,
    /// 'LLNG': signed 64-bit.
    Int64 = 1280069191,
    /// 'LONG': signed 32-bit.
    Int32 = 1280265799,
    /// 'MSGG': nested Message.
    Message = 1297303367,
    /// 'OPTR': flattened generic object, carried as raw buffers.
    Object = 1330664530,
    /// 'PNTR': in-memory pointer; the codec refuses to flatten these.
    Pointer = 1347310674,
    /// 'RAWT': raw byte buffer.
    Raw = 1380013908,
    /// 'RECT': four 32-bit floats per item (left, top, right, bottom).
    Rect = 1380270932,
    /// 'SHRT': signed 16-bit.
    Int16 = 1397248596,
}

/// Renders a type code as its four ASCII characters (e.g. `LONG`), falling
/// back to the decimal value when a byte is not printable.
pub fn type_code_str(code: u32) -> String {
    let bytes = code.to_be_bytes();
    if bytes.iter().all(|b| b.is_ascii_graphic()) {
        bytes.iter().map(|&b| b as char).collect()
    } else {
        code.to_string()
    }
}

/// A 'BPNT' item: two 32-bit floats.
#[derive(Debug, Default, Copy, Clone, PartialEq)]
pub struct Point {
    /// Horizontal coordinate.
    pub x: f32,
    /// Vertical coordinate.
    pub y: f32,
}

impl Point {
    /// Point at (x, y).
    pub fn new(x: f32, y: f32) -> Point {
        Point { x, y }
    }
}

/// A 'RECT' item: four 32-bit floats.
#[derive(Debug, Default, Copy, Clone, PartialEq)]
pub struct Rect {
    /// Left edge.
    pub left: f32,
    /// Top edge.
    pub top: f32,
    /// Right edge.
    pub right: f32,
    /// Bottom edge.
    pub bottom: f32,
}

impl Rect {
    /// Rect from edges.
    pub fn new(left: f32, top: f32, right: f32, bottom: f32) -> Rect {
        Rect {
            left,
            top,
            right,
            bottom,
        }
    }
}

/// Objects that can serialize themselves into a Message field, such as
/// [`BitChord`](crate::BitChord). Used by [`Message::put_flat`] and
/// [`Message::get_flat`].
pub trait Flattenable {
    /// The type code the flattened bytes are stored under.
    fn type_code(&self) -> u32;
    /// Exact number of bytes `flatten` writes.
    fn flattened_size(&self) -> usize;
    /// Writes the flattened form.
    fn flatten<W: Write>(&self, w: &mut W) -> Result<()>;
    /// Replaces this object's state from a flattened form.
    fn unflatten<R: Read>(&mut self, r: &mut R) -> Result<()>;
}

/// The typed item list held by one Message field.
///
/// Each variant carries the whole item vector for its type, so a field can
/// never mix item types. `Flat` covers OPTR, RAWT, BTCH and every tag not in
/// the registry: those are kept as opaque length-prefixed buffers and
/// re-encode byte-identically under their original tag.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldContents {
    /// 'BOOL' items.
    Bool(Vec<bool>),
    /// 'BYTE' items.
    Int8(Vec<i8>),
    /// 'SHRT' items.
    Int16(Vec<i16>),
    /// 'LONG' items.
    Int32(Vec<i32>),
    /// 'LLNG' items.
    Int64(Vec<i64>),
    /// 'FLOT' items.
    Float(Vec<f32>),
    /// 'DBLE' items.
    Double(Vec<f64>),
    /// 'BPNT' items.
    Point(Vec<Point>),
    /// 'RECT' items.
    Rect(Vec<Rect>),
    /// 'CSTR' items.
    String(Vec<String>),
    /// 'MSGG' items.
    Message(Vec<Message>),
    /// Opaque buffers under an arbitrary tag.
    Flat {
        /// The wire tag the buffers are stored under.
        type_code: u32,
        /// One opaque buffer per item.
        items: Vec<Vec<u8>>,
    },
}

impl FieldContents {
    /// The wire type code of this field.
    pub fn type_code(&self) -> u32 {
        match self {
            FieldContents::Bool(_) => TypeCode::Bool.into(),
            FieldContents::Int8(_) => TypeCode::Int8.into(),
            FieldContents::Int16(_) => TypeCode::Int16.into(),
            FieldContents::Int32(_) => TypeCode::Int32.into(),
            FieldContents::Int64(_) => TypeCode::Int64.into(),
            FieldContents::Float(_) => TypeCode::Float.into(),
            FieldContents::Double(_) => TypeCode::Double.into(),
            FieldContents::Point(_) => TypeCode::Point.into(),
            FieldContents::Rect(_) => TypeCode::Rect.into(),
            FieldContents::String(_) => TypeCode::String.into(),
            FieldContents::Message(_) => TypeCode::Message.into(),
            FieldContents::Flat { type_code, .. } => *type_code,
        }
    }

    /// Number of items in the field.
    pub fn len(&self) -> usize {
        match self {
            FieldContents::Bool(v) => v.len(),
            FieldContents::Int8(v) => v.len(),
            FieldContents::Int16(v) => v.len(),
            FieldContents::Int32(v) => v.len(),
            FieldContents::Int64(v) => v.len(),
            FieldContents::Float(v) => v.len(),
            FieldContents::Double(v) => v.len(),
            FieldContents::Point(v) => v.len(),
            FieldContents::Rect(v) => v.len(),
            FieldContents::String(v) => v.len(),
            FieldContents::Message(v) => v.len(),
            FieldContents::Flat { items, .. } => items.len(),
        }
    }

    /// Whether the field holds no items.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Exact payload byte count this field flattens to.
    fn payload_size(&self) -> usize {
        match self {
            FieldContents::Bool(v) => v.len(),
            FieldContents::Int8(v) => v.len(),
            FieldContents::Int16(v) => 2 * v.len(),
            FieldContents::Int32(v) => 4 * v.len(),
            FieldContents::Int64(v) => 8 * v.len(),
            FieldContents::Float(v) => 4 * v.len(),
            FieldContents::Double(v) => 8 * v.len(),
            FieldContents::Point(v) => 8 * v.len(),
            FieldContents::Rect(v) => 16 * v.len(),
            FieldContents::String(v) => 4 + v.iter().map(|s| 4 + s.len() + 1).sum::<usize>(),
            FieldContents::Message(v) => v.iter().map(|m| 4 + m.flattened_size()).sum(),
            FieldContents::Flat { items, .. } => {
                4 + items.iter().map(|b| 4 + b.len()).sum::<usize>()
            }
        }
    }

    fn write_payload<W: Write>(&self, w: &mut W) -> Result<()> {
        match self {
            FieldContents::Bool(v) => {
                for &b in v {
                    w.write_u8(b as u8)?;
                }
            }
            FieldContents::Int8(v) => {
                for &x in v {
                    w.write_i8(x)?;
                }
            }
            FieldContents::Int16(v) => {
                for &x in v {
                    w.write_i16::<LE>(x)?;
                }
            }
            FieldContents::Int32(v) => {
                for &x in v {
                    w.write_i32::<LE>(x)?;
                }
            }
            FieldContents::Int64(v) => {
                for &x in v {
                    w.write_i64::<LE>(x)?;
                }
            }
            FieldContents::Float(v) => {
                for &x in v {
                    w.write_f32::<LE>(x)?;
                }
            }
            FieldContents::Double(v) => {
                for &x in v {
                    w.write_f64::<LE>(x)?;
                }
            }
            FieldContents::Point(v) => {
                for p in v {
                    w.write_f32::<LE>(p.x)?;
                    w.write_f32::<LE>(p.y)?;
                }
            }
            FieldContents::Rect(v) => {
                for r in v {
                    w.write_f32::<LE>(r.left)?;
                    w.write_f32::<LE>(r.top)?;
                    w.write_f32::<LE>(r.right)?;
                    w.write_f32::<LE>(r.bottom)?;
                }
            }
            FieldContents::String(v) => {
                w.write_u32::<LE>(v.len() as u32)?;
                for s in v {
                    write_string(w, s)?;
                }
            }
            FieldContents::Message(v) => {
                for m in v {
                    w.write_u32::<LE>(m.flattened_size() as u32)?;
                    m.flatten(w)?;
                }
            }
            FieldContents::Flat { type_code, items } => {
                if *type_code == u32::from(TypeCode::Pointer) {
                    return Err(Error::InvalidTypeForOperation(*type_code));
                }
                w.write_u32::<LE>(items.len() as u32)?;
                for item in items {
                    w.write_u32::<LE>(item.len() as u32)?;
                    w.write_all(item)?;
                }
            }
        }
        Ok(())
    }

    // Decodes one field payload. The payload has already been sliced out of
    // the stream, so every item length can be checked against the field's
    // declared size and trailing garbage is detectable.
    fn from_payload(type_code: u32, payload: &[u8]) -> Result<FieldContents> {
        let contents = match TypeCode::try_from(type_code) {
            Ok(TypeCode::Bool) => {
                FieldContents::Bool(payload.iter().map(|&b| b != 0).collect())
            }
            Ok(TypeCode::Int8) => {
                FieldContents::Int8(payload.iter().map(|&b| b as i8).collect())
            }
            Ok(TypeCode::Int16) => {
                let mut r = check_item_width(type_code, payload, 2)?;
                let mut v = Vec::with_capacity(payload.len() / 2);
                while !r.is_empty() {
                    v.push(r.read_i16::<LE>()?);
                }
                FieldContents::Int16(v)
            }
            Ok(TypeCode::Int32) => {
                let mut r = check_item_width(type_code, payload, 4)?;
                let mut v = Vec::with_capacity(payload.len() / 4);
                while !r.is_empty() {
                    v.push(r.read_i32::<LE>()?);
                }
                FieldContents::Int32(v)
            }
            Ok(TypeCode::Int64) => {
                let mut r = check_item_width(type_code, payload, 8)?;
                let mut v = Vec::with_capacity(payload.len() / 8);
                while !r.is_empty() {
                    v.push(r.read_i64::<LE>()?);
                }
                FieldContents::Int64(v)
            }
            Ok(TypeCode::Float) => {
                let mut r = check_item_width(type_code, payload, 4)?;
                let mut v = Vec::with_capacity(payload.len() / 4);
                while !r.is_empty() {
                    v.push(r.read_f32::<LE>()?);
                }
                FieldContents::Float(v)
            }
            Ok(TypeCode::Double) => {
                let mut r = check_item_width(type_code, payload, 8)?;
                let mut v = Vec::with_capacity(payload.len() / 8);
                while !r.is_empty() {
                    v.push(r.read_f64::<LE>()?);
                }
                FieldContents::Double(v)
            }
            Ok(TypeCode::Point) => {
                let mut r = check_item_width(type_code, payload, 8)?;
                let mut v = Vec::with_capacity(payload.len() / 8);
                while !r.is_empty() {
                    let x = r.read_f32::<LE>()?;
                    let y = r.read_f32::<LE>()?;
                    v.push(Point::new(x, y));
                }
                FieldContents::Point(v)
            }
            Ok(TypeCode::Rect) => {
                let mut r = check_item_width(type_code, payload, 16)?;
                let mut v = Vec::with_capacity(payload.len() / 16);
                while !r.is_empty() {
                    let left = r.read_f32::<LE>()?;
                    let top = r.read_f32::<LE>()?;
                    let right = r.read_f32::<LE>()?;
                    let bottom = r.read_f32::<LE>()?;
                    v.push(Rect::new(left, top, right, bottom));
                }
                FieldContents::Rect(v)
            }
            Ok(TypeCode::String) => {
                let mut r = payload;
                let count = r.read_u32::<LE>()? as usize;
                let mut v = Vec::with_capacity(count.min(payload.len()));
                for _ in 0..count {
                    v.push(read_string(&mut r)?);
                }
                if !r.is_empty() {
                    return Err(Error::MalformedMessage(format!(
                        "{} trailing bytes after the last CSTR item",
                        r.len()
                    )));
                }
                FieldContents::String(v)
            }
            Ok(TypeCode::Message) => {
                let mut rest = payload;
                let mut v = Vec::new();
                while !rest.is_empty() {
                    if rest.len() < 4 {
                        return Err(Error::MalformedMessage(
                            "sub-Message size straddles its field payload".into(),
                        ));
                    }
                    let mut r = rest;
                    let sub_size = r.read_u32::<LE>()? as usize;
                    rest = r;
                    if sub_size > rest.len() {
                        return Err(Error::MalformedMessage(format!(
                            "sub-Message of {} bytes overruns its field payload",
                            sub_size
                        )));
                    }
                    let (sub, tail) = rest.split_at(sub_size);
                    rest = tail;
                    let mut m = Message::new(0);
                    m.unflatten(&mut &sub[..])?;
                    v.push(m);
                }
                FieldContents::Message(v)
            }
            // OPTR, RAWT, BTCH, PNTR and every unregistered tag: opaque
            // length-prefixed buffers.
            _ => {
                let mut r = payload;
                let count = r.read_u32::<LE>()? as usize;
                let mut items = Vec::with_capacity(count.min(payload.len()));
                for _ in 0..count {
                    let len = r.read_u32::<LE>()? as usize;
                    items.push(take_bytes(&mut r, len)?.to_vec());
                }
                if !r.is_empty() {
                    return Err(Error::MalformedMessage(format!(
                        "{} trailing bytes after the last buffer item",
                        r.len()
                    )));
                }
                FieldContents::Flat { type_code, items }
            }
        };
        Ok(contents)
    }
}

fn check_item_width(type_code: u32, payload: &[u8], width: usize) -> Result<&[u8]> {
    if payload.len() % width != 0 {
        return Err(Error::MalformedMessage(format!(
            "{} payload of {} bytes is not a multiple of the {}-byte item size",
            type_code_str(type_code),
            payload.len(),
            width
        )));
    }
    Ok(payload)
}

fn take_bytes<'a>(r: &mut &'a [u8], len: usize) -> Result<&'a [u8]> {
    if len > r.len() {
        return Err(Error::TruncatedStream);
    }
    let (head, tail) = r.split_at(len);
    *r = tail;
    Ok(head)
}

// Length-prefixed UTF-8 with an explicit NUL, as used for field names and
// CSTR items.
fn write_string<W: Write>(w: &mut W, s: &str) -> Result<()> {
    w.write_u32::<LE>(s.len() as u32 + 1)?;
    w.write_all(s.as_bytes())?;
    w.write_u8(0)?;
    Ok(())
}

fn read_string(r: &mut &[u8]) -> Result<String> {
    let len_with_nul = r.read_u32::<LE>()? as usize;
    if len_with_nul == 0 {
        return Err(Error::MalformedMessage(
            "zero-length string header (must cover at least the NUL)".into(),
        ));
    }
    let bytes = take_bytes(r, len_with_nul - 1)?.to_vec();
    take_bytes(r, 1)?; // consume and discard the NUL
    String::from_utf8(bytes)
        .map_err(|_| Error::MalformedMessage("string item is not valid UTF-8".into()))
}

/// Conversion accepted by the typed put helpers: a single item or any list
/// of items. A scalar becomes a one-element list.
pub trait IntoItems<T> {
    /// The promoted item list.
    fn into_items(self) -> Vec<T>;
}

impl<T> IntoItems<T> for T {
    fn into_items(self) -> Vec<T> {
        vec![self]
    }
}

impl<T> IntoItems<T> for Vec<T> {
    fn into_items(self) -> Vec<T> {
        self
    }
}

impl<T: Clone> IntoItems<T> for &[T] {
    fn into_items(self) -> Vec<T> {
        self.to_vec()
    }
}

impl<T, const N: usize> IntoItems<T> for [T; N] {
    fn into_items(self) -> Vec<T> {
        Vec::from(self)
    }
}

impl IntoItems<String> for &str {
    fn into_items(self) -> Vec<String> {
        vec![self.to_string()]
    }
}

impl<const N: usize> IntoItems<String> for [&str; N] {
    fn into_items(self) -> Vec<String> {
        self.iter().map(|s| s.to_string()).collect()
    }
}

impl IntoItems<String> for Vec<&str> {
    fn into_items(self) -> Vec<String> {
        self.iter().map(|s| s.to_string()).collect()
    }
}

/// A named, typed, multi-valued, nestable record; the codec's unit of
/// transport.
///
/// Field insertion order is preserved through flatten/unflatten round trips,
/// and a field name is unique within a Message: putting a field under an
/// existing name replaces the old contents regardless of their prior type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    /// Application-defined command code carried in the header.
    pub what: u32,
    fields: Vec<(String, FieldContents)>,
}

impl Message {
    /// An empty Message with the given what code.
    pub fn new(what: u32) -> Message {
        Message {
            what,
            fields: Vec::new(),
        }
    }

    /// Removes all fields and resets the what code to zero.
    pub fn clear(&mut self) {
        self.what = 0;
        self.fields.clear();
    }

    /// Field names, in insertion order.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(name, _)| name.as_str())
    }

    /// Number of fields.
    pub fn num_fields(&self) -> usize {
        self.fields.len()
    }

    fn find(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|(n, _)| n == name)
    }

    /// The type code under `name`, if the field exists.
    pub fn field_type(&self, name: &str) -> Option<u32> {
        self.contents(name).map(|c| c.type_code())
    }

    /// Whether a field named `name` exists, of any type.
    pub fn has_field(&self, name: &str) -> bool {
        self.find(name).is_some()
    }

    /// Whether a field named `name` exists with exactly `type_code`
    /// (`TypeCode::Any` matches any type).
    pub fn has_field_of_type(&self, name: &str, type_code: u32) -> bool {
        self.contents_of_type(name, type_code).is_some()
    }

    /// The contents under `name`, of any type.
    pub fn contents(&self, name: &str) -> Option<&FieldContents> {
        self.find(name).map(|i| &self.fields[i].1)
    }

    /// The contents under `name` if stored under exactly `type_code`
    /// (`TypeCode::Any` matches any type).
    pub fn contents_of_type(&self, name: &str, type_code: u32) -> Option<&FieldContents> {
        let contents = self.contents(name)?;
        if type_code == u32::from(TypeCode::Any) || contents.type_code() == type_code {
            Some(contents)
        } else {
            None
        }
    }

    /// Adds or replaces a field. Replacement ignores the prior field's type.
    pub fn put_contents(&mut self, name: impl Into<String>, contents: FieldContents) {
        let name = name.into();
        match self.find(&name) {
            Some(i) => self.fields[i].1 = contents,
            None => self.fields.push((name, contents)),
        }
    }

    /// Removes the field under `name`, if it exists.
    pub fn remove_field(&mut self, name: &str) {
        if let Some(i) = self.find(name) {
            self.fields.remove(i);
        }
    }

    /// Replaces `name` with a BOOL field.
    pub fn put_bool(&mut self, name: impl Into<String>, items: impl IntoItems<bool>) {
        self.put_contents(name, FieldContents::Bool(items.into_items()));
    }

    /// Replaces `name` with a BYTE field.
    pub fn put_int8(&mut self, name: impl Into<String>, items: impl IntoItems<i8>) {
        self.put_contents(name, FieldContents::Int8(items.into_items()));
    }

    /// Replaces `name` with a SHRT field.
    pub fn put_int16(&mut self, name: impl Into<String>, items: impl IntoItems<i16>) {
        self.put_contents(name, FieldContents::Int16(items.into_items()));
    }

    /// Replaces `name` with a LONG field.
    pub fn put_int32(&mut self, name: impl Into<String>, items: impl IntoItems<i32>) {
        self.put_contents(name, FieldContents::Int32(items.into_items()));
    }

    /// Replaces `name` with a LLNG field.
    pub fn put_int64(&mut self, name: impl Into<String>, items: impl IntoItems<i64>) {
        self.put_contents(name, FieldContents::Int64(items.into_items()));
    }

    /// Replaces `name` with a FLOT field.
    pub fn put_float(&mut self, name: impl Into<String>, items: impl IntoItems<f32>) {
        self.put_contents(name, FieldContents::Float(items.into_items()));
    }

    /// Replaces `name` with a DBLE field.
    pub fn put_double(&mut self, name: impl Into<String>, items: impl IntoItems<f64>) {
        self.put_contents(name, FieldContents::Double(items.into_items()));
    }

    /// Replaces `name` with a BPNT field.
    pub fn put_point(&mut self, name: impl Into<String>, items: impl IntoItems<Point>) {
        self.put_contents(name, FieldContents::Point(items.into_items()));
    }

    /// Replaces `name` with a RECT field.
    pub fn put_rect(&mut self, name: impl Into<String>, items: impl IntoItems<Rect>) {
        self.put_contents(name, FieldContents::Rect(items.into_items()));
    }

    /// Replaces `name` with a CSTR field.
    pub fn put_string(&mut self, name: impl Into<String>, items: impl IntoItems<String>) {
        self.put_contents(name, FieldContents::String(items.into_items()));
    }

    /// Replaces `name` with a MSGG field of nested Messages.
    pub fn put_message(&mut self, name: impl Into<String>, items: impl IntoItems<Message>) {
        self.put_contents(name, FieldContents::Message(items.into_items()));
    }

    /// Replaces `name` with opaque buffers stored under an arbitrary type
    /// code (RAWT, OPTR, or any unregistered tag).
    pub fn put_data(
        &mut self,
        name: impl Into<String>,
        type_code: u32,
        items: impl IntoItems<Vec<u8>>,
    ) {
        self.put_contents(
            name,
            FieldContents::Flat {
                type_code,
                items: items.into_items(),
            },
        );
    }

    /// Flattens `object` and stores the buffer under the object's own type
    /// code.
    pub fn put_flat<F: Flattenable>(&mut self, name: impl Into<String>, object: &F) -> Result<()> {
        let mut buf = Vec::with_capacity(object.flattened_size());
        object.flatten(&mut buf)?;
        self.put_data(name, object.type_code(), buf);
        Ok(())
    }

    /// Flattens each object in `objects` and stores the buffers under the
    /// objects' type code. An empty slice leaves the Message untouched.
    pub fn put_flat_list<F: Flattenable>(
        &mut self,
        name: impl Into<String>,
        objects: &[F],
    ) -> Result<()> {
        let first = match objects.first() {
            Some(first) => first,
            None => return Ok(()),
        };
        let type_code = first.type_code();
        let mut items = Vec::with_capacity(objects.len());
        for object in objects {
            let mut buf = Vec::with_capacity(object.flattened_size());
            object.flatten(&mut buf)?;
            items.push(buf);
        }
        self.put_data(name, type_code, items);
        Ok(())
    }

    /// Unflattens the `index`'th buffer under `name` into `object`. The
    /// field must be stored under the object's own type code. Returns
    /// whether a buffer was found.
    pub fn get_flat<F: Flattenable>(
        &self,
        name: &str,
        object: &mut F,
        index: isize,
    ) -> Result<bool> {
        let items = self.get_data(name, object.type_code());
        match item_at(items, index) {
            Some(buf) => {
                object.unflatten(&mut &buf[..])?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// All booleans under `name`, or an empty slice.
    pub fn get_bools(&self, name: &str) -> &[bool] {
        match self.contents(name) {
            Some(FieldContents::Bool(v)) => v,
            _ => &[],
        }
    }

    /// All int8s under `name`, or an empty slice.
    pub fn get_int8s(&self, name: &str) -> &[i8] {
        match self.contents(name) {
            Some(FieldContents::Int8(v)) => v,
            _ => &[],
        }
    }

    /// All int16s under `name`, or an empty slice.
    pub fn get_int16s(&self, name: &str) -> &[i16] {
        match self.contents(name) {
            Some(FieldContents::Int16(v)) => v,
            _ => &[],
        }
    }

    /// All int32s under `name`, or an empty slice.
    pub fn get_int32s(&self, name: &str) -> &[i32] {
        match self.contents(name) {
            Some(FieldContents::Int32(v)) => v,
            _ => &[],
        }
    }

    /// All int64s under `name`, or an empty slice.
    pub fn get_int64s(&self, name: &str) -> &[i64] {
        match self.contents(name) {
            Some(FieldContents::Int64(v)) => v,
            _ => &[],
        }
    }

    /// All floats under `name`, or an empty slice.
    pub fn get_floats(&self, name: &str) -> &[f32] {
        match self.contents(name) {
            Some(FieldContents::Float(v)) => v,
            _ => &[],
        }
    }

    /// All doubles under `name`, or an empty slice.
    pub fn get_doubles(&self, name: &str) -> &[f64] {
        match self.contents(name) {
            Some(FieldContents::Double(v)) => v,
            _ => &[],
        }
    }

    /// All points under `name`, or an empty slice.
    pub fn get_points(&self, name: &str) -> &[Point] {
        match self.contents(name) {
            Some(FieldContents::Point(v)) => v,
            _ => &[],
        }
    }

    /// All rects under `name`, or an empty slice.
    pub fn get_rects(&self, name: &str) -> &[Rect] {
        match self.contents(name) {
            Some(FieldContents::Rect(v)) => v,
            _ => &[],
        }
    }

    /// All strings under `name`, or an empty slice.
    pub fn get_strings(&self, name: &str) -> &[String] {
        match self.contents(name) {
            Some(FieldContents::String(v)) => v,
            _ => &[],
        }
    }

    /// All nested Messages under `name`, or an empty slice.
    pub fn get_messages(&self, name: &str) -> &[Message] {
        match self.contents(name) {
            Some(FieldContents::Message(v)) => v,
            _ => &[],
        }
    }

    /// All opaque buffers stored under `name` with exactly `type_code`
    /// (`TypeCode::Any` matches any buffer field), or an empty slice.
    pub fn get_data(&self, name: &str, type_code: u32) -> &[Vec<u8>] {
        match self.contents(name) {
            Some(FieldContents::Flat {
                type_code: tc,
                items,
            }) if *tc == type_code || type_code == u32::from(TypeCode::Any) => items,
            _ => &[],
        }
    }

    /// The `index`'th boolean under `name`, or `false`. A negative index
    /// counts from the end of the list, as for all the scalar getters.
    pub fn get_bool(&self, name: &str, index: isize) -> bool {
        item_at(self.get_bools(name), index).copied().unwrap_or(false)
    }

    /// The `index`'th int8 under `name`, or 0.
    pub fn get_int8(&self, name: &str, index: isize) -> i8 {
        item_at(self.get_int8s(name), index).copied().unwrap_or(0)
    }

    /// The `index`'th int16 under `name`, or 0.
    pub fn get_int16(&self, name: &str, index: isize) -> i16 {
        item_at(self.get_int16s(name), index).copied().unwrap_or(0)
    }

    /// The `index`'th int32 under `name`, or 0.
    pub fn get_int32(&self, name: &str, index: isize) -> i32 {
        item_at(self.get_int32s(name), index).copied().unwrap_or(0)
    }

    /// The `index`'th int64 under `name`, or 0.
    pub fn get_int64(&self, name: &str, index: isize) -> i64 {
        item_at(self.get_int64s(name), index).copied().unwrap_or(0)
    }

    /// The `index`'th float under `name`, or 0.0.
    pub fn get_float(&self, name: &str, index: isize) -> f32 {
        item_at(self.get_floats(name), index).copied().unwrap_or(0.0)
    }

    /// The `index`'th double under `name`, or 0.0.
    pub fn get_double(&self, name: &str, index: isize) -> f64 {
        item_at(self.get_doubles(name), index).copied().unwrap_or(0.0)
    }

    /// The `index`'th point under `name`, or the origin.
    pub fn get_point(&self, name: &str, index: isize) -> Point {
        item_at(self.get_points(name), index)
            .copied()
            .unwrap_or_default()
    }

    /// The `index`'th rect under `name`, or the all-zero rect.
    pub fn get_rect(&self, name: &str, index: isize) -> Rect {
        item_at(self.get_rects(name), index)
            .copied()
            .unwrap_or_default()
    }

    /// The `index`'th string under `name`, or `""`.
    pub fn get_string(&self, name: &str, index: isize) -> &str {
        item_at(self.get_strings(name), index).map_or("", |s| s.as_str())
    }

    /// The `index`'th nested Message under `name`, if present.
    pub fn get_message(&self, name: &str, index: isize) -> Option<&Message> {
        item_at(self.get_messages(name), index)
    }

    /// Exact number of bytes [`flatten`](Self::flatten) will write: a
    /// 12-byte header plus, per field, the name/type/size overhead and the
    /// payload.
    pub fn flattened_size(&self) -> usize {
        let mut size = 3 * 4;
        for (name, contents) in &self.fields {
            size += 4 + name.len() + 1 + 4 + 4 + contents.payload_size();
        }
        size
    }

    /// Writes the platform-neutral little-endian flattened form.
    ///
    /// Fails with `InvalidTypeForOperation` if any field is stored under
    /// the PNTR type code; pointers have no cross-process representation.
    pub fn flatten<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_u32::<LE>(CURRENT_PROTOCOL_VERSION)?;
        w.write_u32::<LE>(self.what)?;
        w.write_u32::<LE>(self.fields.len() as u32)?;
        for (name, contents) in &self.fields {
            write_string(w, name)?;
            w.write_u32::<LE>(contents.type_code())?;
            w.write_u32::<LE>(contents.payload_size() as u32)?;
            contents.write_payload(w)?;
        }
        Ok(())
    }

    /// Replaces this Message's state with the flattened form read from `r`.
    pub fn unflatten<R: Read>(&mut self, r: &mut R) -> Result<()> {
        self.clear();
        let version = r.read_u32::<LE>()?;
        if version != CURRENT_PROTOCOL_VERSION {
            return Err(Error::BadProtocolVersion(version));
        }
        self.what = r.read_u32::<LE>()?;
        let num_fields = r.read_u32::<LE>()?;
        for _ in 0..num_fields {
            let name_len = r.read_u32::<LE>()? as usize;
            if name_len == 0 {
                return Err(Error::MalformedMessage(
                    "zero-length field-name header".into(),
                ));
            }
            let mut name_bytes = vec![0u8; name_len - 1];
            r.read_exact(&mut name_bytes)?;
            let mut nul = [0u8; 1];
            r.read_exact(&mut nul)?;
            let name = String::from_utf8(name_bytes)
                .map_err(|_| Error::MalformedMessage("field name is not valid UTF-8".into()))?;
            let type_code = r.read_u32::<LE>()?;
            let payload_size = r.read_u32::<LE>()? as usize;
            let mut payload = vec![0u8; payload_size];
            r.read_exact(&mut payload)?;
            let contents = FieldContents::from_payload(type_code, &payload)?;
            self.put_contents(name, contents);
        }
        Ok(())
    }

    /// The flattened form as a fresh buffer.
    pub fn to_flattened_buffer(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.flattened_size());
        self.flatten(&mut buf)?;
        Ok(buf)
    }

    /// Replaces this Message's state from a flattened buffer.
    pub fn set_from_flattened_buffer(&mut self, buf: &[u8]) -> Result<()> {
        self.unflatten(&mut &buf[..])
    }
}

// Shared index resolution for the scalar getters: negative counts from the
// end, anything out of range is absent.
fn item_at<T>(items: &[T], index: isize) -> Option<&T> {
    let len = items.len() as isize;
    let index = if index < 0 { index + len } else { index };
    if index < 0 || index >= len {
        None
    } else {
        items.get(index as usize)
    }
}
