//! Compressed Message envelopes.
//!
//! [`deflate_message`] folds an entire Message into a single `_zlib` RAWT
//! field whose buffer is an 8-byte header (`zlic` magic + original flattened
//! size) followed by a zlib stream. The stream is produced with a sync
//! flush, not a stream finish, so its tail is self-delimiting and the
//! decompressor needs no end-of-stream marker. [`inflate_message`] is the
//! inverse; Messages without a well-formed envelope pass through unchanged.

use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress};

use crate::error::{Error, Result};
use crate::message::{Message, TypeCode};

/// Name of the single field a deflated Message carries.
pub const ZLIB_FIELD_NAME: &str = "_zlib";

/// 'zlic', the envelope magic preceding the compressed bytes.
const ZLIB_CODEC_HEADER: u32 = 2053925219;

const ENVELOPE_HEADER_SIZE: usize = 2 * 4;

/// Returns an equivalent Message whose content is compressed into one
/// `_zlib` field, keeping the original what code.
///
/// Already-deflated Messages are returned unaltered, which makes the
/// operation idempotent. `level` is the zlib compression level (0..=9).
/// With `force == false` the original Message is returned whenever the
/// deflated form would not be smaller.
pub fn deflate_message(msg: &Message, level: u32, force: bool) -> Result<Message> {
    if level > 9 {
        return Err(Error::Zlib(format!(
            "compression level {} out of range 0..=9",
            level
        )));
    }
    if !msg
        .get_data(ZLIB_FIELD_NAME, TypeCode::Raw.into())
        .is_empty()
    {
        return Ok(msg.clone());
    }

    let flat = msg.to_flattened_buffer()?;
    let mut blob = Vec::with_capacity(ENVELOPE_HEADER_SIZE + flat.len() / 2 + 64);
    blob.write_u32::<LE>(ZLIB_CODEC_HEADER)?;
    blob.write_u32::<LE>(flat.len() as u32)?;

    let mut compressor = Compress::new(Compression::new(level), true);
    loop {
        let consumed = compressor.total_in() as usize;
        if blob.len() == blob.capacity() {
            blob.reserve(4096);
        }
        let before = blob.len();
        compressor
            .compress_vec(&flat[consumed..], &mut blob, FlushCompress::Sync)
            .map_err(|e| Error::Zlib(e.to_string()))?;
        // the sync flush is complete once a call with spare output capacity
        // consumes nothing and produces nothing
        if compressor.total_in() as usize == flat.len() && blob.len() == before {
            break;
        }
    }

    let mut deflated = Message::new(msg.what);
    deflated.put_data(ZLIB_FIELD_NAME, TypeCode::Raw.into(), blob);
    if !force && deflated.flattened_size() >= msg.flattened_size() {
        return Ok(msg.clone());
    }
    Ok(deflated)
}

/// Undoes [`deflate_message`]: decompresses the `_zlib` field back into the
/// original Message. A Message without the envelope (or with a buffer that
/// does not start with the `zlic` magic) is returned unaltered.
pub fn inflate_message(msg: &Message) -> Result<Message> {
    let blobs = msg.get_data(ZLIB_FIELD_NAME, TypeCode::Raw.into());
    let blob = match blobs.first() {
        Some(blob) if blob.len() >= ENVELOPE_HEADER_SIZE => blob,
        _ => return Ok(msg.clone()),
    };
    let mut header = &blob[..ENVELOPE_HEADER_SIZE];
    let magic = header.read_u32::<LE>()?;
    let original_size = header.read_u32::<LE>()? as usize;
    if magic != ZLIB_CODEC_HEADER {
        return Ok(msg.clone());
    }

    let compressed = &blob[ENVELOPE_HEADER_SIZE..];
    let mut flat = Vec::with_capacity(original_size);
    let mut decompressor = Decompress::new(true);
    while flat.len() < original_size {
        let consumed = decompressor.total_in() as usize;
        let before = flat.len();
        decompressor
            .decompress_vec(&compressed[consumed..], &mut flat, FlushDecompress::Sync)
            .map_err(|e| Error::Zlib(e.to_string()))?;
        if flat.len() == before && decompressor.total_in() as usize == consumed {
            return Err(Error::Zlib(
                "compressed stream ended short of the declared size".into(),
            ));
        }
    }

    let mut inflated = Message::new(0);
    inflated.set_from_flattened_buffer(&flat)?;
    Ok(inflated)
}
