//! Line framing for the peer link.
//!
//! Decoding yields one trimmed text line per `\n`. Bytes outside ASCII
//! are dropped rather than failing the line, since a noisy UART can
//! corrupt single bytes without invalidating the rest of the stream.
//! Encoding writes a pixel row as space-separated decimals plus `\n`.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::TransferError;

/// Longest line accepted before a newline must appear.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

#[derive(Debug, Default, Clone, Copy)]
pub struct RowCodec;

impl Decoder for RowCodec {
    type Item = String;
    type Error = TransferError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(pos) = src.iter().position(|&b| b == b'\n') else {
            if src.len() > MAX_LINE_LENGTH {
                return Err(TransferError::LineTooLong {
                    size: src.len(),
                    max: MAX_LINE_LENGTH,
                });
            }
            return Ok(None);
        };

        let raw = src.split_to(pos + 1);
        let line: String = raw
            .iter()
            .filter(|b| b.is_ascii())
            .map(|&b| b as char)
            .collect();
        Ok(Some(line.trim().to_string()))
    }
}

impl<'a> Encoder<&'a [u32]> for RowCodec {
    type Error = TransferError;

    fn encode(&mut self, row: &'a [u32], dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(row.len() * 4 + 1);
        for (i, value) in row.iter().enumerate() {
            if i > 0 {
                dst.put_u8(b' ');
            }
            dst.extend_from_slice(value.to_string().as_bytes());
        }
        dst.put_u8(b'\n');
        Ok(())
    }
}

/// Parse a captured row into pixel values.
pub fn parse_row(line: &str) -> Result<Vec<u32>, TransferError> {
    line.split_whitespace()
        .map(|t| {
            t.parse::<u32>()
                .map_err(|_| TransferError::malformed("pixel value", "integer", t))
        })
        .collect()
}
