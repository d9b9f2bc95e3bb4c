//! Streaming access to the packets of a perfetto trace file.
//!
//! A trace is a `Trace` message whose only interesting field is the repeated
//! `packet` (field 1). Packets are yielded still encoded so the tokenizer can
//! hand out views into them without re-serializing anything.

use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use crate::blob::TraceBlobView;
use crate::wire::{parse_varint, WireType, MAX_VARINT_LEN};

const TRACE_PACKET: u64 = 1;
const READ_BUFFER_SIZE: usize = 256 * 1024;

/// Iterator over the encoded `TracePacket`s of a trace stream.
///
/// The first error ends the iteration; nothing after a damaged field can be
/// framed reliably.
pub struct TracePacketIterator<R: BufRead> {
    reader: R,
    failed: bool,
}

impl<R: BufRead> TracePacketIterator<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            failed: false,
        }
    }

    fn next_packet(&mut self) -> Result<Option<TraceBlobView>> {
        loop {
            // A clean end of stream can only fall between fields.
            if self.reader.fill_buf()?.is_empty() {
                return Ok(None);
            }
            let tag = read_varint(&mut self.reader)?;
            let Some(wire_type) = WireType::from_tag(tag) else {
                bail!("Unknown wire type {} in trace", tag & 0x07);
            };

            if tag >> 3 == TRACE_PACKET && wire_type == WireType::LengthDelimited {
                return read_length_delimited(&mut self.reader)
                    .map(|packet| Some(TraceBlobView::from(packet)));
            }
            skip_field(&mut self.reader, wire_type)?;
        }
    }
}

impl<R: BufRead> Iterator for TracePacketIterator<R> {
    type Item = Result<TraceBlobView>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let packet = self.next_packet().transpose();
        if matches!(packet, Some(Err(_))) {
            self.failed = true;
        }
        packet
    }
}

/// Read a varint one byte at a time, decoding it with [`parse_varint`].
pub fn read_varint<R: Read>(reader: &mut R) -> Result<u64> {
    let mut buf = [0u8; MAX_VARINT_LEN];
    for i in 0..MAX_VARINT_LEN {
        reader.read_exact(&mut buf[i..=i])?;
        if buf[i] & 0x80 == 0 {
            if let Some((value, _)) = parse_varint(&buf[..=i]) {
                return Ok(value);
            }
        }
    }
    bail!("Varint too large")
}

/// Read a length-prefixed payload.
///
/// The length comes from the file, so the buffer only grows as bytes
/// actually arrive; a corrupt length fails as a truncated read instead of
/// allocating whatever it claims.
fn read_length_delimited<R: Read>(reader: &mut R) -> Result<Vec<u8>> {
    let len = read_varint(reader)?;
    let mut payload = Vec::new();
    reader
        .take(len)
        .read_to_end(&mut payload)
        .context("Failed to read length-delimited field")?;
    if payload.len() as u64 != len {
        bail!(
            "Truncated field: expected {} bytes, got {}",
            len,
            payload.len()
        );
    }
    Ok(payload)
}

fn skip_field<R: Read>(reader: &mut R, wire_type: WireType) -> Result<()> {
    let len = match wire_type {
        WireType::VarInt => {
            read_varint(reader)?;
            return Ok(());
        }
        WireType::Fixed64 => 8,
        WireType::Fixed32 => 4,
        WireType::LengthDelimited => read_varint(reader)?,
    };
    let skipped = std::io::copy(&mut reader.take(len), &mut std::io::sink())?;
    if skipped != len {
        bail!("Truncated field: expected {len} bytes, got {skipped}");
    }
    Ok(())
}

/// Open a trace file for reading, decompressing `.gz` files on the fly.
pub fn open_trace_reader(path: &Path) -> Result<Box<dyn BufRead + Send>> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let reader = BufReader::with_capacity(READ_BUFFER_SIZE, file);

    match path.extension().and_then(|ext| ext.to_str()) {
        Some("gz") => Ok(Box::new(BufReader::with_capacity(
            READ_BUFFER_SIZE,
            GzDecoder::new(reader),
        ))),
        _ => Ok(Box::new(reader)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::testing::{bytes_field, varint, varint_field};
    use std::io::Cursor;

    fn packets(data: Vec<u8>) -> Vec<Result<TraceBlobView>> {
        TracePacketIterator::new(Cursor::new(data)).collect()
    }

    #[test]
    fn test_yields_packets_in_order() {
        let mut trace = Vec::new();
        bytes_field(&mut trace, 1, &[0x50, 0x01]);
        bytes_field(&mut trace, 1, &[]);
        bytes_field(&mut trace, 1, &[0x50, 0x02]);

        let packets: Vec<Vec<u8>> = packets(trace)
            .into_iter()
            .map(|p| p.unwrap().data().to_vec())
            .collect();
        assert_eq!(packets, vec![vec![0x50, 0x01], vec![], vec![0x50, 0x02]]);
    }

    #[test]
    fn test_skips_other_fields() {
        let mut trace = Vec::new();
        varint_field(&mut trace, 3, 77);
        bytes_field(&mut trace, 2, b"ignored");
        bytes_field(&mut trace, 1, &[0x50, 0x07]);
        // Field 20 needs a two byte tag.
        varint_field(&mut trace, 20, 1);

        let packets = packets(trace);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].as_ref().unwrap().data(), &[0x50, 0x07]);
    }

    #[test]
    fn test_truncated_packet_is_error() {
        let mut trace = Vec::new();
        bytes_field(&mut trace, 1, &[0x50, 0x01]);
        bytes_field(&mut trace, 1, &[0x50, 0x01, 0x02]);
        trace.truncate(trace.len() - 1);

        let packets = packets(trace);
        assert_eq!(packets.len(), 2);
        assert!(packets[0].is_ok());
        assert!(packets[1].is_err());
    }

    #[test]
    fn test_huge_packet_length_is_error() {
        let mut trace = vec![0x0a];
        varint(&mut trace, i64::MAX as u64);

        let packets = packets(trace);
        assert_eq!(packets.len(), 1);
        let err = packets[0].as_ref().unwrap_err();
        assert!(format!("{err:#}").contains("Truncated field"), "{err:#}");
    }

    #[test]
    fn test_unknown_wire_type_is_error() {
        let packets = packets(vec![0x0b, 0x00]);
        assert_eq!(packets.len(), 1);
        assert!(packets[0].is_err());
    }

    #[test]
    fn test_empty_stream() {
        assert!(packets(Vec::new()).is_empty());
    }

    #[test]
    fn test_read_varint() {
        let mut cursor = Cursor::new(vec![0xac, 0x02]);
        assert_eq!(read_varint(&mut cursor).unwrap(), 300);
        let mut cursor = Cursor::new(vec![0xff; 11]);
        assert!(read_varint(&mut cursor).is_err());
        let mut cursor = Cursor::new(vec![0x80]);
        assert!(read_varint(&mut cursor).is_err());
    }
}
