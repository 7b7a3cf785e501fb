//! Intel HEX decoder producing the flat binary image sent to the bootloader.
//!
//! Only contiguous images are supported: once data has been emitted, every
//! extended address record must move exactly one 64 KiB segment forward.
//! Anything else ends the image early without an error. Data below the MBR
//! size is dropped, since the bootloader never receives the MBR.

use std::io::{self, Read};

use super::error::{DfuError, DfuResult};

/// Data record.
const RECORD_DATA: u8 = 0x00;
/// End of file record.
const RECORD_EOF: u8 = 0x01;
/// Extended segment address record (value << 4).
const RECORD_EXTENDED_SEGMENT: u8 = 0x02;
/// Extended linear address record (value << 16).
const RECORD_EXTENDED_LINEAR: u8 = 0x04;

/// One parsed `:LLAAAATT...CC` line.
#[derive(Debug)]
struct Record<'a> {
    offset: u16,
    kind: u8,
    /// Payload as ASCII hex digits.
    payload: &'a [u8],
}

/// What the decoder should do with a record.
enum Step {
    Emit,
    Skip,
    End,
}

/// Address tracking shared by the size pre-scan and the read path, so both
/// agree on which bytes belong to the image.
#[derive(Debug, Default, Clone)]
struct AddressTracker {
    base: u32,
    emitted: usize,
}

impl AddressTracker {
    fn step(&mut self, record: &Record<'_>, mbr_size: u32) -> DfuResult<Step> {
        match record.kind {
            RECORD_DATA => {
                if self.base.wrapping_add(record.offset as u32) < mbr_size {
                    Ok(Step::Skip)
                } else {
                    self.emitted += record.payload.len() / 2;
                    Ok(Step::Emit)
                }
            }
            RECORD_EOF => Ok(Step::End),
            RECORD_EXTENDED_SEGMENT => {
                let address = (read_u16(record.payload)? as u32) << 4;
                if self.emitted > 0 && (address >> 16) != (self.base >> 16) + 1 {
                    return Ok(Step::End);
                }
                self.base = address;
                Ok(Step::Skip)
            }
            RECORD_EXTENDED_LINEAR => {
                let segment = read_u16(record.payload)? as u32;
                if self.emitted > 0 && segment != (self.base >> 16) + 1 {
                    return Ok(Step::End);
                }
                self.base = segment << 16;
                Ok(Step::Skip)
            }
            _ => Ok(Step::Skip),
        }
    }
}

/// Line iterator over raw HEX text, skipping blank lines.
#[derive(Debug, Clone)]
struct Lines<'a> {
    data: &'a [u8],
    pos: usize,
    line: usize,
}

impl<'a> Lines<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            line: 0,
        }
    }

    fn next_record(&mut self) -> DfuResult<Option<Record<'a>>> {
        loop {
            if self.pos >= self.data.len() {
                return Ok(None);
            }
            let rest = &self.data[self.pos..];
            let end = rest
                .iter()
                .position(|&b| b == b'\n' || b == b'\r')
                .unwrap_or(rest.len());
            let line = &rest[..end];
            self.pos += end;
            while self.pos < self.data.len()
                && (self.data[self.pos] == b'\n' || self.data[self.pos] == b'\r')
            {
                self.pos += 1;
            }
            self.line += 1;
            if line.is_empty() {
                continue;
            }
            return parse_record(line, self.line).map(Some);
        }
    }
}

fn parse_record(line: &[u8], number: usize) -> DfuResult<Record<'_>> {
    let invalid = |reason: &str| DfuError::InvalidHex {
        line: number,
        reason: reason.to_string(),
    };

    if line[0] != b':' {
        return Err(invalid("Not a HEX file"));
    }
    if line.len() < 11 {
        return Err(invalid("record too short"));
    }
    let len = read_u8(&line[1..3]).map_err(|_| invalid("invalid byte count"))? as usize;
    let offset = read_u16(&line[3..7]).map_err(|_| invalid("invalid address"))?;
    let kind = read_u8(&line[7..9]).map_err(|_| invalid("invalid record type"))?;
    let payload_end = 9 + len * 2;
    if line.len() < payload_end + 2 {
        return Err(invalid("record shorter than its byte count"));
    }
    let payload = &line[9..payload_end];
    if !payload.iter().all(u8::is_ascii_hexdigit) {
        return Err(invalid("invalid data"));
    }

    Ok(Record {
        offset,
        kind,
        payload,
    })
}

fn read_u8(ascii: &[u8]) -> DfuResult<u8> {
    let mut out = [0u8; 1];
    hex::decode_to_slice(ascii, &mut out).map_err(|e| DfuError::InvalidHex {
        line: 0,
        reason: e.to_string(),
    })?;
    Ok(out[0])
}

fn read_u16(ascii: &[u8]) -> DfuResult<u16> {
    if ascii.len() < 4 {
        return Err(DfuError::InvalidHex {
            line: 0,
            reason: "address record too short".into(),
        });
    }
    let mut out = [0u8; 2];
    hex::decode_to_slice(&ascii[..4], &mut out).map_err(|e| DfuError::InvalidHex {
        line: 0,
        reason: e.to_string(),
    })?;
    Ok(u16::from_be_bytes(out))
}

/// Streaming Intel HEX decoder.
///
/// The binary size is known right after construction (one pre-scan over the
/// text). Reading is single-pass: once drained, the decoder stays empty.
pub struct HexDecoder<'a> {
    lines: Lines<'a>,
    tracker: AddressTracker,
    mbr_size: u32,
    size: usize,
    bytes_read: usize,
    buffer: Vec<u8>,
    buffer_pos: usize,
    finished: bool,
}

impl<'a> HexDecoder<'a> {
    /// Validate the records and compute the output size.
    pub fn new(data: &'a [u8], mbr_size: u32) -> DfuResult<Self> {
        let size = Self::calculate_bin_size(data, mbr_size)?;
        Ok(Self {
            lines: Lines::new(data),
            tracker: AddressTracker::default(),
            mbr_size,
            size,
            bytes_read: 0,
            buffer: Vec::with_capacity(32),
            buffer_pos: 0,
            finished: false,
        })
    }

    fn calculate_bin_size(data: &[u8], mbr_size: u32) -> DfuResult<usize> {
        let mut lines = Lines::new(data);
        let mut tracker = AddressTracker::default();
        let mut seen_record = false;

        while let Some(record) = lines.next_record()? {
            seen_record = true;
            match tracker.step(&record, mbr_size).map_err(|e| at_line(e, lines.line))? {
                Step::End => break,
                Step::Emit | Step::Skip => {}
            }
        }

        if !seen_record {
            return Err(DfuError::InvalidHex {
                line: 0,
                reason: "Not a HEX file".into(),
            });
        }
        Ok(tracker.emitted)
    }

    /// Total number of bytes a full read produces.
    pub fn size_in_bytes(&self) -> usize {
        self.size
    }

    /// Bytes left to read.
    pub fn available(&self) -> usize {
        self.size - self.bytes_read
    }

    /// Decode the remaining image into a vector.
    pub fn into_bytes(mut self) -> DfuResult<Vec<u8>> {
        let mut out = Vec::with_capacity(self.available());
        while self.fill_buffer()? {
            out.extend_from_slice(&self.buffer[self.buffer_pos..]);
            self.bytes_read += self.buffer.len() - self.buffer_pos;
            self.buffer_pos = self.buffer.len();
        }
        Ok(out)
    }

    /// Load the next data record into the buffer. Returns false at the end of the image.
    fn fill_buffer(&mut self) -> DfuResult<bool> {
        if self.finished {
            return Ok(false);
        }
        while let Some(record) = self.lines.next_record()? {
            match self.tracker.step(&record, self.mbr_size)? {
                Step::Emit => {
                    self.buffer.clear();
                    self.buffer.resize(record.payload.len() / 2, 0);
                    hex::decode_to_slice(record.payload, &mut self.buffer).map_err(|e| {
                        DfuError::InvalidHex {
                            line: self.lines.line,
                            reason: e.to_string(),
                        }
                    })?;
                    self.buffer_pos = 0;
                    if !self.buffer.is_empty() {
                        return Ok(true);
                    }
                }
                Step::Skip => {}
                Step::End => break,
            }
        }
        self.finished = true;
        Ok(false)
    }
}

impl Read for HexDecoder<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut written = 0;
        while written < buf.len() {
            if self.buffer_pos >= self.buffer.len() {
                let more = self
                    .fill_buffer()
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
                if !more {
                    break;
                }
            }
            let n = (buf.len() - written).min(self.buffer.len() - self.buffer_pos);
            buf[written..written + n]
                .copy_from_slice(&self.buffer[self.buffer_pos..self.buffer_pos + n]);
            self.buffer_pos += n;
            written += n;
        }
        self.bytes_read += written;
        Ok(written)
    }
}

fn at_line(err: DfuError, line: usize) -> DfuError {
    match err {
        DfuError::InvalidHex { reason, .. } => DfuError::InvalidHex { line, reason },
        other => other,
    }
}

/// Decode a whole HEX file, dropping everything below `mbr_size`.
pub fn hex_to_bin(data: &[u8], mbr_size: u32) -> DfuResult<Vec<u8>> {
    HexDecoder::new(data, mbr_size)?.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::fixtures::HexBuilder;

    #[test]
    fn test_size_matches_full_read() {
        let hex = HexBuilder::new()
            .data(0x0000, &[0xAA; 16])
            .data(0x1000, &[0x01; 16])
            .data(0x1010, &[0x02; 7])
            .eof()
            .build();

        let mut decoder = HexDecoder::new(hex.as_bytes(), 0x1000).unwrap();
        assert_eq!(decoder.size_in_bytes(), 23);

        let mut out = Vec::new();
        decoder.read_to_end(&mut out).unwrap();
        assert_eq!(out.len(), decoder.size_in_bytes());
        assert_eq!(decoder.available(), 0);
    }

    #[test]
    fn test_mbr_bytes_never_emitted() {
        let hex = HexBuilder::new()
            .data(0x0000, &[0xEE; 32])
            .data(0x0FF0, &[0xEE; 16])
            .data(0x1000, &[0x11, 0x22, 0x33, 0x44])
            .eof()
            .build();

        let bin = hex_to_bin(hex.as_bytes(), 0x1000).unwrap();
        assert_eq!(bin, vec![0x11, 0x22, 0x33, 0x44]);
        assert!(!bin.contains(&0xEE));
    }

    #[test]
    fn test_zero_mbr_keeps_everything() {
        let hex = HexBuilder::new()
            .data(0x0000, &[0x01, 0x02])
            .data(0x0002, &[0x03, 0x04])
            .eof()
            .build();

        assert_eq!(hex_to_bin(hex.as_bytes(), 0).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_contiguous_linear_segments() {
        let hex = HexBuilder::new()
            .extended_linear(0x0001)
            .data(0xFFFC, &[0x01, 0x02, 0x03, 0x04])
            .extended_linear(0x0002)
            .data(0x0000, &[0x05, 0x06, 0x07, 0x08])
            .eof()
            .build();

        let decoder = HexDecoder::new(hex.as_bytes(), 0x1000).unwrap();
        assert_eq!(decoder.size_in_bytes(), 8);
        assert_eq!(decoder.into_bytes().unwrap(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_discontinuous_jump_truncates_without_error() {
        let hex = HexBuilder::new()
            .extended_linear(0x0001)
            .data(0x0000, &[0x01, 0x02, 0x03, 0x04])
            // UICR-style jump far away from the image
            .extended_linear(0x1000)
            .data(0x1014, &[0xFF, 0xFF, 0xFF, 0xFF])
            .eof()
            .build();

        let decoder = HexDecoder::new(hex.as_bytes(), 0x1000).unwrap();
        assert_eq!(decoder.size_in_bytes(), 4);
        assert_eq!(decoder.into_bytes().unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_extended_segment_address() {
        // 0x1000 << 4 = 0x10000, the first segment above the MBR
        let hex = HexBuilder::new()
            .extended_segment(0x1000)
            .data(0x0000, &[0xDE, 0xAD, 0xBE, 0xEF])
            .extended_segment(0x2000)
            .data(0x0000, &[0x01, 0x02, 0x03, 0x04])
            .eof()
            .build();

        assert_eq!(
            hex_to_bin(hex.as_bytes(), 0x1000).unwrap(),
            vec![0xDE, 0xAD, 0xBE, 0xEF, 0x01, 0x02, 0x03, 0x04]
        );
    }

    #[test]
    fn test_unknown_records_skipped() {
        let hex = format!(
            "{}\n:0400000500001000E7\n{}\n{}",
            HexBuilder::record(0x1000, 0x00, &[0x01, 0x02]),
            HexBuilder::record(0x1002, 0x00, &[0x03, 0x04]),
            HexBuilder::record(0x0000, 0x01, &[])
        );
        assert_eq!(hex_to_bin(hex.as_bytes(), 0).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_eof_stops_decoding() {
        let hex = HexBuilder::new()
            .data(0x1000, &[0x01, 0x02])
            .eof()
            .data(0x1002, &[0x03, 0x04])
            .build();
        assert_eq!(hex_to_bin(hex.as_bytes(), 0x1000).unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_not_a_hex_file() {
        let result = HexDecoder::new(b"PK\x03\x04 binary garbage", 0x1000);
        assert!(matches!(
            result,
            Err(DfuError::InvalidHex { reason, .. }) if reason == "Not a HEX file"
        ));

        assert!(HexDecoder::new(b"", 0x1000).is_err());
    }

    #[test]
    fn test_crlf_and_lowercase() {
        let hex = HexBuilder::new()
            .data(0x1000, &[0xAB, 0xCD])
            .eof()
            .build()
            .replace('\n', "\r\n")
            .to_lowercase();
        assert_eq!(hex_to_bin(hex.as_bytes(), 0x1000).unwrap(), vec![0xAB, 0xCD]);
    }

    #[test]
    fn test_truncated_record_is_rejected() {
        let result = HexDecoder::new(b":10100000AABB\n", 0);
        assert!(matches!(result, Err(DfuError::InvalidHex { line: 1, .. })));
    }
}
