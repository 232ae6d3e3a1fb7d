// src/io/slcan/codec.rs
//
// slcan (Serial Line CAN) ASCII protocol codec.
//
// Protocol reference: http://www.can232.com/docs/can232_v3.pdf
//
// Frame formats:
//   Standard: t<ID:3hex><DLC:1><DATA:2hex*DLC>[TS:4hex]\r
//   Extended: T<ID:8hex><DLC:1><DATA:2hex*DLC>[TS:4hex]\r
//
// The adapter optionally appends a 4-digit millisecond timestamp before the
// terminator. Its presence is only detectable by peeking at the byte where
// the terminator would be: a hex digit there means a timestamp follows.

use crate::io::{CanFrame, IoError, CAN_MAX_DLEN};

pub const EXTENDED_MARKER: u8 = b'T';
pub const STANDARD_MARKER: u8 = b't';
pub const TERMINATOR: u8 = b'\r';

/// Hardware timestamp unit (the adapter counts milliseconds)
const HW_TIMESTAMP_RESOLUTION: f64 = 1e-3;
const HW_TIMESTAMP_DIGITS: usize = 4;

/// A frame pulled out of the byte stream, before host timestamps are attached
#[derive(Clone, Debug, PartialEq)]
pub struct DecodedFrame {
    pub frame: CanFrame,
    /// Adapter timestamp in seconds, wrapping every 60 s
    pub hw_timestamp: Option<f64>,
}

enum Fragment {
    /// Not enough bytes yet; keep them for the next read
    Incomplete,
    Malformed(IoError),
    Complete {
        decoded: DecodedFrame,
        len: usize,
    },
}

/// slcan ASCII protocol codec.
pub struct SlcanCodec;

impl SlcanCodec {
    /// Scan `buf` for frames.
    ///
    /// The returned iterator yields frames lazily; once it is exhausted,
    /// [`FrameDecoder::consumed`] tells how many leading bytes the caller can
    /// drop (decoded frames and garbage). The rest is a partial frame that
    /// must be kept and prefixed to the next read.
    pub fn decode(buf: &[u8]) -> FrameDecoder<'_> {
        FrameDecoder {
            buf,
            pos: 0,
            malformed: 0,
            last_error: None,
            done: false,
        }
    }

    /// Encode a CAN frame to slcan ASCII format, including the trailing `\r`.
    pub fn encode(frame: &CanFrame) -> Vec<u8> {
        let mut cmd = String::with_capacity(1 + 8 + 1 + CAN_MAX_DLEN * 2 + 1);

        // Frame type prefix and ID
        if frame.is_extended() {
            cmd.push(EXTENDED_MARKER as char);
            cmd.push_str(&format!("{:08X}", frame.id()));
        } else {
            cmd.push(STANDARD_MARKER as char);
            cmd.push_str(&format!("{:03X}", frame.id()));
        }

        // DLC
        cmd.push_str(&format!("{:X}", frame.dlc()));

        // Data bytes
        cmd.push_str(&hex::encode_upper(frame.data()));

        cmd.push(TERMINATOR as char);
        cmd.into_bytes()
    }
}

/// One-shot iterator over the frames found in a buffer.
pub struct FrameDecoder<'a> {
    buf: &'a [u8],
    pos: usize,
    malformed: usize,
    last_error: Option<IoError>,
    done: bool,
}

impl<'a> FrameDecoder<'a> {
    /// Leading bytes fully consumed so far
    pub fn consumed(&self) -> usize {
        self.pos
    }

    /// Marker bytes skipped because the fragment behind them did not parse
    pub fn malformed(&self) -> usize {
        self.malformed
    }

    /// Why the most recent malformed fragment was rejected
    pub fn last_error(&self) -> Option<&IoError> {
        self.last_error.as_ref()
    }
}

impl<'a> Iterator for FrameDecoder<'a> {
    type Item = DecodedFrame;

    fn next(&mut self) -> Option<DecodedFrame> {
        while !self.done {
            let rest = &self.buf[self.pos..];
            let start = match rest
                .iter()
                .position(|b| *b == EXTENDED_MARKER || *b == STANDARD_MARKER)
            {
                Some(offset) => offset,
                None => {
                    // Nothing but garbage left
                    self.pos = self.buf.len();
                    self.done = true;
                    break;
                }
            };
            self.pos += start;

            match parse_fragment(&self.buf[self.pos..]) {
                Fragment::Incomplete => self.done = true,
                Fragment::Malformed(err) => {
                    self.malformed += 1;
                    self.last_error = Some(err);
                    self.pos += 1;
                }
                Fragment::Complete { decoded, len } => {
                    self.pos += len;
                    return Some(decoded);
                }
            }
        }
        None
    }
}

/// Parse the fragment starting at `buf[0]`, which is a frame marker.
fn parse_fragment(buf: &[u8]) -> Fragment {
    let extended = buf[0] == EXTENDED_MARKER;
    let id_len = if extended { 8 } else { 3 };

    // Shortest message is marker + ID + '0'
    if buf.len() < id_len + 2 {
        return Fragment::Incomplete;
    }

    let id = match parse_hex(&buf[1..1 + id_len]) {
        Some(id) => id,
        None => {
            return Fragment::Malformed(IoError::malformed(format!(
                "invalid hex ID: {:?}",
                String::from_utf8_lossy(&buf[1..1 + id_len])
            )))
        }
    };

    let dlc = match buf[1 + id_len] {
        b @ b'0'..=b'8' => (b - b'0') as usize,
        other => {
            return Fragment::Malformed(IoError::malformed(format!(
                "invalid DLC character: {:?}",
                other as char
            )))
        }
    };

    // <marker> <id> <dlc> <data>          [timestamp] \r
    // 1        3|8  1     dlc * 2         [4]         1
    let data_start = 2 + id_len;
    let data_end = data_start + dlc * 2;
    let mut total = data_end + 1;
    if buf.len() < total {
        return Fragment::Incomplete;
    }

    let with_timestamp = buf[total - 1].is_ascii_hexdigit();
    if with_timestamp {
        // The timestamp ends where the terminator was expected plus 3 bytes.
        // The real terminator is left behind and skipped by the next scan.
        total += HW_TIMESTAMP_DIGITS - 1;
        if buf.len() < total {
            return Fragment::Incomplete;
        }
    }

    let mut data = [0u8; CAN_MAX_DLEN];
    if let Err(e) = hex::decode_to_slice(&buf[data_start..data_end], &mut data[..dlc]) {
        return Fragment::Malformed(IoError::malformed(format!("invalid payload: {}", e)));
    }

    let hw_timestamp = if with_timestamp {
        match parse_hex(&buf[total - HW_TIMESTAMP_DIGITS..total]) {
            Some(ticks) => Some(ticks as f64 * HW_TIMESTAMP_RESOLUTION),
            None => return Fragment::Malformed(IoError::malformed("invalid hardware timestamp")),
        }
    } else {
        None
    };

    match CanFrame::new(id, &data[..dlc], extended) {
        Ok(frame) => Fragment::Complete {
            decoded: DecodedFrame { frame, hw_timestamp },
            len: total,
        },
        Err(e) => Fragment::Malformed(e),
    }
}

/// Case-insensitive hex digits to integer, at most 8 digits.
fn parse_hex(digits: &[u8]) -> Option<u32> {
    digits.iter().try_fold(0u32, |acc, &c| {
        let nibble = (c as char).to_digit(16)?;
        Some((acc << 4) | nibble)
    })
}

// ============================================================================
// Tests
// ============================================================================
