//! RFC 6455 frame reading and writing
//!
//! The [`FrameReader`] is a plain state machine: each call to [`step`]
//! consumes whatever bytes are available in the connection's read buffer
//! (including any spill left over from the HTTP parse) and either completes
//! a frame or reports that more bytes are needed. Partial progress — header
//! fields, the mask key, accumulated payload — lives in the reader between
//! calls, so payload bytes leave the read buffer as soon as they arrive and
//! are unmasked on the way.
//!
//! [`step`]: FrameReader::step

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{CloseReason, Error, Result};
use crate::mask::apply_mask_offset;
use crate::utf8::validate_utf8;

/// Largest payload encodable with the 7-bit length seed
pub const MAX_SHORT_PAYLOAD: usize = 125;
/// Largest payload encodable with the 16-bit extended length
pub const MAX_EXTENDED16_PAYLOAD: usize = 65_535;
/// Worst-case frame header size (2 + 8 + 4)
pub const MAX_HEADER_SIZE: usize = 14;

/// WebSocket opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    /// Continuation of a fragmented message
    Continuation = 0x0,
    /// Text frame
    Text = 0x1,
    /// Binary frame
    Binary = 0x2,
    /// Connection close
    Close = 0x8,
    /// Ping
    Ping = 0x9,
    /// Pong
    Pong = 0xA,
}

impl OpCode {
    /// Parse an opcode nibble; reserved opcodes return None
    #[inline]
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x0 => Some(OpCode::Continuation),
            0x1 => Some(OpCode::Text),
            0x2 => Some(OpCode::Binary),
            0x8 => Some(OpCode::Close),
            0x9 => Some(OpCode::Ping),
            0xA => Some(OpCode::Pong),
            _ => None,
        }
    }

    /// Close/Ping/Pong
    #[inline]
    pub fn is_control(&self) -> bool {
        (*self as u8) >= 0x8
    }

    /// Continuation/Text/Binary
    #[inline]
    pub fn is_data(&self) -> bool {
        (*self as u8) <= 0x2
    }
}

/// One parsed or to-be-sent frame
#[derive(Debug, Clone)]
pub struct Frame {
    /// Frame opcode
    pub opcode: OpCode,
    /// Final-fragment flag
    pub fin: bool,
    /// Payload, already unmasked
    pub payload: Bytes,
}

impl Frame {
    /// Frame with explicit fields
    pub fn new(opcode: OpCode, payload: impl Into<Bytes>, fin: bool) -> Self {
        Self {
            opcode,
            fin,
            payload: payload.into(),
        }
    }

    /// Final text frame
    #[inline]
    pub fn text(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Text, data, true)
    }

    /// Final binary frame
    #[inline]
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Binary, data, true)
    }

    /// Ping with payload
    #[inline]
    pub fn ping(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Ping, data, true)
    }

    /// Pong with payload
    #[inline]
    pub fn pong(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Pong, data, true)
    }

    /// Close with status code and reason text
    pub fn close(code: u16, reason: &str) -> Self {
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.put_u16(code);
        payload.put_slice(reason.as_bytes());
        Self::new(OpCode::Close, payload.freeze(), true)
    }

    /// Close with no status
    #[inline]
    pub fn close_empty() -> Self {
        Self::new(OpCode::Close, Bytes::new(), true)
    }

    /// Close/Ping/Pong
    #[inline]
    pub fn is_control(&self) -> bool {
        self.opcode.is_control()
    }

    /// Decode and validate the payload of a Close frame
    pub fn close_reason(&self) -> Result<Option<CloseReason>> {
        match self.payload.len() {
            0 => Ok(None),
            1 => Err(Error::Protocol("close payload of one byte")),
            _ => {
                let code = u16::from_be_bytes([self.payload[0], self.payload[1]]);
                if !CloseReason::is_valid_code(code) {
                    return Err(Error::InvalidCloseCode(code));
                }
                let text = &self.payload[2..];
                if !validate_utf8(text) {
                    return Err(Error::InvalidUtf8);
                }
                Ok(Some(CloseReason::new(
                    code,
                    String::from_utf8_lossy(text).into_owned(),
                )))
            }
        }
    }

    /// Serialize this frame, server-to-client style (no mask)
    pub fn encode(&self, buf: &mut BytesMut) {
        encode_frame(buf, self.opcode, &self.payload, self.fin, None);
    }
}

/// Serialize one frame; `mask` is mandatory for client-to-server frames
/// and must be absent for server-to-client frames
pub fn encode_frame(
    buf: &mut BytesMut,
    opcode: OpCode,
    payload: &[u8],
    fin: bool,
    mask: Option<[u8; 4]>,
) {
    let len = payload.len();
    let header = 2
        + if len > MAX_EXTENDED16_PAYLOAD {
            8
        } else if len > MAX_SHORT_PAYLOAD {
            2
        } else {
            0
        }
        + if mask.is_some() { 4 } else { 0 };
    buf.reserve(header + len);

    let mut b0 = opcode as u8;
    if fin {
        b0 |= 0x80;
    }
    buf.put_u8(b0);

    let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };
    if len <= MAX_SHORT_PAYLOAD {
        buf.put_u8(mask_bit | len as u8);
    } else if len <= MAX_EXTENDED16_PAYLOAD {
        buf.put_u8(mask_bit | 126);
        buf.put_u16(len as u16);
    } else {
        buf.put_u8(mask_bit | 127);
        buf.put_u64(len as u64);
    }

    match mask {
        Some(key) => {
            buf.put_slice(&key);
            let start = buf.len();
            buf.put_slice(payload);
            apply_mask_offset(&mut buf[start..], key, 0);
        }
        None => buf.put_slice(payload),
    }
}

/// Result of one reader step
#[derive(Debug)]
pub enum Step {
    /// The buffer ran dry before a frame completed
    NeedsMore,
    /// One full frame was assembled
    Done(Frame),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    WaitHeader2,
    WaitExtLen,
    WaitMask,
    WaitPayload,
}

/// Incremental frame parser, one per connection
pub struct FrameReader {
    state: ReadState,
    expect_masked: bool,
    max_frame_size: usize,
    fin: bool,
    opcode: OpCode,
    masked: bool,
    len_seed: u8,
    payload_len: u64,
    mask: [u8; 4],
    payload: BytesMut,
}

impl FrameReader {
    /// Reader for one side of a connection; servers set `expect_masked`
    pub fn new(expect_masked: bool, max_frame_size: usize) -> Self {
        Self {
            state: ReadState::WaitHeader2,
            expect_masked,
            max_frame_size,
            fin: false,
            opcode: OpCode::Continuation,
            masked: false,
            len_seed: 0,
            payload_len: 0,
            mask: [0; 4],
            payload: BytesMut::new(),
        }
    }

    /// Consume available bytes from `buf`; either completes one frame or
    /// stores partial progress and asks for more
    pub fn step(&mut self, buf: &mut BytesMut) -> Result<Step> {
        loop {
            match self.state {
                ReadState::WaitHeader2 => {
                    if buf.len() < 2 {
                        return Ok(Step::NeedsMore);
                    }
                    let b0 = buf[0];
                    let b1 = buf[1];
                    if b0 & 0x70 != 0 {
                        return Err(Error::Protocol("reserved bits must be zero"));
                    }
                    self.opcode = OpCode::from_u8(b0 & 0x0F)
                        .ok_or(Error::InvalidFrame("reserved opcode"))?;
                    self.fin = b0 & 0x80 != 0;
                    if self.opcode.is_control() && !self.fin {
                        return Err(Error::Protocol("fragmented control frame"));
                    }
                    self.masked = b1 & 0x80 != 0;
                    if self.expect_masked && !self.masked {
                        return Err(Error::Protocol("client frame not masked"));
                    }
                    if !self.expect_masked && self.masked {
                        return Err(Error::Protocol("server frame masked"));
                    }
                    self.len_seed = b1 & 0x7F;
                    if self.opcode.is_control() && self.len_seed > 125 {
                        return Err(Error::Protocol("control frame too large"));
                    }
                    buf.advance(2);
                    if self.len_seed <= 125 {
                        self.begin_payload(self.len_seed as u64)?;
                    } else {
                        self.state = ReadState::WaitExtLen;
                    }
                }

                ReadState::WaitExtLen => {
                    if self.len_seed == 126 {
                        if buf.len() < 2 {
                            return Ok(Step::NeedsMore);
                        }
                        let len = u16::from_be_bytes([buf[0], buf[1]]) as u64;
                        if len < 126 {
                            return Err(Error::Protocol("payload length not minimal"));
                        }
                        buf.advance(2);
                        self.begin_payload(len)?;
                    } else {
                        if buf.len() < 8 {
                            return Ok(Step::NeedsMore);
                        }
                        let len = u64::from_be_bytes([
                            buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
                        ]);
                        if len <= MAX_EXTENDED16_PAYLOAD as u64 {
                            return Err(Error::Protocol("payload length not minimal"));
                        }
                        if len >> 63 != 0 {
                            return Err(Error::Protocol("payload length high bit set"));
                        }
                        buf.advance(8);
                        self.begin_payload(len)?;
                    }
                }

                ReadState::WaitMask => {
                    if buf.len() < 4 {
                        return Ok(Step::NeedsMore);
                    }
                    self.mask = [buf[0], buf[1], buf[2], buf[3]];
                    buf.advance(4);
                    self.state = ReadState::WaitPayload;
                }

                ReadState::WaitPayload => {
                    let have = self.payload.len() as u64;
                    let remaining = (self.payload_len - have) as usize;
                    if remaining > 0 {
                        if buf.is_empty() {
                            return Ok(Step::NeedsMore);
                        }
                        let take = remaining.min(buf.len());
                        let mut chunk = buf.split_to(take);
                        if self.masked {
                            apply_mask_offset(&mut chunk, self.mask, have as usize);
                        }
                        self.payload.unsplit(chunk);
                    }
                    if (self.payload.len() as u64) < self.payload_len {
                        return Ok(Step::NeedsMore);
                    }
                    let frame = Frame {
                        opcode: self.opcode,
                        fin: self.fin,
                        payload: self.payload.split().freeze(),
                    };
                    self.state = ReadState::WaitHeader2;
                    return Ok(Step::Done(frame));
                }
            }
        }
    }

    fn begin_payload(&mut self, len: u64) -> Result<()> {
        if len > self.max_frame_size as u64 {
            return Err(Error::FrameTooLarge);
        }
        self.payload_len = len;
        self.payload.clear();
        self.state = if self.masked {
            ReadState::WaitMask
        } else {
            ReadState::WaitPayload
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask::apply_mask;

    const LIMIT: usize = 16 * 1024 * 1024;

    fn read_one(reader: &mut FrameReader, buf: &mut BytesMut) -> Frame {
        match reader.step(buf).unwrap() {
            Step::Done(frame) => frame,
            Step::NeedsMore => panic!("frame incomplete"),
        }
    }

    #[test]
    fn masked_hello_sample() {
        // Spec sample bytes: FIN+Text, masked, "Hello"
        let mut buf = BytesMut::from(
            &[0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58][..],
        );
        let mut reader = FrameReader::new(true, LIMIT);
        let frame = read_one(&mut reader, &mut buf);
        assert_eq!(frame.opcode, OpCode::Text);
        assert!(frame.fin);
        assert_eq!(&frame.payload[..], b"Hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn roundtrip_boundary_sizes() {
        for &len in &[0usize, 1, 125, 126, 127, 65_535, 65_536, 1_048_576] {
            let payload: Vec<u8> = (0..len).map(|i| (i * 31) as u8).collect();
            let mask = [0xA1, 0xB2, 0xC3, 0xD4];

            let mut wire = BytesMut::new();
            encode_frame(&mut wire, OpCode::Binary, &payload, true, Some(mask));

            let mut reader = FrameReader::new(true, LIMIT);
            let frame = read_one(&mut reader, &mut wire);
            assert_eq!(frame.opcode, OpCode::Binary);
            assert_eq!(frame.payload.len(), len, "len {}", len);
            assert_eq!(&frame.payload[..], &payload[..], "len {}", len);
        }
    }

    #[test]
    fn stepwise_delivery_one_byte_at_a_time() {
        let payload = b"stepwise payload delivery";
        let mask = [0x01, 0x02, 0x03, 0x04];
        let mut wire = BytesMut::new();
        encode_frame(&mut wire, OpCode::Text, payload, true, Some(mask));

        let mut reader = FrameReader::new(true, LIMIT);
        let mut buf = BytesMut::new();
        let mut result = None;
        for byte in wire.iter() {
            buf.put_u8(*byte);
            match reader.step(&mut buf).unwrap() {
                Step::Done(frame) => {
                    result = Some(frame);
                    break;
                }
                Step::NeedsMore => {}
            }
        }
        let frame = result.expect("frame never completed");
        assert_eq!(&frame.payload[..], payload);
    }

    #[test]
    fn two_frames_in_one_buffer() {
        let mut wire = BytesMut::new();
        encode_frame(&mut wire, OpCode::Text, b"one", true, Some([0; 4]));
        encode_frame(&mut wire, OpCode::Text, b"two", true, Some([9; 4]));

        let mut reader = FrameReader::new(true, LIMIT);
        let first = read_one(&mut reader, &mut wire);
        assert_eq!(&first.payload[..], b"one");
        let second = read_one(&mut reader, &mut wire);
        assert_eq!(&second.payload[..], b"two");
        assert!(wire.is_empty());
    }

    #[test]
    fn zero_length_text() {
        let mut wire = BytesMut::new();
        encode_frame(&mut wire, OpCode::Text, b"", true, Some([5; 4]));
        let mut reader = FrameReader::new(true, LIMIT);
        let frame = read_one(&mut reader, &mut wire);
        assert_eq!(frame.opcode, OpCode::Text);
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn unmasked_client_frame_rejected() {
        let mut buf = BytesMut::from(&[0x81, 0x03, b'a', b'b', b'c'][..]);
        let mut reader = FrameReader::new(true, LIMIT);
        assert!(matches!(reader.step(&mut buf), Err(Error::Protocol(_))));
    }

    #[test]
    fn masked_server_frame_rejected() {
        let mut buf = BytesMut::from(&[0x81, 0x83, 0, 0, 0, 0, b'a', b'b', b'c'][..]);
        let mut reader = FrameReader::new(false, LIMIT);
        assert!(matches!(reader.step(&mut buf), Err(Error::Protocol(_))));
    }

    #[test]
    fn reserved_opcode_rejected() {
        let mut buf = BytesMut::from(&[0x83, 0x80, 0, 0, 0, 0][..]);
        let mut reader = FrameReader::new(true, LIMIT);
        assert!(matches!(reader.step(&mut buf), Err(Error::InvalidFrame(_))));
    }

    #[test]
    fn reserved_bits_rejected() {
        let mut buf = BytesMut::from(&[0xC1, 0x80, 0, 0, 0, 0][..]);
        let mut reader = FrameReader::new(true, LIMIT);
        assert!(matches!(reader.step(&mut buf), Err(Error::Protocol(_))));
    }

    #[test]
    fn fragmented_control_rejected() {
        let mut buf = BytesMut::from(&[0x09, 0x80, 0, 0, 0, 0][..]); // Ping, FIN=0
        let mut reader = FrameReader::new(true, LIMIT);
        assert!(matches!(reader.step(&mut buf), Err(Error::Protocol(_))));
    }

    #[test]
    fn oversized_control_rejected() {
        let mut buf = BytesMut::from(&[0x88, 0xFE][..]); // Close with 16-bit length
        let mut reader = FrameReader::new(true, LIMIT);
        assert!(matches!(reader.step(&mut buf), Err(Error::Protocol(_))));
    }

    #[test]
    fn non_minimal_lengths_rejected() {
        // 16-bit form carrying a value < 126
        let mut buf = BytesMut::new();
        buf.put_slice(&[0x82, 0xFE]);
        buf.put_u16(10);
        let mut reader = FrameReader::new(true, LIMIT);
        assert!(matches!(reader.step(&mut buf), Err(Error::Protocol(_))));

        // 64-bit form carrying a value <= 65535
        let mut buf = BytesMut::new();
        buf.put_slice(&[0x82, 0xFF]);
        buf.put_u64(100);
        let mut reader = FrameReader::new(true, LIMIT);
        assert!(matches!(reader.step(&mut buf), Err(Error::Protocol(_))));
    }

    #[test]
    fn frame_size_limit_enforced() {
        let mut wire = BytesMut::new();
        encode_frame(&mut wire, OpCode::Binary, &[0u8; 2048], true, Some([1; 4]));
        let mut reader = FrameReader::new(true, 1024);
        assert!(matches!(reader.step(&mut wire), Err(Error::FrameTooLarge)));
    }

    #[test]
    fn encoder_header_forms() {
        let mut buf = BytesMut::new();
        encode_frame(&mut buf, OpCode::Text, b"ping", true, None);
        assert_eq!(&buf[..], &[0x81, 0x04, b'p', b'i', b'n', b'g']);

        let mut buf = BytesMut::new();
        encode_frame(&mut buf, OpCode::Binary, &[7u8; 126], true, None);
        assert_eq!(buf[0], 0x82);
        assert_eq!(buf[1], 126);
        assert_eq!(u16::from_be_bytes([buf[2], buf[3]]), 126);
        assert_eq!(buf.len(), 4 + 126);

        let mut buf = BytesMut::new();
        encode_frame(&mut buf, OpCode::Binary, &[7u8; 65_536], true, None);
        assert_eq!(buf[1], 127);
        let len = u64::from_be_bytes([
            buf[2], buf[3], buf[4], buf[5], buf[6], buf[7], buf[8], buf[9],
        ]);
        assert_eq!(len, 65_536);
        assert_eq!(buf.len(), 10 + 65_536);
    }

    #[test]
    fn encoder_masks_payload() {
        let mask = [0x11, 0x22, 0x33, 0x44];
        let mut buf = BytesMut::new();
        encode_frame(&mut buf, OpCode::Text, b"test", true, Some(mask));
        assert_eq!(buf[1] & 0x80, 0x80);
        assert_eq!(&buf[2..6], &mask);
        let mut payload = buf[6..].to_vec();
        apply_mask(&mut payload, mask);
        assert_eq!(&payload, b"test");
    }

    #[test]
    fn close_reason_validation() {
        let frame = Frame::close(1000, "bye");
        let reason = frame.close_reason().unwrap().unwrap();
        assert_eq!(reason.code, 1000);
        assert_eq!(reason.reason, "bye");

        assert!(Frame::close_empty().close_reason().unwrap().is_none());

        let bad = Frame::new(OpCode::Close, vec![0x03u8], true);
        assert!(bad.close_reason().is_err());

        let bad_code = Frame::close(999, "");
        assert!(matches!(
            bad_code.close_reason(),
            Err(Error::InvalidCloseCode(999))
        ));
    }
}
