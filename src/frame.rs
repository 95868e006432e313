//! WebSocket frame decoding and encoding
//!
//! Inbound frames are decoded by [`FrameReceiver`], which accumulates bytes
//! across reads and answers one question: how many more bytes are needed
//! before a complete frame is available. The answer starts at the 2-byte
//! prefix, grows to the full header once the length byte is known, then to
//! header plus payload. Validation happens as soon as the relevant header
//! bytes are present, so a bad frame is rejected before its payload arrives.
//!
//! Outbound frames are [`ServerFrame`]s: FIN set, never masked, minimal
//! length encoding, header serialized once at construction.

use bytes::buf::Chain;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::mask::apply_mask;
use crate::{MEDIUM_MESSAGE_THRESHOLD, SMALL_MESSAGE_THRESHOLD};

/// Largest header of a server frame (2 + 8 bytes, no mask)
pub const MAX_SERVER_HEADER_SIZE: usize = 10;

/// WebSocket opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    /// Continuation frame
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
    /// Parse opcode from the low nibble of the first header byte
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

    /// Check if this is a control frame
    #[inline]
    pub fn is_control(&self) -> bool {
        (*self as u8) >= 0x8
    }

    /// Check if this is a data frame
    #[inline]
    pub fn is_data(&self) -> bool {
        (*self as u8) <= 0x2
    }
}

/// Reason a received frame was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    /// RSV1-3 set without a negotiated extension
    #[error("reserved bits must be 0")]
    ReservedBits,
    /// Opcode in the reserved ranges
    #[error("reserved opcode {0:#x}")]
    ReservedOpcode(u8),
    /// FIN unset or a continuation frame
    #[error("fragmented messages are not supported")]
    Fragmented,
    /// Mask bit unset on a client frame
    #[error("client frames must be masked")]
    Unmasked,
    /// Extended length used where a shorter encoding fits
    #[error("payload length not minimal")]
    NonMinimalLength,
    /// 64-bit length with the most significant bit set
    #[error("payload length MSB must be 0")]
    LengthOverflow,
    /// Control frame payload over 125 bytes
    #[error("control frame too large")]
    ControlTooLarge,
    /// Payload larger than the configured maximum
    #[error("frame of {0} bytes exceeds the maximum frame size")]
    TooLarge(u64),
}

/// A decoded client frame with its payload already unmasked
#[derive(Debug, Clone)]
pub struct Frame {
    /// Frame opcode
    pub opcode: OpCode,
    /// Unmasked payload
    pub payload: Bytes,
}

impl Frame {
    /// Status code carried by a Close frame, if any
    pub fn close_code(&self) -> Option<u16> {
        if self.opcode != OpCode::Close || self.payload.len() < 2 {
            return None;
        }
        Some(u16::from_be_bytes([self.payload[0], self.payload[1]]))
    }
}

/// Parsed header of a frame whose header bytes are all buffered
#[derive(Debug, Clone, Copy)]
struct Header {
    opcode: OpCode,
    header_len: usize,
    payload_len: usize,
    mask: [u8; 4],
}

/// Result of looking at the front of the decode buffer
enum Peek {
    /// The header is incomplete; this many bytes are needed in total
    Partial(usize),
    Header(Header),
}

fn peek_header(buf: &[u8], max_frame_size: usize) -> Result<Peek, FrameError> {
    if buf.len() < 2 {
        return Ok(Peek::Partial(2));
    }

    let b0 = buf[0];
    let b1 = buf[1];

    if b0 & 0x70 != 0 {
        return Err(FrameError::ReservedBits);
    }

    let raw_opcode = b0 & 0x0F;
    let opcode = OpCode::from_u8(raw_opcode).ok_or(FrameError::ReservedOpcode(raw_opcode))?;
    let fin = b0 & 0x80 != 0;
    if !fin || opcode == OpCode::Continuation {
        return Err(FrameError::Fragmented);
    }

    if b1 & 0x80 == 0 {
        return Err(FrameError::Unmasked);
    }

    let len_byte = b1 & 0x7F;
    let extended = match len_byte {
        126 => 2,
        127 => 8,
        _ => 0,
    };
    let header_len = 2 + extended + 4;
    if buf.len() < header_len {
        return Ok(Peek::Partial(header_len));
    }

    let payload_len = match len_byte {
        126 => {
            let len = u16::from_be_bytes([buf[2], buf[3]]) as u64;
            if len <= SMALL_MESSAGE_THRESHOLD as u64 {
                return Err(FrameError::NonMinimalLength);
            }
            len
        }
        127 => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[2..10]);
            let len = u64::from_be_bytes(raw);
            if len >> 63 != 0 {
                return Err(FrameError::LengthOverflow);
            }
            if len <= MEDIUM_MESSAGE_THRESHOLD as u64 {
                return Err(FrameError::NonMinimalLength);
            }
            len
        }
        short => short as u64,
    };

    if opcode.is_control() && payload_len > SMALL_MESSAGE_THRESHOLD as u64 {
        return Err(FrameError::ControlTooLarge);
    }
    if payload_len > max_frame_size as u64 {
        return Err(FrameError::TooLarge(payload_len));
    }

    let mut mask = [0u8; 4];
    mask.copy_from_slice(&buf[header_len - 4..header_len]);

    Ok(Peek::Header(Header {
        opcode,
        header_len,
        // Bounded by max_frame_size above
        payload_len: payload_len as usize,
        mask,
    }))
}

/// Incremental decoder for client frames
///
/// Bytes are appended through [`buffer_mut`](Self::buffer_mut) (for
/// `read_buf`) or [`extend`](Self::extend). [`needed`](Self::needed)
/// reports how many more bytes a complete frame requires, and
/// [`take_frame`](Self::take_frame) splits that frame off the front while
/// keeping any bytes that belong to the next one.
#[derive(Debug)]
pub struct FrameReceiver {
    buf: BytesMut,
    max_frame_size: usize,
}

impl FrameReceiver {
    /// Create a receiver with an empty buffer of the given capacity
    pub fn new(max_frame_size: usize, capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            max_frame_size,
        }
    }

    /// Create a receiver seeded with bytes read past the handshake
    pub fn with_leftover(max_frame_size: usize, leftover: BytesMut) -> Self {
        Self {
            buf: leftover,
            max_frame_size,
        }
    }

    /// Buffer to read into
    #[inline]
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Append received bytes
    #[inline]
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of bytes buffered and not yet consumed
    #[inline]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// How many more bytes are needed before [`take_frame`](Self::take_frame)
    /// yields a frame. `Ok(0)` means a complete frame is buffered.
    pub fn needed(&self) -> Result<usize, FrameError> {
        match peek_header(&self.buf, self.max_frame_size)? {
            Peek::Partial(total) => Ok(total - self.buf.len()),
            Peek::Header(header) => {
                Ok((header.header_len + header.payload_len).saturating_sub(self.buf.len()))
            }
        }
    }

    /// Split the next complete frame off the buffer and unmask it
    ///
    /// Returns `Ok(None)` when more bytes are needed.
    pub fn take_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        let header = match peek_header(&self.buf, self.max_frame_size)? {
            Peek::Partial(_) => return Ok(None),
            Peek::Header(header) => header,
        };

        if self.buf.len() < header.header_len + header.payload_len {
            return Ok(None);
        }

        self.buf.advance(header.header_len);
        let mut payload = self.buf.split_to(header.payload_len);
        apply_mask(&mut payload, header.mask);

        Ok(Some(Frame {
            opcode: header.opcode,
            payload: payload.freeze(),
        }))
    }
}

/// An outbound frame with its header serialized up front
#[derive(Debug, Clone)]
pub struct ServerFrame {
    opcode: OpCode,
    header: [u8; MAX_SERVER_HEADER_SIZE],
    header_len: u8,
    payload: Bytes,
}

impl ServerFrame {
    /// Build a final, unmasked frame
    pub fn new(opcode: OpCode, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        let len = payload.len();

        let mut header = [0u8; MAX_SERVER_HEADER_SIZE];
        header[0] = 0x80 | opcode as u8;

        let header_len = if len <= SMALL_MESSAGE_THRESHOLD {
            header[1] = len as u8;
            2
        } else if len <= MEDIUM_MESSAGE_THRESHOLD {
            header[1] = 126;
            header[2..4].copy_from_slice(&(len as u16).to_be_bytes());
            4
        } else {
            header[1] = 127;
            header[2..10].copy_from_slice(&(len as u64).to_be_bytes());
            10
        };

        Self {
            opcode,
            header,
            header_len,
            payload,
        }
    }

    /// Build a Close frame, optionally carrying a status code
    pub fn close(code: Option<u16>) -> Self {
        match code {
            Some(code) => Self::new(OpCode::Close, Bytes::copy_from_slice(&code.to_be_bytes())),
            None => Self::new(OpCode::Close, Bytes::new()),
        }
    }

    /// Frame opcode
    #[inline]
    pub fn opcode(&self) -> OpCode {
        self.opcode
    }

    /// Serialized header bytes
    #[inline]
    pub fn header(&self) -> &[u8] {
        &self.header[..self.header_len as usize]
    }

    /// Payload bytes
    #[inline]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Total size on the wire
    #[inline]
    pub fn wire_len(&self) -> usize {
        self.header_len as usize + self.payload.len()
    }

    /// Header followed by payload, for vectored writes
    #[inline]
    pub fn as_buf(&self) -> Chain<&[u8], Bytes> {
        self.header().chain(self.payload.clone())
    }
}

/// Encode a frame into a buffer
///
/// With a mask this produces client-role frames; the server itself only
/// sends [`ServerFrame`]s.
pub fn encode_frame(
    buf: &mut BytesMut,
    opcode: OpCode,
    payload: &[u8],
    fin: bool,
    mask: Option<[u8; 4]>,
) {
    let payload_len = payload.len();

    let header_size = 2 + if payload_len > MEDIUM_MESSAGE_THRESHOLD {
        8
    } else if payload_len > SMALL_MESSAGE_THRESHOLD {
        2
    } else {
        0
    } + if mask.is_some() { 4 } else { 0 };

    buf.reserve(header_size + payload_len);

    let mut b0 = opcode as u8;
    if fin {
        b0 |= 0x80;
    }
    buf.put_u8(b0);

    let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };

    if payload_len <= SMALL_MESSAGE_THRESHOLD {
        buf.put_u8(mask_bit | payload_len as u8);
    } else if payload_len <= MEDIUM_MESSAGE_THRESHOLD {
        buf.put_u8(mask_bit | 126);
        buf.put_u16(payload_len as u16);
    } else {
        buf.put_u8(mask_bit | 127);
        buf.put_u64(payload_len as u64);
    }

    if let Some(m) = mask {
        buf.put_slice(&m);

        let start = buf.len();
        buf.put_slice(payload);
        apply_mask(&mut buf[start..], m);
    } else {
        buf.put_slice(payload);
    }
}
