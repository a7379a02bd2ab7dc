use bytes::{BufMut, Bytes, BytesMut};

use crate::quic::error::{ProtocolError, Result};
use crate::quic::stream::StreamId;

/// Largest value a variable-length integer can carry
pub const MAX_VARINT: u64 = (1 << 62) - 1;

const STREAM_FIN_BIT: u8 = 0x01;
const STREAM_LEN_BIT: u8 = 0x02;
const STREAM_OFF_BIT: u8 = 0x04;

// guards against absurd range counts in hostile ACK frames
const MAX_ACK_RANGES: u64 = 1024;

/// Frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Padding = 0x00,
    Ping = 0x01,
    Ack = 0x02,
    StopSending = 0x05,
    Stream = 0x08,
    MaxStreamData = 0x11,
    ConnectionClose = 0x1c,
}

impl FrameType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(FrameType::Padding),
            0x01 => Some(FrameType::Ping),
            0x02 => Some(FrameType::Ack),
            0x05 => Some(FrameType::StopSending),
            0x08..=0x0f => Some(FrameType::Stream),
            0x11 => Some(FrameType::MaxStreamData),
            0x1c => Some(FrameType::ConnectionClose),
            _ => None,
        }
    }
}

/// Frames
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Padding {
        length: usize,
    },
    Ping,
    Ack {
        largest_acknowledged: u64,
        /// Microseconds between receipt of the largest packet and this ACK
        ack_delay: u64,
        /// Inclusive `(smallest, largest)` ranges, descending
        ack_ranges: Vec<(u64, u64)>,
    },
    StopSending {
        stream_id: StreamId,
        application_error_code: u64,
    },
    Stream {
        stream_id: StreamId,
        offset: u64,
        data: Bytes,
        fin: bool,
    },
    MaxStreamData {
        stream_id: StreamId,
        maximum_stream_data: u64,
    },
    ConnectionClose {
        error_code: u64,
        frame_type: Option<u64>,
        reason_phrase: String,
    },
}

impl Frame {
    /// Whether receipt of this frame obliges the receiver to acknowledge it
    pub fn is_ack_eliciting(&self) -> bool {
        !matches!(
            self,
            Frame::Padding { .. } | Frame::Ack { .. } | Frame::ConnectionClose { .. }
        )
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode_to(&mut buf);
        buf.freeze()
    }

    pub fn encode_to(&self, buf: &mut BytesMut) {
        match self {
            Frame::Padding { length } => {
                buf.put_bytes(0, *length);
            }
            Frame::Ping => {
                buf.put_u8(FrameType::Ping as u8);
            }
            Frame::Ack {
                largest_acknowledged,
                ack_delay,
                ack_ranges,
            } => {
                debug_assert!(ack_ranges.first().is_some_and(|&(_, hi)| hi == *largest_acknowledged));
                buf.put_u8(FrameType::Ack as u8);
                encode_varint(buf, *largest_acknowledged);
                encode_varint(buf, *ack_delay);
                encode_varint(buf, ack_ranges.len().saturating_sub(1) as u64);

                let mut ranges = ack_ranges.iter();
                let mut smallest = match ranges.next() {
                    Some(&(lo, hi)) => {
                        encode_varint(buf, hi - lo);
                        lo
                    }
                    None => {
                        encode_varint(buf, 0);
                        *largest_acknowledged
                    }
                };
                for &(lo, hi) in ranges {
                    encode_varint(buf, smallest - hi - 2);
                    encode_varint(buf, hi - lo);
                    smallest = lo;
                }
            }
            Frame::StopSending {
                stream_id,
                application_error_code,
            } => {
                buf.put_u8(FrameType::StopSending as u8);
                encode_varint(buf, stream_id.value());
                encode_varint(buf, *application_error_code);
            }
            Frame::Stream {
                stream_id,
                offset,
                data,
                fin,
            } => {
                let mut frame_type = FrameType::Stream as u8 | STREAM_LEN_BIT;
                if *offset > 0 {
                    frame_type |= STREAM_OFF_BIT;
                }
                if *fin {
                    frame_type |= STREAM_FIN_BIT;
                }
                buf.put_u8(frame_type);
                encode_varint(buf, stream_id.value());
                if *offset > 0 {
                    encode_varint(buf, *offset);
                }
                encode_varint(buf, data.len() as u64);
                buf.put_slice(data);
            }
            Frame::MaxStreamData {
                stream_id,
                maximum_stream_data,
            } => {
                buf.put_u8(FrameType::MaxStreamData as u8);
                encode_varint(buf, stream_id.value());
                encode_varint(buf, *maximum_stream_data);
            }
            Frame::ConnectionClose {
                error_code,
                frame_type,
                reason_phrase,
            } => {
                buf.put_u8(FrameType::ConnectionClose as u8);
                encode_varint(buf, *error_code);
                encode_varint(buf, frame_type.unwrap_or(0));
                encode_varint(buf, reason_phrase.len() as u64);
                buf.put_slice(reason_phrase.as_bytes());
            }
        }
    }

    /// Size of this frame once encoded
    pub fn encoded_len(&self) -> usize {
        match self {
            Frame::Padding { length } => *length,
            Frame::Ping => 1,
            Frame::Stream {
                stream_id,
                offset,
                data,
                ..
            } => stream_header_len(*stream_id, *offset, data.len()) + data.len(),
            Frame::StopSending {
                stream_id,
                application_error_code,
            } => 1 + varint_len(stream_id.value()) + varint_len(*application_error_code),
            Frame::MaxStreamData {
                stream_id,
                maximum_stream_data,
            } => 1 + varint_len(stream_id.value()) + varint_len(*maximum_stream_data),
            Frame::Ack { .. } | Frame::ConnectionClose { .. } => self.encode().len(),
        }
    }

    /// Decode a single frame, returning it with the number of bytes consumed
    pub fn decode(data: &[u8]) -> Result<(Self, usize)> {
        let mut cursor = data;
        let type_byte = read_u8(&mut cursor)?;
        let frame_type = FrameType::from_byte(type_byte).ok_or_else(|| {
            ProtocolError::InvalidFrameFormat(format!("unknown frame type {:#04x}", type_byte))
        })?;

        let frame = match frame_type {
            FrameType::Padding => {
                let mut length = 1;
                while cursor.first() == Some(&0) {
                    cursor = &cursor[1..];
                    length += 1;
                }
                Frame::Padding { length }
            }
            FrameType::Ping => Frame::Ping,
            FrameType::Ack => {
                let largest_acknowledged = read_varint(&mut cursor)?;
                let ack_delay = read_varint(&mut cursor)?;
                let range_count = read_varint(&mut cursor)?;
                if range_count > MAX_ACK_RANGES {
                    return Err(ProtocolError::InvalidFrameFormat(format!(
                        "too many ACK ranges: {}",
                        range_count
                    ))
                    .into());
                }
                let first_range = read_varint(&mut cursor)?;
                let mut smallest = largest_acknowledged.checked_sub(first_range).ok_or_else(|| {
                    ProtocolError::InvalidFrameFormat("first ACK range exceeds largest".to_string())
                })?;
                let mut ack_ranges = Vec::with_capacity(range_count as usize + 1);
                ack_ranges.push((smallest, largest_acknowledged));
                for _ in 0..range_count {
                    let gap = read_varint(&mut cursor)?;
                    let length = read_varint(&mut cursor)?;
                    let hi = smallest
                        .checked_sub(gap + 2)
                        .ok_or_else(|| ProtocolError::InvalidFrameFormat("ACK gap underflow".to_string()))?;
                    let lo = hi
                        .checked_sub(length)
                        .ok_or_else(|| ProtocolError::InvalidFrameFormat("ACK range underflow".to_string()))?;
                    ack_ranges.push((lo, hi));
                    smallest = lo;
                }
                Frame::Ack {
                    largest_acknowledged,
                    ack_delay,
                    ack_ranges,
                }
            }
            FrameType::StopSending => Frame::StopSending {
                stream_id: StreamId::new(read_varint(&mut cursor)?),
                application_error_code: read_varint(&mut cursor)?,
            },
            FrameType::Stream => {
                let stream_id = StreamId::new(read_varint(&mut cursor)?);
                let offset = if type_byte & STREAM_OFF_BIT != 0 {
                    read_varint(&mut cursor)?
                } else {
                    0
                };
                let length = if type_byte & STREAM_LEN_BIT != 0 {
                    read_varint(&mut cursor)? as usize
                } else {
                    cursor.len()
                };
                let payload = read_bytes(&mut cursor, length)?;
                if offset + payload.len() as u64 > MAX_VARINT {
                    return Err(ProtocolError::InvalidFrameFormat("stream data beyond maximum offset".to_string()).into());
                }
                Frame::Stream {
                    stream_id,
                    offset,
                    data: Bytes::copy_from_slice(payload),
                    fin: type_byte & STREAM_FIN_BIT != 0,
                }
            }
            FrameType::MaxStreamData => Frame::MaxStreamData {
                stream_id: StreamId::new(read_varint(&mut cursor)?),
                maximum_stream_data: read_varint(&mut cursor)?,
            },
            FrameType::ConnectionClose => {
                let error_code = read_varint(&mut cursor)?;
                let frame_type = read_varint(&mut cursor)?;
                let reason_len = read_varint(&mut cursor)? as usize;
                let reason = read_bytes(&mut cursor, reason_len)?;
                Frame::ConnectionClose {
                    error_code,
                    frame_type: (frame_type != 0).then_some(frame_type),
                    reason_phrase: String::from_utf8_lossy(reason).into_owned(),
                }
            }
        };

        Ok((frame, data.len() - cursor.len()))
    }

    /// Decode every frame in a packet payload
    pub fn decode_all(payload: &[u8]) -> Result<Vec<Frame>> {
        let mut frames = Vec::new();
        let mut offset = 0;
        while offset < payload.len() {
            let (frame, consumed) = Frame::decode(&payload[offset..])?;
            offset += consumed;
            frames.push(frame);
        }
        Ok(frames)
    }
}

/// Bytes taken by a STREAM frame before its data
pub fn stream_header_len(stream_id: StreamId, offset: u64, len: usize) -> usize {
    let offset_len = if offset > 0 { varint_len(offset) } else { 0 };
    1 + varint_len(stream_id.value()) + offset_len + varint_len(len as u64)
}

pub fn varint_len(value: u64) -> usize {
    if value < 64 {
        1
    } else if value < 16384 {
        2
    } else if value < 1073741824 {
        4
    } else {
        8
    }
}

pub fn encode_varint(buf: &mut BytesMut, value: u64) {
    debug_assert!(value <= MAX_VARINT, "varint out of range: {}", value);
    if value < 64 {
        buf.put_u8(value as u8);
    } else if value < 16384 {
        buf.put_u16(0x4000 | (value as u16));
    } else if value < 1073741824 {
        buf.put_u32(0x80000000 | (value as u32));
    } else {
        buf.put_u64(0xc000000000000000 | (value & MAX_VARINT));
    }
}

/// Read a varint from the front of `data`, advancing it
pub fn read_varint(data: &mut &[u8]) -> Result<u64> {
    let first = *data
        .first()
        .ok_or_else(|| ProtocolError::InvalidFrameFormat("empty varint".to_string()))?;
    let len = 1usize << (first >> 6);
    let bytes = read_bytes(data, len)?;
    let mut value = (bytes[0] & 0x3f) as u64;
    for &b in &bytes[1..] {
        value = (value << 8) | b as u64;
    }
    Ok(value)
}

fn read_u8(data: &mut &[u8]) -> Result<u8> {
    Ok(read_bytes(data, 1)?[0])
}

fn read_bytes<'a>(data: &mut &'a [u8], len: usize) -> Result<&'a [u8]> {
    if data.len() < len {
        return Err(ProtocolError::InvalidFrameFormat(format!(
            "truncated frame: need {} bytes, have {}",
            len,
            data.len()
        ))
        .into());
    }
    let (head, tail) = data.split_at(len);
    *data = tail;
    Ok(head)
}
