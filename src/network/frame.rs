// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::warn;

use crate::{AppError, AppResult};

/// Splits a connection's byte stream into frames and wraps outbound payloads.
///
/// `input` must be a pure function of the buffered bytes: the read path calls it
/// again every time more bytes arrive and after every extracted frame.
pub trait FramingProtocol: Send + Sync + 'static {
    /// Byte length of the next complete frame at the head of `buffer`,
    /// delimiter included. `Ok(None)` or `Ok(Some(0))` means more bytes are needed.
    /// An error means the stream can never yield a valid frame.
    fn input(&self, buffer: &[u8]) -> AppResult<Option<usize>>;

    /// Adds the wire framing to an outbound payload.
    fn pack(&self, payload: &[u8]) -> Bytes;

    /// Strips the framing from a complete frame.
    fn unpack(&self, frame: Bytes) -> AppResult<Bytes>;

    /// Message id carried by an unpacked payload, if the wire format has one.
    fn message_id(&self, _payload: &[u8]) -> u32 {
        0
    }
}

/// Pulls every complete frame off the head of `buffer`.
///
/// Returns `(payload, wire_length)` pairs in stream order and leaves any trailing
/// partial frame in the buffer.
pub fn extract_frames(
    protocol: &dyn FramingProtocol,
    buffer: &mut BytesMut,
) -> AppResult<Vec<(Bytes, usize)>> {
    let mut frames = Vec::new();
    while !buffer.is_empty() {
        let frame_len = match protocol.input(buffer)? {
            Some(len) if len > 0 => len,
            _ => break,
        };
        if frame_len > buffer.len() {
            warn!(
                "framing protocol reported a frame of {} bytes with only {} buffered",
                frame_len,
                buffer.len()
            );
            break;
        }
        let frame = buffer.split_to(frame_len).freeze();
        frames.push((protocol.unpack(frame)?, frame_len));
    }
    Ok(frames)
}

const DEFAULT_MAX_LINE_SIZE: usize = 64 * 1024;

/// Delimiter terminated frames, `\n` by default.
///
/// A line longer than `max_frame_size` (delimiter excluded) is a malformed
/// stream, so a peer that never sends the delimiter cannot grow the read buffer
/// without bound.
#[derive(Debug, Clone)]
pub struct LineProtocol {
    delimiter: Vec<u8>,
    max_frame_size: usize,
}

impl Default for LineProtocol {
    fn default() -> Self {
        Self {
            delimiter: b"\n".to_vec(),
            max_frame_size: DEFAULT_MAX_LINE_SIZE,
        }
    }
}

impl LineProtocol {
    pub fn new(delimiter: &[u8]) -> AppResult<Self> {
        if delimiter.is_empty() {
            return Err(AppError::Config(
                "line delimiter must not be empty".to_string(),
            ));
        }
        Ok(Self {
            delimiter: delimiter.to_vec(),
            ..Self::default()
        })
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }
}

impl FramingProtocol for LineProtocol {
    fn input(&self, buffer: &[u8]) -> AppResult<Option<usize>> {
        let limit = self.max_frame_size + self.delimiter.len();
        // never scan past the longest legal frame
        let head = &buffer[..buffer.len().min(limit)];
        match head
            .windows(self.delimiter.len())
            .position(|window| window == self.delimiter.as_slice())
        {
            Some(index) => Ok(Some(index + self.delimiter.len())),
            None if buffer.len() >= limit => Err(AppError::MalformedFrame(format!(
                "no delimiter within {} bytes",
                self.max_frame_size
            ))),
            None => Ok(None),
        }
    }

    fn pack(&self, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(payload.len() + self.delimiter.len());
        buf.put_slice(payload);
        buf.put_slice(&self.delimiter);
        buf.freeze()
    }

    fn unpack(&self, mut frame: Bytes) -> AppResult<Bytes> {
        if frame.ends_with(&self.delimiter) {
            frame.truncate(frame.len() - self.delimiter.len());
        }
        Ok(frame)
    }
}

const LENGTH_FIELD_SIZE: usize = 4;
const CHECKSUM_SIZE: usize = 4;

/// `[u32 big-endian body length][body]`, where body is the payload optionally
/// followed by its crc32c.
#[derive(Debug, Clone)]
pub struct LengthPrefixedProtocol {
    max_frame_size: usize,
    checksum: bool,
}

impl Default for LengthPrefixedProtocol {
    fn default() -> Self {
        Self::new(1024 * 1024)
    }
}

impl LengthPrefixedProtocol {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            max_frame_size,
            checksum: false,
        }
    }

    pub fn with_checksum(mut self) -> Self {
        self.checksum = true;
        self
    }
}

impl FramingProtocol for LengthPrefixedProtocol {
    fn input(&self, buffer: &[u8]) -> AppResult<Option<usize>> {
        if buffer.len() < LENGTH_FIELD_SIZE {
            return Ok(None);
        }
        let mut head = &buffer[..LENGTH_FIELD_SIZE];
        let body_size = head.get_u32() as usize;
        if body_size > self.max_frame_size {
            return Err(AppError::MalformedFrame(format!(
                "frame of length {} is too large",
                body_size
            )));
        }
        if self.checksum && body_size < CHECKSUM_SIZE {
            return Err(AppError::MalformedFrame(format!(
                "frame of length {} cannot hold a checksum",
                body_size
            )));
        }
        let frame_len = LENGTH_FIELD_SIZE + body_size;
        if buffer.len() < frame_len {
            return Ok(None);
        }
        Ok(Some(frame_len))
    }

    fn pack(&self, payload: &[u8]) -> Bytes {
        let trailer = if self.checksum { CHECKSUM_SIZE } else { 0 };
        let mut buf = BytesMut::with_capacity(LENGTH_FIELD_SIZE + payload.len() + trailer);
        buf.put_u32((payload.len() + trailer) as u32);
        buf.put_slice(payload);
        if self.checksum {
            buf.put_u32(crc32c::crc32c(payload));
        }
        buf.freeze()
    }

    fn unpack(&self, mut frame: Bytes) -> AppResult<Bytes> {
        if frame.len() < LENGTH_FIELD_SIZE {
            return Err(AppError::MalformedFrame(format!(
                "frame of {} bytes has no length field",
                frame.len()
            )));
        }
        frame.advance(LENGTH_FIELD_SIZE);
        if !self.checksum {
            return Ok(frame);
        }
        if frame.len() < CHECKSUM_SIZE {
            return Err(AppError::MalformedFrame("missing checksum".to_string()));
        }
        let mut trailer = frame.split_off(frame.len() - CHECKSUM_SIZE);
        let expected = trailer.get_u32();
        let actual = crc32c::crc32c(&frame);
        if expected != actual {
            return Err(AppError::CorruptFrame(format!(
                "checksum mismatch, expected {:#010x} got {:#010x}",
                expected, actual
            )));
        }
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer_of(parts: &[Bytes]) -> BytesMut {
        let mut buffer = BytesMut::new();
        for part in parts {
            buffer.extend_from_slice(part);
        }
        buffer
    }

    fn payloads(frames: Vec<(Bytes, usize)>) -> Vec<Bytes> {
        frames.into_iter().map(|(payload, _)| payload).collect()
    }

    #[test]
    fn test_line_two_frames_in_one_read() {
        let protocol = LineProtocol::default();
        let mut buffer = BytesMut::from(&b"abc\nde\n"[..]);

        let frames = extract_frames(&protocol, &mut buffer).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], (Bytes::from_static(b"abc"), 4));
        assert_eq!(frames[1], (Bytes::from_static(b"de"), 3));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_line_partial_frame_is_kept() {
        let protocol = LineProtocol::default();
        let mut buffer = BytesMut::from(&b"abc\nde"[..]);

        let frames = extract_frames(&protocol, &mut buffer).unwrap();
        assert_eq!(payloads(frames), vec![Bytes::from_static(b"abc")]);
        assert_eq!(&buffer[..], b"de");

        buffer.extend_from_slice(b"f\n");
        let frames = extract_frames(&protocol, &mut buffer).unwrap();
        assert_eq!(payloads(frames), vec![Bytes::from_static(b"def")]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_line_multi_byte_delimiter() {
        let protocol = LineProtocol::new(b"\r\n").unwrap();
        let packed = protocol.pack(b"ping");
        assert_eq!(&packed[..], b"ping\r\n");

        let mut buffer = BytesMut::from(&b"ping\r\npo"[..]);
        let frames = extract_frames(&protocol, &mut buffer).unwrap();
        assert_eq!(frames, vec![(Bytes::from_static(b"ping"), 6)]);
        assert_eq!(&buffer[..], b"po");
    }

    #[test]
    fn test_line_empty_delimiter_is_config_error() {
        assert!(matches!(LineProtocol::new(b""), Err(AppError::Config(_))));
    }

    #[test]
    fn test_line_longer_than_limit_is_malformed() {
        let protocol = LineProtocol::default().with_max_frame_size(8);

        // exactly at the limit is fine
        let mut buffer = BytesMut::from(&b"12345678\n"[..]);
        let frames = extract_frames(&protocol, &mut buffer).unwrap();
        assert_eq!(payloads(frames), vec![Bytes::from_static(b"12345678")]);

        // short and undelimited, wait for more
        let mut buffer = BytesMut::from(&b"12345678"[..]);
        assert!(extract_frames(&protocol, &mut buffer).unwrap().is_empty());

        let mut buffer = BytesMut::from(&b"123456789"[..]);
        assert!(matches!(
            extract_frames(&protocol, &mut buffer),
            Err(AppError::MalformedFrame(_))
        ));

        let mut buffer = BytesMut::from(&vec![b'a'; 4 * 1024 * 1024][..]);
        assert!(matches!(
            extract_frames(&LineProtocol::default(), &mut buffer),
            Err(AppError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_pack_then_extract_keeps_boundaries() {
        let protocols: Vec<Box<dyn FramingProtocol>> = vec![
            Box::new(LineProtocol::default()),
            Box::new(LengthPrefixedProtocol::default()),
            Box::new(LengthPrefixedProtocol::default().with_checksum()),
        ];
        for protocol in protocols {
            let first = protocol.pack(b"hello");
            let second = protocol.pack(b"world!");
            let mut buffer = buffer_of(&[first, second]);

            let frames = extract_frames(protocol.as_ref(), &mut buffer).unwrap();
            assert_eq!(
                payloads(frames),
                vec![Bytes::from_static(b"hello"), Bytes::from_static(b"world!")]
            );
            assert!(buffer.is_empty());
        }
    }

    #[test]
    fn test_length_prefixed_waits_for_body() {
        let protocol = LengthPrefixedProtocol::default();
        let packed = protocol.pack(b"payload");

        // one byte at a time, nothing is produced until the last byte lands
        let mut buffer = BytesMut::new();
        for (i, byte) in packed.iter().enumerate() {
            buffer.put_u8(*byte);
            let frames = extract_frames(&protocol, &mut buffer).unwrap();
            if i + 1 < packed.len() {
                assert!(frames.is_empty());
            } else {
                assert_eq!(payloads(frames), vec![Bytes::from_static(b"payload")]);
            }
        }
    }

    #[test]
    fn test_length_prefixed_rejects_oversized_frame() {
        let protocol = LengthPrefixedProtocol::new(16);
        let mut buffer = BytesMut::new();
        buffer.put_u32(17);
        buffer.put_slice(&[0u8; 17]);

        let result = extract_frames(&protocol, &mut buffer);
        assert!(matches!(result, Err(AppError::MalformedFrame(_))));
    }

    #[test]
    fn test_checksum_mismatch_is_corrupt() {
        let protocol = LengthPrefixedProtocol::default().with_checksum();
        let mut packed = BytesMut::from(&protocol.pack(b"payload")[..]);
        // flip a payload bit
        packed[LENGTH_FIELD_SIZE] ^= 0x01;

        let result = extract_frames(&protocol, &mut packed);
        assert!(matches!(result, Err(AppError::CorruptFrame(_))));
    }

    struct OverReporting;

    impl FramingProtocol for OverReporting {
        fn input(&self, buffer: &[u8]) -> AppResult<Option<usize>> {
            Ok(Some(buffer.len() + 1))
        }
        fn pack(&self, payload: &[u8]) -> Bytes {
            Bytes::copy_from_slice(payload)
        }
        fn unpack(&self, frame: Bytes) -> AppResult<Bytes> {
            Ok(frame)
        }
    }

    #[test]
    fn test_length_beyond_buffer_is_incomplete() {
        let mut buffer = BytesMut::from(&b"abc"[..]);
        let frames = extract_frames(&OverReporting, &mut buffer).unwrap();
        assert!(frames.is_empty());
        assert_eq!(buffer.len(), 3);
    }
}
