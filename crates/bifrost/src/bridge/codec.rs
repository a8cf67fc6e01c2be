//! Framed codec for companion dispatch messages.
//!
//! Each frame is a 10-byte ASCII header followed by a JSON payload:
//!
//! ```text
//! E 0000002a C {"script":"..."}
//! ^ ^^^^^^^^ ^
//! | |        concatenated-message marker
//! | payload length in bytes, 8 lowercase hex digits
//! extended-message marker
//! ```
//!
//! The header never counts itself. Payloads must be strictly shorter than
//! 16^8 bytes so the length always fits in eight hex digits.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::protocol::DispatchRequest;

pub const HEADER_LEN: usize = 10;

/// Exclusive upper bound on payload length (16^8).
pub const MAX_PAYLOAD_LEN: u64 = 1 << 32;

const HEADER_START: u8 = b'E';
const HEADER_END: u8 = b'C';

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame payload of {len} bytes exceeds the {MAX_PAYLOAD_LEN} byte limit")]
    Oversized { len: u64 },

    #[error("malformed frame header: {0:?}")]
    MalformedHeader(String),

    #[error("invalid frame payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Build the header announcing a payload of `len` bytes.
pub fn encode_header(len: u64) -> Result<[u8; HEADER_LEN], FrameError> {
    if len >= MAX_PAYLOAD_LEN {
        return Err(FrameError::Oversized { len });
    }
    let text = format!("E{len:08x}C");
    let mut header = [0u8; HEADER_LEN];
    header.copy_from_slice(text.as_bytes());
    Ok(header)
}

/// Parse a header and return the payload length it announces.
pub fn decode_header(header: &[u8]) -> Result<usize, FrameError> {
    let malformed = || FrameError::MalformedHeader(String::from_utf8_lossy(header).into_owned());

    if header.len() != HEADER_LEN
        || header[0] != HEADER_START
        || header[HEADER_LEN - 1] != HEADER_END
    {
        return Err(malformed());
    }
    let digits = &header[1..HEADER_LEN - 1];
    if !digits.iter().all(u8::is_ascii_hexdigit) {
        return Err(malformed());
    }
    let digits = std::str::from_utf8(digits).map_err(|_| malformed())?;
    let len = u64::from_str_radix(digits, 16).map_err(|_| malformed())?;
    usize::try_from(len).map_err(|_| FrameError::Oversized { len })
}

/// Encode a dispatch request into a complete frame.
pub fn encode_frame(request: &DispatchRequest) -> Result<Bytes, FrameError> {
    let mut buf = BytesMut::new();
    FrameCodec::<DispatchRequest>::new().encode(request.clone(), &mut buf)?;
    Ok(buf.freeze())
}

/// Codec that frames messages with the hex length header and serializes with JSON.
pub struct FrameCodec<T> {
    _phantom: PhantomData<T>,
}

impl<T> Default for FrameCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FrameCodec<T> {
    pub fn new() -> Self {
        Self {
            _phantom: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for FrameCodec<T> {
    type Item = T;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let len = decode_header(&src[..HEADER_LEN])?;
        let total = HEADER_LEN + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }
        src.advance(HEADER_LEN);
        let payload = src.split_to(len);
        let item = serde_json::from_slice(&payload)?;
        Ok(Some(item))
    }
}

impl<T: Serialize> Encoder<T> for FrameCodec<T> {
    type Error = FrameError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(&item)?;
        let json_len = json.len();
        // Header is validated before anything lands in dst so an oversized
        // payload leaves the write buffer untouched.
        let header = encode_header(json_len as u64)?;
        tracing::trace!(json_size_bytes = json_len, "Encoding frame");
        if json_len > 1_000_000 {
            tracing::info!(
                json_size_bytes = json_len,
                json_size_kb = json_len / 1024,
                "Large frame being encoded"
            );
        }
        dst.reserve(HEADER_LEN + json_len);
        dst.put_slice(&header);
        dst.put_slice(&json);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_zero_padded_lowercase_hex() {
        assert_eq!(&encode_header(0).unwrap(), b"E00000000C");
        assert_eq!(&encode_header(42).unwrap(), b"E0000002aC");
        assert_eq!(&encode_header(0xdead_beef).unwrap(), b"EdeadbeefC");
        assert_eq!(&encode_header(MAX_PAYLOAD_LEN - 1).unwrap(), b"EffffffffC");
    }

    #[test]
    fn header_rejects_oversized_length() {
        assert!(matches!(
            encode_header(MAX_PAYLOAD_LEN),
            Err(FrameError::Oversized { len }) if len == MAX_PAYLOAD_LEN
        ));
        assert!(matches!(
            encode_header(u64::MAX),
            Err(FrameError::Oversized { .. })
        ));
    }

    #[test]
    fn decode_header_reads_length() {
        assert_eq!(decode_header(b"E0000002aC").unwrap(), 42);
        assert_eq!(decode_header(b"E0000002AC").unwrap(), 42);
    }

    #[test]
    fn decode_header_rejects_bad_markers() {
        let bad_headers: [&[u8]; 5] = [
            b"X0000002aC",
            b"E0000002aX",
            b"E000z002aC",
            b"E+0000002C",
            b"E0002aC",
        ];
        for bad in bad_headers {
            assert!(
                matches!(decode_header(bad), Err(FrameError::MalformedHeader(_))),
                "accepted {:?}",
                String::from_utf8_lossy(bad)
            );
        }
    }

    #[test]
    fn frame_header_matches_payload_bytes() {
        // Multi-byte characters: header counts bytes, not chars.
        let request = DispatchRequest::new("let s = 'héllo ✓';");
        let frame = encode_frame(&request).unwrap();
        let declared = decode_header(&frame[..HEADER_LEN]).unwrap();
        assert_eq!(declared, frame.len() - HEADER_LEN);

        let payload: serde_json::Value = serde_json::from_slice(&frame[HEADER_LEN..]).unwrap();
        assert_eq!(payload, serde_json::json!({"script": "let s = 'héllo ✓';"}));
    }

    #[test]
    fn codec_roundtrip_dispatch_request() {
        let mut codec = FrameCodec::<DispatchRequest>::new();
        let mut buf = BytesMut::new();

        let req = DispatchRequest::new("x = 1\ny = 2");
        codec.encode(req.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();

        assert_eq!(decoded, req);
        assert!(buf.is_empty());
    }

    #[test]
    fn decoder_waits_for_partial_frames() {
        let frame = encode_frame(&DispatchRequest::new("partial")).unwrap();
        let mut codec = FrameCodec::<DispatchRequest>::new();

        let mut buf = BytesMut::from(&frame[..4]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&frame[4..frame.len() - 1]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&frame[frame.len() - 1..]);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.script, "partial");
    }

    #[test]
    fn decoder_splits_back_to_back_frames() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode_frame(&DispatchRequest::new("first")).unwrap());
        buf.extend_from_slice(&encode_frame(&DispatchRequest::new("second")).unwrap());

        let mut codec = FrameCodec::<DispatchRequest>::new();
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().script, "first");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().script, "second");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn decoder_rejects_garbage_header() {
        let mut buf = BytesMut::from(&b"not a frame at all"[..]);
        let mut codec = FrameCodec::<DispatchRequest>::new();
        assert!(matches!(
            codec.decode(&mut buf),
            Err(FrameError::MalformedHeader(_))
        ));
    }
}
