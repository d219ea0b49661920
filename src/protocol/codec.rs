//! Frame codec.
//!
//! ## Frame Format
//!
//! ```text
//! [varint length][envelope bytes][zero padding]
//! |<------------ length + 4 bytes ------------>|
//! ```
//!
//! The reader peeks a fixed 4-byte window to learn the envelope length,
//! then reads `length + 4` bytes in one go. Writers therefore always emit
//! `length + 4` bytes, padding with zeros whenever the varint is shorter
//! than 4 bytes, so that consecutive frames stay aligned.
//!
//! A 4-byte varint tops out at `2^28 - 1`, which caps the envelope size.
//! Longer envelopes would need a 5-byte prefix and are refused on both
//! sides.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use prost::encoding::{decode_varint, encode_varint};
use prost::Message;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::tcp::OwnedReadHalf;

use super::{Envelope, WireEnvelope};
use crate::error::{FrameError, FrameResult};

/// Size of the look-ahead window, and of the space reserved for the prefix.
pub const HEADER_WINDOW: usize = 4;

/// Largest envelope whose length fits in a 4-byte varint.
pub const MAX_ENVELOPE_LEN: usize = (1 << 28) - 1;

/// First pause between peeks while the prefix is still arriving.
const PEEK_RETRY: Duration = Duration::from_millis(1);

/// Ceiling for the doubling peek pause.
const PEEK_RETRY_MAX: Duration = Duration::from_millis(100);

/// Parse the length prefix from a peeked window.
///
/// Only the first `HEADER_WINDOW` bytes are considered. The prefix must
/// terminate inside them.
pub fn decode_header(window: &[u8]) -> FrameResult<u32> {
    let mut buf = &window[..window.len().min(HEADER_WINDOW)];
    let len = decode_varint(&mut buf).map_err(|_| FrameError::MalformedHeader)?;
    u32::try_from(len).map_err(|_| FrameError::MalformedHeader)
}

/// Total bytes a frame occupies on the wire for an envelope of `envelope_len`.
pub fn frame_len(envelope_len: usize) -> FrameResult<usize> {
    if envelope_len > MAX_ENVELOPE_LEN {
        return Err(FrameError::FrameTooLarge { len: envelope_len });
    }
    Ok(envelope_len + HEADER_WINDOW)
}

/// Serialize an envelope into a complete, padded frame.
pub fn encode_frame(envelope: &Envelope) -> FrameResult<Bytes> {
    let wire = envelope.to_wire();
    let envelope_len = wire.encoded_len();
    let total = frame_len(envelope_len)?;

    let mut buf = BytesMut::with_capacity(total);
    encode_varint(envelope_len as u64, &mut buf);
    wire.encode(&mut buf)?;
    buf.resize(total, 0);

    Ok(buf.freeze())
}

/// Read one full frame whose prefix declared `declared` envelope bytes.
///
/// Keeps reading until `declared + HEADER_WINDOW` bytes have arrived, then
/// decodes the envelope from exactly `declared` bytes after the prefix.
pub async fn read_frame<R>(reader: &mut R, declared: u32) -> FrameResult<Envelope>
where
    R: AsyncRead + Unpin,
{
    let expected = frame_len(declared as usize)?;
    let mut buf = vec![0u8; expected];
    let mut received = 0;

    while received < expected {
        let n = reader.read(&mut buf[received..]).await?;
        if n == 0 {
            return Err(FrameError::ShortRead { expected, received });
        }
        received += n;
    }

    decode_frame(&buf, declared)
}

/// Decode a fully buffered frame.
fn decode_frame(frame: &[u8], declared: u32) -> FrameResult<Envelope> {
    let mut body = frame;
    let len = decode_varint(&mut body).map_err(|_| FrameError::MalformedHeader)?;
    let declared = declared as usize;
    if len != declared as u64 || body.len() < declared {
        return Err(FrameError::MalformedHeader);
    }

    let wire = WireEnvelope::decode(&body[..declared])?;
    Envelope::from_wire(wire)
}

/// Peek the 4-byte window of a socket and parse its length prefix.
///
/// Nothing is consumed. If fewer than 4 bytes are buffered and they do not
/// yet hold a whole prefix, the peek is retried with a doubling pause.
pub async fn peek_header(reader: &mut OwnedReadHalf) -> FrameResult<u32> {
    let mut window = [0u8; HEADER_WINDOW];
    let mut pause = PEEK_RETRY;

    loop {
        let n = reader.peek(&mut window).await?;
        if n == 0 {
            return Err(FrameError::ShortRead {
                expected: HEADER_WINDOW,
                received: 0,
            });
        }

        match decode_header(&window[..n]) {
            Ok(len) => return Ok(len),
            Err(e) if n == HEADER_WINDOW => return Err(e),
            Err(_) => {
                tokio::time::sleep(pause).await;
                pause = next_peek_pause(pause);
            }
        }
    }
}

fn next_peek_pause(pause: Duration) -> Duration {
    (pause * 2).min(PEEK_RETRY_MAX)
}

/// Run the full decode protocol on a socket: peek, parse header, read frame.
pub async fn read_envelope(reader: &mut OwnedReadHalf) -> FrameResult<Envelope> {
    let declared = peek_header(reader).await?;
    read_frame(reader, declared).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageKind;
    use prost::encoding::encoded_len_varint;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};
    use tokio_test::assert_ok;

    async fn decode_bytes(frame: &[u8]) -> FrameResult<Envelope> {
        let declared = decode_header(frame)?;
        let mut reader = frame;
        read_frame(&mut reader, declared).await
    }

    #[tokio::test]
    async fn test_round_trip() {
        let envelope = Envelope::data(vec![7u8; 10]);
        let frame = encode_frame(&envelope).unwrap();

        let decoded = decode_bytes(&frame).await.unwrap();
        assert_eq!(decoded, envelope);
    }

    #[tokio::test]
    async fn test_ping_round_trip() {
        let frame = encode_frame(&Envelope::ping()).unwrap();
        // varint(2), kind field, zero padding
        assert_eq!(&frame[..], &[0x02, 0x08, 0x01, 0x00, 0x00, 0x00]);

        let decoded = decode_bytes(&frame).await.unwrap();
        assert_eq!(decoded.kind(), MessageKind::Ping);
    }

    #[test]
    fn test_frame_is_padded_to_window() {
        let envelope = Envelope::data(vec![1u8; 10]);
        let envelope_len = envelope.to_wire().encoded_len();
        let frame = encode_frame(&envelope).unwrap();

        assert_eq!(frame.len(), envelope_len + HEADER_WINDOW);
        assert_eq!(&frame[frame.len() - 3..], &[0, 0, 0]);
    }

    #[tokio::test]
    async fn test_prefix_width_boundaries() {
        // Payload sizes chosen so the envelope prefix needs 1, 2, 3 and 4 bytes.
        for (payload_len, prefix_len) in [(10, 1), (200, 2), (20_000, 3), (2_100_000, 4)] {
            let envelope = Envelope::data(vec![0xabu8; payload_len]);
            let envelope_len = envelope.to_wire().encoded_len();
            assert_eq!(encoded_len_varint(envelope_len as u64), prefix_len);

            let frame = encode_frame(&envelope).unwrap();
            assert_eq!(frame.len(), envelope_len + HEADER_WINDOW);
            assert_eq!(decode_header(&frame).unwrap() as usize, envelope_len);

            let decoded = decode_bytes(&frame).await.unwrap();
            assert_eq!(decoded.payload().len(), payload_len);
        }
    }

    #[test]
    fn test_five_byte_prefix_rejected() {
        assert_eq!(
            decode_header(&[0xff, 0xff, 0xff, 0x7f]).unwrap() as usize,
            MAX_ENVELOPE_LEN
        );

        let mut prefix = BytesMut::new();
        encode_varint((MAX_ENVELOPE_LEN + 1) as u64, &mut prefix);
        assert_eq!(prefix.len(), 5);
        assert!(matches!(
            decode_header(&prefix),
            Err(FrameError::MalformedHeader)
        ));

        assert_ok!(frame_len(MAX_ENVELOPE_LEN));
        assert!(matches!(
            frame_len(MAX_ENVELOPE_LEN + 1),
            Err(FrameError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_empty_window_is_malformed() {
        assert!(matches!(decode_header(&[]), Err(FrameError::MalformedHeader)));
        assert!(matches!(
            decode_header(&[0x80, 0x80]),
            Err(FrameError::MalformedHeader)
        ));
    }

    #[tokio::test]
    async fn test_short_read() {
        let frame = encode_frame(&Envelope::data(vec![3u8; 10])).unwrap();
        let truncated = &frame[..frame.len() - 5];

        match decode_bytes(truncated).await {
            Err(FrameError::ShortRead { expected, received }) => {
                assert_eq!(expected, frame.len());
                assert_eq!(received, truncated.len());
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reassembles_partial_reads() {
        let envelope = Envelope::data(&b"split frame"[..]);
        let frame = encode_frame(&envelope).unwrap();

        let mut reader = tokio_test::io::Builder::new()
            .read(&frame[..2])
            .read(&frame[2..7])
            .read(&frame[7..])
            .build();

        let declared = decode_header(&frame).unwrap();
        let decoded = read_frame(&mut reader, declared).await.unwrap();
        assert_eq!(decoded, envelope);
    }

    #[tokio::test]
    async fn test_garbage_payload_fails_decode() {
        let frame = [0x03, 0xff, 0xff, 0xff, 0x00, 0x00, 0x00];
        let result = decode_bytes(&frame).await;
        assert!(matches!(result, Err(FrameError::DecodeFailure(_))));
    }

    #[tokio::test]
    async fn test_decode_stops_at_declared_length() {
        // The trailing field sits inside the padding and must be ignored.
        let mut frame = encode_frame(&Envelope::ping()).unwrap().to_vec();
        frame[3] = 0x10;
        frame[4] = 0x01;

        let decoded = decode_bytes(&frame).await.unwrap();
        assert_eq!(decoded, Envelope::ping());
    }

    #[tokio::test]
    async fn test_truncated_envelope_fails_decode() {
        // Declares 4 bytes, but the payload field inside claims 10.
        let frame = [0x04, 0x08, 0x02, 0x12, 0x0a, 0x00, 0x00, 0x00];
        let result = decode_bytes(&frame).await;
        assert!(matches!(result, Err(FrameError::DecodeFailure(_))));
    }

    #[tokio::test]
    async fn test_declared_length_mismatch() {
        let frame = encode_frame(&Envelope::ping()).unwrap();
        let mut reader = &frame[..];
        let result = read_frame(&mut reader, 1).await;
        assert!(matches!(result, Err(FrameError::MalformedHeader)));
    }

    #[tokio::test]
    async fn test_read_envelope_from_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let envelope = Envelope::data(vec![9u8; 10]);
        let frame = encode_frame(&envelope).unwrap();

        let writer = tokio::spawn(async move {
            let mut client = TcpStream::connect(addr).await.unwrap();
            client.write_all(&frame[..1]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            client.write_all(&frame[1..]).await.unwrap();
            client
        });

        let (stream, _) = listener.accept().await.unwrap();
        let (mut reader, _writer) = stream.into_split();
        let decoded = read_envelope(&mut reader).await.unwrap();
        assert_eq!(decoded, envelope);

        let _client = writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_read_envelope_waits_for_split_prefix() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // 300 bytes of payload needs a 2-byte prefix; only the first arrives.
        let envelope = Envelope::data(vec![5u8; 300]);
        let frame = encode_frame(&envelope).unwrap();
        assert_eq!(encoded_len_varint(decode_header(&frame).unwrap() as u64), 2);

        let writer = tokio::spawn(async move {
            let mut client = TcpStream::connect(addr).await.unwrap();
            client.write_all(&frame[..1]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(30)).await;
            client.write_all(&frame[1..]).await.unwrap();
            client
        });

        let (stream, _) = listener.accept().await.unwrap();
        let (mut reader, _writer) = stream.into_split();
        let decoded = tokio::time::timeout(Duration::from_secs(2), read_envelope(&mut reader))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(decoded, envelope);

        let _client = writer.await.unwrap();
    }

    #[test]
    fn test_peek_pause_doubles_to_ceiling() {
        let mut pause = PEEK_RETRY;
        let mut seen = vec![pause];
        while pause < PEEK_RETRY_MAX {
            pause = next_peek_pause(pause);
            seen.push(pause);
        }

        assert_eq!(seen[1], Duration::from_millis(2));
        assert_eq!(*seen.last().unwrap(), PEEK_RETRY_MAX);
        assert_eq!(next_peek_pause(PEEK_RETRY_MAX), PEEK_RETRY_MAX);
    }

    #[tokio::test]
    async fn test_read_envelope_peer_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = TcpStream::connect(addr).await.unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        drop(client);

        let (mut reader, _writer) = stream.into_split();
        let result = read_envelope(&mut reader).await;
        assert!(matches!(
            result,
            Err(FrameError::ShortRead { received: 0, .. }) | Err(FrameError::Io(_))
        ));
    }
}
