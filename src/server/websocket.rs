//! Server-to-client WebSocket framing and the frame push loop.
//!
//! Only one frame shape is ever sent: a final, unmasked binary frame whose
//! length always uses the 64-bit extended form.

use std::io;

use bytes::BufMut;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::capture::FrameFeed;

/// FIN bit set, opcode 2 (binary).
pub const FIN_BINARY: u8 = 0x82;
/// Mask bit clear, payload length in the next 8 bytes.
pub const PAYLOAD_LEN_64: u8 = 0x7F;
pub const HEADER_LEN: usize = 10;

/// Write `value` into `dst` most significant byte first.
pub fn put_be_u64(mut dst: &mut [u8], value: u64) {
    dst.put_u64(value);
}

pub fn encode_binary_header(payload_len: u64) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[0] = FIN_BINARY;
    header[1] = PAYLOAD_LEN_64;
    put_be_u64(&mut header[2..], payload_len);
    header
}

pub fn upgrade_response(accept_token: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept_token}\r\n\r\n"
    )
}

/// A connection that completed the opening handshake.
pub struct WebSocketSession<S> {
    stream: S,
}

impl<S: AsyncWrite + Unpin> WebSocketSession<S> {
    /// Send the `101 Switching Protocols` response.
    pub async fn accept(mut stream: S, accept_token: &str) -> io::Result<Self> {
        stream
            .write_all(upgrade_response(accept_token).as_bytes())
            .await?;
        stream.flush().await?;
        Ok(Self { stream })
    }

    pub async fn send_binary(&mut self, payload: &[u8]) -> io::Result<()> {
        let header = encode_binary_header(payload.len() as u64);
        self.stream.write_all(&header).await?;
        self.stream.write_all(payload).await?;
        self.stream.flush().await
    }

    /// Push frames until the feed fails or the peer stops accepting writes.
    ///
    /// Returns the number of frames sent. No close frame is sent on exit.
    pub async fn push_frames(mut self, feed: &mut FrameFeed) -> u64 {
        metrics::gauge!("camserve_websocket_sessions").increment(1.0);
        let mut sent = 0u64;
        loop {
            let frame = match feed.next_frame().await {
                Ok(frame) => frame,
                Err(e) => {
                    debug!("Ending stream, no frame: {}", e);
                    break;
                }
            };
            if let Err(e) = self.send_binary(&frame.data).await {
                debug!("Ending stream, write failed: {}", e);
                break;
            }
            sent += 1;
            metrics::counter!("camserve_websocket_frames_total").increment(1);
        }
        metrics::gauge!("camserve_websocket_sessions").decrement(1.0);
        sent
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn big_endian_encoder_puts_most_significant_byte_first() {
        let mut out = [0u8; 8];
        put_be_u64(&mut out, 0x0102_0304_0506_0708);
        assert_eq!(out, [1, 2, 3, 4, 5, 6, 7, 8]);

        put_be_u64(&mut out, 300);
        assert_eq!(out, [0, 0, 0, 0, 0, 0, 0x01, 0x2C]);
    }

    #[test]
    fn header_is_always_ten_bytes_with_64_bit_length() {
        for len in [0u64, 1, 125, 126, 65_535, 65_536, u32::MAX as u64 + 1] {
            let header = encode_binary_header(len);
            assert_eq!(header.len(), HEADER_LEN);
            assert_eq!(header[0], 0x82);
            assert_eq!(header[1], 0x7F);
            assert_eq!(u64::from_be_bytes(header[2..].try_into().unwrap()), len);
        }
    }

    #[test]
    fn mask_bit_is_never_set() {
        assert_eq!(encode_binary_header(42)[1] & 0x80, 0);
    }

    #[tokio::test]
    async fn session_writes_handshake_then_framed_payload() {
        let mut session = WebSocketSession::accept(Vec::new(), "token").await.unwrap();
        session.send_binary(b"\xFF\xD8jpeg").await.unwrap();

        let written = session.into_inner();
        let handshake = upgrade_response("token");
        assert!(written.starts_with(handshake.as_bytes()));

        let frame = &written[handshake.len()..];
        assert_eq!(&frame[..HEADER_LEN], &encode_binary_header(6));
        assert_eq!(&frame[HEADER_LEN..], b"\xFF\xD8jpeg");
    }
}
