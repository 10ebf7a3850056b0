//! Request-line tokenizer over a connection's byte stream.
//!
//! One reader per connection: it owns the stream and a fixed buffer, and keeps
//! the unconsumed tail of the last read between calls. Lines end at `\r`; a
//! `\n` directly after the `\r` belongs to the terminator and is dropped, even
//! when it only arrives with the next read. Any other byte after `\r` starts
//! the next line.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::ReadError;

/// Longest request or header line accepted, terminator included.
pub const MAX_LINE: usize = 1024;

pub struct LineReader<R> {
    inner: R,
    buf: Box<[u8]>,
    start: usize,
    len: usize,
    // `\r` was the last buffered byte; a leading `\n` on the next read is
    // part of that terminator.
    pending_lf: bool,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_capacity(inner, MAX_LINE)
    }

    pub fn with_capacity(inner: R, capacity: usize) -> Self {
        assert!(capacity > 0, "line buffer capacity must be non-zero");
        Self {
            inner,
            buf: vec![0; capacity].into_boxed_slice(),
            start: 0,
            len: 0,
            pending_lf: false,
        }
    }

    /// Next line without its terminator.
    ///
    /// The slice borrows the reader's buffer and is overwritten by the next
    /// call.
    pub async fn read_line(&mut self) -> Result<&[u8], ReadError> {
        loop {
            if self.len == 0 {
                self.start = 0;
                self.fill(0).await?;
            }

            if self.pending_lf {
                self.pending_lf = false;
                if self.buf[self.start] == b'\n' {
                    self.consume(1);
                    continue;
                }
            }

            let window = &self.buf[self.start..self.start + self.len];
            if let Some(end) = window.iter().position(|&b| b == b'\r') {
                let line_start = self.start;
                self.consume(end + 1);
                if self.len == 0 {
                    self.pending_lf = true;
                } else if self.buf[self.start] == b'\n' {
                    self.consume(1);
                }
                return Ok(&self.buf[line_start..line_start + end]);
            }

            if self.len == self.buf.len() {
                return Err(ReadError::LineTooLong {
                    capacity: self.buf.len(),
                });
            }

            // Partial line: move it to the front and read behind it.
            self.buf.copy_within(self.start..self.start + self.len, 0);
            self.start = 0;
            self.fill(self.len).await?;
        }
    }

    /// Bytes read from the stream but not yet returned as lines.
    pub fn buffered(&self) -> usize {
        self.len
    }

    /// Give the stream back; buffered bytes are discarded.
    pub fn into_inner(self) -> R {
        self.inner
    }

    fn consume(&mut self, n: usize) {
        self.start += n;
        self.len -= n;
    }

    async fn fill(&mut self, offset: usize) -> Result<(), ReadError> {
        let n = self.inner.read(&mut self.buf[offset..]).await?;
        if n == 0 {
            return Err(ReadError::ConnectionClosed);
        }
        self.len += n;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use proptest::prelude::*;
    use tokio::io::ReadBuf;

    use super::*;

    /// Delivers the input in fixed-size physical reads.
    struct Chunked {
        chunks: VecDeque<Vec<u8>>,
    }

    impl Chunked {
        fn new(data: &[u8], chunk: usize) -> Self {
            Self {
                chunks: data.chunks(chunk.max(1)).map(<[u8]>::to_vec).collect(),
            }
        }

        fn split_at(data: &[u8], cuts: &[usize]) -> Self {
            let mut chunks = VecDeque::new();
            let mut last = 0;
            for &cut in cuts {
                let cut = cut.min(data.len());
                if cut > last {
                    chunks.push_back(data[last..cut].to_vec());
                    last = cut;
                }
            }
            if last < data.len() {
                chunks.push_back(data[last..].to_vec());
            }
            Self { chunks }
        }
    }

    impl AsyncRead for Chunked {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if let Some(mut chunk) = self.chunks.pop_front() {
                let n = chunk.len().min(buf.remaining());
                buf.put_slice(&chunk[..n]);
                if n < chunk.len() {
                    chunk.drain(..n);
                    self.chunks.push_front(chunk);
                }
            }
            Poll::Ready(Ok(()))
        }
    }

    struct Failing;

    impl AsyncRead for Failing {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::from(io::ErrorKind::ConnectionReset)))
        }
    }

    async fn collect<R: AsyncRead + Unpin>(reader: &mut LineReader<R>) -> (Vec<Vec<u8>>, ReadError) {
        let mut lines = Vec::new();
        loop {
            match reader.read_line().await {
                Ok(line) => lines.push(line.to_vec()),
                Err(e) => return (lines, e),
            }
        }
    }

    fn lines(input: &[u8], chunk: usize, capacity: usize) -> Vec<Vec<u8>> {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        rt.block_on(async {
            let mut reader = LineReader::with_capacity(Chunked::new(input, chunk), capacity);
            collect(&mut reader).await.0
        })
    }

    #[tokio::test]
    async fn splits_request_and_headers() {
        let input = b"GET / HTTP/1.1\r\nHost: cam\r\n\r\n";
        let mut reader = LineReader::new(Chunked::new(input, input.len()));

        assert_eq!(reader.read_line().await.unwrap(), b"GET / HTTP/1.1");
        assert_eq!(reader.read_line().await.unwrap(), b"Host: cam");
        assert_eq!(reader.read_line().await.unwrap(), b"");
        assert!(matches!(
            reader.read_line().await,
            Err(ReadError::ConnectionClosed)
        ));
    }

    #[test]
    fn byte_at_a_time_matches_single_read() {
        let input = b"GET /socket HTTP/1.1\r\nSec-WebSocket-Key: abc\r\n\r\n";
        assert_eq!(lines(input, 1, 64), lines(input, input.len(), 64));
        assert_eq!(lines(input, 1, 64).len(), 3);
    }

    #[tokio::test]
    async fn line_filling_the_buffer_without_terminator_is_too_long() {
        let input = vec![b'a'; 16];
        let mut reader = LineReader::with_capacity(Chunked::new(&input, 5), 16);
        assert!(matches!(
            reader.read_line().await,
            Err(ReadError::LineTooLong { capacity: 16 })
        ));
    }

    #[tokio::test]
    async fn line_one_short_of_capacity_with_terminator_fits() {
        let mut input = vec![b'a'; 15];
        input.extend_from_slice(b"\r\nnext\r\n");
        let mut reader = LineReader::with_capacity(Chunked::new(&input, 7), 16);

        assert_eq!(reader.read_line().await.unwrap(), &[b'a'; 15][..]);
        // The `\n` arrived after the buffer was full; it must not leak.
        assert_eq!(reader.read_line().await.unwrap(), b"next");
    }

    #[tokio::test]
    async fn bare_carriage_return_keeps_the_following_byte() {
        let mut reader = LineReader::new(Chunked::new(b"one\rtwo\r\n", 64));
        assert_eq!(reader.read_line().await.unwrap(), b"one");
        assert_eq!(reader.read_line().await.unwrap(), b"two");
    }

    #[tokio::test]
    async fn read_errors_are_reported() {
        let mut reader = LineReader::new(Failing);
        assert!(matches!(reader.read_line().await, Err(ReadError::Io(_))));
    }

    #[tokio::test]
    async fn unterminated_tail_before_close_is_an_error() {
        let mut reader = LineReader::new(Chunked::new(b"GET / HT", 3));
        assert!(matches!(
            reader.read_line().await,
            Err(ReadError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn unread_bytes_are_tracked() {
        let mut reader = LineReader::new(Chunked::new(b"a\r\nbc\r\n", 64));
        reader.read_line().await.unwrap();
        assert_eq!(reader.buffered(), 4);
    }

    proptest! {
        #[test]
        fn lines_do_not_depend_on_read_boundaries(
            raw in proptest::collection::vec(
                prop_oneof![Just(b'\r'), Just(b'\n'), b'a'..=b'z'], 0..200),
            cuts in proptest::collection::vec(0usize..200, 0..20),
        ) {
            let mut cuts = cuts;
            cuts.sort_unstable();

            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let (split, whole) = rt.block_on(async {
                let mut split = LineReader::with_capacity(Chunked::split_at(&raw, &cuts), 256);
                let mut whole = LineReader::with_capacity(Chunked::new(&raw, raw.len()), 256);
                (collect(&mut split).await.0, collect(&mut whole).await.0)
            });
            prop_assert_eq!(split, whole);
        }
    }
}
