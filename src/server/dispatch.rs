//! Per-connection request handling.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, instrument, warn};

use crate::capture::FrameFeed;
use crate::error::{ConnectionError, ProtocolError, ReadError};

use super::handshake::{self, KEY_HEADER_PREFIX};
use super::line::LineReader;
use super::page::PageVariant;
use super::websocket::WebSocketSession;

const JPEG_HEADER: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Type: image/jpeg\r\nConnection: close\r\n\r\n";
const BAD_REQUEST: &[u8] =
    b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
const NOT_FOUND: &[u8] = b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
const SERVER_ERROR: &[u8] =
    b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
const LINGER: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Frame,
    Socket,
    Index,
    NotFound,
}

const ROUTES: &[(&str, Route)] = &[
    ("GET /frame.jpg", Route::Frame),
    ("GET /socket ", Route::Socket),
    ("GET / ", Route::Index),
];

impl Route {
    /// Longest matching prefix of the raw request line.
    pub fn classify(line: &[u8]) -> Route {
        ROUTES
            .iter()
            .filter(|(prefix, _)| line.starts_with(prefix.as_bytes()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map_or(Route::NotFound, |(_, route)| *route)
    }
}

/// Request line split into its parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub raw_line: &'a str,
}

impl<'a> Request<'a> {
    pub fn parse(line: &'a [u8]) -> Result<Self, ProtocolError> {
        let raw_line = std::str::from_utf8(line).map_err(|_| ProtocolError::MalformedRequest)?;
        let mut parts = raw_line.split(' ').filter(|part| !part.is_empty());
        match (parts.next(), parts.next()) {
            (Some(method), Some(path)) => Ok(Self {
                method,
                path,
                raw_line,
            }),
            _ => Err(ProtocolError::MalformedRequest),
        }
    }
}

/// Serve one connection: one request, one response, then close.
///
/// WebSocket upgrades keep the connection until the stream ends.
#[instrument(skip_all)]
pub async fn handle_connection<S>(
    stream: S,
    mut feed: FrameFeed,
    page: PageVariant,
) -> Result<(), ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut reader = LineReader::new(stream);

    let route = {
        let line = reader.read_line().await?;
        let route = Route::classify(line);
        match Request::parse(line) {
            Ok(request) => debug!(method = request.method, path = request.path, ?route, "request"),
            Err(_) => debug!(?route, "unparseable request line"),
        }
        route
    };

    if route == Route::Socket {
        return upgrade(reader, &mut feed).await;
    }

    // Plain routes answer from the request line alone.
    let mut stream = reader.into_inner();
    let result = match route {
        Route::Frame => match feed.next_frame().await {
            Ok(frame) => {
                write(&mut stream, JPEG_HEADER).await?;
                write(&mut stream, &frame.data).await
            }
            Err(e) => {
                warn!("No frame for /frame.jpg: {}", e);
                write(&mut stream, SERVER_ERROR).await
            }
        },
        Route::Index => {
            let html = page.html();
            let header = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                html.len()
            );
            write(&mut stream, header.as_bytes()).await?;
            write(&mut stream, html.as_bytes()).await
        }
        _ => write(&mut stream, NOT_FOUND).await,
    };

    let _ = stream.shutdown().await;
    if result.is_ok() {
        linger(&mut stream).await;
    }
    result
}

/// Read the upgrade headers, answer with 101 and push frames until the
/// stream ends.
async fn upgrade<S>(mut reader: LineReader<S>, feed: &mut FrameFeed) -> Result<(), ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let key = read_websocket_key(&mut reader).await?;
    let mut stream = reader.into_inner();
    let token = match key {
        Some(Ok(token)) => token,
        Some(Err(e)) => return reject(&mut stream, e).await,
        None => return reject(&mut stream, ProtocolError::MissingWebSocketKey).await,
    };

    let session = WebSocketSession::accept(stream, &token)
        .await
        .map_err(ConnectionError::Write)?;
    let sent = session.push_frames(feed).await;
    debug!(frames = sent, "websocket stream ended");
    Ok(())
}

/// Read and discard until the peer closes or [`LINGER`] passes.
async fn linger<S>(stream: &mut S)
where
    S: AsyncRead + Unpin,
{
    let mut scratch = [0u8; 512];
    let _ = tokio::time::timeout(LINGER, async {
        while let Ok(n) = stream.read(&mut scratch).await {
            if n == 0 {
                break;
            }
        }
    })
    .await;
}

/// Consume header lines up to the blank line.
///
/// Returns the accept token derived from the first `Sec-WebSocket-Key`
/// header, or the reason it could not be used.
async fn read_websocket_key<R>(
    reader: &mut LineReader<R>,
) -> Result<Option<Result<String, ProtocolError>>, ReadError>
where
    R: AsyncRead + Unpin,
{
    let mut token = None;
    loop {
        let line = reader.read_line().await?;
        if line.is_empty() {
            return Ok(token);
        }
        if token.is_none() {
            if let Some(value) = line.strip_prefix(KEY_HEADER_PREFIX) {
                token = Some(handshake::parse_client_key(value).map(handshake::derive_accept_token));
            }
        }
    }
}

async fn reject<S>(stream: &mut S, error: ProtocolError) -> Result<(), ConnectionError>
where
    S: AsyncWrite + Unpin,
{
    write(stream, BAD_REQUEST).await?;
    let _ = stream.shutdown().await;
    Err(error.into())
}

async fn write<S>(stream: &mut S, bytes: &[u8]) -> Result<(), ConnectionError>
where
    S: AsyncWrite + Unpin,
{
    stream
        .write_all(bytes)
        .await
        .map_err(ConnectionError::Write)
}
