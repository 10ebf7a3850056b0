//! HTTP/WebSocket front end serving the capture feed.

pub mod dispatch;
pub mod handshake;
pub mod line;
pub mod page;
pub mod websocket;

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::capture::FrameFeed;

pub use dispatch::{handle_connection, Request, Route};
pub use handshake::derive_accept_token;
pub use line::{LineReader, MAX_LINE};
pub use page::PageVariant;
pub use websocket::{encode_binary_header, WebSocketSession};

/// Accept loop handing every connection to its own task.
pub struct Server {
    listener: TcpListener,
    feed: FrameFeed,
    page: PageVariant,
}

impl Server {
    pub async fn bind(addr: &str, feed: FrameFeed, page: PageVariant) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("Web server listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            feed,
            page,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until `shutdown` completes. In-flight connections keep running.
    pub async fn run_until<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Web server stopping");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        metrics::counter!("camserve_connections_total").increment(1);
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
                        }
                        let feed = self.feed.clone();
                        let page = self.page;
                        tokio::spawn(
                            async move {
                                if let Err(e) = handle_connection(stream, feed, page).await {
                                    debug!("Connection ended: {}", e);
                                }
                            }
                            .instrument(info_span!("conn", %peer)),
                        );
                    }
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
            }
        }
    }
}
