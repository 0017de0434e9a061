//! Local HTTP receiver for the redirect strategy.
//!
//! Stands in for the application's callback page when the consent flow is
//! driven from a terminal: the provider redirects the browser to this
//! listener, which runs the callback handling and then sends the browser on
//! to the settings page.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use super::callback::{settings_location, CallbackParams};
use super::{CallbackOutcome, Coordinator};
use crate::error::ConnectError;

const MAX_HEADER_LINES: usize = 100;

/// How long one connection may take to send its request head.
pub const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(5);

pub struct CallbackListener {
    listener: TcpListener,
    read_timeout: Duration,
}

impl CallbackListener {
    pub async fn bind(addr: SocketAddr) -> Result<Self, ConnectError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|error| ConnectError::NetworkError(format!("bind {addr}: {error}")))?;
        Ok(Self {
            listener,
            read_timeout: REQUEST_READ_TIMEOUT,
        })
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ConnectError> {
        self.listener
            .local_addr()
            .map_err(|error| ConnectError::NetworkError(error.to_string()))
    }

    /// Serves requests until one hits the callback path, then returns its
    /// outcome. Other paths (favicon requests and the like) get a 404. A
    /// connection that stays silent past the read timeout is dropped.
    pub async fn receive(self, coordinator: &Coordinator) -> Result<CallbackOutcome, ConnectError> {
        let callback_path = coordinator.config().callback_path.clone();
        loop {
            let (mut stream, peer) = self
                .listener
                .accept()
                .await
                .map_err(|error| ConnectError::NetworkError(format!("accept: {error}")))?;

            let read =
                tokio::time::timeout(self.read_timeout, read_request_target(&mut stream)).await;
            let target = match read {
                Ok(Ok(Some(target))) => target,
                Ok(Ok(None)) => {
                    let _ = respond(&mut stream, "400 Bad Request", None, "Bad request").await;
                    continue;
                }
                Ok(Err(error)) => {
                    debug!(%peer, "dropping unreadable request: {error}");
                    continue;
                }
                Err(_) => {
                    debug!(%peer, "dropping connection that sent no request in time");
                    continue;
                }
            };

            let (path, query) = target.split_once('?').unwrap_or((target.as_str(), ""));
            if path != callback_path {
                debug!(%peer, path, "not the callback path");
                let _ = respond(&mut stream, "404 Not Found", None, "Not found").await;
                continue;
            }

            info!(%peer, "gmail callback received");
            let outcome = coordinator
                .handle_callback(&CallbackParams::from_query(query))
                .await;
            let written = match settings_location(coordinator.config(), &outcome) {
                Some(location) => {
                    respond(&mut stream, "303 See Other", Some(location.as_str()), "").await
                }
                None => {
                    respond(
                        &mut stream,
                        "200 OK",
                        None,
                        "This authorization was already handled. You can close this window.",
                    )
                    .await
                }
            };
            if let Err(error) = written {
                warn!(%peer, "failed to answer callback request: {error}");
            }
            return outcome;
        }
    }
}

/// Reads the request line and drains the headers. Returns `None` for
/// anything that is not a `GET`.
async fn read_request_target(stream: &mut TcpStream) -> std::io::Result<Option<String>> {
    let mut reader = BufReader::new(stream);
    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;

    let mut header = String::new();
    for _ in 0..MAX_HEADER_LINES {
        header.clear();
        let read = reader.read_line(&mut header).await?;
        if read == 0 || header.trim().is_empty() {
            break;
        }
    }

    let mut parts = request_line.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some("GET"), Some(target)) => Ok(Some(target.to_string())),
        _ => Ok(None),
    }
}

async fn respond(
    stream: &mut TcpStream,
    status: &str,
    location: Option<&str>,
    body: &str,
) -> std::io::Result<()> {
    let mut response = format!("HTTP/1.1 {status}\r\n");
    if let Some(location) = location {
        response.push_str(&format!("Location: {location}\r\n"));
    }
    response.push_str(&format!(
        "Content-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    ));
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}
