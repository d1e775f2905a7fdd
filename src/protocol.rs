//! The response channel.
//!
//! Cooperating processes exchange single-word UDP datagrams on loopback:
//! `SNAP` asks for a snapshot, `YES` and `NO` answer the pending one.
//! Delivery is best effort. Anything that is not exactly one of the three
//! tokens (surrounding whitespace aside) is dropped without a reply.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

/// Largest datagram we bother reading. Real tokens are at most 4 bytes.
const MAX_DATAGRAM: usize = 64;

/// A well-formed message on the response channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    Snap,
    Yes,
    No,
}

impl Token {
    /// Parse a datagram payload. Returns `None` for anything malformed.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(payload).ok()?;
        match text.trim_matches(|c: char| c.is_whitespace() || c == '\0') {
            "SNAP" => Some(Token::Snap),
            "YES" => Some(Token::Yes),
            "NO" => Some(Token::No),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Token::Snap => "SNAP",
            Token::Yes => "YES",
            Token::No => "NO",
        }
    }

    /// The label carried by `YES`/`NO`.
    pub fn label(&self) -> Option<bool> {
        match self {
            Token::Yes => Some(true),
            Token::No => Some(false),
            Token::Snap => None,
        }
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives tokens from the listener. Called on the listener task, so it
/// must not block.
pub trait TokenHandler: Send + Sync {
    fn on_token(&self, token: Token, from: SocketAddr);
}

impl<F> TokenHandler for F
where
    F: Fn(Token, SocketAddr) + Send + Sync,
{
    fn on_token(&self, token: Token, from: SocketAddr) {
        self(token, from)
    }
}

/// UDP listener for the response channel.
#[derive(Debug)]
pub struct ResponseListener {
    socket: UdpSocket,
    local_addr: SocketAddr,
}

impl ResponseListener {
    /// Bind to `addr`, which must be a loopback address.
    pub async fn bind(addr: SocketAddr) -> Result<Self, ProtocolError> {
        ensure_loopback(addr)?;
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| ProtocolError::Bind(addr, e.to_string()))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| ProtocolError::Io(e.to_string()))?;
        Ok(Self { socket, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Dispatch tokens to `handler` until `cancel` fires.
    pub async fn run<H: TokenHandler>(self, handler: H, cancel: CancellationToken) {
        let mut buf = [0u8; MAX_DATAGRAM];
        tracing::info!("Listening for responses on udp://{}", self.local_addr);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => {
                    let (len, from) = match received {
                        Ok(r) => r,
                        Err(e) => {
                            // ICMP port-unreachable and friends surface here on some
                            // platforms; the socket stays usable.
                            tracing::debug!("Response channel receive error: {}", e);
                            continue;
                        }
                    };

                    if !from.ip().is_loopback() {
                        tracing::debug!("Dropping datagram from non-local peer {}", from);
                        continue;
                    }

                    match Token::parse(&buf[..len]) {
                        Some(token) => {
                            tracing::debug!("Received {} from {}", token, from);
                            handler.on_token(token, from);
                        }
                        None => tracing::debug!("Dropping malformed datagram ({} bytes) from {}", len, from),
                    }
                }
            }
        }

        tracing::info!("Response listener stopped");
    }
}

/// Send one token to `addr` from an ephemeral loopback socket.
pub async fn send_token(addr: SocketAddr, token: Token) -> Result<(), ProtocolError> {
    ensure_loopback(addr)?;
    let local = match addr.ip() {
        IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
        IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 0),
    };
    let socket = UdpSocket::bind(local)
        .await
        .map_err(|e| ProtocolError::Bind(local, e.to_string()))?;
    socket
        .send_to(token.as_str().as_bytes(), addr)
        .await
        .map_err(|e| ProtocolError::Io(e.to_string()))?;
    Ok(())
}

/// Reject any address that could be reached from another machine.
pub fn ensure_loopback(addr: SocketAddr) -> Result<(), ProtocolError> {
    if addr.ip().is_loopback() {
        Ok(())
    } else {
        Err(ProtocolError::NotLoopback(addr))
    }
}

/// Response channel errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    NotLoopback(SocketAddr),
    Bind(SocketAddr, String),
    Io(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::NotLoopback(addr) => {
                write!(f, "{addr} is not a loopback address")
            }
            ProtocolError::Bind(addr, e) => write!(f, "Could not bind {addr}: {e}"),
            ProtocolError::Io(e) => write!(f, "IO error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}
