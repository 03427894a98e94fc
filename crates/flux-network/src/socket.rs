//! Socket utilities (C4): listener creation and non-blocking connect with an
//! optional resolution cache.

use std::{
    io,
    net::{SocketAddr, ToSocketAddrs},
    time::{Duration, Instant},
};

use mio::net::{TcpListener, TcpStream};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, warn};

use crate::error::SocketError;

const LISTEN_BACKLOG: i32 = 128;
const CACHE_TTL: Duration = Duration::from_secs(300);

/// Binds a non-blocking, close-on-exec listener on `addr:port`. `addr` is
/// expected to be a numeric host (IPv4 dotted or IPv6 colonned), matching the
/// no-DNS contract for the bind side.
pub fn listen(addr: &str, port: u16) -> Result<TcpListener, SocketError> {
    let resolved: SocketAddr = format!("{addr}:{port}")
        .parse()
        .map_err(|_| SocketError::Resolve(format!("{addr}:{port}")))?;

    let domain = if resolved.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).map_err(SocketError::Connect)?;
    socket.set_reuse_address(true).map_err(SocketError::Connect)?;
    socket.set_nonblocking(true).map_err(SocketError::Connect)?;
    socket.bind(&resolved.into()).map_err(SocketError::Connect)?;
    socket.listen(LISTEN_BACKLOG).map_err(SocketError::Connect)?;

    let std_listener: std::net::TcpListener = socket.into();
    let listener = TcpListener::from_std(std_listener);
    debug!(%resolved, "listening");
    Ok(listener)
}

/// Caches the last successful DNS resolution for a `(host, port)` pair,
/// treated as time-to-live from the resolution itself rather than from last
/// use: a hit within [`CACHE_TTL`] of when the address was resolved is
/// served without touching the resolver; once stale it is dropped and the
/// next connect re-resolves.
#[derive(Default)]
pub struct ResolveCache {
    entry: Option<(String, u16, SocketAddr, Instant)>,
}

impl ResolveCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&mut self, host: &str, port: u16) -> Option<SocketAddr> {
        let (cached_host, cached_port, addr, resolved_at) = self.entry.as_ref()?;
        if cached_host != host || *cached_port != port {
            return None;
        }
        if resolved_at.elapsed() > CACHE_TTL {
            self.entry = None;
            return None;
        }
        Some(*addr)
    }

    fn invalidate(&mut self) {
        self.entry = None;
    }

    fn store(&mut self, host: &str, port: u16, addr: SocketAddr) {
        self.entry = Some((host.to_owned(), port, addr, Instant::now()));
    }
}

/// Resolves `host:port` (DNS allowed) and connects, trying the cached
/// address first when present and not expired, then every resolved
/// candidate in order. Returns the first socket that connects immediately
/// or reports "in progress" (mio's `connect` never blocks). Invalidates the
/// cache entry on failure.
pub fn connect(host: &str, port: u16, cache: &mut ResolveCache) -> Result<TcpStream, SocketError> {
    if let Some(addr) = cache.get(host, port) {
        match try_connect(addr) {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                warn!(%addr, %err, "cached address failed to connect, invalidating");
                cache.invalidate();
            }
        }
    }

    let candidates: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|_| SocketError::Resolve(format!("{host}:{port}")))?
        .collect();
    if candidates.is_empty() {
        return Err(SocketError::NoCandidates);
    }

    for addr in &candidates {
        match try_connect(*addr) {
            Ok(stream) => {
                cache.store(host, port, *addr);
                return Ok(stream);
            }
            Err(err) => warn!(%addr, %err, "candidate failed to connect"),
        }
    }
    Err(SocketError::NoCandidates)
}

fn try_connect(addr: SocketAddr) -> io::Result<TcpStream> {
    TcpStream::connect(addr)
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener as StdTcpListener;

    use super::*;

    #[test]
    fn listen_binds_ephemeral_port() {
        let listener = listen("127.0.0.1", 0).unwrap();
        assert!(listener.local_addr().unwrap().port() > 0);
    }

    #[test]
    fn connect_reaches_loopback_listener() {
        let std_listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let port = std_listener.local_addr().unwrap().port();
        let mut cache = ResolveCache::new();
        let stream = connect("127.0.0.1", port, &mut cache).unwrap();
        assert!(stream.peer_addr().is_ok() || stream.take_error().unwrap().is_none());
    }

    #[test]
    fn cache_expires_after_ttl() {
        let mut cache = ResolveCache::new();
        cache.store("example.test", 80, "127.0.0.1:80".parse().unwrap());
        assert!(cache.get("example.test", 80).is_some());
        cache.entry.as_mut().unwrap().3 = Instant::now() - CACHE_TTL - Duration::from_secs(1);
        assert!(cache.get("example.test", 80).is_none());
    }
}
