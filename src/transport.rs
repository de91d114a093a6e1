//! Capability traits for the byte transports a client runs over.
//!
//! The client core is generic over these traits; `crate::stack` hosts the
//! std implementations (plain TCP and rustls-backed TLS).

use core::net::SocketAddr;

use embedded_io_async::{Error, Read, Write};

use edge_nal::TcpShutdown;

use crate::Protocol;

/// A factory for transport endpoints to remote peers.
///
/// `connect` establishes the raw TCP connection; `handshake` upgrades it
/// into the endpoint requests run over. Keeping the two apart lets the
/// connection state machine observe the handshake phase of secured
/// transports; for plain TCP the handshake is the identity.
pub trait Transport {
    /// The transport flavor, which also selects the default service name
    /// used when resolving the host.
    const PROTOCOL: Protocol;

    /// Error type returned by connect, handshake, and endpoint IO
    type Error: Error;

    /// The raw endpoint produced by `connect`
    type TcpSocket;

    /// The endpoint produced by `handshake`
    type Socket: Read<Error = Self::Error>
        + Write<Error = Self::Error>
        + TcpShutdown<Error = Self::Error>;

    /// Connect to a remote transport address
    async fn connect(&self, remote: SocketAddr) -> Result<Self::TcpSocket, Self::Error>;

    /// Complete the transport handshake on a freshly-connected endpoint.
    ///
    /// `host` is the name the peer must present credentials for. TLS
    /// transports send it as SNI and verify the peer certificate against
    /// it (RFC 2818 style); plain transports ignore it.
    async fn handshake(
        &self,
        host: &str,
        socket: Self::TcpSocket,
    ) -> Result<Self::Socket, Self::Error>;
}

impl<T> Transport for &T
where
    T: Transport,
{
    const PROTOCOL: Protocol = T::PROTOCOL;

    type Error = T::Error;

    type TcpSocket = T::TcpSocket;

    type Socket = T::Socket;

    async fn connect(&self, remote: SocketAddr) -> Result<Self::TcpSocket, Self::Error> {
        (*self).connect(remote).await
    }

    async fn handshake(
        &self,
        host: &str,
        socket: Self::TcpSocket,
    ) -> Result<Self::Socket, Self::Error> {
        (*self).handshake(host, socket).await
    }
}

/// Name resolution producing an ordered endpoint list.
///
/// Connect attempts walk the returned sequence in order until one
/// succeeds, so implementations should put preferred addresses first.
pub trait Resolve {
    /// The type returned when resolution fails
    type Error: Error;

    /// Resolve `host` for the given service name (`"http"` / `"https"`)
    async fn resolve(&self, host: &str, service: &str)
        -> Result<Vec<SocketAddr>, Self::Error>;
}

impl<T> Resolve for &T
where
    T: Resolve,
{
    type Error = T::Error;

    async fn resolve(
        &self,
        host: &str,
        service: &str,
    ) -> Result<Vec<SocketAddr>, Self::Error> {
        T::resolve(self, host, service).await
    }
}
