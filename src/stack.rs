//! STD implementations of the transport traits, built on the same
//! `async-io` sockets as `edge-nal-std`.

use core::net::SocketAddr;

use std::io;
use std::net::ToSocketAddrs;

use edge_nal::TcpConnect;
use edge_nal_std::{Stack, TcpSocket};

use crate::transport::{Resolve, Transport};
use crate::Protocol;

#[cfg(feature = "tls")]
pub use tls::*;

/// Plain-TCP transport over the std network stack.
#[derive(Default, Clone)]
pub struct Plain(Stack);

impl Plain {
    pub const fn new() -> Self {
        Self(Stack::new())
    }
}

impl Transport for Plain {
    const PROTOCOL: Protocol = Protocol::Plain;

    type Error = io::Error;

    type TcpSocket = TcpSocket;

    type Socket = TcpSocket;

    async fn connect(&self, remote: SocketAddr) -> Result<Self::TcpSocket, Self::Error> {
        self.0.connect(remote).await
    }

    async fn handshake(
        &self,
        _host: &str,
        socket: Self::TcpSocket,
    ) -> Result<Self::Socket, Self::Error> {
        Ok(socket)
    }
}

impl Resolve for Plain {
    type Error = io::Error;

    async fn resolve(
        &self,
        host: &str,
        service: &str,
    ) -> Result<Vec<SocketAddr>, Self::Error> {
        lookup_host(host, service)
    }
}

fn lookup_host(host: &str, service: &str) -> Result<Vec<SocketAddr>, io::Error> {
    let port = match service {
        "http" => Protocol::Plain.default_port(),
        "https" => Protocol::Tls.default_port(),
        other => other
            .parse::<u16>()
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?,
    };

    let endpoints = (host, port).to_socket_addrs()?.collect::<Vec<_>>();

    if endpoints.is_empty() {
        Err(io::ErrorKind::AddrNotAvailable.into())
    } else {
        Ok(endpoints)
    }
}

#[cfg(feature = "tls")]
mod tls {
    use core::net::SocketAddr;

    use std::io;
    use std::net::{Shutdown, TcpStream};
    use std::sync::Arc;

    use async_io::Async;

    use futures_lite::io::{AsyncReadExt, AsyncWriteExt};

    use futures_rustls::client::TlsStream;
    use futures_rustls::rustls::pki_types::ServerName;
    use futures_rustls::rustls::{ClientConfig, RootCertStore};
    use futures_rustls::TlsConnector;

    use embedded_io_async::{ErrorType, Read, Write};

    use edge_nal::{Close, TcpConnect, TcpShutdown};
    use edge_nal_std::{Stack, TcpSocket};

    use log::debug;

    use crate::transport::{Resolve, Transport};
    use crate::Protocol;

    /// TLS transport over the std network stack.
    ///
    /// rustls in client mode (TLS 1.2+): the host name is sent as SNI and
    /// the peer certificate is verified against it, RFC 2818 style.
    #[derive(Clone)]
    pub struct Tls {
        stack: Stack,
        connector: TlsConnector,
    }

    impl Tls {
        /// Build a TLS transport trusting the system default root store.
        pub fn new() -> Result<Self, io::Error> {
            let mut roots = RootCertStore::empty();

            let (added, ignored) =
                roots.add_parsable_certificates(rustls_native_certs::load_native_certs()?);

            debug!("Loaded {added} system trust roots ({ignored} ignored)");

            let config = ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth();

            Ok(Self::with_config(Arc::new(config)))
        }

        /// Build a TLS transport from a prepared rustls configuration.
        pub fn with_config(config: Arc<ClientConfig>) -> Self {
            Self {
                stack: Stack::new(),
                connector: TlsConnector::from(config),
            }
        }
    }

    impl Transport for Tls {
        const PROTOCOL: Protocol = Protocol::Tls;

        type Error = io::Error;

        type TcpSocket = TcpSocket;

        type Socket = TlsSocket;

        async fn connect(&self, remote: SocketAddr) -> Result<Self::TcpSocket, Self::Error> {
            self.stack.connect(remote).await
        }

        async fn handshake(
            &self,
            host: &str,
            socket: Self::TcpSocket,
        ) -> Result<Self::Socket, Self::Error> {
            let name = ServerName::try_from(host.to_string())
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

            debug!("TLS handshake with {host}");

            let stream = self.connector.connect(name, socket.release()).await?;

            Ok(TlsSocket(stream))
        }
    }

    impl Resolve for Tls {
        type Error = io::Error;

        async fn resolve(
            &self,
            host: &str,
            service: &str,
        ) -> Result<Vec<SocketAddr>, Self::Error> {
            super::lookup_host(host, service)
        }
    }

    /// A TLS endpoint
    pub struct TlsSocket(TlsStream<Async<TcpStream>>);

    impl TlsSocket {
        pub fn release(self) -> TlsStream<Async<TcpStream>> {
            self.0
        }
    }

    impl ErrorType for TlsSocket {
        type Error = io::Error;
    }

    impl Read for TlsSocket {
        async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
            self.0.read(buf).await
        }
    }

    impl Write for TlsSocket {
        async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
            self.0.write(buf).await
        }

        async fn flush(&mut self) -> Result<(), Self::Error> {
            self.0.flush().await
        }
    }

    impl TcpShutdown for TlsSocket {
        async fn close(&mut self, what: Close) -> Result<(), Self::Error> {
            if matches!(what, Close::Write | Close::Both) {
                // Deliver close_notify before tearing down the TCP stream
                let _ = self.0.close().await;
            }

            match what {
                Close::Read => self.0.get_ref().0.as_ref().shutdown(Shutdown::Read)?,
                Close::Write => self.0.get_ref().0.as_ref().shutdown(Shutdown::Write)?,
                Close::Both => self.0.get_ref().0.as_ref().shutdown(Shutdown::Both)?,
            }

            Ok(())
        }

        async fn abort(&mut self) -> Result<(), Self::Error> {
            // No-op, STD will abort the socket on drop anyway

            Ok(())
        }
    }
}
