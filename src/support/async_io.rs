//-
// Copyright (c) 2025, Jason Lingle
//
// This file is part of Graphgate.
//
// Graphgate is free software: you can  redistribute it and/or modify it under
// the terms  of the GNU General  Public License as published  by the Free
// Software Foundation, either version 3 of  the License, or (at your option)
// any later version.
//
// Graphgate is distributed  in the hope that it will  be useful, but WITHOUT
// ANY WARRANTY;  without even the  implied warranty of  MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along
// with Graphgate. If not, see <http://www.gnu.org/licenses/>.

use std::io;
use std::mem;
use std::pin::Pin;
use std::task;

use openssl::ssl::{Ssl, SslAcceptor};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_openssl::SslStream;

use crate::support::error::Error;

/// The main type for doing I/O on server connections.
///
/// A `ServerIo` starts out either in cleartext (STARTTLS-capable listeners)
/// or is upgraded with `ssl_accept` before the first byte is exchanged
/// (implicit-TLS listeners). The protocol engines only see one
/// `AsyncRead + AsyncWrite` type and query `is_ssl` to decide what to
/// advertise.
pub struct ServerIo {
    inner: Inner,
}

enum Inner {
    Cleartext(TcpStream),
    Ssl(SslStream<TcpStream>),
    #[cfg(test)]
    Duplex(tokio::io::DuplexStream),
    /// Transient state while an upgrade is in progress. Never observed
    /// outside `ssl_accept`.
    Handshaking,
}

impl ServerIo {
    /// Set up a `ServerIo` over an accepted socket, in cleartext.
    pub fn new_socket(sock: TcpStream) -> Self {
        Self {
            inner: Inner::Cleartext(sock),
        }
    }

    /// Set up a `ServerIo` over an in-memory stream for driving the
    /// protocol engines in tests. TLS upgrades are not possible.
    #[cfg(test)]
    pub fn new_duplex(stream: tokio::io::DuplexStream) -> Self {
        Self {
            inner: Inner::Duplex(stream),
        }
    }

    /// Perform the server side of a TLS handshake, switching this stream
    /// into TLS mode.
    ///
    /// Any bytes buffered by outer wrappers must have been flushed before
    /// the call; the handshake reads from the raw socket.
    pub async fn ssl_accept(
        &mut self,
        acceptor: &SslAcceptor,
    ) -> Result<(), Error> {
        let Inner::Cleartext(sock) =
            mem::replace(&mut self.inner, Inner::Handshaking)
        else {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "TLS accept on a stream which is not in cleartext mode",
            )));
        };

        let ssl = Ssl::new(acceptor.context())?;
        let mut stream = SslStream::new(ssl, sock)?;
        match Pin::new(&mut stream).accept().await {
            Ok(()) => {
                self.inner = Inner::Ssl(stream);
                Ok(())
            },
            Err(e) => Err(Error::Io(e.into_io_error().unwrap_or_else(|e| {
                io::Error::new(io::ErrorKind::Other, e)
            }))),
        }
    }

    /// Whether the stream is currently in TLS mode.
    pub fn is_ssl(&self) -> bool {
        matches!(self.inner, Inner::Ssl(..))
    }

    /// A human-readable description of the negotiated TLS parameters, if
    /// in TLS mode.
    pub fn ssl_string(&self) -> Option<String> {
        match self.inner {
            Inner::Ssl(ref stream) => {
                let ssl = stream.ssl();
                Some(format!(
                    "{}:{}",
                    ssl.version_str(),
                    ssl.current_cipher()
                        .map(|c| c.name())
                        .unwrap_or("unknown"),
                ))
            },
            _ => None,
        }
    }
}

impl AsyncRead for ServerIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> task::Poll<io::Result<()>> {
        match self.get_mut().inner {
            Inner::Cleartext(ref mut s) => Pin::new(s).poll_read(cx, buf),
            Inner::Ssl(ref mut s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(test)]
            Inner::Duplex(ref mut s) => Pin::new(s).poll_read(cx, buf),
            Inner::Handshaking => unreachable!("read during TLS handshake"),
        }
    }
}

impl AsyncWrite for ServerIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
        buf: &[u8],
    ) -> task::Poll<io::Result<usize>> {
        match self.get_mut().inner {
            Inner::Cleartext(ref mut s) => Pin::new(s).poll_write(cx, buf),
            Inner::Ssl(ref mut s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(test)]
            Inner::Duplex(ref mut s) => Pin::new(s).poll_write(cx, buf),
            Inner::Handshaking => unreachable!("write during TLS handshake"),
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<io::Result<()>> {
        match self.get_mut().inner {
            Inner::Cleartext(ref mut s) => Pin::new(s).poll_flush(cx),
            Inner::Ssl(ref mut s) => Pin::new(s).poll_flush(cx),
            #[cfg(test)]
            Inner::Duplex(ref mut s) => Pin::new(s).poll_flush(cx),
            Inner::Handshaking => unreachable!("flush during TLS handshake"),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<io::Result<()>> {
        match self.get_mut().inner {
            Inner::Cleartext(ref mut s) => Pin::new(s).poll_shutdown(cx),
            Inner::Ssl(ref mut s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(test)]
            Inner::Duplex(ref mut s) => Pin::new(s).poll_shutdown(cx),
            Inner::Handshaking => unreachable!("shutdown during TLS handshake"),
        }
    }
}
