//! Unified plaintext/TLS stream with SMTP line framing.

use crate::types::Reply;
use crate::{Error, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::server::TlsStream;

/// A connection stream that is either plain TCP or server-side TLS.
///
/// STARTTLS consumes the plain variant and yields the TLS one; the read
/// buffer is dropped in the process, so plaintext bytes pipelined ahead of
/// the upgrade never leak into the encrypted session.
pub enum SmtpStream {
    /// Plain TCP.
    Tcp(BufReader<TcpStream>),
    /// Server-side TLS.
    Tls(Box<BufReader<TlsStream<TcpStream>>>),
}

impl SmtpStream {
    /// Wraps an accepted TCP stream.
    #[must_use]
    pub fn plain(stream: TcpStream) -> Self {
        Self::Tcp(BufReader::new(stream))
    }

    /// Performs the server-side handshake for an implicit-TLS connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the handshake fails.
    pub async fn tls(stream: TcpStream, acceptor: &TlsAcceptor) -> Result<Self> {
        let tls = acceptor.accept(stream).await?;
        Ok(Self::Tls(Box::new(BufReader::new(tls))))
    }

    /// Upgrades a plain stream to TLS in place (STARTTLS).
    ///
    /// # Errors
    ///
    /// Returns an error if the stream is already TLS or the handshake fails.
    pub async fn upgrade(self, acceptor: &TlsAcceptor) -> Result<Self> {
        match self {
            Self::Tcp(reader) => {
                let stream = reader.into_inner();
                let tls = acceptor.accept(stream).await?;
                Ok(Self::Tls(Box::new(BufReader::new(tls))))
            }
            Self::Tls(_) => Err(Error::Config("connection is already TLS".to_string())),
        }
    }

    /// Reads one raw line including its terminator bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] on EOF, or an I/O error.
    pub async fn read_line_bytes(&mut self) -> Result<Vec<u8>> {
        let mut line = Vec::new();
        let n = match self {
            Self::Tcp(r) => r.read_until(b'\n', &mut line).await?,
            Self::Tls(r) => r.read_until(b'\n', &mut line).await?,
        };
        if n == 0 {
            return Err(Error::ConnectionClosed);
        }
        Ok(line)
    }

    /// Reads one command line, lossily decoded and stripped of its
    /// terminator.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] on EOF, or an I/O error.
    pub async fn read_line(&mut self) -> Result<String> {
        let mut bytes = self.read_line_bytes().await?;
        while bytes.last().is_some_and(|&b| b == b'\n' || b == b'\r') {
            bytes.pop();
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Writes and flushes one reply.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the write fails.
    pub async fn write_reply(&mut self, reply: &Reply) -> Result<()> {
        let wire = reply.to_wire();
        match self {
            Self::Tcp(s) => {
                s.get_mut().write_all(&wire).await?;
                s.get_mut().flush().await?;
            }
            Self::Tls(s) => {
                s.get_mut().write_all(&wire).await?;
                s.get_mut().flush().await?;
            }
        }
        Ok(())
    }
}
