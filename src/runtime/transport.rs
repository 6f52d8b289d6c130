use std::io::{self, Read, Write};

use tokio::{io::Interest, net::TcpStream};

/// A tokio TCP stream seen through the non-blocking `Read`/`Write` contract the
/// TLS connection expects: `WouldBlock` instead of waiting.
#[derive(Debug)]
pub struct TokioTransport {
    stream: TcpStream,
}

impl TokioTransport {
    /// Wraps an accepted stream.
    #[must_use]
    pub const fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    /// Waits until the socket is ready for `interest`.
    ///
    /// # Errors
    ///
    /// Returns the socket's IO error.
    pub async fn ready(&self, interest: Interest) -> io::Result<()> {
        self.stream.ready(interest).await.map(|_| ())
    }

    /// Gives back the stream.
    #[must_use]
    pub fn into_inner(self) -> TcpStream {
        self.stream
    }
}

impl Read for TokioTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.try_read(buf)
    }
}

impl Write for TokioTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.try_write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
