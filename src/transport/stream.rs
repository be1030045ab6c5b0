//! Socket wrapper: TCP, Unix or TLS, with message framing.

use futures::FutureExt;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, UnixStream};

#[cfg(feature = "tls")]
use tokio_native_tls::TlsStream;

use crate::buffer_set::BufferSet;
use crate::error::{Error, Result};
use crate::opts::Opts;

pub enum Stream {
    Tcp(BufReader<TcpStream>),
    #[cfg(feature = "tls")]
    Tls(BufReader<TlsStream<TcpStream>>),
    Unix(BufReader<UnixStream>),
}

impl Stream {
    pub fn tcp(stream: TcpStream) -> Self {
        Self::Tcp(BufReader::new(stream))
    }

    pub fn unix(stream: UnixStream) -> Self {
        Self::Unix(BufReader::new(stream))
    }

    /// Open the socket described by `opts`.
    pub async fn connect(opts: &Opts) -> Result<Self> {
        if let Some(path) = opts.socket_path() {
            return Ok(Self::unix(UnixStream::connect(&path).await?));
        }
        if opts.host.is_empty() {
            return Err(Error::InvalidUsage("host is empty".into()));
        }
        let tcp = TcpStream::connect((opts.host.as_str(), opts.port)).await?;
        tcp.set_nodelay(true)?;
        Ok(Self::tcp(tcp))
    }

    pub fn is_unix(&self) -> bool {
        matches!(self, Self::Unix(_))
    }

    pub async fn read_exact(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        match self {
            Stream::Tcp(r) => r.read_exact(buf).await.map(|_| ()),
            #[cfg(feature = "tls")]
            Stream::Tls(r) => r.read_exact(buf).await.map(|_| ()),
            Stream::Unix(r) => r.read_exact(buf).await.map(|_| ()),
        }
    }

    pub async fn read_u8(&mut self) -> std::io::Result<u8> {
        let mut byte = [0_u8; 1];
        self.read_exact(&mut byte).await?;
        let [b] = byte;
        Ok(b)
    }

    /// Whether the server has sent something that was not read yet. Never waits.
    ///
    /// End of stream counts as input, so the next read reports it.
    pub fn has_pending_input(&mut self) -> Result<bool> {
        let ready = match self {
            Stream::Tcp(r) => r.fill_buf().now_or_never().map(|res| res.map(|_| ())),
            #[cfg(feature = "tls")]
            Stream::Tls(r) => r.fill_buf().now_or_never().map(|res| res.map(|_| ())),
            Stream::Unix(r) => r.fill_buf().now_or_never().map(|res| res.map(|_| ())),
        };
        match ready {
            None => Ok(false),
            Some(Ok(())) => Ok(true),
            Some(Err(e)) => Err(e.into()),
        }
    }

    /// Read one framed message: type byte into `type_byte`, payload into `read_buffer`.
    pub async fn read_message(&mut self, buffer_set: &mut BufferSet) -> Result<()> {
        let mut header = [0_u8; 5];
        self.read_exact(&mut header).await?;
        let [type_byte, length @ ..] = header;
        let length = u32::from_be_bytes(length);
        let Some(payload_len) = length.checked_sub(4) else {
            return Err(Error::Protocol(format!("Invalid message length: {length}")));
        };

        buffer_set.type_byte = type_byte;
        buffer_set.read_buffer.clear();
        buffer_set.read_buffer.resize(payload_len as usize, 0);
        self.read_exact(&mut buffer_set.read_buffer).await?;
        Ok(())
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            Stream::Tcp(r) => r.get_mut().write_all(buf).await,
            #[cfg(feature = "tls")]
            Stream::Tls(r) => r.get_mut().write_all(buf).await,
            Stream::Unix(r) => r.get_mut().write_all(buf).await,
        }
    }

    pub async fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Stream::Tcp(r) => r.get_mut().flush().await,
            #[cfg(feature = "tls")]
            Stream::Tls(r) => r.get_mut().flush().await,
            Stream::Unix(r) => r.get_mut().flush().await,
        }
    }

    /// Write `write_buffer` and empty it.
    pub async fn send(&mut self, buffer_set: &mut BufferSet) -> Result<()> {
        self.write_all(&buffer_set.write_buffer).await?;
        self.flush().await?;
        buffer_set.write_buffer.clear();
        Ok(())
    }

    pub async fn shutdown(&mut self) -> std::io::Result<()> {
        match self {
            Stream::Tcp(r) => r.get_mut().shutdown().await,
            #[cfg(feature = "tls")]
            Stream::Tls(r) => r.get_mut().shutdown().await,
            Stream::Unix(r) => r.get_mut().shutdown().await,
        }
    }

    /// Run the TLS handshake after the server accepted SSLRequest.
    #[cfg(feature = "tls")]
    pub async fn upgrade_to_tls(self, host: &str) -> Result<Self> {
        let Stream::Tcp(reader) = self else {
            return Err(Error::InvalidUsage("TLS is only available over TCP".into()));
        };
        let connector = tokio_native_tls::TlsConnector::from(native_tls::TlsConnector::new()?);
        let tls = connector.connect(host, reader.into_inner()).await?;
        Ok(Stream::Tls(BufReader::new(tls)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_messages() {
        let Ok((client, mut server)) = UnixStream::pair() else {
            return;
        };
        let mut stream = Stream::unix(client);
        let sent = server
            .write_all(&[b'Z', 0, 0, 0, 5, b'I', b'C', 0, 0, 0, 4])
            .await;
        assert!(sent.is_ok());

        let mut bs = BufferSet::new();
        assert!(stream.read_message(&mut bs).await.is_ok());
        assert_eq!((bs.type_byte, bs.read_buffer.as_slice()), (b'Z', &b"I"[..]));
        assert!(stream.read_message(&mut bs).await.is_ok());
        assert_eq!((bs.type_byte, bs.read_buffer.len()), (b'C', 0));
    }

    #[tokio::test]
    async fn pending_input_is_seen_without_waiting() {
        let Ok((client, mut server)) = UnixStream::pair() else {
            return;
        };
        let mut stream = Stream::unix(client);
        assert!(matches!(stream.has_pending_input(), Ok(false)));

        assert!(server.write_all(&[b'Z', 0, 0, 0, 5, b'I']).await.is_ok());
        let mut pending = false;
        for _ in 0..100 {
            pending = matches!(stream.has_pending_input(), Ok(true));
            if pending {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(pending);

        let mut bs = BufferSet::new();
        assert!(stream.read_message(&mut bs).await.is_ok());
        assert_eq!(bs.type_byte, b'Z');
        assert!(matches!(stream.has_pending_input(), Ok(false)));
    }

    #[tokio::test]
    async fn rejects_short_length() {
        let Ok((client, mut server)) = UnixStream::pair() else {
            return;
        };
        let mut stream = Stream::unix(client);
        assert!(server.write_all(&[b'Z', 0, 0, 0, 3]).await.is_ok());
        let mut bs = BufferSet::new();
        assert!(matches!(
            stream.read_message(&mut bs).await,
            Err(Error::Protocol(_))
        ));
    }
}
