//! Byte stream: the transport underneath the line codec. Wraps a plain or
//! TLS-upgraded `TcpStream`, enforces the line-length cap and the single
//! inactivity timer, and applies high-water-mark backpressure on writes.
//!
//! Every suspension point here is a plain `.await` point rather than a
//! callback or an explicit event type — no separate event-dispatch loop
//! is needed.

use crate::error::{MtaError, Result};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;

enum Transport {
    Plain(BufReader<TcpStream>),
    Tls(BufReader<TlsStream<TcpStream>>),
    #[cfg(test)]
    Duplex(BufReader<tokio::io::DuplexStream>),
    /// Transient placeholder while the plain `TcpStream` is on loan to a
    /// TLS handshake; never observed outside
    /// `take_plain_tcp_stream`/`upgrade`.
    Placeholder,
}

/// One TCP (optionally TLS-upgraded) connection to a remote SMTP server.
///
/// Input can be paused so the state machine can stop reading while it
/// still has queued output to drain, and output is buffered up to
/// `high_water_mark` before a caller must `drain()` before queuing more —
/// the same backpressure rule the body streamer relies on.
pub struct ByteStream {
    transport: Transport,
    out_buf: Vec<u8>,
    high_water_mark: usize,
    inactivity_timeout: Duration,
    input_paused: bool,
}

impl ByteStream {
    pub async fn connect_plain(
        addr: std::net::SocketAddr,
        source_addr: Option<std::net::IpAddr>,
        high_water_mark: usize,
        inactivity_timeout: Duration,
    ) -> Result<Self> {
        let stream = match source_addr {
            Some(src) => {
                let socket = match src {
                    std::net::IpAddr::V4(_) => tokio::net::TcpSocket::new_v4()?,
                    std::net::IpAddr::V6(_) => tokio::net::TcpSocket::new_v6()?,
                };
                socket.bind(std::net::SocketAddr::new(src, 0))?;
                socket.connect(addr).await?
            }
            None => TcpStream::connect(addr).await?,
        };
        stream.set_nodelay(true).ok();
        Ok(Self {
            transport: Transport::Plain(BufReader::new(stream)),
            out_buf: Vec::new(),
            high_water_mark,
            inactivity_timeout,
            input_paused: false,
        })
    }

    /// Consume the plain transport and replace it with the upgraded TLS
    /// stream. The transport has no usable I/O for the brief window while
    /// the handshake itself is in flight (see `take_plain_tcp_stream`).
    pub fn upgrade(&mut self, tls_stream: TlsStream<TcpStream>) {
        self.transport = Transport::Tls(BufReader::new(tls_stream));
    }

    pub fn is_tls(&self) -> bool {
        matches!(self.transport, Transport::Tls(_))
    }

    /// Test-only constructor backed by an in-process duplex pipe, so the
    /// body streamer and state machine can be exercised without a real
    /// socket.
    #[cfg(test)]
    pub fn from_duplex_for_test(
        stream: tokio::io::DuplexStream,
        high_water_mark: usize,
        inactivity_timeout: Duration,
    ) -> Self {
        Self {
            transport: Transport::Duplex(BufReader::new(stream)),
            out_buf: Vec::new(),
            high_water_mark,
            inactivity_timeout,
            input_paused: false,
        }
    }

    /// Take the plain `TcpStream` out for a TLS handshake, leaving a
    /// transient placeholder behind. Used for both implicit SMTPS (before
    /// the supervisor ever calls into the state machine) and mid-dialog
    /// STARTTLS. Fails if the `BufReader` is still holding unconsumed
    /// bytes, since those would be silently dropped; callers
    /// only upgrade right after a CRLF-terminated reply, which guarantees
    /// the buffer is empty.
    pub fn take_plain_tcp_stream(&mut self) -> Result<TcpStream> {
        if self.has_buffered_input() {
            return Err(MtaError::Protocol(
                "unsolicited data present before TLS handshake".to_string(),
            ));
        }
        match std::mem::replace(&mut self.transport, Transport::Placeholder) {
            Transport::Plain(reader) => Ok(reader.into_inner()),
            other => {
                self.transport = other;
                Err(MtaError::Protocol("stream is not in plain-text mode".to_string()))
            }
        }
    }

    /// Whether the input buffer still holds bytes beyond the line just
    /// consumed — the anti-smuggling check: if a reply is followed by
    /// unread bytes, the remote is speaking out of turn and the session
    /// is killed.
    pub fn has_buffered_input(&self) -> bool {
        match &self.transport {
            Transport::Plain(r) => !r.buffer().is_empty(),
            Transport::Tls(r) => !r.buffer().is_empty(),
            #[cfg(test)]
            Transport::Duplex(r) => !r.buffer().is_empty(),
            Transport::Placeholder => false,
        }
    }

    pub fn pause_input(&mut self) {
        self.input_paused = true;
    }

    pub fn resume_input(&mut self) {
        self.input_paused = false;
    }

    /// Read one CRLF-terminated line, with the trailing CRLF stripped.
    ///
    /// `Ok(None)` is a clean EOF before any bytes arrived (a disconnected
    /// peer). A line exceeding `max_len` without a terminator, or any read
    /// after `pause_input()`, is a fatal protocol error — the session
    /// drops the connection.
    pub async fn read_line(&mut self, max_len: usize) -> Result<Option<String>> {
        if self.input_paused {
            return Err(MtaError::Protocol("read attempted while input is paused".to_string()));
        }

        let fut = async {
            let mut line = String::new();
            let n = match &mut self.transport {
                Transport::Plain(r) => read_line_capped(r, &mut line, max_len).await,
                Transport::Tls(r) => read_line_capped(r, &mut line, max_len).await,
                #[cfg(test)]
                Transport::Duplex(r) => read_line_capped(r, &mut line, max_len).await,
                Transport::Placeholder => {
                    Err(MtaError::Protocol("read attempted mid-TLS-handshake".to_string()))
                }
            }?;
            if n == 0 {
                return Ok(None);
            }
            let trimmed = line.trim_end_matches(['\r', '\n']);
            Ok(Some(trimmed.to_string()))
        };

        match timeout(self.inactivity_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(MtaError::Timeout),
        }
    }

    /// Append bytes to the pending output buffer without writing them
    /// yet. Returns `true` if the buffer is now at or above the
    /// high-water mark and the caller should `drain()` before queuing
    /// more.
    pub fn queue(&mut self, bytes: &[u8]) -> bool {
        self.out_buf.extend_from_slice(bytes);
        self.out_buf.len() >= self.high_water_mark
    }

    /// Flush everything queued so far.
    pub async fn drain(&mut self) -> Result<()> {
        if self.out_buf.is_empty() {
            return Ok(());
        }
        let buf = std::mem::take(&mut self.out_buf);
        let write = async {
            match &mut self.transport {
                Transport::Plain(r) => r.get_mut().write_all(&buf).await,
                Transport::Tls(r) => r.get_mut().write_all(&buf).await,
                #[cfg(test)]
                Transport::Duplex(r) => r.get_mut().write_all(&buf).await,
                Transport::Placeholder => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::NotConnected,
                        "write attempted mid-TLS-handshake",
                    ))
                }
            }
        };
        timeout(self.inactivity_timeout, write)
            .await
            .map_err(|_| MtaError::Timeout)??;
        Ok(())
    }

    pub async fn write_line(&mut self, line: &[u8]) -> Result<()> {
        self.queue(line);
        self.drain().await
    }
}

async fn read_line_capped<R: tokio::io::AsyncBufRead + Unpin>(
    reader: &mut R,
    out: &mut String,
    max_len: usize,
) -> Result<usize> {
    use tokio::io::AsyncBufReadExt;
    let mut total = 0usize;
    loop {
        let mut chunk = String::new();
        let n = reader.read_line(&mut chunk).await?;
        if n == 0 {
            return Ok(total);
        }
        total += n;
        out.push_str(&chunk);
        if out.ends_with('\n') {
            if out.len() > max_len {
                return Err(MtaError::Protocol(format!(
                    "line exceeds maximum length of {} bytes",
                    max_len
                )));
            }
            return Ok(total);
        }
        if out.len() > max_len {
            return Err(MtaError::Protocol(format!(
                "line exceeds maximum length of {} bytes",
                max_len
            )));
        }
    }
}

#[allow(dead_code)]
fn _assert_send<T: Send>() {}
