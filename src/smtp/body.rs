//! Body streamer: sends the message content as SMTP `DATA` lines —
//! dot-stuffed, CRLF-terminated, back-pressured against the byte stream's
//! high-water mark.
//!
//! The trailing lone-dot terminator is deliberately not emitted here: that
//! belongs to the EOM transition in the state machine, which is a protocol
//! event rather than a content-streaming one.

use crate::collab::ContentHandle;
use crate::error::Result;
use crate::smtp::stream::ByteStream;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};

pub struct BodyStreamer;

impl BodyStreamer {
    /// Rewind `content` to the start and stream every line to `out`,
    /// dot-stuffing lines that begin with `.` and terminating each with
    /// CRLF regardless of how the content is itself terminated.
    ///
    /// Any error reading `content` here is a local fault, not a remote
    /// one: callers must treat it as a `TempFail` of the whole task and
    /// close the session.
    pub async fn stream(content: &mut ContentHandle, out: &mut ByteStream) -> Result<()> {
        content.seek(std::io::SeekFrom::Start(0)).await?;
        let mut reader = BufReader::new(&mut *content);

        loop {
            let mut raw = Vec::new();
            let n = reader.read_until(b'\n', &mut raw).await?;
            if n == 0 {
                break;
            }
            while matches!(raw.last(), Some(b'\n') | Some(b'\r')) {
                raw.pop();
            }

            if raw.first() == Some(&b'.') {
                out.queue(b".");
            }
            let over_water = out.queue(&raw);
            let over_water = out.queue(b"\r\n") || over_water;
            if over_water {
                out.drain().await?;
            }
        }

        out.drain().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::duplex;

    async fn collect_written(body: &[u8]) -> Vec<u8> {
        let mut content: ContentHandle = Box::new(Cursor::new(body.to_vec()));
        let (client, mut server) = duplex(1 << 20);
        let mut out =
            ByteStream::from_duplex_for_test(client, 65_536, std::time::Duration::from_secs(5));
        BodyStreamer::stream(&mut content, &mut out).await.unwrap();
        drop(out);

        let mut buf = Vec::new();
        use tokio::io::AsyncReadExt;
        let _ = tokio::time::timeout(std::time::Duration::from_millis(50), server.read_to_end(&mut buf)).await;
        buf
    }

    #[tokio::test]
    async fn dot_stuffs_leading_dot_lines() {
        let out = collect_written(b"Subject: hi\r\n.secret\r\nbody\r\n").await;
        assert_eq!(out, b"Subject: hi\r\n..secret\r\nbody\r\n".to_vec());
    }

    #[tokio::test]
    async fn normalizes_bare_lf_to_crlf() {
        let out = collect_written(b"line one\nline two\n").await;
        assert_eq!(out, b"line one\r\nline two\r\n".to_vec());
    }
}
