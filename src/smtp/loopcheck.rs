//! Loop detector: counts `Received:` header lines before the first blank
//! line, so a task whose body has already hopped through too many relays
//! can be failed as `Loop` rather than forwarded forever.

use crate::collab::ContentHandle;
use crate::error::Result;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};

pub struct LoopCheck;

impl LoopCheck {
    /// Count `Received:` header lines (case-insensitive) up to the first
    /// blank line (end of headers), short-circuiting once `hop_limit` is
    /// reached. Always rewinds `content` back to its start before
    /// returning, whatever the count, since the body streamer sends the
    /// whole message from the top regardless of outcome.
    pub async fn count_received_headers(content: &mut ContentHandle, hop_limit: u32) -> Result<u32> {
        let result = Self::scan(content, hop_limit).await;
        content.seek(std::io::SeekFrom::Start(0)).await?;
        result
    }

    async fn scan(content: &mut ContentHandle, hop_limit: u32) -> Result<u32> {
        content.seek(std::io::SeekFrom::Start(0)).await?;
        let mut reader = BufReader::new(&mut *content);
        let mut count = 0u32;

        loop {
            let mut line = String::new();
            let n = reader.read_line(&mut line).await?;
            if n == 0 {
                break;
            }
            let trimmed = line.trim_end_matches(['\r', '\n']);
            let starts_with_whitespace = trimmed.starts_with(' ') || trimmed.starts_with('\t');
            if !starts_with_whitespace && !trimmed.contains(':') {
                break;
            }
            if trimmed.len() >= 9 && trimmed[..9].eq_ignore_ascii_case("received:") {
                count += 1;
                if count >= hop_limit {
                    return Ok(count);
                }
            }
        }

        Ok(count)
    }

    /// Whether `count_received_headers`'s result means the task should be
    /// failed as `Loop` rather than sent.
    pub fn exceeds(count: u32, hop_limit: u32) -> bool {
        count >= hop_limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn counts_received_headers_case_insensitively() {
        let mut content: ContentHandle = Box::new(Cursor::new(
            b"RECEIVED: from a\r\nreceived: from b\r\nSubject: hi\r\n\r\nbody\r\n".to_vec(),
        ));
        let count = LoopCheck::count_received_headers(&mut content, 100).await.unwrap();
        assert_eq!(count, 2);
        assert!(!LoopCheck::exceeds(count, 100));
    }

    #[tokio::test]
    async fn stops_scanning_at_first_blank_line() {
        let mut content: ContentHandle = Box::new(Cursor::new(
            b"Received: from a\r\n\r\nReceived: this is body text, not a header\r\n".to_vec(),
        ));
        let count = LoopCheck::count_received_headers(&mut content, 100).await.unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn flags_loop_once_hop_limit_is_exceeded() {
        let mut body = Vec::new();
        for _ in 0..5 {
            body.extend_from_slice(b"Received: from somewhere\r\n");
        }
        body.extend_from_slice(b"\r\nbody\r\n");
        let mut content: ContentHandle = Box::new(Cursor::new(body));
        let count = LoopCheck::count_received_headers(&mut content, 3).await.unwrap();
        assert!(LoopCheck::exceeds(count, 3));
    }

    #[tokio::test]
    async fn flags_loop_when_count_exactly_equals_hop_limit() {
        let mut body = Vec::new();
        for _ in 0..3 {
            body.extend_from_slice(b"Received: from somewhere\r\n");
        }
        body.extend_from_slice(b"\r\nbody\r\n");
        let mut content: ContentHandle = Box::new(Cursor::new(body));
        let count = LoopCheck::count_received_headers(&mut content, 3).await.unwrap();
        assert!(LoopCheck::exceeds(count, 3));
    }

    #[tokio::test]
    async fn rewinds_content_regardless_of_outcome() {
        let mut content: ContentHandle =
            Box::new(Cursor::new(b"Received: from a\r\n\r\nhello world\r\n".to_vec()));
        LoopCheck::count_received_headers(&mut content, 0).await.unwrap();
        let mut rest = String::new();
        use tokio::io::AsyncReadExt;
        content.read_to_string(&mut rest).await.unwrap();
        assert_eq!(rest, "Received: from a\r\n\r\nhello world\r\n");
    }
}
