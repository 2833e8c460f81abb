//! Content-Length framed message transport.
//!
//! Each message on the wire is a header block (one or more `Name: value`
//! lines terminated by CRLF), a blank CRLF line, then exactly N bytes of
//! UTF-8 JSON where N comes from the case-insensitive `Content-Length`
//! header. The framing hides whether the underlying channel is a subprocess
//! pipe or a TCP socket; [`crate::client::RpcClient`] accepts any
//! `AsyncRead`/`AsyncWrite` pair.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::warn;

/// Reads framed messages from a byte stream.
pub struct FrameReader<R> {
    inner: BufReader<R>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wrap a raw byte stream.
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
        }
    }

    /// Read the next frame payload.
    ///
    /// Returns `Ok(Some(payload))` for a complete frame and `Ok(None)` on a
    /// clean end of stream. A header block with no `Content-Length` is
    /// dropped and reading resumes at the next block; unknown headers are
    /// skipped.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error if the stream fails, including an
    /// unexpected EOF in the middle of a frame body.
    pub async fn read_frame(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        loop {
            let Some(content_length) = self.read_header_block().await? else {
                return Ok(None);
            };
            let Some(content_length) = content_length else {
                warn!("dropping message with no Content-Length header");
                continue;
            };
            let mut payload = vec![0u8; content_length];
            self.inner.read_exact(&mut payload).await?;
            return Ok(Some(payload));
        }
    }

    /// Read one header block up to and including its blank line.
    ///
    /// The outer `None` means the stream ended before a block started; the
    /// inner value is the parsed `Content-Length`, if any.
    async fn read_header_block(&mut self) -> std::io::Result<Option<Option<usize>>> {
        let mut content_length: Option<usize> = None;
        let mut line = String::new();
        loop {
            line.clear();
            if self.inner.read_line(&mut line).await? == 0 {
                return Ok(None);
            }
            let header = line.trim_end_matches(['\r', '\n']);
            if header.is_empty() {
                return Ok(Some(content_length));
            }
            if let Some((name, value)) = header.split_once(':') {
                if name.trim().eq_ignore_ascii_case("content-length") {
                    match value.trim().parse::<usize>() {
                        Ok(length) => content_length = Some(length),
                        Err(_) => {
                            warn!(header, "ignoring unparseable Content-Length header");
                        }
                    }
                }
            }
        }
    }
}

/// Encode and write one frame.
///
/// Callers serialize access through a single writer lock so concurrent
/// senders never interleave partial frames.
///
/// # Errors
///
/// Returns the underlying I/O error if the write or flush fails.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> std::io::Result<()> {
    let header = format!("Content-Length: {}\r\n\r\n", payload.len());
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_then_read_frame() {
        let (client, server) = tokio::io::duplex(4096);
        let (reader_half, _keep) = tokio::io::split(client);
        let (_keep2, mut writer_half) = tokio::io::split(server);

        write_frame(&mut writer_half, br#"{"jsonrpc":"2.0"}"#)
            .await
            .unwrap();

        let mut reader = FrameReader::new(reader_half);
        let frame = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(frame, br#"{"jsonrpc":"2.0"}"#);
    }

    #[tokio::test]
    async fn test_unknown_headers_are_skipped() {
        let (client, server) = tokio::io::duplex(4096);
        let (reader_half, _keep) = tokio::io::split(client);
        let (_keep2, mut writer_half) = tokio::io::split(server);

        let body = br#"{"ok":true}"#;
        let raw = format!(
            "X-Custom-Header: value\r\nContent-Length: {}\r\n\r\n",
            body.len()
        );
        writer_half.write_all(raw.as_bytes()).await.unwrap();
        writer_half.write_all(body).await.unwrap();

        let mut reader = FrameReader::new(reader_half);
        let frame = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(frame, body);
    }

    #[tokio::test]
    async fn test_content_length_is_case_insensitive() {
        let (client, server) = tokio::io::duplex(4096);
        let (reader_half, _keep) = tokio::io::split(client);
        let (_keep2, mut writer_half) = tokio::io::split(server);

        let body = b"{}";
        let raw = format!("content-length: {}\r\n\r\n", body.len());
        writer_half.write_all(raw.as_bytes()).await.unwrap();
        writer_half.write_all(body).await.unwrap();

        let mut reader = FrameReader::new(reader_half);
        let frame = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(frame, body);
    }

    #[tokio::test]
    async fn test_block_without_content_length_is_dropped() {
        let (client, server) = tokio::io::duplex(4096);
        let (reader_half, _keep) = tokio::io::split(client);
        let (_keep2, mut writer_half) = tokio::io::split(server);

        writer_half
            .write_all(b"X-Only-Header: no-length\r\n\r\n")
            .await
            .unwrap();
        let body = br#"{"ok":true}"#;
        let raw = format!("Content-Length: {}\r\n\r\n", body.len());
        writer_half.write_all(raw.as_bytes()).await.unwrap();
        writer_half.write_all(body).await.unwrap();

        let mut reader = FrameReader::new(reader_half);
        let frame = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(frame, body);
    }

    #[tokio::test]
    async fn test_eof_yields_none() {
        let (client, server) = tokio::io::duplex(4096);
        let (reader_half, _keep) = tokio::io::split(client);
        drop(server);

        let mut reader = FrameReader::new(reader_half);
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_back_to_back_frames() {
        let (client, server) = tokio::io::duplex(4096);
        let (reader_half, _keep) = tokio::io::split(client);
        let (_keep2, mut writer_half) = tokio::io::split(server);

        write_frame(&mut writer_half, b"{\"a\":1}").await.unwrap();
        write_frame(&mut writer_half, b"{\"b\":2}").await.unwrap();

        let mut reader = FrameReader::new(reader_half);
        assert_eq!(reader.read_frame().await.unwrap().unwrap(), b"{\"a\":1}");
        assert_eq!(reader.read_frame().await.unwrap().unwrap(), b"{\"b\":2}");
    }
}
