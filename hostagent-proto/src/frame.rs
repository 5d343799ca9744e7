//! Framed channel I/O.
//!
//! The local channels carrying task traffic have small internal buffers,
//! so a value is never written atomically. Instead it is transmitted as a
//! chunk-count line followed by that many fixed-size slices, each flushed
//! before the next is sent. Reading mirrors the layout and reassembles
//! the original value.

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum characters per chunk line.
pub const CHUNK_SIZE: usize = 500;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("channel i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid chunk count line: {0:?}")]
    BadChunkCount(String),
    #[error("channel closed after {read} of {expected} chunks")]
    Truncated { read: usize, expected: usize },
    #[error("value contains a newline and cannot be framed")]
    NewlineInValue,
}

/// Write `value` as a framed sequence of chunks.
///
/// An empty value is legal and produces a frame with chunk count zero.
/// Any I/O failure aborts the whole frame and must be treated by the
/// caller as fatal for this connection.
pub async fn write_framed<W>(writer: &mut W, value: &str) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    if value.contains('\n') {
        return Err(FrameError::NewlineInValue);
    }

    let chunks = chunk_value(value);
    writer
        .write_all(format!("{}\n", chunks.len()).as_bytes())
        .await?;
    writer.flush().await?;

    for chunk in chunks {
        writer.write_all(chunk.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        // Let the peer drain the channel before the next slice.
        writer.flush().await?;
    }

    Ok(())
}

/// Read one framed value, reassembling chunks in order.
pub async fn read_framed<R>(reader: &mut R) -> Result<String, FrameError>
where
    R: AsyncBufRead + Unpin,
{
    let mut header = String::new();
    if reader.read_line(&mut header).await? == 0 {
        return Err(FrameError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "channel closed before frame header",
        )));
    }

    let count: usize = header
        .trim()
        .parse()
        .map_err(|_| FrameError::BadChunkCount(header.trim().to_string()))?;

    let mut value = String::new();
    for read in 0..count {
        let mut chunk = String::new();
        if reader.read_line(&mut chunk).await? == 0 {
            return Err(FrameError::Truncated {
                read,
                expected: count,
            });
        }
        if chunk.ends_with('\n') {
            chunk.pop();
        }
        value.push_str(&chunk);
    }

    Ok(value)
}

/// Split a value into at-most-`CHUNK_SIZE`-character slices.
fn chunk_value(value: &str) -> Vec<&str> {
    let mut chunks = Vec::new();
    let mut rest = value;
    while !rest.is_empty() {
        let split = rest
            .char_indices()
            .nth(CHUNK_SIZE)
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        let (head, tail) = rest.split_at(split);
        chunks.push(head);
        rest = tail;
    }
    chunks
}
