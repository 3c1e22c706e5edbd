//! Length-delimited, compressed, typed frames over a byte stream, plus the
//! raw CRLF line I/O used by the identity preamble and turn tokens.
//!
//! One frame on the wire is a 4-byte big-endian length followed by that many
//! bytes of deflate-compressed JSON. The framer never reads past the end of
//! the current frame or line, so the underlying stream can be handed between
//! protocol phases without losing buffered bytes.

use {
    flate2::{read::DeflateDecoder, write::DeflateEncoder, Compression},
    serde::{de::DeserializeOwned, Serialize},
    std::{
        convert::TryFrom,
        io::{self, Read, Write},
    },
    tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
};

use crate::{defaults, error::TransportError};

pub struct FramedStream<S> {
    stream: S,
    max_frame_length: usize,
}

impl<S> FramedStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, max_frame_length: usize) -> FramedStream<S> {
        FramedStream {
            stream,
            max_frame_length,
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Serialize, compress, and frame one value.
    pub async fn send_typed<T: Serialize>(&mut self, value: &T) -> Result<(), TransportError> {
        let encoded = serde_json::to_vec(value)
            .map_err(|e| TransportError::protocol(format!("failed to serialize message: {}", e)))?;
        let compressed = compress(&encoded)?;
        if compressed.len() > self.max_frame_length {
            return Err(TransportError::protocol(format!(
                "outgoing frame of {} bytes exceeds the {} byte limit",
                compressed.len(),
                self.max_frame_length
            )));
        }
        let length = u32::try_from(compressed.len())
            .map_err(|_| TransportError::protocol("outgoing frame exceeds u32 length"))?;
        self.stream.write_all(&length.to_be_bytes()).await?;
        self.stream.write_all(&compressed).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Read one frame and decode it. Oversized lengths and bytes that fail to
    /// inflate or deserialize are protocol violations: the stream is no
    /// longer positioned at a frame boundary and must be destroyed.
    pub async fn receive_typed<T: DeserializeOwned>(&mut self) -> Result<T, TransportError> {
        let mut header = [0; 4];
        self.stream.read_exact(&mut header).await?;
        let length = u32::from_be_bytes(header) as usize;
        if length == 0 || length > self.max_frame_length {
            return Err(TransportError::protocol(format!(
                "incoming frame length {} outside 1..={}",
                length, self.max_frame_length
            )));
        }
        let mut compressed = vec![0; length];
        self.stream.read_exact(&mut compressed).await?;
        let decompressed = decompress(&compressed)
            .map_err(|e| TransportError::protocol(format!("frame does not inflate: {}", e)))?;
        serde_json::from_slice(&decompressed)
            .map_err(|e| TransportError::protocol(format!("failed to decode message: {}", e)))
    }

    /// Write one ASCII line, CRLF-terminated.
    pub async fn write_line(&mut self, line: &str) -> Result<(), TransportError> {
        self.stream.write_all(line.as_bytes()).await?;
        self.stream.write_all(b"\r\n").await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Read one line, or `None` if the peer closed the stream before sending
    /// a single byte, the quiet departure of a peer that had nothing more to
    /// say. EOF *mid*-line is a protocol violation.
    pub async fn read_line_or_eof(&mut self) -> Result<Option<String>, TransportError> {
        let mut line = Vec::new();
        let mut byte = [0; 1];
        loop {
            let read = self.stream.read(&mut byte).await?;
            if read == 0 {
                if line.is_empty() {
                    return Ok(None);
                }
                return Err(TransportError::protocol("stream ended mid-line"));
            }
            if byte[0] == b'\n' {
                break;
            }
            if line.len() >= defaults::max_line_length() {
                return Err(TransportError::protocol("line exceeds maximum length"));
            }
            line.push(byte[0]);
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        match String::from_utf8(line) {
            Ok(line) => Ok(Some(line)),
            Err(_) => Err(TransportError::protocol("line is not valid UTF-8")),
        }
    }

    /// Read one line, treating EOF as an error.
    pub async fn read_line(&mut self) -> Result<String, TransportError> {
        self.read_line_or_eof().await?.ok_or_else(|| {
            TransportError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream closed while a line was expected",
            ))
        })
    }

    /// Write raw bytes untouched; used for the HTTP response served to
    /// browsers that wander into the port.
    pub(crate) async fn write_raw(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), TransportError> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

fn compress(bytes: &[u8]) -> Result<Vec<u8>, io::Error> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::fast());
    encoder.write_all(bytes)?;
    encoder.finish()
}

fn decompress(bytes: &[u8]) -> Result<Vec<u8>, io::Error> {
    let mut decompressed = Vec::new();
    DeflateDecoder::new(bytes).read_to_end(&mut decompressed)?;
    Ok(decompressed)
}
