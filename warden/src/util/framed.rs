// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Length-prefixed frames carrying JSON messages
//!
//! Each frame is a big-endian `u32` length followed by that many bytes of content.
//! A stream that ends cleanly between frames yields `None` rather than an error.

use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frames larger than this are refused unless a caller asks for a different limit
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 1024 * 1024;

#[derive(thiserror::Error, Debug)]
pub enum ReadError {
  #[error("Frame length of {received} bytes exceeds the limit of {limit}")]
  MaxLengthExceeded { limit: usize, received: usize },
  #[error("Stream ended partway through a frame of {length} bytes")]
  Truncated {
    length: usize,
    #[source]
    error: std::io::Error,
  },
  #[error("Stream ended after {received} of the 4 bytes of a frame length")]
  TruncatedLength { received: usize },
  #[error("Failure reading frame: {0}")]
  Io(#[from] std::io::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum WriteError {
  #[error("Frame of {0} bytes cannot be described by a u32 length")]
  Oversized(usize),
  #[error("Failure writing frame: {0}")]
  Io(#[from] std::io::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum MessageReadError {
  #[error(transparent)]
  Frame(#[from] ReadError),
  #[error("Malformed message content: {0}")]
  Malformed(#[from] serde_json::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum MessageWriteError {
  #[error(transparent)]
  Frame(#[from] WriteError),
  #[error("Message could not be serialized: {0}")]
  Serialization(#[from] serde_json::Error),
}

/// Reads a single frame, or `None` if the stream closed before a new frame began
pub async fn read_frame<R: AsyncRead + Unpin>(
  reader: &mut R,
  max_length: usize,
) -> Result<Option<Vec<u8>>, ReadError> {
  let mut prefix = [0u8; 4];
  let mut received = 0;
  while received < prefix.len() {
    match reader.read(&mut prefix[received..]).await? {
      0 if received == 0 => return Ok(None),
      0 => return Err(ReadError::TruncatedLength { received }),
      n => received += n,
    }
  }
  let length = u32::from_be_bytes(prefix) as usize;
  if length > max_length {
    return Err(ReadError::MaxLengthExceeded {
      limit: max_length,
      received: length,
    });
  }
  let mut buffer = vec![0u8; length];
  reader
    .read_exact(&mut buffer)
    .await
    .map_err(|error| ReadError::Truncated { length, error })?;
  Ok(Some(buffer))
}

pub async fn write_frame<W: AsyncWrite + Unpin>(
  writer: &mut W,
  content: &[u8],
) -> Result<(), WriteError> {
  let length = u32::try_from(content.len()).map_err(|_| WriteError::Oversized(content.len()))?;
  writer.write_u32(length).await?;
  writer.write_all(content).await?;
  writer.flush().await?;
  Ok(())
}

pub async fn read_message<R, T>(reader: &mut R, max_length: usize) -> Result<Option<T>, MessageReadError>
where
  R: AsyncRead + Unpin,
  T: DeserializeOwned,
{
  match read_frame(reader, max_length).await? {
    None => Ok(None),
    Some(frame) => Ok(Some(serde_json::from_slice(&frame)?)),
  }
}

pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<(), MessageWriteError>
where
  W: AsyncWrite + Unpin,
  T: Serialize + ?Sized,
{
  let content = serde_json::to_vec(message)?;
  write_frame(writer, &content).await?;
  Ok(())
}
