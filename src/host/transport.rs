use crate::error::{HostError, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Exclusive upper bound on a frame's payload length (1 MiB)
///
/// 프레임 형식 (양방향): 4바이트 little-endian `u32` 길이 + 본문.
/// 길이는 `0 < length < MAX_FRAME_LEN`.
pub const MAX_FRAME_LEN: u32 = 1024 * 1024;

pub fn is_valid_length(length: u32) -> bool {
    length > 0 && length < MAX_FRAME_LEN
}

/// Prefix `payload` with its little-endian length
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>> {
    let length = u32::try_from(payload.len())
        .ok()
        .filter(|length| is_valid_length(*length))
        .ok_or(HostError::OutboundLength(payload.len()))?;

    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&length.to_le_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Reads whole frames from a byte stream.
///
/// Buffered, so a burst of back-to-back frames is drained from memory
/// without another trip to the pipe.
pub struct FrameReader<R> {
    inner: BufReader<R>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
        }
    }

    /// Read the next frame.
    ///
    /// - `HeaderRead`: fewer than 4 header bytes before EOF. Fatal.
    /// - `InvalidLength`: declared length out of range; the body is left
    ///   unread.
    /// - `TruncatedBody`: the body ended early; only this frame is lost.
    pub async fn read_frame(&mut self) -> Result<Vec<u8>> {
        let mut header = [0u8; 4];
        self.inner
            .read_exact(&mut header)
            .await
            .map_err(HostError::HeaderRead)?;

        let length = u32::from_le_bytes(header);
        if !is_valid_length(length) {
            return Err(HostError::InvalidLength(length));
        }

        let mut body = vec![0u8; length as usize];
        self.inner
            .read_exact(&mut body)
            .await
            .map_err(|source| HostError::TruncatedBody {
                expected: length,
                source,
            })?;

        Ok(body)
    }
}

/// Writes whole frames. Not synchronised; exactly one task may own it.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Header and payload go out in a single `write_all`, then flush
    pub async fn write_frame(&mut self, payload: &[u8]) -> Result<()> {
        let frame = encode_frame(payload)?;
        self.inner.write_all(&frame).await?;
        self.inner.flush().await?;
        Ok(())
    }
}
