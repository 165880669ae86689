//! Length-prefixed message framing.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::Error;

/// Largest accepted frame body. Generously above any legal message; a larger
/// prefix means the stream is broken or hostile.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Errors while reading or writing framed messages.
#[derive(Debug, Error)]
pub enum WireError {
    /// The stream failed or closed mid-frame
    #[error("stream io: {0}")]
    Io(#[from] std::io::Error),

    /// The body could not be encoded or decoded
    #[error("message codec: {0}")]
    Codec(#[from] bincode::Error),

    /// A frame length prefix exceeded [`MAX_FRAME_LEN`]
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    /// The remote answered with a typed protocol error
    #[error(transparent)]
    Remote(#[from] Error),
}

/// Write one framed message: 4-byte big-endian length, then the body.
pub async fn write_message<M, W>(stream: &mut W, msg: &M) -> Result<(), WireError>
where
    M: Serialize,
    W: AsyncWrite + Unpin,
{
    let body = bincode::serialize(msg)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge(body.len()));
    }
    stream.write_all(&(body.len() as u32).to_be_bytes()).await?;
    stream.write_all(&body).await?;
    Ok(())
}

/// Read one framed message.
pub async fn read_message<M, R>(stream: &mut R) -> Result<M, WireError>
where
    M: DeserializeOwned,
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 4];
    stream.read_exact(&mut prefix).await?;
    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge(len));
    }

    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(bincode::deserialize(&body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        seq: u64,
        note: String,
    }

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(256);

        let msg = Ping {
            seq: 7,
            note: "hello".into(),
        };
        write_message(&mut a, &msg).await.unwrap();

        let read: Ping = read_message(&mut b).await.unwrap();
        assert_eq!(read, msg);
    }

    #[tokio::test]
    async fn test_frame_sequences_preserve_boundaries() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        for seq in 0..5u64 {
            let msg = Ping {
                seq,
                note: "x".repeat(seq as usize * 3),
            };
            write_message(&mut a, &msg).await.unwrap();
        }
        for seq in 0..5u64 {
            let read: Ping = read_message(&mut b).await.unwrap();
            assert_eq!(read.seq, seq);
        }
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);

        let write = tokio::spawn(async move {
            let prefix = ((MAX_FRAME_LEN + 1) as u32).to_be_bytes();
            tokio::io::AsyncWriteExt::write_all(&mut a, &prefix).await.ok();
        });

        let res: Result<Ping, _> = read_message(&mut b).await;
        assert!(matches!(res, Err(WireError::FrameTooLarge(_))));
        write.await.unwrap();
    }
}
