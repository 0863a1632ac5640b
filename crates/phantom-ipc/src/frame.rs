//! Length-prefixed text frames.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{IpcError, Result};

/// Upper bound on one frame. The largest legitimate payload is the
/// ModifiedPaths listing for a huge enlistment.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Reads one frame, returning its text payload.
///
/// A clean EOF before the length prefix maps to [`IpcError::Disconnected`]
/// so accept loops can tell hangups from protocol errors.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(IpcError::Disconnected);
        }
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(IpcError::FrameTooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    String::from_utf8(payload).map_err(|_| IpcError::NotText)
}

/// Writes one frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &str) -> Result<()> {
    let bytes = payload.as_bytes();
    if bytes.len() > MAX_FRAME_LEN {
        return Err(IpcError::FrameTooLarge {
            len: bytes.len(),
            max: MAX_FRAME_LEN,
        });
    }
    writer.write_all(&(bytes.len() as u32).to_le_bytes()).await?;
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_frame(&mut client, "GetStatus\0").await.unwrap();
        let frame = read_frame(&mut server).await.unwrap();
        assert_eq!(frame, "GetStatus\0");
    }

    #[tokio::test]
    async fn body_may_contain_nuls() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_frame(&mut client, "ModifiedPaths\0a\0b\0c\0")
            .await
            .unwrap();
        let frame = read_frame(&mut server).await.unwrap();
        assert_eq!(frame.matches('\0').count(), 4);
    }

    #[tokio::test]
    async fn oversized_length_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let huge = (MAX_FRAME_LEN as u32 + 1).to_le_bytes();
        tokio::io::AsyncWriteExt::write_all(&mut client, &huge)
            .await
            .unwrap();
        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, IpcError::FrameTooLarge { .. }));
    }

    #[tokio::test]
    async fn hangup_is_disconnected() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, IpcError::Disconnected));
    }
}
