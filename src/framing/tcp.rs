//! Length-delimited TCP framing: `len[4, BE] ∥ epoch[2, BE] ∥ ciphertext+tag`.
//! The length field covers the epoch and the ciphertext. Handshake messages
//! use the same 4-byte outer record without an epoch field.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::constants::{MAX_FRAME, TAG_LEN};
use crate::error::{Result, TunnelError};

const EPOCH_LEN: usize = 2;
/// Smallest valid data frame: epoch + AEAD tag.
const MIN_FRAME: usize = EPOCH_LEN + TAG_LEN;

/// Write one data frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    epoch: u16,
    ciphertext: &[u8],
) -> Result<()> {
    let len = EPOCH_LEN + ciphertext.len();
    if len > MAX_FRAME {
        return Err(TunnelError::ResourceExhausted("frame"));
    }
    let mut header = [0u8; 6];
    header[..4].copy_from_slice(&(len as u32).to_be_bytes());
    header[4..].copy_from_slice(&epoch.to_be_bytes());
    writer.write_all(&header).await?;
    writer.write_all(ciphertext).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one data frame, validating the declared length before allocating.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(u16, Vec<u8>)> {
    let mut header = [0u8; 6];
    read_exact(reader, &mut header).await?;
    let len = u32::from_be_bytes(header[..4].try_into().expect("4 bytes")) as usize;
    if !(MIN_FRAME..=MAX_FRAME).contains(&len) {
        return Err(TunnelError::DecryptFail);
    }
    let epoch = u16::from_be_bytes(header[4..].try_into().expect("2 bytes"));
    let mut body = vec![0u8; len - EPOCH_LEN];
    read_exact(reader, &mut body).await?;
    Ok((epoch, body))
}

/// Write one handshake record: `len[4, BE] ∥ message`.
pub async fn write_handshake<W: AsyncWrite + Unpin>(writer: &mut W, msg: &[u8]) -> Result<()> {
    if msg.is_empty() || msg.len() > MAX_FRAME {
        return Err(TunnelError::HandshakeFailed);
    }
    writer.write_all(&(msg.len() as u32).to_be_bytes()).await?;
    writer.write_all(msg).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one handshake record.
pub async fn read_handshake<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut header = [0u8; 4];
    read_exact(reader, &mut header).await?;
    let len = u32::from_be_bytes(header) as usize;
    if len == 0 || len > MAX_FRAME {
        return Err(TunnelError::HandshakeFailed);
    }
    let mut msg = vec![0u8; len];
    read_exact(reader, &mut msg).await?;
    Ok(msg)
}

async fn read_exact<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(TunnelError::TransportClosed)
        }
        Err(e) => Err(e.into()),
    }
}
