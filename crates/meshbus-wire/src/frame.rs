//! Frame I/O over async byte streams.

use crate::codec::{decode_length, encode_envelope, FRAME_HEADER_LEN};
use crate::error::WireError;
use meshbus_types::Envelope;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Read one frame body (without the length prefix).
///
/// End of stream before the first header byte returns
/// [`WireError::ConnectionClosed`]. End of stream anywhere after it, in the
/// header or the body, is an I/O error: the framing can no longer be trusted.
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_LEN];
    match reader.read_exact(&mut header[..1]).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(WireError::ConnectionClosed);
        }
        Err(e) => return Err(WireError::Io(e)),
    }
    reader.read_exact(&mut header[1..]).await?;

    let len = decode_length(&header) as usize;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

/// Write a pre-encoded frame and flush.
pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Encode and write an envelope.
pub async fn write_envelope<W>(writer: &mut W, envelope: &Envelope) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_envelope(envelope)?;
    write_frame(writer, &frame).await
}
