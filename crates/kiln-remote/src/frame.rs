use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::FourCC;

/// Upper bound on the error-description slot of a response frame.
pub const MAX_ERROR_DESC: usize = 1024;

/// Payloads larger than this are treated as a framing error.
const MAX_PAYLOAD: u32 = 256 * 1024 * 1024;

/// One framed message. Layout on the wire, little-endian:
///
/// ```text
/// u32 command
/// u64 cookie
/// u8  is_response
/// u8  error
/// u32 error_desc length, error_desc bytes
/// u32 payload length, payload bytes
/// ```
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Frame {
    pub command: FourCC,
    pub cookie: u64,
    pub is_response: bool,
    pub error: bool,
    pub error_desc: String,
    pub payload: Vec<u8>,
}

impl Frame {
    pub(crate) fn request(command: FourCC, cookie: u64, payload: Vec<u8>) -> Self {
        Self {
            command,
            cookie,
            is_response: false,
            error: false,
            error_desc: String::new(),
            payload,
        }
    }

    pub(crate) fn response(
        command: FourCC,
        cookie: u64,
        payload: Vec<u8>,
        error: bool,
        error_desc: &str,
    ) -> Self {
        let mut desc = error_desc.to_owned();
        desc.truncate(MAX_ERROR_DESC);
        Self {
            command,
            cookie,
            is_response: true,
            error,
            error_desc: desc,
            payload,
        }
    }
}

pub(crate) async fn read_frame<R>(reader: &mut R) -> std::io::Result<Frame>
where
    R: AsyncRead + Unpin,
{
    let command = reader.read_u32_le().await?;
    let cookie = reader.read_u64_le().await?;
    let is_response = reader.read_u8().await? != 0;
    let error = reader.read_u8().await? != 0;

    let desc_len = reader.read_u32_le().await?;
    if desc_len as usize > MAX_ERROR_DESC {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "oversized error description",
        ));
    }
    let mut desc = vec![0_u8; desc_len as usize];
    reader.read_exact(&mut desc).await?;

    let payload_len = reader.read_u32_le().await?;
    if payload_len > MAX_PAYLOAD {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "oversized payload",
        ));
    }
    let mut payload = vec![0_u8; payload_len as usize];
    reader.read_exact(&mut payload).await?;

    Ok(Frame {
        command,
        cookie,
        is_response,
        error,
        error_desc: String::from_utf8_lossy(&desc).into_owned(),
        payload,
    })
}

/// Writes a frame whose payload is stitched from `bodies` without an
/// intermediate copy. `frame.payload` is written first, then each body.
pub(crate) async fn write_frame<W>(
    writer: &mut W,
    frame: &Frame,
    bodies: &[&[u8]],
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total = frame.payload.len() + bodies.iter().map(|b| b.len()).sum::<usize>();

    writer.write_u32_le(frame.command).await?;
    writer.write_u64_le(frame.cookie).await?;
    writer.write_u8(u8::from(frame.is_response)).await?;
    writer.write_u8(u8::from(frame.error)).await?;
    writer.write_u32_le(frame.error_desc.len() as u32).await?;
    writer.write_all(frame.error_desc.as_bytes()).await?;
    writer.write_u32_le(total as u32).await?;
    writer.write_all(&frame.payload).await?;
    for body in bodies {
        writer.write_all(body).await?;
    }
    writer.flush().await
}
