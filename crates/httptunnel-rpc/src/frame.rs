//! Length-prefixed framing: a little-endian `u32` byte count followed by one CBOR
//! [`WireFrame`].

use bytes::{BufMut, Bytes, BytesMut};
use httptunnel_proto::wire::{self, WireFrame};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::RpcTransportError;

const PREFIX_LEN: usize = 4;

/// Encodes `frame` together with its length prefix, refusing frames above `limit`.
pub(crate) fn encode(frame: &WireFrame, limit: u32) -> Result<Bytes, RpcTransportError> {
    let body = wire::encode_wire_frame(frame).map_err(|err| RpcTransportError::EncodeError {
        message: err.to_string(),
    })?;
    let len = match u32::try_from(body.len()) {
        Ok(len) if len <= limit => len,
        _ => {
            return Err(RpcTransportError::FrameTooLarge {
                len: u32::try_from(body.len()).unwrap_or(u32::MAX),
                max: limit,
            })
        }
    };

    let mut out = BytesMut::with_capacity(PREFIX_LEN + body.len());
    out.put_u32_le(len);
    out.put_slice(&body);
    Ok(out.freeze())
}

pub(crate) async fn write(
    io: &mut (impl AsyncWrite + Unpin),
    frame: &WireFrame,
    limit: u32,
) -> Result<(), RpcTransportError> {
    let bytes = encode(frame, limit)?;
    io.write_all(&bytes).await?;
    io.flush().await?;
    Ok(())
}

/// Reads one frame. The length prefix is checked against `limit` before anything is
/// allocated for the body.
pub(crate) async fn read(
    io: &mut (impl AsyncRead + Unpin),
    limit: u32,
) -> Result<WireFrame, RpcTransportError> {
    let len = io.read_u32_le().await?;
    if len > limit {
        return Err(RpcTransportError::FrameTooLarge { len, max: limit });
    }

    let mut body = Vec::new();
    body.try_reserve_exact(len as usize)
        .map_err(|err| RpcTransportError::AllocationFailed {
            message: format!("{len} bytes: {err}"),
        })?;
    body.resize(len as usize, 0);
    io.read_exact(&mut body).await?;

    wire::decode_wire_frame(&body).map_err(|err| RpcTransportError::DecodeError {
        message: err.to_string(),
    })
}

pub(crate) fn kind(frame: &WireFrame) -> &'static str {
    match frame {
        WireFrame::Hello(_) => "hello",
        WireFrame::Welcome(_) => "welcome",
        WireFrame::Reject(_) => "reject",
        WireFrame::Packet { .. } => "packet",
        WireFrame::Unknown => "unknown",
    }
}
