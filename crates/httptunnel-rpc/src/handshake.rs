//! The opening exchange: the client sends a hello, the server answers with a welcome that
//! fixes the version and limits for the rest of the connection, or with a reject.

use httptunnel_proto::wire::{
    Capabilities, ClientHello, HandshakeReject, RejectCode, ServerWelcome, SupportedVersions,
    WireFrame,
};
use httptunnel_proto::ConnectionId;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{frame, RpcTransportError};

/// Frame limit in force until the handshake has negotiated the real one. Keeps an
/// unauthenticated peer from making us allocate large buffers.
pub const DEFAULT_PRE_HANDSHAKE_MAX_FRAME_LEN: u32 = 1 << 20;

/// Current protocol version, default limits, cancellation enabled.
pub fn default_client_hello() -> ClientHello {
    ClientHello {
        supported_versions: SupportedVersions::CURRENT,
        capabilities: default_capabilities(),
        client_build: Some(format!("httptunnel-rpc/{}", env!("CARGO_PKG_VERSION"))),
    }
}

pub(crate) fn default_capabilities() -> Capabilities {
    Capabilities {
        supports_cancel: true,
        ..Capabilities::default()
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub hello: ClientHello,
    pub pre_handshake_max_frame_len: u32,
}

impl ClientConfig {
    pub fn new(hello: ClientHello) -> Self {
        Self {
            hello,
            pre_handshake_max_frame_len: DEFAULT_PRE_HANDSHAKE_MAX_FRAME_LEN,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new(default_client_hello())
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub supported_versions: SupportedVersions,
    pub capabilities: Capabilities,
    pub pre_handshake_max_frame_len: u32,
    /// Reported back to the client in the welcome.
    pub connection_id: ConnectionId,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            supported_versions: SupportedVersions::CURRENT,
            capabilities: default_capabilities(),
            pre_handshake_max_frame_len: DEFAULT_PRE_HANDSHAKE_MAX_FRAME_LEN,
            connection_id: 1,
        }
    }
}

/// Runs the server half of the handshake. On failure a reject is sent when the hello
/// itself was readable.
pub(crate) async fn accept<S>(
    io: &mut S,
    cfg: &ServerConfig,
) -> Result<ServerWelcome, RpcTransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let limit = cfg.pre_handshake_max_frame_len;
    let hello = match frame::read(io, limit).await? {
        WireFrame::Hello(hello) => hello,
        other => {
            return Err(RpcTransportError::HandshakeFailed {
                message: format!("expected hello, got {}", frame::kind(&other)),
            })
        }
    };

    let welcome = cfg
        .supported_versions
        .choose_common(&hello.supported_versions)
        .ok_or_else(|| {
            (
                RejectCode::UnsupportedVersion,
                format!(
                    "no common protocol version (server {:?}, client {:?})",
                    cfg.supported_versions, hello.supported_versions
                ),
            )
        })
        .and_then(|chosen_version| {
            let chosen_capabilities = negotiate(&cfg.capabilities, &hello.capabilities)
                .map_err(|message| (RejectCode::InvalidRequest, message))?;
            Ok(ServerWelcome {
                connection_id: cfg.connection_id,
                chosen_version,
                chosen_capabilities,
            })
        });

    match welcome {
        Ok(welcome) => {
            frame::write(io, &WireFrame::Welcome(welcome.clone()), limit).await?;
            Ok(welcome)
        }
        Err((code, message)) => {
            let reject = WireFrame::Reject(HandshakeReject {
                code,
                message: message.clone(),
            });
            if let Err(err) = frame::write(io, &reject, limit).await {
                tracing::debug!(target: "httptunnel.rpc", error = %err, "failed to send handshake reject");
            }
            Err(RpcTransportError::HandshakeFailed { message })
        }
    }
}

/// Runs the client half of the handshake.
pub(crate) async fn connect<S>(
    io: &mut S,
    cfg: &ClientConfig,
) -> Result<ServerWelcome, RpcTransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let limit = cfg.pre_handshake_max_frame_len;
    frame::write(io, &WireFrame::Hello(cfg.hello.clone()), limit).await?;

    match frame::read(io, limit).await? {
        WireFrame::Welcome(welcome) => Ok(welcome),
        WireFrame::Reject(reject) => Err(RpcTransportError::HandshakeFailed {
            message: format!("rejected by server ({:?}): {}", reject.code, reject.message),
        }),
        other => Err(RpcTransportError::HandshakeFailed {
            message: format!("expected welcome, got {}", frame::kind(&other)),
        }),
    }
}

/// Both sides must honour the smaller of each limit; cancellation needs both to opt in.
fn negotiate(server: &Capabilities, client: &Capabilities) -> Result<Capabilities, String> {
    let caps = Capabilities {
        max_frame_len: server.max_frame_len.min(client.max_frame_len),
        max_packet_len: server.max_packet_len.min(client.max_packet_len),
        supports_cancel: server.supports_cancel && client.supports_cancel,
    };
    if caps.max_frame_len == 0 || caps.max_packet_len == 0 {
        return Err(format!(
            "unusable limits: max_frame_len={}, max_packet_len={}",
            caps.max_frame_len, caps.max_packet_len
        ));
    }
    Ok(caps)
}
