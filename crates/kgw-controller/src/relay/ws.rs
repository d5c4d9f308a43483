//! Adapters from the concrete WebSocket libraries to relay [`Connection`]s:
//! axum on the browser side, tokio-tungstenite towards the gateway.

use axum::extract::ws::{CloseFrame as AxumCloseFrame, Message as AxumMessage, WebSocket};
use futures_util::{SinkExt, StreamExt, future};
use kgw_client::GatewayClient;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as KernelMessage;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, header::AUTHORIZATION};
use tokio_tungstenite::tungstenite::protocol::CloseFrame as KernelCloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::{CloseReason, Connection, Frame, RelayError};

pub type KernelSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub fn client_connection(socket: WebSocket) -> Connection {
    let (sink, stream) = socket.split();
    let sink = sink
        .sink_map_err(|e| RelayError::Client(e.to_string()))
        .with(|frame: Frame| future::ready(Ok::<_, RelayError>(to_axum(frame))));
    let stream = stream.map(|message| {
        message
            .map(from_axum)
            .map_err(|e| RelayError::Client(e.to_string()))
    });
    Connection::new(sink, stream)
}

pub fn kernel_connection(socket: KernelSocket) -> Connection {
    let (sink, stream) = socket.split();
    let sink = sink
        .sink_map_err(|e| RelayError::Kernel(e.to_string()))
        .with(|frame: Frame| future::ready(Ok::<_, RelayError>(to_kernel(frame))));
    let stream = stream.filter_map(|message| {
        future::ready(match message {
            Ok(message) => from_kernel(message).map(Ok),
            Err(e) => Some(Err(RelayError::Kernel(e.to_string()))),
        })
    });
    Connection::new(sink, stream)
}

/// Opens the kernel's channels socket with the gateway credentials. The
/// handshake is bounded by the client's deadline; the connection is not.
pub async fn dial_kernel(client: &GatewayClient, kernel_id: &str) -> Result<Connection, RelayError> {
    let connect_error = |message: String| RelayError::Connect {
        kernel_id: kernel_id.to_string(),
        message,
    };
    let url = client
        .channels_url(kernel_id)
        .map_err(|e| connect_error(e.to_string()))?;
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| connect_error(e.to_string()))?;
    let mut auth = HeaderValue::from_str(&client.authorization())
        .map_err(|e| connect_error(e.to_string()))?;
    auth.set_sensitive(true);
    request.headers_mut().insert(AUTHORIZATION, auth);

    let deadline = client.config().timeout;
    let (socket, _response) = tokio::time::timeout(deadline, connect_async(request))
        .await
        .map_err(|_| connect_error(format!("handshake timed out after {deadline:?}")))?
        .map_err(|e| connect_error(e.to_string()))?;
    tracing::debug!(kernel_id, %url, "kernel channels connected");
    Ok(kernel_connection(socket))
}

fn from_axum(message: AxumMessage) -> Frame {
    match message {
        AxumMessage::Text(text) => Frame::Text(text.as_str().to_owned()),
        AxumMessage::Binary(bytes) => Frame::Binary(bytes),
        AxumMessage::Ping(bytes) => Frame::Ping(bytes),
        AxumMessage::Pong(bytes) => Frame::Pong(bytes),
        AxumMessage::Close(frame) => Frame::Close(frame.map(|f| CloseReason {
            code: f.code,
            reason: f.reason.as_str().to_owned(),
        })),
    }
}

fn to_axum(frame: Frame) -> AxumMessage {
    match frame {
        Frame::Text(text) => AxumMessage::Text(text.into()),
        Frame::Binary(bytes) => AxumMessage::Binary(bytes),
        Frame::Ping(bytes) => AxumMessage::Ping(bytes),
        Frame::Pong(bytes) => AxumMessage::Pong(bytes),
        Frame::Close(reason) => AxumMessage::Close(reason.map(|r| AxumCloseFrame {
            code: r.code,
            reason: r.reason.into(),
        })),
    }
}

fn from_kernel(message: KernelMessage) -> Option<Frame> {
    let frame = match message {
        KernelMessage::Text(text) => Frame::Text(text.as_str().to_owned()),
        KernelMessage::Binary(bytes) => Frame::Binary(bytes),
        KernelMessage::Ping(bytes) => Frame::Ping(bytes),
        KernelMessage::Pong(bytes) => Frame::Pong(bytes),
        KernelMessage::Close(frame) => Frame::Close(frame.map(|f| CloseReason {
            code: u16::from(f.code),
            reason: f.reason.as_str().to_owned(),
        })),
        KernelMessage::Frame(_) => return None,
    };
    Some(frame)
}

fn to_kernel(frame: Frame) -> KernelMessage {
    match frame {
        Frame::Text(text) => KernelMessage::Text(text.into()),
        Frame::Binary(bytes) => KernelMessage::Binary(bytes),
        Frame::Ping(bytes) => KernelMessage::Ping(bytes),
        Frame::Pong(bytes) => KernelMessage::Pong(bytes),
        Frame::Close(reason) => KernelMessage::Close(reason.map(|r| KernelCloseFrame {
            code: CloseCode::from(r.code),
            reason: r.reason.into(),
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn kernel_close_codes_survive_conversion() {
        let frame = Frame::Close(Some(CloseReason::new(4001, "custom")));
        let back = from_kernel(to_kernel(frame.clone())).unwrap();
        assert_eq!(back, frame);

        let frame = Frame::Close(Some(CloseReason::new(1011, "could not connect to kernel")));
        assert_eq!(from_axum(to_axum(frame.clone())), frame);
    }

    #[test]
    fn data_frames_keep_payload() {
        let text = Frame::Text("{\"header\":{}}".into());
        assert_eq!(from_kernel(to_kernel(text.clone())), Some(text.clone()));
        assert_eq!(from_axum(to_axum(text.clone())), text);
        let binary = Frame::Binary(Bytes::from_static(&[0, 159, 146, 150]));
        assert_eq!(from_axum(to_axum(binary.clone())), binary);
    }
}
