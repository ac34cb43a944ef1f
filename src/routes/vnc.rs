//! VNC relay: browser WebSocket ↔ job VNC server.
//!
//! Everything that can fail for a known reason (unknown session, unknown
//! job, pod not there yet, tunnel errors) is answered with a JSON error
//! before the upgrade. After the upgrade, frames are relayed unmodified
//! until either side closes:
//!
//! - `vnc.remote_path` empty: raw TCP to the tunnel endpoint.
//! - otherwise: a WebSocket to `ws://{tunnel}{remote_path}` (websockify).
//!
//! The tunnel is borrowed for the lifetime of the relay and released, not
//! closed, when it ends.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{
    self, client::IntoClientRequest, http::HeaderValue, Message as RemoteMessage,
};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::error::{Error, Result};
use crate::jobs::JobDirectory;
use crate::sessions::SessionType;
use crate::tunnel::Tunnel;
use crate::AppState;

const TCP_BUFFER_SIZE: usize = 64 * 1024;

/// `GET /vnc/{session_id}`: upgrade to a VNC relay (`binary` sub-protocol).
pub async fn vnc_upgrade(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<Response> {
    let target = state
        .sessions
        .resolve(&session_id, SessionType::Vnc)
        .await
        .ok_or_else(|| Error::not_found("Session not found"))?;
    let job = state
        .jobs
        .find_job(&target.job_id)
        .await
        .ok_or_else(|| Error::not_found(format!("Job {} not found", target.job_id)))?;
    let port = job
        .resources
        .vnc_port
        .unwrap_or(state.config.vnc.default_port);

    let tunnel = state
        .tunnels
        .create_or_use_existing(&target.job_id, port, target.rank)
        .await?;
    let remote_path = state.config.vnc.remote_path.clone();

    let span = info_span!(
        "vnc_relay",
        relay_id = %uuid::Uuid::new_v4(),
        job_id = %target.job_id,
        rank = target.rank,
        port,
    );
    Ok(ws
        .protocols(["binary"])
        .on_upgrade(move |socket| relay(socket, tunnel, remote_path).instrument(span)))
}

async fn relay(socket: WebSocket, tunnel: Arc<Tunnel>, remote_path: String) {
    let addr = tunnel.socket_addr();
    info!("VNC relay connected to {addr}");
    if remote_path.is_empty() {
        relay_tcp(socket, &addr).await;
    } else {
        relay_websockify(socket, &format!("ws://{addr}{remote_path}")).await;
    }
    tunnel.touch();
    info!("VNC relay closed");
}

async fn close_with_error(mut socket: WebSocket, reason: &str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::ERROR,
            reason: reason.into(),
        })))
        .await;
}

async fn relay_tcp(socket: WebSocket, addr: &str) {
    let stream = match TcpStream::connect(addr).await {
        Ok(s) => s,
        Err(e) => {
            warn!("VNC connect to {addr} failed: {e}");
            close_with_error(socket, "VNC server unreachable").await;
            return;
        }
    };
    let (mut tcp_read, mut tcp_write) = stream.into_split();
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut buf = vec![0u8; TCP_BUFFER_SIZE];

    loop {
        tokio::select! {
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Binary(data))) => {
                    if tcp_write.write_all(&data).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Text(text))) => {
                    if tcp_write.write_all(text.as_bytes()).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            read = tcp_read.read(&mut buf) => match read {
                Ok(0) => {
                    debug!("VNC server closed the connection");
                    break;
                }
                Ok(n) => {
                    let frame = Message::Binary(Bytes::copy_from_slice(&buf[..n]));
                    if ws_tx.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!("VNC read error: {e}");
                    break;
                }
            },
        }
    }

    let _ = ws_tx.send(Message::Close(None)).await;
    let _ = tcp_write.shutdown().await;
}

async fn relay_websockify(socket: WebSocket, url: &str) {
    let remote = match connect_websockify(url).await {
        Ok(r) => r,
        Err(e) => {
            warn!("VNC websockify connect to {url} failed: {e}");
            close_with_error(socket, "VNC server unreachable").await;
            return;
        }
    };
    let (mut remote_tx, mut remote_rx) = remote.split();
    let (mut ws_tx, mut ws_rx) = socket.split();

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                let forwarded = match msg {
                    Some(Ok(Message::Binary(data))) => RemoteMessage::Binary(data),
                    Some(Ok(Message::Text(text))) => RemoteMessage::Text(text.as_str().into()),
                    Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                };
                if remote_tx.send(forwarded).await.is_err() {
                    break;
                }
            }
            msg = remote_rx.next() => {
                let forwarded = match msg {
                    Some(Ok(RemoteMessage::Binary(data))) => Message::Binary(data),
                    Some(Ok(RemoteMessage::Text(text))) => Message::Text(text.as_str().into()),
                    Some(Ok(RemoteMessage::Close(_)) | Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                };
                if ws_tx.send(forwarded).await.is_err() {
                    break;
                }
            }
        }
    }

    let _ = ws_tx.send(Message::Close(None)).await;
    let _ = remote_tx.send(RemoteMessage::Close(None)).await;
}

async fn connect_websockify(
    url: &str,
) -> std::result::Result<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>,
    tungstenite::Error,
> {
    let mut request = url.into_client_request()?;
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("binary"));
    let (stream, _) = tokio_tungstenite::connect_async(request).await?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::handshake::server::{
        ErrorResponse, Request as HandshakeRequest, Response as HandshakeResponse,
    };

    use super::*;
    use crate::cluster::testing::FakeCluster;
    use crate::config::Config;
    use crate::jobs::JobResources;
    use crate::testing;

    /// State whose `job-42` VNC port points at `vnc_port` on loopback.
    async fn vnc_state(config: Config, vnc_port: u16) -> (AppState, Arc<FakeCluster>, String) {
        let (state, cluster) = testing::state_with(config).await;
        let mut job = testing::job("job-42");
        job.resources = JobResources {
            vnc_port: Some(vnc_port),
            ..JobResources::default()
        };
        state.jobs.upsert(job).await;
        let id = state
            .sessions
            .store()
            .create("job-42", 0, SessionType::Vnc)
            .await
            .unwrap();
        (state, cluster, id)
    }

    fn status_of(err: tungstenite::Error) -> u16 {
        match err {
            tungstenite::Error::Http(response) => response.status().as_u16(),
            other => panic!("expected HTTP rejection, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_session_is_rejected_before_upgrade() {
        let (state, _) = testing::state().await;
        let addr = testing::serve(state).await;

        let err = tokio_tungstenite::connect_async(format!("ws://{addr}/vnc/nope"))
            .await
            .err()
            .unwrap();
        assert_eq!(status_of(err), 404);
    }

    #[tokio::test]
    async fn test_tcp_relay_after_pod_appears() {
        let vnc = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let vnc_port = vnc.local_addr().unwrap().port();
        let (state, cluster, id) = vnc_state(testing::config(), vnc_port).await;
        let addr = testing::serve(state).await;
        let url = format!("ws://{addr}/vnc/{id}");

        let err = tokio_tungstenite::connect_async(url.as_str()).await.err().unwrap();
        assert_eq!(status_of(err), 404);

        cluster.add_pod("job-42", 0, "127.0.0.1");
        let (mut client, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
        let (mut server_side, _) = vnc.accept().await.unwrap();

        let handshake = b"RFB 003.008\n\x00\x01\xfe\xff";
        client
            .send(RemoteMessage::Binary(Bytes::from_static(handshake)))
            .await
            .unwrap();
        let mut received = vec![0u8; handshake.len()];
        server_side.read_exact(&mut received).await.unwrap();
        assert_eq!(received, handshake);

        server_side.write_all(b"RFB 003.008\n").await.unwrap();
        match client.next().await.unwrap().unwrap() {
            RemoteMessage::Binary(data) => assert_eq!(&data[..], b"RFB 003.008\n"),
            other => panic!("unexpected frame {other:?}"),
        }

        drop(server_side);
        loop {
            match client.next().await {
                Some(Ok(RemoteMessage::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            }
        }
    }

    #[tokio::test]
    async fn test_websockify_relay() {
        let remote = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let remote_port = remote.local_addr().unwrap().port();
        let mut config = testing::config();
        config.vnc.remote_path = "/websockify".to_string();
        let (state, cluster, id) = vnc_state(config, remote_port).await;
        cluster.add_pod("job-42", 0, "127.0.0.1");
        let addr = testing::serve(state).await;

        let echo = tokio::spawn(async move {
            let (stream, _) = remote.accept().await.unwrap();
            let mut path = String::new();
            let callback = |request: &HandshakeRequest, mut response: HandshakeResponse| {
                path = request.uri().path().to_string();
                response
                    .headers_mut()
                    .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("binary"));
                Ok::<_, ErrorResponse>(response)
            };
            let mut ws = tokio_tungstenite::accept_hdr_async(stream, callback)
                .await
                .unwrap();
            if let Some(Ok(RemoteMessage::Binary(data))) = ws.next().await {
                ws.send(RemoteMessage::Binary(data)).await.unwrap();
            }
            path
        });

        let (mut client, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/vnc/{id}"))
            .await
            .unwrap();
        client
            .send(RemoteMessage::Binary(Bytes::from_static(b"\x03\x00frame")))
            .await
            .unwrap();
        match client.next().await.unwrap().unwrap() {
            RemoteMessage::Binary(data) => assert_eq!(&data[..], b"\x03\x00frame"),
            other => panic!("unexpected frame {other:?}"),
        }
        assert_eq!(echo.await.unwrap(), "/websockify");
    }
}
