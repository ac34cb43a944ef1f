//! Kubernetes API client.
//!
//! REST calls go through `reqwest`; exec channels speak the
//! `v4.channel.k8s.io` WebSocket sub-protocol, where the first byte of every
//! binary frame selects the stream:
//!
//! | Byte | Stream                                   |
//! |------|------------------------------------------|
//! | 0    | stdin (client → server)                  |
//! | 1    | stdout                                   |
//! | 2    | stderr                                   |
//! | 3    | status, a JSON `Status` sent on exit     |
//! | 4    | resize, `{"Width": c, "Height": r}`      |
//!
//! In-cluster the client authenticates with the mounted service-account
//! token (re-read per request, since bound tokens rotate) and trusts the
//! mounted CA. Outside the cluster it expects `kubectl proxy` on
//! `http://127.0.0.1:8001` unless `cluster.api_url` says otherwise.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::Connector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ClusterApi, ExecChannel, ExecEnd, ExecEvent, Placement, Pod, TerminalSize};
use crate::config::ClusterConfig;
use crate::error::{Error, Result};

const EXEC_PROTOCOL: &str = "v4.channel.k8s.io";
const CHANNEL_STDIN: u8 = 0;
const CHANNEL_STDOUT: u8 = 1;
const CHANNEL_STDERR: u8 = 2;
const CHANNEL_STATUS: u8 = 3;
const CHANNEL_RESIZE: u8 = 4;

const KUBECTL_PROXY_URL: &str = "http://127.0.0.1:8001";

pub struct KubeClient {
    base: Url,
    http: reqwest::Client,
    /// Service-account token file, `None` when talking to `kubectl proxy`.
    token_path: Option<PathBuf>,
    tls: Option<native_tls::TlsConnector>,
    container: Option<String>,
}

impl KubeClient {
    pub fn from_config(config: &ClusterConfig, placement: Placement) -> Result<Self> {
        let base = match (&config.api_url, placement) {
            (Some(url), _) => url.clone(),
            (None, Placement::InCluster) => {
                let host = std::env::var("KUBERNETES_SERVICE_HOST").map_err(|_| {
                    Error::Cluster("KUBERNETES_SERVICE_HOST is not set".to_string())
                })?;
                let port =
                    std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());
                format!("https://{host}:{port}")
            }
            (None, Placement::External) => KUBECTL_PROXY_URL.to_string(),
        };
        let base = Url::parse(&base)
            .map_err(|e| Error::Cluster(format!("Invalid API URL {base}: {e}")))?;

        let mut http = reqwest::Client::builder();
        let mut tls = None;
        let mut token_path = None;
        if placement == Placement::InCluster {
            token_path = Some(PathBuf::from(&config.token_path));
            if let Ok(pem) = std::fs::read(&config.ca_path) {
                let cert = reqwest::Certificate::from_pem(&pem)
                    .map_err(|e| Error::Cluster(format!("Invalid cluster CA: {e}")))?;
                http = http.add_root_certificate(cert);

                let ws_cert = native_tls::Certificate::from_pem(&pem)
                    .map_err(|e| Error::Cluster(format!("Invalid cluster CA: {e}")))?;
                let connector = native_tls::TlsConnector::builder()
                    .add_root_certificate(ws_cert)
                    .build()
                    .map_err(|e| Error::Cluster(format!("TLS setup failed: {e}")))?;
                tls = Some(connector);
            } else {
                warn!("Cluster CA {} not readable, using system roots", config.ca_path);
            }
        }

        info!("Cluster API at {base} ({})", placement.as_str());
        Ok(Self {
            base,
            http: http.build()?,
            token_path,
            tls,
            container: config.container.clone(),
        })
    }

    async fn bearer(&self) -> Result<Option<String>> {
        match &self.token_path {
            Some(path) => {
                let token = tokio::fs::read_to_string(path).await?;
                Ok(Some(format!("Bearer {}", token.trim())))
            }
            None => Ok(None),
        }
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|e| Error::Cluster(format!("Invalid API path {path}: {e}")))
    }

    async fn get(&self, url: Url) -> Result<reqwest::Response> {
        let mut request = self.http.get(url);
        if let Some(auth) = self.bearer().await? {
            request = request.header("authorization", auth);
        }
        Ok(request.send().await?)
    }

    fn exec_url(&self, pod: &Pod, command: &[String]) -> Result<Url> {
        let mut url = self.url(&format!(
            "/api/v1/namespaces/{}/pods/{}/exec",
            pod.namespace, pod.name
        ))?;
        let ws_scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(ws_scheme)
            .map_err(|()| Error::Cluster("Cannot build exec URL".to_string()))?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("stdin", "true")
                .append_pair("stdout", "true")
                .append_pair("tty", "true");
            if let Some(ref container) = self.container {
                query.append_pair("container", container);
            }
            for arg in command {
                query.append_pair("command", arg);
            }
        }
        Ok(url)
    }
}

#[derive(Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<PodObject>,
}

#[derive(Deserialize)]
struct PodObject {
    metadata: ObjectMeta,
    #[serde(default)]
    status: PodStatus,
}

#[derive(Deserialize)]
struct ObjectMeta {
    name: String,
    #[serde(default)]
    namespace: String,
    #[serde(default)]
    labels: HashMap<String, String>,
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodStatus {
    #[serde(default)]
    phase: String,
    pod_ip: Option<String>,
}

impl From<PodObject> for Pod {
    fn from(obj: PodObject) -> Self {
        Pod {
            namespace: obj.metadata.namespace,
            name: obj.metadata.name,
            ip: obj.status.pod_ip,
            phase: obj.status.phase,
            labels: obj.metadata.labels,
        }
    }
}

#[derive(Deserialize)]
struct ServiceObject {
    spec: ServiceSpec,
}

#[derive(Deserialize)]
struct ServiceSpec {
    #[serde(default)]
    ports: Vec<ServicePort>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServicePort {
    port: u16,
    node_port: Option<u16>,
}

/// Exec `Status` object sent on the status channel.
#[derive(Deserialize)]
struct ExecStatus {
    #[serde(default)]
    status: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    reason: String,
}

fn classify_status(raw: &[u8]) -> ExecEnd {
    let Ok(status) = serde_json::from_slice::<ExecStatus>(raw) else {
        return ExecEnd::Failed(String::from_utf8_lossy(raw).into_owned());
    };
    match (status.status.as_str(), status.reason.as_str()) {
        ("Success", _) | (_, "NonZeroExitCode") => ExecEnd::Completed,
        (_, "NotFound") => ExecEnd::NotFound,
        _ => ExecEnd::Failed(status.message),
    }
}

fn framed(channel: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 1);
    frame.push(channel);
    frame.extend_from_slice(payload);
    frame
}

#[async_trait]
impl ClusterApi for KubeClient {
    async fn list_pods_by_label(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>> {
        let mut url = self.url(&format!("/api/v1/namespaces/{namespace}/pods"))?;
        url.query_pairs_mut().append_pair("labelSelector", selector);
        let response = self.get(url).await?;
        if !response.status().is_success() {
            return Err(Error::Cluster(format!(
                "Listing pods ({selector}) failed: {}",
                response.status()
            )));
        }
        let list: PodList = response.json().await?;
        Ok(list.items.into_iter().map(Pod::from).collect())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod> {
        let url = self.url(&format!("/api/v1/namespaces/{namespace}/pods/{name}"))?;
        let response = self.get(url).await?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(Error::not_found(format!("Pod {namespace}/{name}"))),
            s if s.is_success() => Ok(response.json::<PodObject>().await?.into()),
            s => Err(Error::Cluster(format!("Reading pod {name} failed: {s}"))),
        }
    }

    async fn node_port(&self, namespace: &str, service: &str, port: u16) -> Result<Option<u16>> {
        let url = self.url(&format!("/api/v1/namespaces/{namespace}/services/{service}"))?;
        let response = self.get(url).await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => {
                let svc: ServiceObject = response.json().await?;
                Ok(svc
                    .spec
                    .ports
                    .iter()
                    .find(|p| p.port == port)
                    .and_then(|p| p.node_port))
            }
            s => Err(Error::Cluster(format!("Reading service {service} failed: {s}"))),
        }
    }

    async fn exec(&self, pod: &Pod, command: &[String]) -> Result<ExecChannel> {
        use tokio_tungstenite::tungstenite::Error as WsError;

        let url = self.exec_url(pod, command)?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| Error::Cluster(e.to_string()))?;
        request.headers_mut().insert(
            "sec-websocket-protocol",
            HeaderValue::from_static(EXEC_PROTOCOL),
        );
        if let Some(auth) = self.bearer().await? {
            let value =
                HeaderValue::from_str(&auth).map_err(|e| Error::Cluster(e.to_string()))?;
            request.headers_mut().insert("authorization", value);
        }

        let connector = self.tls.clone().map(Connector::NativeTls);
        let (ws, _response) =
            match tokio_tungstenite::connect_async_tls_with_config(request, None, false, connector)
                .await
            {
                Ok(pair) => pair,
                Err(WsError::Http(resp)) if resp.status() == StatusCode::NOT_FOUND => {
                    return Err(Error::not_found(format!("Pod {}", pod.name)));
                }
                Err(e) => return Err(Error::Cluster(format!("Exec into {} failed: {e}", pod.name))),
            };
        debug!("Exec channel open to {}/{}", pod.namespace, pod.name);

        let (stdin_tx, mut stdin_rx) = mpsc::channel::<Vec<u8>>(64);
        let (resize_tx, mut resize_rx) = mpsc::channel::<TerminalSize>(8);
        let (output_tx, output_rx) = mpsc::channel::<ExecEvent>(256);
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let pod_name = pod.name.clone();

        tokio::spawn(async move {
            let (mut sink, mut stream) = ws.split();
            let end = loop {
                tokio::select! {
                    () = task_cancel.cancelled() => break ExecEnd::Cancelled,
                    Some(data) = stdin_rx.recv() => {
                        let frame = framed(CHANNEL_STDIN, &data);
                        if let Err(e) = sink.send(Message::Binary(frame.into())).await {
                            break ExecEnd::Failed(e.to_string());
                        }
                    }
                    Some(size) = resize_rx.recv() => {
                        let Ok(json) = serde_json::to_vec(&size) else { continue };
                        let frame = framed(CHANNEL_RESIZE, &json);
                        if let Err(e) = sink.send(Message::Binary(frame.into())).await {
                            break ExecEnd::Failed(e.to_string());
                        }
                    }
                    msg = stream.next() => match msg {
                        Some(Ok(Message::Binary(data))) => match data.first() {
                            Some(&(CHANNEL_STDOUT | CHANNEL_STDERR)) if data.len() > 1 => {
                                if output_tx.send(ExecEvent::Output(data[1..].to_vec())).await.is_err() {
                                    break ExecEnd::Cancelled;
                                }
                            }
                            Some(&CHANNEL_STATUS) => break classify_status(&data[1..]),
                            _ => {}
                        },
                        Some(Ok(Message::Close(_))) | None => break ExecEnd::Completed,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => break ExecEnd::Failed(e.to_string()),
                    },
                }
            };
            debug!("Exec channel to {pod_name} ended: {end:?}");
            let _ = sink.close().await;
            let _ = output_tx.send(ExecEvent::Ended(end)).await;
        });

        Ok(ExecChannel {
            stdin: stdin_tx,
            resize: resize_tx,
            output: output_rx,
            cancel,
        })
    }
}
