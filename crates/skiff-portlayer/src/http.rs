//! HTTP/1 client implementation of the port-layer surface.
//!
//! One connection per request: connect, handshake, spawn the connection
//! task, send. Streaming responses hand the body out as an `AsyncRead`;
//! streaming requests bridge an in-process duplex pipe into the request
//! body so callers get a plain `AsyncWrite`.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::client::conn::http1;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde_json::json;
use skiff_error::{EngineError, Result};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::io::{ReaderStream, StreamReader};

use crate::models::{
    ContainerCreateSpec, ContainerInfo, ContainerState, Handle, PathStat, PowerState,
    ScopeInfo, ScopeJoinSpec, TaskSpec, TaskState, VolumeJoinSpec, VolumeSpec,
};
use crate::stream::{ByteReader, ByteWriter, EofTolerantReader};
use crate::surface::{KvStore, PortLayer};

/// Connection settings for the port layer.
#[derive(Debug, Clone)]
pub struct PortLayerConfig {
    /// `host:port` of the port-layer API endpoint.
    pub address: String,
    pub connect_timeout: Duration,
}

impl PortLayerConfig {
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            connect_timeout: Duration::from_secs(15),
        }
    }
}

/// Port-layer client speaking HTTP/1.1 over TCP.
pub struct HttpPortLayer {
    config: PortLayerConfig,
}

#[derive(serde::Deserialize)]
struct HandleReply {
    handle: Handle,
}

#[derive(serde::Deserialize)]
struct CreateReply {
    id: String,
    handle: Handle,
}

#[derive(serde::Deserialize)]
struct TaskJoinReply {
    handle: Handle,
    task_id: String,
}

impl HttpPortLayer {
    #[must_use]
    pub fn new(config: PortLayerConfig) -> Self {
        Self { config }
    }

    async fn connect(&self) -> Result<TokioIo<TcpStream>> {
        let stream = tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect(&self.config.address),
        )
        .await
        .map_err(|_| {
            EngineError::internal(format!("connect to {} timed out", self.config.address))
        })?
        .map_err(|e| EngineError::internal(format!("connect to {}: {e}", self.config.address)))?;
        Ok(TokioIo::new(stream))
    }

    /// Sends one request on a fresh connection. The connection task keeps
    /// running in the background so streaming bodies stay readable.
    async fn send<B>(&self, req: Request<B>) -> Result<Response<Incoming>>
    where
        B: hyper::body::Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let io = self.connect().await?;
        let (mut sender, conn) = http1::Builder::new()
            .handshake(io)
            .await
            .map_err(|e| EngineError::internal(format!("portlayer handshake failed: {e}")))?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                let msg = e.to_string().to_lowercase();
                if !msg.contains("canceled") && !msg.contains("incomplete") {
                    tracing::debug!("portlayer connection ended: {}", e);
                }
            }
        });

        sender
            .send_request(req)
            .await
            .map_err(|e| EngineError::internal(format!("portlayer request failed: {e}")))
    }

    fn build(method: Method, path: &str, body: Option<&serde_json::Value>) -> Result<Request<Full<Bytes>>> {
        let payload = match body {
            Some(value) => serde_json::to_vec(value)
                .map_err(|e| EngineError::internal(format!("encoding request: {e}")))?,
            None => Vec::new(),
        };
        Request::builder()
            .method(method)
            .uri(path)
            .header(hyper::header::HOST, "portlayer")
            .header(hyper::header::CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(payload)))
            .map_err(|e| EngineError::internal(format!("building request: {e}")))
    }

    /// Maps a non-success status into the engine taxonomy, consuming the
    /// error body as the message.
    async fn check(resp: Response<Incoming>) -> Result<Response<Incoming>> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp
            .into_body()
            .collect()
            .await
            .map(http_body_util::Collected::to_bytes)
            .unwrap_or_default();
        let mut message = String::from_utf8_lossy(&body).trim().to_string();
        if message.is_empty() {
            message = status.to_string();
        }
        Err(match status {
            StatusCode::NOT_FOUND => EngineError::NotFound(message),
            StatusCode::CONFLICT => EngineError::Conflict(message),
            StatusCode::LOCKED => EngineError::ResourceLocked(message),
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                EngineError::BadRequest(message)
            }
            _ => EngineError::Internal(message),
        })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<T> {
        let resp = self.send(Self::build(method, path, body)?).await?;
        let resp = Self::check(resp).await?;
        let bytes = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| EngineError::internal(format!("reading portlayer response: {e}")))?
            .to_bytes();
        serde_json::from_slice(&bytes)
            .map_err(|e| EngineError::internal(format!("decoding portlayer response: {e}")))
    }

    async fn call_unit(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<()> {
        let resp = self.send(Self::build(method, path, body)?).await?;
        Self::check(resp).await.map(|_| ())
    }

    async fn call_stream(&self, path: &str) -> Result<ByteReader> {
        let resp = self.send(Self::build(Method::GET, path, None)?).await?;
        let resp = Self::check(resp).await?;
        Ok(Self::body_reader(resp.into_body()))
    }

    fn body_reader(body: Incoming) -> ByteReader {
        let data = body.into_data_stream().map(|res| res.map_err(io::Error::other));
        Box::new(EofTolerantReader::new(StreamReader::new(data)))
    }

    /// Opens a streaming upload: the caller writes into one end of a duplex
    /// pipe while a background task relays the other end as the request
    /// body and resolves with the RPC outcome.
    async fn call_upload(
        &self,
        method: Method,
        path: &str,
    ) -> Result<(ByteWriter, JoinHandle<Result<()>>)> {
        let io = self.connect().await?;
        let (mut sender, conn) = http1::Builder::new()
            .handshake(io)
            .await
            .map_err(|e| EngineError::internal(format!("portlayer handshake failed: {e}")))?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!("portlayer upload connection ended: {}", e);
            }
        });

        let (writer, relay) = tokio::io::duplex(64 * 1024);
        let frames = ReaderStream::new(relay).map(|res| res.map(Frame::data));
        let req = Request::builder()
            .method(method)
            .uri(path)
            .header(hyper::header::HOST, "portlayer")
            .header(hyper::header::CONTENT_TYPE, "application/x-tar")
            .body(StreamBody::new(frames))
            .map_err(|e| EngineError::internal(format!("building request: {e}")))?;

        let task = tokio::spawn(async move {
            let resp = sender
                .send_request(req)
                .await
                .map_err(|e| EngineError::internal(format!("portlayer upload failed: {e}")))?;
            Self::check(resp).await.map(|_| ())
        });

        Ok((Box::new(writer) as ByteWriter, task))
    }
}

#[async_trait]
impl KvStore for HttpPortLayer {
    async fn kv_get(&self, key: &str) -> Result<Option<String>> {
        match self.call_stream(&format!("/kv/{key}")).await {
            Ok(mut reader) => {
                let mut value = String::new();
                tokio::io::AsyncReadExt::read_to_string(&mut reader, &mut value)
                    .await
                    .map_err(|e| EngineError::internal(format!("reading kv value: {e}")))?;
                Ok(Some(value))
            }
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn kv_put(&self, key: &str, value: &str) -> Result<()> {
        let req = Request::builder()
            .method(Method::PUT)
            .uri(format!("/kv/{key}"))
            .header(hyper::header::HOST, "portlayer")
            .body(Full::new(Bytes::from(value.to_string())))
            .map_err(|e| EngineError::internal(format!("building request: {e}")))?;
        let resp = self.send(req).await?;
        Self::check(resp).await.map(|_| ())
    }
}

#[async_trait]
impl PortLayer for HttpPortLayer {
    async fn ping(&self) -> Result<()> {
        self.call_unit(Method::GET, "/_ping", None).await
    }

    async fn create_container(&self, spec: &ContainerCreateSpec) -> Result<(String, Handle)> {
        let body = serde_json::to_value(spec)
            .map_err(|e| EngineError::internal(format!("encoding create spec: {e}")))?;
        let reply: CreateReply = self.call(Method::POST, "/containers", Some(&body)).await?;
        Ok((reply.id, reply.handle))
    }

    async fn handle(&self, id: &str) -> Result<Handle> {
        let reply: HandleReply = self
            .call(Method::GET, &format!("/containers/{id}/handle"), None)
            .await?;
        Ok(reply.handle)
    }

    async fn commit(&self, handle: Handle, id: &str, wait: Option<Duration>) -> Result<()> {
        let wait_secs = wait.map_or(-1, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX));
        let body = json!({ "handle": handle, "wait": wait_secs });
        self.call_unit(
            Method::PUT,
            &format!("/containers/{id}/commit"),
            Some(&body),
        )
        .await
    }

    async fn state_change(&self, handle: Handle, state: PowerState) -> Result<Handle> {
        let body = json!({ "handle": handle, "state": state });
        let reply: HandleReply = self.call(Method::PUT, "/handles/state", Some(&body)).await?;
        Ok(reply.handle)
    }

    async fn rename(&self, handle: Handle, name: &str) -> Result<Handle> {
        let body = json!({ "handle": handle, "name": name });
        let reply: HandleReply = self.call(Method::PUT, "/handles/rename", Some(&body)).await?;
        Ok(reply.handle)
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.call_unit(Method::DELETE, &format!("/containers/{id}"), None)
            .await
    }

    async fn signal(&self, id: &str, signal: i64) -> Result<()> {
        let body = json!({ "signal": signal });
        self.call_unit(
            Method::POST,
            &format!("/containers/{id}/signal"),
            Some(&body),
        )
        .await
    }

    async fn wait(&self, id: &str, timeout: Option<Duration>) -> Result<ContainerState> {
        let secs = timeout.map_or(-1, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX));
        self.call(
            Method::GET,
            &format!("/containers/{id}/wait?timeout={secs}"),
            None,
        )
        .await
    }

    async fn state(&self, id: &str) -> Result<ContainerState> {
        self.call(Method::GET, &format!("/containers/{id}/state"), None)
            .await
    }

    async fn info(&self, id: &str) -> Result<ContainerInfo> {
        self.call(Method::GET, &format!("/containers/{id}/info"), None)
            .await
    }

    async fn list(&self, all: bool) -> Result<Vec<ContainerInfo>> {
        self.call(Method::GET, &format!("/containers?all={all}"), None)
            .await
    }

    async fn logs(
        &self,
        id: &str,
        follow: bool,
        timestamps: bool,
        since: Option<i64>,
        tail: Option<u64>,
    ) -> Result<ByteReader> {
        let mut path = format!("/containers/{id}/logs?follow={follow}&timestamps={timestamps}");
        if let Some(since) = since {
            path.push_str(&format!("&since={since}"));
        }
        if let Some(tail) = tail {
            path.push_str(&format!("&tail={tail}"));
        }
        self.call_stream(&path).await
    }

    async fn stats(&self, id: &str, stream: bool) -> Result<ByteReader> {
        self.call_stream(&format!("/containers/{id}/stats?stream={stream}"))
            .await
    }

    async fn task_join(&self, handle: Handle, spec: &TaskSpec) -> Result<(Handle, String)> {
        let body = json!({ "handle": handle, "task": spec });
        let reply: TaskJoinReply = self.call(Method::POST, "/tasks/join", Some(&body)).await?;
        Ok((reply.handle, reply.task_id))
    }

    async fn task_bind(&self, handle: Handle, id: &str, task_id: &str) -> Result<Handle> {
        let body = json!({ "handle": handle, "container_id": id, "task_id": task_id });
        let reply: HandleReply = self.call(Method::POST, "/tasks/bind", Some(&body)).await?;
        Ok(reply.handle)
    }

    async fn task_inspect(&self, id: &str, task_id: &str) -> Result<TaskState> {
        self.call(
            Method::GET,
            &format!("/containers/{id}/tasks/{task_id}"),
            None,
        )
        .await
    }

    async fn interaction_join(&self, handle: Handle) -> Result<Handle> {
        let body = json!({ "handle": handle });
        let reply: HandleReply = self
            .call(Method::POST, "/interaction/join", Some(&body))
            .await?;
        Ok(reply.handle)
    }

    async fn interaction_bind(&self, handle: Handle, id: &str) -> Result<Handle> {
        let body = json!({ "handle": handle, "id": id });
        let reply: HandleReply = self
            .call(Method::POST, "/interaction/bind", Some(&body))
            .await?;
        Ok(reply.handle)
    }

    async fn interaction_unbind(&self, handle: Handle, id: &str) -> Result<Handle> {
        let body = json!({ "handle": handle, "id": id });
        let reply: HandleReply = self
            .call(Method::POST, "/interaction/unbind", Some(&body))
            .await?;
        Ok(reply.handle)
    }

    async fn stdin_writer(&self, id: &str, deadline: Duration) -> Result<ByteWriter> {
        let secs = deadline.as_secs();
        let (writer, task) = self
            .call_upload(Method::POST, &format!("/interaction/{id}/stdin?deadline={secs}"))
            .await?;
        // Outcome surfaces through the output pumps; failures here are noise.
        tokio::spawn(async move {
            if let Ok(Err(e)) = task.await {
                tracing::debug!("stdin stream ended: {}", e);
            }
        });
        Ok(writer)
    }

    async fn close_stdin(&self, id: &str) -> Result<()> {
        self.call_unit(Method::POST, &format!("/interaction/{id}/stdin/close"), None)
            .await
    }

    async fn stdout_reader(&self, id: &str, deadline: Duration) -> Result<ByteReader> {
        let secs = deadline.as_secs();
        self.call_stream(&format!("/interaction/{id}/stdout?deadline={secs}"))
            .await
    }

    async fn stderr_reader(&self, id: &str, deadline: Duration) -> Result<ByteReader> {
        let secs = deadline.as_secs();
        self.call_stream(&format!("/interaction/{id}/stderr?deadline={secs}"))
            .await
    }

    async fn resize(&self, id: &str, height: u32, width: u32) -> Result<()> {
        self.call_unit(
            Method::POST,
            &format!("/interaction/{id}/resize?h={height}&w={width}"),
            None,
        )
        .await
    }

    async fn logging_join(&self, handle: Handle) -> Result<Handle> {
        let body = json!({ "handle": handle });
        let reply: HandleReply = self.call(Method::POST, "/logging/join", Some(&body)).await?;
        Ok(reply.handle)
    }

    async fn scope_add(&self, handle: Handle, spec: &ScopeJoinSpec) -> Result<Handle> {
        let body = json!({ "handle": handle, "scope": spec });
        let reply: HandleReply = self.call(Method::POST, "/scopes/add", Some(&body)).await?;
        Ok(reply.handle)
    }

    async fn scope_remove(&self, handle: Handle, id: &str) -> Result<Handle> {
        let body = json!({ "handle": handle, "id": id });
        let reply: HandleReply = self.call(Method::POST, "/scopes/remove", Some(&body)).await?;
        Ok(reply.handle)
    }

    async fn scope_bind(&self, handle: Handle, id: &str) -> Result<Handle> {
        let body = json!({ "handle": handle, "id": id });
        let reply: HandleReply = self.call(Method::POST, "/scopes/bind", Some(&body)).await?;
        Ok(reply.handle)
    }

    async fn scope_unbind(&self, handle: Handle, id: &str) -> Result<Handle> {
        let body = json!({ "handle": handle, "id": id });
        let reply: HandleReply = self.call(Method::POST, "/scopes/unbind", Some(&body)).await?;
        Ok(reply.handle)
    }

    async fn scope_list(&self, name: Option<&str>) -> Result<Vec<ScopeInfo>> {
        let path = match name {
            Some(name) => format!("/scopes?name={name}"),
            None => "/scopes".to_string(),
        };
        self.call(Method::GET, &path, None).await
    }

    async fn scope_create(&self, spec: &ScopeInfo) -> Result<ScopeInfo> {
        let body = serde_json::to_value(spec)
            .map_err(|e| EngineError::internal(format!("encoding scope: {e}")))?;
        self.call(Method::POST, "/scopes", Some(&body)).await
    }

    async fn scope_delete(&self, name: &str) -> Result<()> {
        self.call_unit(Method::DELETE, &format!("/scopes/{name}"), None)
            .await
    }

    async fn create_image_store(&self, name: &str) -> Result<()> {
        let body = json!({ "name": name });
        self.call_unit(Method::POST, "/storage/imagestores", Some(&body))
            .await
    }

    async fn create_volume(&self, spec: &VolumeSpec) -> Result<VolumeSpec> {
        let body = serde_json::to_value(spec)
            .map_err(|e| EngineError::internal(format!("encoding volume: {e}")))?;
        self.call(Method::POST, "/storage/volumes", Some(&body)).await
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        self.call_unit(Method::DELETE, &format!("/storage/volumes/{name}"), None)
            .await
    }

    async fn volume_join(&self, handle: Handle, spec: &VolumeJoinSpec) -> Result<Handle> {
        let body = json!({ "handle": handle, "join": spec });
        let reply: HandleReply = self
            .call(Method::POST, "/storage/volumes/join", Some(&body))
            .await?;
        Ok(reply.handle)
    }

    async fn list_volumes(&self) -> Result<Vec<VolumeSpec>> {
        self.call(Method::GET, "/storage/volumes", None).await
    }

    async fn get_volume(&self, name: &str) -> Result<VolumeSpec> {
        self.call(Method::GET, &format!("/storage/volumes/{name}"), None)
            .await
    }

    async fn stat_path(&self, store: &str, device: &str, filter_spec: &str) -> Result<PathStat> {
        self.call(
            Method::GET,
            &format!("/storage/{store}/{device}/stat?filter={filter_spec}"),
            None,
        )
        .await
    }

    async fn export_archive(
        &self,
        store: &str,
        device: &str,
        data: bool,
        filter_spec: &str,
    ) -> Result<ByteReader> {
        self.call_stream(&format!(
            "/storage/{store}/{device}/export?data={data}&filter={filter_spec}"
        ))
        .await
    }

    async fn import_archive(
        &self,
        store: &str,
        device: &str,
        filter_spec: &str,
    ) -> Result<(ByteWriter, JoinHandle<Result<()>>)> {
        self.call_upload(
            Method::PUT,
            &format!("/storage/{store}/{device}/import?filter={filter_spec}"),
        )
        .await
    }

    async fn event_stream(&self) -> Result<ByteReader> {
        self.call_stream("/events").await
    }
}
