//! Remote observer sinks.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tonic::transport::{Channel, Endpoint};

use super::{Observer, ObserverEvent};
use crate::proto::observer::observer_client::ObserverClient;
use crate::proto::observer::UpdateObserverRequest;
use crate::types::{Error, Result};

/// Port used for `grpc://` observer URLs that do not name one.
pub const DEFAULT_GRPC_OBSERVER_PORT: u16 = 8260;

/// Build a sink from an observer URL.
///
/// `grpc://host[:port]` calls the remote `Observer.UpdateObserver` RPC;
/// `http://` and `https://` POST the event as JSON. The URL doubles as the
/// observer id.
pub fn observer_from_url(raw: &str, timeout: Duration) -> Result<Arc<dyn Observer>> {
    let parsed = url::Url::parse(raw)
        .map_err(|e| Error::bad_input(format!("invalid observer URL {}: {}", raw, e)))?;

    match parsed.scheme() {
        "grpc" => Ok(Arc::new(GrpcObserver::from_url(&parsed, raw, timeout)?)),
        "http" | "https" => Ok(Arc::new(HttpObserver::new(raw, timeout)?)),
        other => Err(Error::bad_input(format!(
            "unsupported observer URL scheme '{}': {}",
            other, raw
        ))),
    }
}

/// Sink calling a remote `Observer` gRPC service.
#[derive(Debug, Clone)]
pub struct GrpcObserver {
    id: String,
    endpoint: String,
    client: ObserverClient<Channel>,
}

impl GrpcObserver {
    fn from_url(parsed: &url::Url, raw: &str, timeout: Duration) -> Result<Self> {
        let host = parsed
            .host_str()
            .ok_or_else(|| Error::bad_input(format!("observer URL has no host: {}", raw)))?;
        let port = parsed.port().unwrap_or(DEFAULT_GRPC_OBSERVER_PORT);
        Self::connect_lazy(raw, host, port, timeout)
    }

    /// Create the client without dialing; the connection is made on first send.
    pub fn connect_lazy(id: &str, host: &str, port: u16, timeout: Duration) -> Result<Self> {
        let target = format!("http://{}:{}", host, port);
        let endpoint = Endpoint::from_shared(target.clone())
            .map_err(|e| Error::bad_input(format!("invalid observer endpoint: {}", e)))?
            .timeout(timeout)
            .connect_timeout(timeout);
        Ok(Self {
            id: id.to_string(),
            endpoint: target,
            client: ObserverClient::new(endpoint.connect_lazy()),
        })
    }

    /// Address the sink dials.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Observer for GrpcObserver {
    fn id(&self) -> &str {
        &self.id
    }

    async fn update(&self, event: &ObserverEvent) -> Result<()> {
        let message = serde_json::to_string(event)
            .map_err(|e| Error::internal(format!("encode observer event: {}", e)))?;
        self.client
            .clone()
            .update_observer(UpdateObserverRequest { message })
            .await
            .map_err(|status| Error::transport(format!("observer {}: {}", self.id, status.message())))?;
        Ok(())
    }
}

/// Sink POSTing JSON events to an HTTP endpoint.
#[derive(Debug, Clone)]
pub struct HttpObserver {
    id: String,
    client: reqwest::Client,
}

impl HttpObserver {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::internal(format!("build HTTP observer client: {}", e)))?;
        Ok(Self {
            id: url.to_string(),
            client,
        })
    }
}

#[async_trait]
impl Observer for HttpObserver {
    fn id(&self) -> &str {
        &self.id
    }

    async fn update(&self, event: &ObserverEvent) -> Result<()> {
        let response = self
            .client
            .post(&self.id)
            .json(event)
            .send()
            .await
            .map_err(|e| Error::transport(format!("observer {}: {}", self.id, e)))?;
        if !response.status().is_success() {
            return Err(Error::transport(format!(
                "observer {} answered {}",
                self.id,
                response.status()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::observer::observer_server::{Observer as ObserverRpc, ObserverServer};
    use crate::proto::observer::UpdateObserverResponse;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::TcpListenerStream;
    use tonic::{Request, Response, Status};

    fn grpc_observer(raw: &str) -> GrpcObserver {
        let parsed = url::Url::parse(raw).unwrap();
        GrpcObserver::from_url(&parsed, raw, Duration::from_secs(1)).unwrap()
    }

    #[tokio::test]
    async fn test_grpc_url_uses_default_port() {
        let observer = observer_from_url("grpc://localhost", Duration::from_secs(1)).unwrap();
        assert_eq!(observer.id(), "grpc://localhost");
        assert_eq!(grpc_observer("grpc://localhost").endpoint(), "http://localhost:8260");
        assert_eq!(grpc_observer("grpc://sink:9999").endpoint(), "http://sink:9999");
    }

    struct Recorder(mpsc::Sender<String>);

    #[tonic::async_trait]
    impl ObserverRpc for Recorder {
        async fn update_observer(
            &self,
            request: Request<UpdateObserverRequest>,
        ) -> std::result::Result<Response<UpdateObserverResponse>, Status> {
            let _ = self.0.send(request.into_inner().message).await;
            Ok(Response::new(UpdateObserverResponse {}))
        }
    }

    #[tokio::test]
    async fn test_grpc_observer_delivers_event() {
        let (tx, mut rx) = mpsc::channel(4);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(
            tonic::transport::Server::builder()
                .add_service(ObserverServer::new(Recorder(tx)))
                .serve_with_incoming(TcpListenerStream::new(listener)),
        );

        let observer = grpc_observer(&format!("grpc://127.0.0.1:{}", port));
        let event = ObserverEvent {
            component_id: 6016,
            message_id: "SZSDK60168002".to_string(),
            method: "GetVersion".to_string(),
            correlation_id: "c-1".to_string(),
            origin: "unit".to_string(),
            subject: serde_json::json!({}),
            timestamp: chrono::Utc::now(),
        };
        observer.update(&event).await.unwrap();

        let message = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let delivered: ObserverEvent = serde_json::from_str(&message).unwrap();
        assert_eq!(delivered, event);
    }

    #[tokio::test]
    async fn test_http_url() {
        let observer =
            observer_from_url("http://localhost:9000/events", Duration::from_secs(1)).unwrap();
        assert_eq!(observer.id(), "http://localhost:9000/events");
    }

    #[test]
    fn test_unknown_scheme_is_bad_input() {
        let err = observer_from_url("ftp://localhost", Duration::from_secs(1))
            .err()
            .unwrap();
        assert_eq!(err.kind(), "bad-input");

        let err = observer_from_url("not a url", Duration::from_secs(1))
            .err()
            .unwrap();
        assert_eq!(err.kind(), "bad-input");
    }
}
