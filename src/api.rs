//! Backend REST client
//!
//! Stream CRUD and credential issuance. The publishing pipeline only needs
//! the [`StreamDescriptor`] these calls produce.

use reqwest::{Method, RequestBuilder, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    error::{BroadcastError, Result},
    model::stream::StreamDescriptor,
};

pub const DEFAULT_API_BASE: &str = "http://localhost:8080/api";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StreamStatus {
    Created,
    Live,
    Ended,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSummary {
    pub stream_id: u64,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: StreamStatus,
    pub creator: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamPage {
    pub items: Vec<StreamSummary>,
    pub next_cursor: Option<u64>,
    pub has_more: bool,
}

#[derive(Debug, Serialize)]
struct CreateStreamRequest<'a> {
    title: &'a str,
    description: &'a str,
}

pub struct StreamApi {
    base: String,
    http: reqwest::Client,
    /// Full `Authorization` header value, e.g. `Bearer <jwt>`.
    auth_header: Option<String>,
}

impl StreamApi {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
            auth_header: None,
        }
    }

    pub fn with_auth(mut self, auth_header: impl Into<String>) -> Self {
        self.auth_header = Some(auth_header.into());
        self
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base, path);
        debug!("{} {}", method, url);
        let builder = self.http.request(method, url);
        match &self.auth_header {
            Some(auth) => builder.header(reqwest::header::AUTHORIZATION, auth),
            None => builder,
        }
    }

    /// Create a stream owned by the authenticated user and get its
    /// broadcast credential.
    pub async fn create_stream(&self, title: &str, description: &str) -> Result<StreamDescriptor> {
        let descriptor: StreamDescriptor = send_json(
            self.request(Method::POST, "/stream")
                .json(&CreateStreamRequest { title, description }),
        )
        .await?;
        info!("Created stream {}", descriptor.stream_id);
        Ok(descriptor)
    }

    /// Fresh broadcast credential for an existing stream.
    pub async fn stream_credential(&self, stream_id: u64) -> Result<StreamDescriptor> {
        send_json(self.request(Method::GET, &format!("/stream/{stream_id}/jwt"))).await
    }

    pub async fn get_stream(&self, stream_id: u64) -> Result<StreamSummary> {
        send_json(self.request(Method::GET, &format!("/stream/{stream_id}"))).await
    }

    pub async fn list_streams(&self, cursor: Option<u64>, limit: u32) -> Result<StreamPage> {
        let mut query = vec![("limit", limit.to_string())];
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor.to_string()));
        }
        send_json(self.request(Method::GET, "/stream").query(&query)).await
    }

    pub async fn delete_stream(&self, stream_id: u64) -> Result<()> {
        send(self.request(Method::DELETE, &format!("/stream/{stream_id}"))).await?;
        Ok(())
    }

    /// Record that the stream went live.
    pub async fn mark_live(&self, stream_id: u64) -> Result<()> {
        send(self.request(Method::PUT, &format!("/stream/{stream_id}/live"))).await?;
        Ok(())
    }

    pub async fn mark_ended(&self, stream_id: u64) -> Result<()> {
        send(self.request(Method::PUT, &format!("/stream/{stream_id}/ended"))).await?;
        Ok(())
    }

    /// Media-server token for stream `number`, as a raw JWT.
    pub async fn publish_token(&self, number: u64) -> Result<String> {
        let response = send(self.request(Method::GET, &format!("/publish/token/{number}"))).await?;
        response
            .text()
            .await
            .map_err(|e| BroadcastError::TransportError(e.to_string()))
    }
}

async fn send(builder: RequestBuilder) -> Result<reqwest::Response> {
    let response = builder
        .send()
        .await
        .map_err(|e| BroadcastError::TransportError(e.to_string()))?;

    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            BroadcastError::AuthRejected(format!("{status}: {body}"))
        }
        _ => BroadcastError::TransportError(format!("{status}: {body}")),
    })
}

async fn send_json<T: DeserializeOwned>(builder: RequestBuilder) -> Result<T> {
    let body = send(builder)
        .await?
        .text()
        .await
        .map_err(|e| BroadcastError::TransportError(e.to_string()))?;
    serde_json::from_str(&body)
        .map_err(|e| BroadcastError::TransportError(format!("unexpected response: {e}")))
}

#[cfg(test)]
mod tests {
    use std::{
        io::Read,
        sync::{mpsc::Sender, Arc, Mutex},
    };

    use rouille::{Request, Response, Server};

    use super::*;

    /// A backend on loopback that records `METHOD url auth body` per request.
    struct Backend {
        base: String,
        seen: Arc<Mutex<Vec<String>>>,
        stop: Sender<()>,
    }

    impl Backend {
        fn start() -> Backend {
            let seen = Arc::new(Mutex::new(vec![]));
            let log = seen.clone();
            let server = Server::new("127.0.0.1:0", move |request| {
                let mut body = String::new();
                if let Some(mut data) = request.data() {
                    data.read_to_string(&mut body).unwrap();
                }
                let auth = request.header("Authorization").unwrap_or("-").to_string();
                log.lock().unwrap().push(format!(
                    "{} {} {} {}",
                    request.method(),
                    request.raw_url(),
                    auth,
                    body
                ));
                respond(request, &auth)
            })
            .unwrap();
            let base = format!("http://{}/api", server.server_addr());
            let (_handle, stop) = server.stoppable();
            Backend { base, seen, stop }
        }

        fn seen(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl Drop for Backend {
        fn drop(&mut self) {
            let _ = self.stop.send(());
        }
    }

    fn respond(request: &Request, auth: &str) -> Response {
        if auth != "Bearer user-jwt" {
            return Response::text("login required").with_status_code(401);
        }
        const DESCRIPTOR: &str =
            r#"{"streamId": 5, "streamUrl": "media.example.com:1935", "mediamtxJwt": "jwt-5"}"#;
        match (request.method(), request.url().as_str()) {
            ("POST", "/api/stream") | ("GET", "/api/stream/5/jwt") => {
                Response::from_data("application/json", DESCRIPTOR)
            }
            ("GET", "/api/stream/5") => Response::from_data(
                "application/json",
                r#"{"streamId": 5, "title": "t", "status": "CREATED", "creator": "u"}"#,
            ),
            ("GET", "/api/stream") => Response::from_data(
                "application/json",
                r#"{"items": [], "nextCursor": null, "hasMore": false}"#,
            ),
            ("GET", "/api/publish/token/5") => Response::text("raw.jwt"),
            ("DELETE", "/api/stream/5")
            | ("PUT", "/api/stream/5/live")
            | ("PUT", "/api/stream/5/ended") => Response::empty_204(),
            _ => Response::empty_404(),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn calls_hit_backend_routes() {
        let backend = Backend::start();
        let api = StreamApi::new(&backend.base).with_auth("Bearer user-jwt");

        let created = api.create_stream("Title", "About").await.unwrap();
        assert_eq!(created.stream_id, 5);
        let credential = api.stream_credential(5).await.unwrap();
        assert_eq!(credential.mediamtx_jwt, "jwt-5");
        assert_eq!(
            api.get_stream(5).await.unwrap().status,
            StreamStatus::Created
        );
        assert!(!api.list_streams(Some(9), 2).await.unwrap().has_more);
        api.mark_live(5).await.unwrap();
        api.mark_ended(5).await.unwrap();
        assert_eq!(api.publish_token(5).await.unwrap(), "raw.jwt");
        api.delete_stream(5).await.unwrap();

        assert_eq!(
            backend.seen(),
            vec![
                r#"POST /api/stream Bearer user-jwt {"title":"Title","description":"About"}"#,
                "GET /api/stream/5/jwt Bearer user-jwt ",
                "GET /api/stream/5 Bearer user-jwt ",
                "GET /api/stream?limit=2&cursor=9 Bearer user-jwt ",
                "PUT /api/stream/5/live Bearer user-jwt ",
                "PUT /api/stream/5/ended Bearer user-jwt ",
                "GET /api/publish/token/5 Bearer user-jwt ",
                "DELETE /api/stream/5 Bearer user-jwt ",
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_login_is_auth_rejected() {
        let backend = Backend::start();
        let api = StreamApi::new(&backend.base);

        assert!(matches!(
            api.stream_credential(5).await,
            Err(BroadcastError::AuthRejected(_))
        ));
        assert_eq!(backend.seen(), vec!["GET /api/stream/5/jwt - "]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_stream_is_transport_error() {
        let backend = Backend::start();
        let api = StreamApi::new(&backend.base).with_auth("Bearer user-jwt");
        assert!(matches!(
            api.get_stream(404).await,
            Err(BroadcastError::TransportError(_))
        ));
    }

    #[test]
    fn stream_page_parses() {
        let raw = r#"{
            "items": [{"streamId": 3, "title": "t", "description": "d", "status": "LIVE", "creator": "u"}],
            "nextCursor": null,
            "hasMore": false
        }"#;
        let page: StreamPage = serde_json::from_str(raw).unwrap();
        assert_eq!(page.items[0].status, StreamStatus::Live);
        assert_eq!(page.next_cursor, None);
    }

    #[test]
    fn base_url_is_normalized() {
        let api = StreamApi::new("http://localhost:8080/api/");
        assert_eq!(api.base, "http://localhost:8080/api");
    }
}
