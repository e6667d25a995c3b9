//! HTTP signaling endpoint
//!
//! A fixed pool of worker threads pulls requests off a `tiny_http` server and
//! hands them to the [`Router`]. Offer handling runs under one coarse lock
//! around the [`SignalingSession`], so negotiations are strictly serialized.

use crate::config::{ServerConfig, SnapshotConfig};
use crate::errors::{ServerError, SignalingError};
use crate::signaling::{AbortHandle, SignalingSession};
use crate::snapshot::SnapshotBridge;
use crate::types::SessionDescription;
use parking_lot::Mutex;
use serde::Deserialize;
use std::io::Read;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tiny_http::{Header, Method, Response, Server, StatusCode};

pub const JSON_CONTENT_TYPE: &str = "application/json; charset=UTF-8";
pub const TEXT_CONTENT_TYPE: &str = "text/plain; charset=UTF-8";

/// Sent on every response so a browser viewer on any origin can call us
pub const CORS_HEADERS: [(&str, &str); 4] = [
    ("Access-Control-Allow-Origin", "*"),
    ("Access-Control-Allow-Methods", "GET, POST, PUT, OPTIONS"),
    ("Access-Control-Allow-Headers", "*"),
    ("Access-Control-Max-Age", "3628800"),
];

const MAX_BODY_BYTES: u64 = 1 << 20;
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Transport-independent view of a request
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub path: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

impl HttpResponse {
    fn json(status: u16, value: &serde_json::Value) -> Self {
        Self {
            status,
            content_type: JSON_CONTENT_TYPE,
            body: value.to_string().into_bytes(),
        }
    }

    fn empty_json() -> Self {
        Self {
            status: 200,
            content_type: JSON_CONTENT_TYPE,
            body: b"{}".to_vec(),
        }
    }

    fn bad_request() -> Self {
        Self {
            status: 400,
            content_type: TEXT_CONTENT_TYPE,
            body: Vec::new(),
        }
    }

    fn payload_too_large() -> Self {
        Self::error(413, format!("request body exceeds {} bytes", MAX_BODY_BYTES))
    }

    fn error(status: u16, message: String) -> Self {
        Self::json(status, &serde_json::json!({ "error": message }))
    }

    /// Every header sent with this response
    pub fn headers(&self) -> Vec<(&'static str, &'static str)> {
        let mut headers = vec![("Content-Type", self.content_type)];
        headers.extend(CORS_HEADERS);
        headers
    }
}

#[derive(Deserialize)]
struct OfferBody {
    #[serde(rename = "type")]
    sdp_type: Option<String>,
    sdp: Option<String>,
}

/// Decode an `application/x-www-form-urlencoded` value
fn form_decode(value: &str) -> Result<String, SignalingError> {
    let spaced = value.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|v| v.into_owned())
        .map_err(|e| SignalingError::MalformedRequest(format!("invalid form encoding: {}", e)))
}

/// Extract the offer from a request body
///
/// Accepts the JSON object directly, or a form body carrying it in a
/// `postData` (or `data`) field.
pub fn parse_offer(body: &[u8], content_type: Option<&str>) -> Result<SessionDescription, SignalingError> {
    let text = std::str::from_utf8(body)
        .map_err(|_| SignalingError::MalformedRequest("body is not UTF-8".to_string()))?
        .trim();
    if text.is_empty() {
        return Err(SignalingError::MalformedRequest("empty body".to_string()));
    }

    let is_form = content_type.is_some_and(|ct| ct.contains("application/x-www-form-urlencoded"));
    let json = if is_form || !text.starts_with('{') {
        let field = text
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(key, _)| *key == "postData" || *key == "data")
            .map(|(_, value)| value)
            .ok_or_else(|| SignalingError::MalformedRequest("missing postData field".to_string()))?;
        form_decode(field)?
    } else {
        text.to_string()
    };

    let offer: OfferBody = serde_json::from_str(&json)
        .map_err(|e| SignalingError::MalformedRequest(format!("invalid JSON: {}", e)))?;
    let sdp_type = offer
        .sdp_type
        .ok_or_else(|| SignalingError::MalformedRequest("missing type".to_string()))?;
    let sdp = offer
        .sdp
        .ok_or_else(|| SignalingError::MalformedRequest("missing sdp".to_string()))?;
    if sdp_type != "offer" {
        return Err(SignalingError::MalformedRequest(format!(
            "expected type \"offer\", got {:?}",
            sdp_type
        )));
    }
    if sdp.trim().is_empty() {
        return Err(SignalingError::MalformedRequest("empty sdp".to_string()));
    }
    Ok(SessionDescription::offer(sdp))
}

/// Maps requests onto the signaling session and the snapshot bridge
pub struct Router {
    session: Mutex<SignalingSession>,
    abort: AbortHandle,
    snapshot: Arc<SnapshotBridge>,
    snapshot_timeout: Duration,
    offer_paths: Vec<String>,
    snapshot_path: String,
}

impl Router {
    pub fn new(
        session: SignalingSession,
        snapshot: Arc<SnapshotBridge>,
        server: &ServerConfig,
        snapshot_config: &SnapshotConfig,
    ) -> Self {
        Self {
            abort: session.abort_handle(),
            session: Mutex::new(session),
            snapshot,
            snapshot_timeout: snapshot_config.timeout(),
            offer_paths: server.offer_paths.clone(),
            snapshot_path: server.snapshot_path.clone(),
        }
    }

    /// Coarse lock around the signaling session
    pub fn session(&self) -> &Mutex<SignalingSession> {
        &self.session
    }

    pub fn route(&self, request: &HttpRequest) -> HttpResponse {
        let path = request.path.split('?').next().unwrap_or_default();

        if self.offer_paths.iter().any(|p| p == path) {
            match request.method {
                Method::Post => self.handle_offer(request),
                Method::Options => HttpResponse::empty_json(),
                _ => HttpResponse::bad_request(),
            }
        } else if path == self.snapshot_path {
            match request.method {
                Method::Get => self.handle_snapshot(),
                Method::Options => HttpResponse::empty_json(),
                _ => HttpResponse::bad_request(),
            }
        } else {
            log::debug!("No route for {} {}", request.method, path);
            HttpResponse::bad_request()
        }
    }

    fn handle_offer(&self, request: &HttpRequest) -> HttpResponse {
        let offer = match parse_offer(&request.body, request.content_type.as_deref()) {
            Ok(offer) => offer,
            Err(e) => {
                log::warn!("Rejected offer: {}", e);
                return HttpResponse::error(e.status_code(), e.to_string());
            }
        };

        log::info!("Received offer on {} ({} bytes of SDP)", request.path, offer.sdp.len());
        let result = self.session.lock().handle_offer(&offer);
        match result {
            Ok(answer) => match serde_json::to_value(&answer) {
                Ok(value) => {
                    log::info!("Sending final answer");
                    HttpResponse::json(200, &value)
                }
                Err(e) => HttpResponse::error(500, e.to_string()),
            },
            Err(e) => {
                log::error!("Negotiation failed: {}", e);
                HttpResponse::error(e.status_code(), e.to_string())
            }
        }
    }

    fn handle_snapshot(&self) -> HttpResponse {
        match self.snapshot.request_snapshot(self.snapshot_timeout) {
            Ok(image) => HttpResponse {
                status: 200,
                content_type: image.content_type,
                body: image.data,
            },
            Err(e) => {
                log::error!("Snapshot failed: {}", e);
                HttpResponse::error(e.status_code(), e.to_string())
            }
        }
    }

    /// Release blocked requests and dispose the active session
    pub fn shutdown(&self) {
        self.abort.abort();
        self.snapshot.shutdown();
        self.session.lock().shutdown();
    }
}

fn respond(request: tiny_http::Request, response: HttpResponse) {
    let headers = response.headers();
    let mut reply = Response::from_data(response.body).with_status_code(StatusCode(response.status));
    for (name, value) in headers {
        match Header::from_bytes(name.as_bytes(), value.as_bytes()) {
            Ok(header) => reply.add_header(header),
            Err(()) => log::warn!("Invalid response header {}", name),
        }
    }
    if let Err(e) = request.respond(reply) {
        log::warn!("Failed to send response: {}", e);
    }
}

/// Read at most `limit` bytes. `None` when the body is longer.
fn read_limited(reader: &mut dyn Read, limit: u64) -> std::io::Result<Option<Vec<u8>>> {
    let mut body = Vec::new();
    reader.take(limit + 1).read_to_end(&mut body)?;
    if body.len() as u64 > limit {
        return Ok(None);
    }
    Ok(Some(body))
}

fn serve(mut request: tiny_http::Request, router: &Router) {
    let content_type = request
        .headers()
        .iter()
        .find(|h| h.field.equiv("Content-Type"))
        .map(|h| h.value.as_str().to_string());

    let body = match read_limited(request.as_reader(), MAX_BODY_BYTES) {
        Ok(Some(body)) => body,
        Ok(None) => {
            log::warn!("Rejected {} {}: body over {} bytes", request.method(), request.url(), MAX_BODY_BYTES);
            respond(request, HttpResponse::payload_too_large());
            return;
        }
        Err(e) => {
            log::warn!("Failed to read request body: {}", e);
            respond(request, HttpResponse::bad_request());
            return;
        }
    };

    let http_request = HttpRequest {
        method: request.method().clone(),
        path: request.url().to_string(),
        content_type,
        body,
    };
    let response = router.route(&http_request);
    log::debug!("{} {} -> {}", http_request.method, http_request.path, response.status);
    respond(request, response);
}

pub struct SignalingServer {
    router: Arc<Router>,
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl SignalingServer {
    /// Bind `addr` and start `workers` request threads
    pub fn bind(addr: SocketAddr, router: Router, workers: usize) -> Result<Self, ServerError> {
        let http = Server::http(addr).map_err(|e| ServerError::Bind {
            addr: addr.to_string(),
            reason: e.to_string(),
        })?;
        let local_addr = http.server_addr().to_ip().ok_or_else(|| ServerError::Bind {
            addr: addr.to_string(),
            reason: "not an IP listener".to_string(),
        })?;

        let http = Arc::new(http);
        let router = Arc::new(router);
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut handles = Vec::with_capacity(workers.max(1));
        for index in 0..workers.max(1) {
            let http = Arc::clone(&http);
            let router = Arc::clone(&router);
            let shutdown = Arc::clone(&shutdown);
            let handle = std::thread::Builder::new()
                .name(format!("rtccam-http-{}", index))
                .spawn(move || {
                    while !shutdown.load(Ordering::Acquire) {
                        match http.recv_timeout(POLL_INTERVAL) {
                            Ok(Some(request)) => serve(request, &router),
                            Ok(None) => {}
                            Err(e) => log::warn!("HTTP receive error: {}", e),
                        }
                    }
                })?;
            handles.push(handle);
        }

        log::info!("Signaling server listening on http://{}", local_addr);
        Ok(Self {
            router,
            local_addr,
            shutdown,
            workers: handles,
        })
    }

    /// Bind using the `[server]` section
    pub fn from_config(config: &ServerConfig, router: Router) -> Result<Self, ServerError> {
        let addr = config.socket_addr().map_err(|e| ServerError::Bind {
            addr: format!("{}:{}", config.bind_address, config.port),
            reason: e.to_string(),
        })?;
        Self::bind(addr, router, config.workers)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Stop accepting, unblock waiting requests, dispose the session and join
    /// the workers. Idempotent.
    pub fn shutdown(&mut self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        log::info!("Shutting down signaling server");
        self.router.abort.abort();
        self.router.snapshot.shutdown();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                log::warn!("HTTP worker panicked");
            }
        }
        self.router.shutdown();
    }
}

impl Drop for SignalingServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NegotiationConfig;
    use crate::media::VideoSink;
    use crate::signaling::MediaSessionFactory;
    use crate::testing::{sample_offer, synthetic_video_frame, LoopbackEngine, LoopbackScript};

    fn router_with(script: LoopbackScript) -> (Arc<LoopbackEngine>, Router) {
        let engine = Arc::new(LoopbackEngine::with_script(script));
        let factory = MediaSessionFactory::new(engine.clone(), &NegotiationConfig::default()).unwrap();
        let session = SignalingSession::new(factory, Some(Duration::from_secs(5)));
        let snapshot_config = SnapshotConfig {
            timeout_ms: 100,
            ..SnapshotConfig::default()
        };
        let router = Router::new(
            session,
            Arc::new(SnapshotBridge::new(80)),
            &ServerConfig::default(),
            &snapshot_config,
        );
        (engine, router)
    }

    fn request(method: Method, path: &str, body: &str) -> HttpRequest {
        HttpRequest {
            method,
            path: path.to_string(),
            content_type: Some("application/json".to_string()),
            body: body.as_bytes().to_vec(),
        }
    }

    fn offer_json() -> String {
        serde_json::to_string(&sample_offer()).unwrap()
    }

    #[test]
    fn test_parse_raw_json() {
        let offer = parse_offer(br#"{"type":"offer","sdp":"v=0\r\n"}"#, None).unwrap();
        assert_eq!(offer.sdp, "v=0\r\n");
    }

    #[test]
    fn test_parse_form_field() {
        let json = r#"{"type":"offer","sdp":"v=0 o=- 1"}"#;
        let body = format!("postData={}", urlencoding::encode(json));
        let offer = parse_offer(body.as_bytes(), Some("application/x-www-form-urlencoded")).unwrap();
        assert_eq!(offer.sdp, "v=0 o=- 1");

        let body = "other=1&data=%7B%22type%22%3A%22offer%22%2C%22sdp%22%3A%22v%3D0+x%22%7D";
        let offer = parse_offer(body.as_bytes(), None).unwrap();
        assert_eq!(offer.sdp, "v=0 x");
    }

    #[test]
    fn test_parse_rejects_bad_offers() {
        for body in [
            r#"{"type":"answer","sdp":"x"}"#,
            r#"{"type":"offer"}"#,
            r#"{"sdp":"v=0"}"#,
            r#"{"type":"offer","sdp":""}"#,
            "{not json",
            "",
            "foo=bar",
        ] {
            let err = parse_offer(body.as_bytes(), None).unwrap_err();
            assert!(matches!(err, SignalingError::MalformedRequest(_)), "{}", body);
        }
    }

    #[test]
    fn test_offer_round_trip() {
        let (engine, router) = router_with(LoopbackScript::default());
        for path in ["/", "/webrtc", "/webcam"] {
            let response = router.route(&request(Method::Post, path, &offer_json()));
            assert_eq!(response.status, 200);
            assert_eq!(response.content_type, JSON_CONTENT_TYPE);

            let answer: SessionDescription = serde_json::from_slice(&response.body).unwrap();
            assert_eq!(answer.sdp_type, crate::types::SdpType::Answer);
            assert!(answer.candidate_count() > 0);
        }
        assert_eq!(engine.live_sessions(), 1);
    }

    #[test]
    fn test_malformed_offer_keeps_session() {
        let (engine, router) = router_with(LoopbackScript::default());
        router.route(&request(Method::Post, "/", &offer_json()));
        let active = router.session().lock().active_session_id().map(str::to_string);

        let response = router.route(&request(Method::Post, "/", r#"{"type":"answer","sdp":"x"}"#));
        assert_eq!(response.status, 400);
        assert_eq!(router.session().lock().active_session_id().map(str::to_string), active);
        assert_eq!(engine.live_sessions(), 1);
    }

    #[test]
    fn test_negotiation_failure_is_500() {
        let (_engine, router) = router_with(LoopbackScript {
            reject_remote_description: true,
            ..LoopbackScript::default()
        });
        let response = router.route(&request(Method::Post, "/webrtc", &offer_json()));
        assert_eq!(response.status, 500);
        assert_eq!(response.content_type, JSON_CONTENT_TYPE);
    }

    #[test]
    fn test_preflight_and_unknown_routes() {
        let (_engine, router) = router_with(LoopbackScript::default());

        for path in ["/", "/snapshot"] {
            let response = router.route(&request(Method::Options, path, ""));
            assert_eq!(response.status, 200);
            assert_eq!(response.body, b"{}");
        }

        let response = router.route(&request(Method::Get, "/webrtc", ""));
        assert_eq!(response.status, 400);
        assert_eq!(response.content_type, TEXT_CONTENT_TYPE);
        assert!(response.body.is_empty());

        let response = router.route(&request(Method::Post, "/nowhere", "{}"));
        assert_eq!(response.status, 400);
    }

    #[test]
    fn test_snapshot_route() {
        let (_engine, router) = router_with(LoopbackScript::default());

        let response = router.route(&request(Method::Get, "/snapshot", ""));
        assert_eq!(response.status, 504);

        let bridge = Arc::clone(&router.snapshot);
        let producer = std::thread::spawn(move || {
            while !bridge.is_requested() {
                std::thread::sleep(Duration::from_millis(1));
            }
            bridge.on_frame(&synthetic_video_frame(0, 32, 24));
        });
        let response = router.route(&request(Method::Get, "/snapshot?t=1", ""));
        producer.join().unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.content_type, "image/jpeg");
        assert_eq!(&response.body[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_oversized_body_is_rejected() {
        let mut exact = std::io::Cursor::new(vec![b'x'; 64]);
        assert_eq!(read_limited(&mut exact, 64).unwrap().unwrap().len(), 64);

        let mut over = std::io::Cursor::new(vec![b'x'; 65]);
        assert!(read_limited(&mut over, 64).unwrap().is_none());

        let response = HttpResponse::payload_too_large();
        assert_eq!(response.status, 413);
        assert_eq!(response.content_type, JSON_CONTENT_TYPE);
    }

    #[test]
    fn test_every_response_carries_cors() {
        let response = HttpResponse::bad_request();
        let headers = response.headers();
        assert!(headers.contains(&("Access-Control-Allow-Origin", "*")));
        assert!(headers.contains(&("Access-Control-Allow-Methods", "GET, POST, PUT, OPTIONS")));
        assert!(headers.contains(&("Access-Control-Allow-Headers", "*")));
        assert!(headers.contains(&("Access-Control-Max-Age", "3628800")));
        assert!(headers.contains(&("Content-Type", TEXT_CONTENT_TYPE)));
    }
}
