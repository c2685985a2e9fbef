//! The registry HTTP front door.
//!
//! Implements the OCI Distribution v2 read endpoints plus the mirror
//! protocol. A request is either served from the local content store,
//! proxied to a peer that advertises the requested key, or answered with
//! 404, which tells the container runtime to fall back to the upstream
//! registry. The handler never returns 5xx.

use std::any::Any;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, State};
use axum::headers::HeaderMapExt;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use http::header::{HeaderName, CONTENT_LENGTH, CONTENT_TYPE};
use http::{Method, Request, StatusCode};
use hyper::body::HttpBody;
use hyper::Body;
use tokio_util::io::ReaderStream;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::headers::{XExternal, XMirror, XRemoteRegistry};
use crate::metrics;
use crate::oci::{OciClient, OciError};
use crate::reference::{self, Reference};
use crate::routing::{self, Resolution};

static DOCKER_CONTENT_DIGEST: HeaderName = HeaderName::from_static("docker-content-digest");

const RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);
const BLOB_PIPE_CAPACITY: usize = 64 * 1024;

pub struct RegistryState {
    pub oci: Arc<dyn OciClient>,
    pub router: Arc<dyn routing::Router>,
    /// This node's own registry listener port; peers are homogeneous, so it
    /// is also the port peers serve on.
    pub registry_port: u16,
}

pub fn make_router(state: Arc<RegistryState>) -> axum::Router {
    axum::Router::new()
        .route("/healthz", get(|| async { StatusCode::OK }))
        .fallback(registry)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::custom(handle_panic))
}

/// A panic must not kill peer requests, and must not leak as a 5xx.
fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response<Body> {
    let detail = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!(detail, "panic while serving registry request");
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(Body::empty())
        .unwrap()
}

async fn registry(
    State(state): State<Arc<RegistryState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request<Body>,
) -> Response {
    // Only deal with GET and HEAD requests.
    if req.method() != Method::GET && req.method() != Method::HEAD {
        return not_found();
    }

    // Quickly return 200 for /v2 to indicate that the registry supports v2.
    let path = req.uri().path().trim_end_matches('/').to_string();
    if path == "/v2" {
        if req.method() != Method::GET {
            return not_found();
        }
        return StatusCode::OK.into_response();
    }
    if !path.starts_with("/v2/") {
        return not_found();
    }

    // Always expect the remote registry header to be passed in the request.
    let Some(XRemoteRegistry(remote_registry)) = req.headers().typed_get() else {
        debug!(path, "missing remote registry header");
        return not_found();
    };

    // Requests with the mirror header are resolved to a peer and proxied.
    let mirror = req
        .headers()
        .typed_get::<XMirror>()
        .map(|header| header.0)
        .unwrap_or(false);
    if mirror {
        let external = req
            .headers()
            .typed_get::<XExternal>()
            .map(|header| header.0)
            .unwrap_or(false);
        let response = handle_mirror(&state, &remote_registry, external, addr.ip(), req).await;
        metrics::record_mirror_request(&remote_registry, response.status(), external);
        return response;
    }

    serve_local(&state, &remote_registry, &path, req.method()).await
}

async fn serve_local(
    state: &RegistryState,
    remote_registry: &str,
    path: &str,
    method: &Method,
) -> Response {
    match reference::manifest_reference(remote_registry, path) {
        Ok(Some(reference)) => return handle_manifest(state, &reference, method).await,
        Ok(None) => {}
        Err(err) => {
            debug!(path, %err, "invalid manifest reference");
            return not_found();
        }
    }
    match reference::blob_reference(remote_registry, path) {
        Ok(Some(reference)) => handle_blob(state, &reference, method).await,
        Ok(None) => not_found(),
        Err(err) => {
            debug!(path, %err, "invalid blob reference");
            not_found()
        }
    }
}

async fn handle_mirror(
    state: &RegistryState,
    remote_registry: &str,
    external: bool,
    client_ip: IpAddr,
    mut req: Request<Body>,
) -> Response {
    // Downgrade the mirror header before anything else, so a forwarded
    // request can never be classified as a mirror request again.
    req.headers_mut().typed_insert(XMirror(false));

    let path = req.uri().path().to_string();
    let reference = match reference::any_reference(remote_registry, &path) {
        Ok(Some(reference)) => reference,
        Ok(None) => {
            debug!(path, "could not parse reference");
            return not_found();
        }
        Err(err) => {
            debug!(path, %err, "could not parse reference");
            return not_found();
        }
    };
    let key = reference.key();

    // External callers are outside the overlay, so resolving to this node
    // is a valid answer for them.
    if external {
        info!(path, ip = %client_ip, "handling mirror request from external node");
    }

    let resolution = tokio::time::timeout(
        RESOLVE_TIMEOUT,
        state.router.resolve(&key, external),
    )
    .await
    .ok()
    .flatten();
    let Some(resolution) = resolution else {
        debug!(key, "no node with the requested key could be resolved");
        return not_found();
    };

    let method = req.method().clone();
    match resolution {
        Resolution::Local => serve_local(state, remote_registry, &path, &method).await,
        Resolution::Peer(ip) => {
            let target = peer_url(ip, state.registry_port);
            debug!(path, target, "forwarding request");
            match hyper_reverse_proxy::call(client_ip, &target, req).await {
                Ok(response) => {
                    let (parts, body) = response.into_parts();
                    let body = <Body as HttpBody>::map_err(body, axum::Error::new).boxed_unsync();
                    Response::from_parts(parts, body)
                }
                Err(err) => {
                    warn!(?err, target, "could not proxy to peer");
                    not_found()
                }
            }
        }
    }
}

async fn handle_manifest(
    state: &RegistryState,
    reference: &Reference,
    method: &Method,
) -> Response {
    // Tag references are a miss until resolved to a digest by the caller.
    let Some(digest) = reference.digest() else {
        return not_found();
    };
    let (bytes, media_type) = match state.oci.get_content(digest).await {
        Ok(content) => content,
        Err(err) => return miss(err, "manifest"),
    };
    let builder = Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, media_type)
        .header(CONTENT_LENGTH, bytes.len())
        .header(&DOCKER_CONTENT_DIGEST, digest.to_string());
    let body = if method == Method::HEAD {
        Body::empty()
    } else {
        Body::from(bytes)
    };
    match builder.body(body) {
        Ok(response) => response.into_response(),
        Err(err) => {
            warn!(%err, "could not build manifest response");
            not_found()
        }
    }
}

async fn handle_blob(state: &RegistryState, reference: &Reference, method: &Method) -> Response {
    let Some(digest) = reference.digest() else {
        return not_found();
    };
    let size = match state.oci.get_size(digest).await {
        Ok(size) => size,
        Err(err) => return miss(err, "blob"),
    };
    let builder = Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_LENGTH, size)
        .header(&DOCKER_CONTENT_DIGEST, digest.to_string());
    let body = if method == Method::HEAD {
        Body::empty()
    } else {
        // Pipe the blob through a bounded buffer; backpressure from the
        // response body propagates to the content store read.
        let (mut writer, reader) = tokio::io::duplex(BLOB_PIPE_CAPACITY);
        let oci = Arc::clone(&state.oci);
        let digest = digest.clone();
        tokio::spawn(async move {
            if let Err(err) = oci.copy(&digest, &mut writer).await {
                warn!(%err, digest = %digest, "blob copy aborted");
            }
        });
        Body::wrap_stream(ReaderStream::new(reader))
    };
    match builder.body(body) {
        Ok(response) => response.into_response(),
        Err(err) => {
            warn!(%err, "could not build blob response");
            not_found()
        }
    }
}

/// Misses are expected and stay quiet; transient store failures are warned
/// about. Both answer 404 so the caller falls back upstream.
fn miss(err: OciError, what: &str) -> Response {
    if !err.is_not_found() {
        warn!(%err, what, "could not serve content");
    }
    not_found()
}

fn not_found() -> Response {
    StatusCode::NOT_FOUND.into_response()
}

fn peer_url(ip: IpAddr, port: u16) -> String {
    match ip {
        IpAddr::V4(ip) => format!("http://{ip}:{port}"),
        IpAddr::V6(ip) => format!("http://[{ip}]:{port}"),
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddr};
    use std::sync::Mutex;

    use axum::extract::ConnectInfo;
    use tower::ServiceExt;

    use super::*;
    use crate::test_utils::{MemoryOciClient, MemoryRouter};

    fn digest(fill: char) -> String {
        format!("sha256:{}", fill.to_string().repeat(64))
    }

    fn make_app(oci: MemoryOciClient, router: MemoryRouter, registry_port: u16) -> (axum::Router, Arc<MemoryRouter>) {
        let router = Arc::new(router);
        let state = Arc::new(RegistryState {
            oci: Arc::new(oci),
            router: Arc::clone(&router) as Arc<dyn routing::Router>,
            registry_port,
        });
        (make_router(state), router)
    }

    fn request(method: Method, uri: &str) -> http::request::Builder {
        Request::builder().method(method).uri(uri)
    }

    async fn send(app: &axum::Router, builder: http::request::Builder) -> Response {
        let mut req = builder.body(Body::empty()).unwrap();
        req.extensions_mut().insert(ConnectInfo(SocketAddr::from((
            Ipv4Addr::LOCALHOST,
            43210,
        ))));
        app.clone().oneshot(req).await.unwrap()
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        hyper::body::to_bytes(response.into_body())
            .await
            .unwrap()
            .to_vec()
    }

    #[tokio::test]
    async fn health_endpoint_is_ok() {
        let (app, _) = make_app(MemoryOciClient::default(), MemoryRouter::default(), 5000);
        let response = send(&app, request(Method::GET, "/healthz")).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn capability_probe() {
        let (app, _) = make_app(MemoryOciClient::default(), MemoryRouter::default(), 5000);

        for uri in ["/v2", "/v2/"] {
            let response = send(&app, request(Method::GET, uri)).await;
            assert_eq!(response.status(), StatusCode::OK);
            assert!(body_bytes(response).await.is_empty());
        }

        let response = send(&app, request(Method::HEAD, "/v2")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = send(&app, request(Method::POST, "/v2")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_paths_are_not_found() {
        let (app, _) = make_app(MemoryOciClient::default(), MemoryRouter::default(), 5000);

        for uri in ["/", "/v3/foo", "/v2/foo/bar/tags/list"] {
            let response = send(
                &app,
                request(Method::GET, uri).header("x-remote-registry", "docker.io"),
            )
            .await;
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{uri}");
        }
    }

    #[tokio::test]
    async fn missing_remote_registry_header_is_not_found() {
        let oci = MemoryOciClient::default().with_manifest(&digest('a'), b"{}".to_vec(), "application/json");
        let (app, _) = make_app(oci, MemoryRouter::default(), 5000);
        let uri = format!("/v2/foo/bar/manifests/{}", digest('a'));
        let response = send(&app, request(Method::GET, &uri)).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn local_manifest_hit() {
        let manifest = br#"{"schemaVersion":2}"#.to_vec();
        let oci = MemoryOciClient::default().with_manifest(
            &digest('a'),
            manifest.clone(),
            "application/vnd.oci.image.manifest.v1+json",
        );
        let (app, _) = make_app(oci, MemoryRouter::default(), 5000);
        let uri = format!("/v2/foo/bar/manifests/{}", digest('a'));

        let response = send(
            &app,
            request(Method::GET, &uri).header("x-remote-registry", "docker.io"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[CONTENT_TYPE],
            "application/vnd.oci.image.manifest.v1+json"
        );
        assert_eq!(
            response.headers()[CONTENT_LENGTH],
            manifest.len().to_string().as_str()
        );
        assert_eq!(response.headers()["docker-content-digest"], digest('a').as_str());
        assert_eq!(body_bytes(response).await, manifest);
    }

    #[tokio::test]
    async fn head_returns_get_headers_and_no_body() {
        let manifest = br#"{"schemaVersion":2}"#.to_vec();
        let oci = MemoryOciClient::default().with_manifest(
            &digest('a'),
            manifest.clone(),
            "application/vnd.oci.image.manifest.v1+json",
        );
        let (app, _) = make_app(oci, MemoryRouter::default(), 5000);
        let uri = format!("/v2/foo/bar/manifests/{}", digest('a'));

        let get = send(
            &app,
            request(Method::GET, &uri).header("x-remote-registry", "docker.io"),
        )
        .await;
        let head = send(
            &app,
            request(Method::HEAD, &uri).header("x-remote-registry", "docker.io"),
        )
        .await;

        assert_eq!(head.status(), StatusCode::OK);
        assert_eq!(get.headers(), head.headers());
        assert!(body_bytes(head).await.is_empty());
    }

    #[tokio::test]
    async fn manifest_by_tag_is_a_miss() {
        let oci = MemoryOciClient::default().with_manifest(&digest('a'), b"{}".to_vec(), "application/json");
        let (app, _) = make_app(oci, MemoryRouter::default(), 5000);
        let response = send(
            &app,
            request(Method::GET, "/v2/foo/bar/manifests/latest")
                .header("x-remote-registry", "docker.io"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn local_blob_is_streamed() {
        let blob: Vec<u8> = (0..=255u8).cycle().take(256 * 1024).collect();
        let oci = MemoryOciClient::default().with_blob(&digest('b'), blob.clone());
        let (app, _) = make_app(oci, MemoryRouter::default(), 5000);
        let uri = format!("/v2/foo/bar/blobs/{}", digest('b'));

        let response = send(
            &app,
            request(Method::GET, &uri).header("x-remote-registry", "docker.io"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[CONTENT_LENGTH],
            blob.len().to_string().as_str()
        );
        assert_eq!(body_bytes(response).await, blob);
    }

    #[tokio::test]
    async fn blob_path_without_digest_is_not_found() {
        let (app, _) = make_app(MemoryOciClient::default(), MemoryRouter::default(), 5000);
        let response = send(
            &app,
            request(Method::GET, "/v2/foo/bar/blobs/latest")
                .header("x-remote-registry", "docker.io"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn mirror_miss_is_not_found() {
        let (app, router) = make_app(MemoryOciClient::default(), MemoryRouter::default(), 5000);
        let uri = format!("/v2/foo/bar/blobs/{}", digest('c'));
        let response = send(
            &app,
            request(Method::GET, &uri)
                .header("x-remote-registry", "docker.io")
                .header("x-mirror", "true"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        // Internal mirror requests must not resolve to this node.
        assert_eq!(router.resolve_calls(), vec![(digest('c'), false)]);
    }

    #[tokio::test(start_paused = true)]
    async fn mirror_resolve_deadline_yields_not_found() {
        let (app, _) = make_app(
            MemoryOciClient::default(),
            MemoryRouter::default().unresponsive(),
            5000,
        );
        let uri = format!("/v2/foo/bar/blobs/{}", digest('c'));
        let response = send(
            &app,
            request(Method::GET, &uri)
                .header("x-remote-registry", "docker.io")
                .header("x-mirror", "true"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    /// A peer that records the mirror header it saw and serves a fixed body.
    async fn spawn_peer(body: &'static str) -> (SocketAddr, Arc<Mutex<Option<String>>>) {
        let seen = Arc::new(Mutex::new(None));
        let captured = Arc::clone(&seen);
        let app = axum::Router::new().fallback(move |req: Request<Body>| {
            let captured = Arc::clone(&captured);
            async move {
                let mirror = req
                    .headers()
                    .get("x-mirror")
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_string);
                *captured.lock().unwrap() = mirror;
                body
            }
        });
        let server = axum::Server::bind(&SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
            .serve(app.into_make_service());
        let addr = server.local_addr();
        tokio::spawn(server);
        (addr, seen)
    }

    #[tokio::test]
    async fn mirror_hit_proxies_with_downgraded_header() {
        let (peer_addr, seen_mirror_header) = spawn_peer("blob-bytes").await;
        let router = MemoryRouter::default()
            .with_resolution(&digest('d'), Resolution::Peer(peer_addr.ip()));
        let (app, _) = make_app(MemoryOciClient::default(), router, peer_addr.port());

        let uri = format!("/v2/foo/bar/blobs/{}", digest('d'));
        let response = send(
            &app,
            request(Method::GET, &uri)
                .header("x-remote-registry", "docker.io")
                .header("x-mirror", "true"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, b"blob-bytes");
        assert_eq!(
            seen_mirror_header.lock().unwrap().as_deref(),
            Some("false"),
            "forwarded request must carry a downgraded mirror header"
        );
    }

    #[tokio::test]
    async fn external_mirror_request_may_resolve_to_self() {
        let blob = b"local-blob".to_vec();
        let oci = MemoryOciClient::default().with_blob(&digest('e'), blob.clone());
        let router = MemoryRouter::default().with_resolution(&digest('e'), Resolution::Local);
        let (app, router) = make_app(oci, router, 5000);

        let uri = format!("/v2/foo/bar/blobs/{}", digest('e'));
        let response = send(
            &app,
            request(Method::GET, &uri)
                .header("x-remote-registry", "docker.io")
                .header("x-mirror", "true")
                .header("x-external", "true"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, blob);
        // External requests permit resolving to this node.
        assert_eq!(router.resolve_calls(), vec![(digest('e'), true)]);
    }

    #[tokio::test]
    async fn panics_are_recovered_as_not_found() {
        let state = Arc::new(RegistryState {
            oci: Arc::new(MemoryOciClient::default()),
            router: Arc::new(MemoryRouter::default()),
            registry_port: 5000,
        });
        let app = axum::Router::new()
            .route(
                "/boom",
                get(|| async {
                    panic!("kaboom");
                    #[allow(unreachable_code)]
                    ""
                }),
            )
            .fallback(registry)
            .with_state(state)
            .layer(CatchPanicLayer::custom(handle_panic));

        let mut req = Request::builder()
            .method(Method::GET)
            .uri("/boom")
            .body(Body::empty())
            .unwrap();
        req.extensions_mut().insert(ConnectInfo(SocketAddr::from((
            Ipv4Addr::LOCALHOST,
            43210,
        ))));
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
