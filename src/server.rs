//! The routing dispatcher
//!
//! Accepts connections, classifies each request (admission check, debug,
//! mapping CRUD, noise, second-level proxy, normal proxy) and drives
//! resolve → build-upstream → forward. Handlers run concurrently and share
//! the store, the snapshot caches and the single-flight group.

use crate::config::Config;
use crate::control::{self, DebugData, MAPPINGS_API_PREFIX};
use crate::discovery::{ContainerInventory, ContainerRecord, ProcessRecord, SystemProcessProbe};
use crate::error::{full_body, json_error_response, GatewayErrorCode, ProxyBody};
use crate::forward::{self, Forwarder};
use crate::logbuf::LogBuffer;
use crate::resolver::{InventorySnapshot, ResolverGateway};
use crate::singleflight::ResolveGroup;
use crate::snapshot::SnapshotCache;
use crate::store::{MappingStore, RouteMapping, TargetKind};
use crate::upstream;
use anyhow::Result;
use hyper::body::Incoming;
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const X_REQUEST_ID: &str = "x-request-id";
const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Maximum hostname length per DNS specification
const MAX_HOSTNAME_LEN: usize = 253;

/// Shared per-process routing state.
pub struct ProxyState {
    pub config: Config,
    pub store: Arc<MappingStore>,
    resolver: ResolverGateway,
    resolve_group: ResolveGroup,
    process_probe: SystemProcessProbe,
    process_cache: SnapshotCache<Vec<ProcessRecord>>,
    containers: ContainerInventory,
    container_cache: SnapshotCache<Vec<ContainerRecord>>,
    forwarder: Forwarder,
    logs: LogBuffer,
}

impl ProxyState {
    pub fn new(
        config: Config,
        store: Arc<MappingStore>,
        containers: ContainerInventory,
        logs: LogBuffer,
    ) -> Self {
        let resolver = ResolverGateway::new(
            config.api_key.clone(),
            config.api_url.clone(),
            config.model.clone(),
            config.llm_timeout(),
        );
        let ttl = config.process_snapshot_ttl();
        Self {
            process_probe: SystemProcessProbe::new(config.probe_timeout()),
            process_cache: SnapshotCache::new("processes", ttl),
            container_cache: SnapshotCache::new("containers", ttl),
            resolve_group: ResolveGroup::new(),
            forwarder: Forwarder::new(),
            config,
            store,
            resolver,
            containers,
            logs,
        }
    }

    async fn process_snapshot(&self) -> Result<Vec<ProcessRecord>> {
        let probe = self.process_probe.clone();
        self.process_cache
            .get(move || async move { probe.scan().await })
            .await
    }

    async fn container_snapshot(&self) -> Vec<ContainerRecord> {
        let own_project = self.config.own_project.clone();
        self.container_cache
            .get(|| async { Ok(self.containers.scan(own_project.as_deref()).await) })
            .await
            .unwrap_or_default()
    }

    async fn gather_inventory(&self) -> InventorySnapshot {
        let processes = match self.process_snapshot().await {
            Ok(processes) => processes,
            Err(e) => {
                warn!(error = %e, "process discovery failed, judging without it");
                Vec::new()
            }
        };
        InventorySnapshot {
            processes,
            containers: self.container_snapshot().await,
            mappings: self.store.get_all(),
        }
    }

    /// Resolve a key through the single-flight group, writing the result
    /// through to the store.
    async fn resolve(
        &self,
        key: &str,
        force: bool,
        prompt: Option<String>,
        related: Option<RelatedRequest>,
    ) -> Result<RouteMapping> {
        self.resolve_group
            .resolve(key, || async {
                // Another waiter may have just populated the store.
                if !force {
                    if let Some(mapping) = self.store.get(key) {
                        return Ok(mapping);
                    }
                }

                let inventory = self.gather_inventory().await;
                let decision = match &related {
                    None => {
                        self.resolver
                            .resolve_hostname(key, prompt.as_deref(), &inventory)
                            .await?
                    }
                    Some(ctx) => {
                        self.resolver
                            .resolve_related(
                                &ctx.origin_host,
                                ctx.origin_mapping.as_ref(),
                                &ctx.service,
                                prompt.as_deref(),
                                &inventory,
                            )
                            .await?
                    }
                };

                let mapping = decision.into_mapping();
                info!(
                    key,
                    kind = mapping.kind.as_str(),
                    target = %mapping.target,
                    port = mapping.port,
                    reason = %mapping.llm_reason,
                    "resolved target"
                );
                self.store.set(key, mapping.clone());
                if let Err(e) = self.store.save() {
                    // The in-memory mapping still stands; routing works,
                    // persistence is degraded until the next save.
                    warn!(key, error = %e, "failed to persist mapping");
                }
                Ok(mapping)
            })
            .await
    }
}

struct RelatedRequest {
    origin_host: String,
    origin_mapping: Option<RouteMapping>,
    service: String,
}

/// The listening proxy server.
pub struct ProxyServer {
    listener: TcpListener,
    state: Arc<ProxyState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub async fn bind(state: Arc<ProxyState>, shutdown_rx: watch::Receiver<bool>) -> Result<Self> {
        let listener = TcpListener::bind(&state.config.listen).await?;
        Ok(Self {
            listener,
            state,
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self) -> Result<()> {
        info!(addr = %self.listener.local_addr()?, "proxy listening");
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, state).await {
                                    debug!(addr = %addr, error = %e, "connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("proxy shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    addr: SocketAddr,
    state: Arc<ProxyState>,
) -> Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let state = Arc::clone(&state);
        async move { handle_request(req, state, addr).await }
    });

    // HTTP/1.1 and h2c on one port; HTTP/1.1 connections can still upgrade
    // to WebSocket.
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("connection error: {e}"))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    state: Arc<ProxyState>,
    client_addr: SocketAddr,
) -> std::result::Result<Response<ProxyBody>, hyper::Error> {
    let Some(hostname) = extract_hostname(&req) else {
        return Ok(json_error_response(
            GatewayErrorCode::MissingHostHeader,
            "Missing or invalid Host header",
        ));
    };

    let path = req.uri().path().to_string();
    debug!(hostname, method = %req.method(), path, "incoming request");

    // TLS admission check, consulted out-of-band by the terminating front
    // end before it mints a certificate.
    if path == "/_caddy/check" || path == "/_tls_check" {
        let domain = query_param(req.uri().query(), "domain").unwrap_or_else(|| hostname.clone());
        return Ok(admission_response(&domain, &state.config.admission_suffix));
    }

    if path.starts_with(MAPPINGS_API_PREFIX) {
        return Ok(control::handle_mappings_api(req, &state.store).await);
    }

    if hostname == state.config.debug_host || path.starts_with("/_debug") {
        return Ok(handle_debug(&req, &state).await);
    }

    // Browser noise: never worth a resolution.
    if path == "/favicon.ico" || path == "/robots.txt" {
        return Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(full_body(""))
            .expect("valid response builder"));
    }

    if let Some(rest) = path.strip_prefix("/_proxy/") {
        let Some((service, remaining)) = parse_proxy_path(rest) else {
            return Ok(json_error_response(
                GatewayErrorCode::BadRequest,
                "Invalid proxy path",
            ));
        };
        let key = format!("{hostname}:{service}");
        let related = RelatedRequest {
            origin_host: hostname.clone(),
            origin_mapping: state.store.get(&hostname),
            service,
        };
        return Ok(proxy_request(req, state, client_addr, key, Some(remaining), Some(related)).await);
    }

    Ok(proxy_request(req, state, client_addr, hostname, None, None).await)
}

/// The shared resolve → build → forward tail of both proxy paths.
async fn proxy_request(
    mut req: Request<Incoming>,
    state: Arc<ProxyState>,
    client_addr: SocketAddr,
    key: String,
    path_override: Option<String>,
    related: Option<RelatedRequest>,
) -> Response<ProxyBody> {
    let raw_query = req.uri().query().map(String::from);
    let force = has_query_flag(raw_query.as_deref(), "force");
    let prompt = query_param(raw_query.as_deref(), "prompt");

    // Rewrite the URI the upstream will see: reserved params stripped (all
    // other pairs byte-for-byte as received), path replaced for the
    // second-level prefix.
    let path = path_override.unwrap_or_else(|| req.uri().path().to_string());
    let forwarded_query = raw_query.as_deref().and_then(strip_reserved_query);
    let path_and_query = match &forwarded_query {
        Some(query) => format!("{path}?{query}"),
        None => path,
    };
    match path_and_query.parse() {
        Ok(uri) => *req.uri_mut() = uri,
        Err(e) => {
            return json_error_response(
                GatewayErrorCode::BadRequest,
                format!("invalid request target: {e}"),
            );
        }
    }

    let cached = if force { None } else { state.store.get(&key) };
    let mapping = match cached {
        Some(mapping) => mapping,
        None => match state.resolve(&key, force, prompt, related).await {
            Ok(mapping) => mapping,
            Err(e) => {
                error!(key, error = format!("{e:#}"), "resolution failed");
                return json_error_response(
                    GatewayErrorCode::ResolverFailed,
                    format!("Failed to resolve target for {key}: {e:#}"),
                );
            }
        },
    };

    // The live snapshot is only needed when a rebind can actually happen.
    let snapshot = if mapping.kind == TargetKind::Process && mapping.identifier.is_some() {
        match state.process_snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(key, error = %e, "process snapshot unavailable, skipping rebind");
                Vec::new()
            }
        }
    } else {
        Vec::new()
    };

    let (upstream_host, upstream_port) =
        match upstream::build_upstream(&mapping, &snapshot, &state.containers).await {
            Ok(addr) => addr,
            Err(e) => {
                error!(key, error = format!("{e:#}"), "failed to build upstream address");
                return json_error_response(
                    GatewayErrorCode::UpstreamUnreachable,
                    format!("Failed to build upstream for {key}: {e:#}"),
                );
            }
        };

    apply_forwarded_headers(&mut req, client_addr);
    debug!(key, upstream = %format!("{upstream_host}:{upstream_port}"), "proxying request");

    if upgrade_type(&req).as_deref() == Some("websocket") {
        return forward::bridge_websocket(req, &upstream_host, upstream_port).await;
    }

    match state
        .forwarder
        .forward_http(req, &upstream_host, upstream_port)
        .await
    {
        Ok(response) => response,
        Err(e) => {
            error!(key, error = format!("{e:#}"), "upstream request failed");
            json_error_response(
                GatewayErrorCode::UpstreamUnreachable,
                format!("Upstream {upstream_host}:{upstream_port} unreachable: {e:#}"),
            )
        }
    }
}

async fn handle_debug(req: &Request<Incoming>, state: &Arc<ProxyState>) -> Response<ProxyBody> {
    let processes = match state.process_snapshot().await {
        Ok(processes) => processes,
        Err(e) => {
            warn!(error = %e, "process discovery failed for debug view");
            Vec::new()
        }
    };
    let data = DebugData {
        model: state.resolver.model().to_string(),
        cache_file: state.config.cache_file.clone(),
        api_key_set: state.resolver.has_credentials(),
        processes,
        containers: state.container_snapshot().await,
        mappings: state.store.get_all(),
        logs: state.logs.entries(),
    };

    let wants_html = req
        .headers()
        .get(hyper::header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("text/html"))
        .unwrap_or(false);

    if wants_html {
        control::debug_html(&data)
    } else {
        control::debug_json(&data)
    }
}

fn admission_response(domain: &str, suffix: &str) -> Response<ProxyBody> {
    if domain.ends_with(suffix) {
        Response::builder()
            .status(StatusCode::OK)
            .body(full_body("OK"))
            .expect("valid response builder")
    } else {
        json_error_response(
            GatewayErrorCode::NotAllowed,
            format!("{domain} does not end with {suffix}"),
        )
    }
}

/// Overwrite forwarded headers; this proxy is the first trusted hop, so
/// client-provided values are never appended to.
fn apply_forwarded_headers(req: &mut Request<Incoming>, client_addr: SocketAddr) {
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let original_host = req.headers().get(hyper::header::HOST).cloned();
    let headers = req.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(host) = original_host {
        headers.insert(X_FORWARDED_HOST, host);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
}

fn extract_hostname<B>(req: &Request<B>) -> Option<String> {
    let host = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().authority().map(|a| a.as_str()))?;
    parse_host(host)
}

/// Strip port and brackets from a Host value and lowercase it. Accepts
/// IPv6 literals in bracket form, with or without a port.
pub(crate) fn parse_host(host: &str) -> Option<String> {
    if host.is_empty() || host.len() > MAX_HOSTNAME_LEN {
        return None;
    }

    if let Some(rest) = host.strip_prefix('[') {
        let end = rest.find(']')?;
        return Some(rest[..end].to_lowercase());
    }

    let hostname = match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        Some(_) => return None,
        None => host,
    };
    if hostname.is_empty() {
        return None;
    }

    // Alphanumerics, hyphen and dot only: keeps log lines and the mapping
    // file free of junk from hand-crafted requests.
    if !hostname
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
    {
        return None;
    }

    Some(hostname.to_lowercase())
}

/// `/_proxy/<service>/<rest?>` → (service, "/" + rest).
pub(crate) fn parse_proxy_path(rest: &str) -> Option<(String, String)> {
    let (service, remaining) = match rest.split_once('/') {
        Some((service, remaining)) => (service, format!("/{remaining}")),
        None => (rest, "/".to_string()),
    };
    if service.is_empty() {
        return None;
    }
    Some((service.to_string(), remaining))
}

/// Remove `force` and `prompt` pairs, preserving everything else in its
/// original order and exact textual form. Returns `None` when nothing
/// remains.
pub(crate) fn strip_reserved_query(query: &str) -> Option<String> {
    let kept: Vec<&str> = query
        .split('&')
        .filter(|pair| {
            let name = pair.split('=').next().unwrap_or(pair);
            name != "force" && name != "prompt"
        })
        .collect();
    if kept.is_empty() {
        None
    } else {
        Some(kept.join("&"))
    }
}

pub(crate) fn has_query_flag(query: Option<&str>, name: &str) -> bool {
    let Some(query) = query else { return false };
    query
        .split('&')
        .any(|pair| pair == name || pair.starts_with(&format!("{name}=")))
}

/// First value of a query parameter, form-decoded.
pub(crate) fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    let query = query?;
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        if key == name {
            Some(percent_decode(value))
        } else {
            None
        }
    })
}

/// Minimal application/x-www-form-urlencoded decoding: `+` to space and
/// `%XX` escapes; malformed escapes pass through literally.
pub(crate) fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len()
                && bytes[i + 1].is_ascii_hexdigit()
                && bytes[i + 2].is_ascii_hexdigit() =>
            {
                let hi = (bytes[i + 1] as char).to_digit(16).expect("checked hexdigit");
                let lo = (bytes[i + 2] as char).to_digit(16).expect("checked hexdigit");
                out.push((hi * 16 + lo) as u8);
                i += 3;
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn upgrade_type<B>(req: &Request<B>) -> Option<String> {
    let wants_upgrade = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);
    if !wants_upgrade {
        return None;
    }
    req.headers()
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host() {
        assert_eq!(parse_host("myapp.localhost"), Some("myapp.localhost".to_string()));
        assert_eq!(parse_host("MyApp.Localhost:8080"), Some("myapp.localhost".to_string()));
        assert_eq!(parse_host("[::1]:8080"), Some("::1".to_string()));
        assert_eq!(parse_host("[2001:db8::1]"), Some("2001:db8::1".to_string()));
        assert_eq!(parse_host(""), None);
        assert_eq!(parse_host("bad host!"), None);
        assert_eq!(parse_host(&"a".repeat(300)), None);
    }

    #[test]
    fn test_parse_proxy_path() {
        assert_eq!(
            parse_proxy_path("api/users"),
            Some(("api".to_string(), "/users".to_string()))
        );
        assert_eq!(
            parse_proxy_path("api/users/42/edit"),
            Some(("api".to_string(), "/users/42/edit".to_string()))
        );
        assert_eq!(parse_proxy_path("api"), Some(("api".to_string(), "/".to_string())));
        assert_eq!(parse_proxy_path("api/"), Some(("api".to_string(), "/".to_string())));
        assert_eq!(parse_proxy_path(""), None);
    }

    #[test]
    fn test_strip_reserved_query_preserves_order_and_form() {
        assert_eq!(
            strip_reserved_query("b=2&force&a=%201&prompt=use+docker"),
            Some("b=2&a=%201".to_string())
        );
        assert_eq!(strip_reserved_query("force&prompt=x"), None);
        assert_eq!(strip_reserved_query("force=1"), None);
        assert_eq!(
            strip_reserved_query("forceful=1&promptly=2"),
            Some("forceful=1&promptly=2".to_string())
        );
        assert_eq!(strip_reserved_query("x=1&x=2"), Some("x=1&x=2".to_string()));
    }

    #[test]
    fn test_has_query_flag() {
        assert!(has_query_flag(Some("force"), "force"));
        assert!(has_query_flag(Some("a=1&force"), "force"));
        assert!(has_query_flag(Some("force=true"), "force"));
        assert!(!has_query_flag(Some("forceful=1"), "force"));
        assert!(!has_query_flag(None, "force"));
    }

    #[test]
    fn test_query_param_decodes() {
        assert_eq!(
            query_param(Some("prompt=use+docker"), "prompt"),
            Some("use docker".to_string())
        );
        assert_eq!(
            query_param(Some("a=1&prompt=the%20api%3A8080"), "prompt"),
            Some("the api:8080".to_string())
        );
        assert_eq!(query_param(Some("prompt"), "prompt"), None);
        assert_eq!(query_param(Some("a=1"), "prompt"), None);
    }

    #[test]
    fn test_percent_decode_malformed_escapes() {
        assert_eq!(percent_decode("100%"), "100%");
        assert_eq!(percent_decode("a%2"), "a%2");
        assert_eq!(percent_decode("a%zz"), "a%zz");
        assert_eq!(percent_decode("a%3Ab"), "a:b");
    }

    #[test]
    fn test_admission_response() {
        assert_eq!(
            admission_response("myapp.localhost", ".localhost").status(),
            StatusCode::OK
        );
        assert_eq!(
            admission_response("example.com", ".localhost").status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            admission_response("sneaky.localhost.evil.com", ".localhost").status(),
            StatusCode::FORBIDDEN
        );
    }
}
