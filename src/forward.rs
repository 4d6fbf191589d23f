//! Upstream forwarding: pooled HTTP and WebSocket bridging
//!
//! HTTP requests are re-issued through a pooled client with the inbound
//! body streamed straight through. WebSocket upgrades are terminated and
//! re-originated: the upstream handshake must succeed before the client
//! ever sees a 101, then frames are relayed verbatim in both directions.

use crate::error::{full_body, json_error_response, GatewayErrorCode, ProxyBody};
use anyhow::{Context as _, Result};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{self, HeaderMap};
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message, Role};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, warn};

/// Pooled HTTP client for upstream requests.
pub struct Forwarder {
    client: Client<HttpConnector, Incoming>,
}

impl Default for Forwarder {
    fn default() -> Self {
        Self::new()
    }
}

impl Forwarder {
    pub fn new() -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(10)
            .build(connector);

        Self { client }
    }

    /// Forward the request to `host:port`, streaming both bodies.
    ///
    /// Redirects are passed through untouched; the pooled client never
    /// follows them. Transport failures bubble up for the dispatcher to
    /// turn into 502.
    pub async fn forward_http(
        &self,
        req: Request<Incoming>,
        host: &str,
        port: u16,
    ) -> Result<Response<ProxyBody>> {
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri = upstream_uri(host, port, path_and_query);

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder().method(parts.method).uri(&uri);

        let mut headers = parts.headers;
        sanitize_request_headers(&mut headers);
        if let Some(out_headers) = builder.headers_mut() {
            *out_headers = headers;
        }

        let upstream_req = builder.body(body).context("building upstream request")?;

        let response = self
            .client
            .request(upstream_req)
            .await
            .with_context(|| format!("upstream request to {uri} failed"))?;

        let (mut parts, body) = response.into_parts();
        sanitize_response_headers(&mut parts.headers);
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

/// Headers never forwarded upstream. `Host` is rewritten by the client
/// from the URI; `Accept-Encoding` is dropped so the upstream never sends
/// a compressed body the proxy would then mislabel.
pub fn sanitize_request_headers(headers: &mut HeaderMap) {
    headers.remove(header::HOST);
    headers.remove(header::CONNECTION);
    headers.remove(header::ACCEPT_ENCODING);
}

/// Headers stripped from the upstream response: the client library may
/// already have transformed the body, so these would misdescribe what the
/// proxy actually sends.
pub fn sanitize_response_headers(headers: &mut HeaderMap) {
    headers.remove(header::CONTENT_ENCODING);
    headers.remove(header::CONTENT_LENGTH);
}

fn upstream_uri(host: &str, port: u16, path_and_query: &str) -> String {
    format!("http://{host}:{port}{path_and_query}")
}

fn ws_uri(host: &str, port: u16, path_and_query: &str) -> String {
    format!("ws://{host}:{port}{path_and_query}")
}

/// Terminate an inbound WebSocket upgrade and bridge it to the upstream.
///
/// The inbound 101 is only sent after the upstream handshake succeeds, so
/// a dead upstream surfaces as a plain 502 instead of a dropped socket.
pub async fn bridge_websocket(req: Request<Incoming>, host: &str, port: u16) -> Response<ProxyBody> {
    let Some(client_key) = req
        .headers()
        .get(header::SEC_WEBSOCKET_KEY)
        .map(|k| k.as_bytes().to_vec())
    else {
        return json_error_response(
            GatewayErrorCode::BadRequest,
            "upgrade request without Sec-WebSocket-Key",
        );
    };

    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = ws_uri(host, port, path_and_query);

    let mut upstream_req = match url.clone().into_client_request() {
        Ok(r) => r,
        Err(e) => {
            return json_error_response(
                GatewayErrorCode::UpstreamUnreachable,
                format!("invalid upstream WebSocket URL {url}: {e}"),
            );
        }
    };
    if let Some(protocols) = req.headers().get(header::SEC_WEBSOCKET_PROTOCOL) {
        upstream_req
            .headers_mut()
            .insert(header::SEC_WEBSOCKET_PROTOCOL, protocols.clone());
    }

    let (upstream_ws, upstream_resp) = match tokio_tungstenite::connect_async(upstream_req).await {
        Ok(ok) => ok,
        Err(e) => {
            warn!(url, error = %e, "upstream WebSocket handshake failed");
            return json_error_response(
                GatewayErrorCode::UpstreamUnreachable,
                format!("WebSocket handshake with {url} failed: {e}"),
            );
        }
    };
    debug!(url, "upstream WebSocket established");

    let mut response = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::UPGRADE, "websocket")
        .header(header::CONNECTION, "Upgrade")
        .header(
            header::SEC_WEBSOCKET_ACCEPT,
            derive_accept_key(&client_key),
        );
    if let Some(protocol) = upstream_resp.headers().get(header::SEC_WEBSOCKET_PROTOCOL) {
        response = response.header(header::SEC_WEBSOCKET_PROTOCOL, protocol.clone());
    }
    let response = response
        .body(full_body(""))
        .expect("valid response builder");

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let io = TokioIo::new(upgraded);
                let client_ws =
                    WebSocketStream::from_raw_socket(io, Role::Server, None).await;
                relay(client_ws, upstream_ws).await;
            }
            Err(e) => {
                error!(error = %e, "client upgrade failed after upstream handshake");
            }
        }
    });

    response
}

/// Relay frames until either side closes. A close from one side is
/// forwarded with its code and reason; a transport error closes the other
/// side with 1011.
async fn relay<C, U>(client: WebSocketStream<C>, upstream: WebSocketStream<U>)
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    tokio::join!(
        pump(&mut client_rx, &mut upstream_tx, "client->upstream"),
        pump(&mut upstream_rx, &mut client_tx, "upstream->client"),
    );
    debug!("WebSocket bridge closed");
}

async fn pump<R, W>(read: &mut R, write: &mut W, direction: &str)
where
    R: Stream<Item = tokio_tungstenite::tungstenite::Result<Message>> + Unpin,
    W: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    loop {
        match read.next().await {
            Some(Ok(Message::Close(frame))) => {
                debug!(direction, code = ?frame.as_ref().map(|f| f.code), "forwarding close");
                let _ = write.send(Message::Close(frame)).await;
                break;
            }
            Some(Ok(Message::Frame(_))) => {
                // Raw frames never surface outside the codec.
            }
            Some(Ok(message)) => {
                if let Err(e) = write.send(message).await {
                    debug!(direction, error = %e, "write side gone");
                    break;
                }
            }
            Some(Err(e)) => {
                debug!(direction, error = %e, "abnormal termination");
                let _ = write
                    .send(Message::Close(Some(CloseFrame {
                        code: CloseCode::Error,
                        reason: "proxy transport error".into(),
                    })))
                    .await;
                break;
            }
            None => {
                let _ = write.close().await;
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;

    #[test]
    fn test_request_header_hygiene() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("app.localhost"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(
            header::ACCEPT_ENCODING,
            HeaderValue::from_static("gzip, br"),
        );
        headers.insert(header::COOKIE, HeaderValue::from_static("session=abc"));
        headers.insert(header::ACCEPT, HeaderValue::from_static("text/html"));

        sanitize_request_headers(&mut headers);

        assert!(headers.get(header::HOST).is_none());
        assert!(headers.get(header::CONNECTION).is_none());
        assert!(headers.get(header::ACCEPT_ENCODING).is_none());
        assert_eq!(headers.get(header::COOKIE).unwrap(), "session=abc");
        assert_eq!(headers.get(header::ACCEPT).unwrap(), "text/html");
    }

    #[test]
    fn test_response_header_hygiene() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("1234"));
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        headers.insert(header::LOCATION, HeaderValue::from_static("/next"));

        sanitize_response_headers(&mut headers);

        assert!(headers.get(header::CONTENT_ENCODING).is_none());
        assert!(headers.get(header::CONTENT_LENGTH).is_none());
        assert_eq!(
            headers.get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
        // Redirects pass through untouched.
        assert_eq!(headers.get(header::LOCATION).unwrap(), "/next");
    }

    #[test]
    fn test_upstream_uris() {
        assert_eq!(
            upstream_uri("127.0.0.1", 3000, "/api/users?x=1"),
            "http://127.0.0.1:3000/api/users?x=1"
        );
        assert_eq!(
            ws_uri("172.18.0.3", 7000, "/stream"),
            "ws://172.18.0.3:7000/stream"
        );
    }
}
