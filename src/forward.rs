//! Outbound forwarding
//! Opens the origin connection, replays the rewritten request and streams the answer back

use crate::proxy::{empty_body, BoxError, ProxyBody};
use crate::registry::PrefixTarget;
use crate::rewrite::RewriteResult;
use crate::tls::OutboundTls;
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::Body;
use hyper::header::{HeaderName, HeaderValue, CONNECTION, HOST, UPGRADE};
use hyper::upgrade::OnUpgrade;
use hyper::{HeaderMap, Request, Response, StatusCode, Uri, Version};
use hyper_util::rt::TokioIo;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Headers that describe a single transport hop and are never forwarded
const HOP_HEADERS: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Request-scoped forwarding failures
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("No proxy configuration found for path prefix: {0}")]
    NoRoute(String),

    #[error("invalid target url: {0}")]
    InvalidTarget(String),

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TLS handshake with {host} failed: {source}")]
    Handshake {
        host: String,
        #[source]
        source: openssl::ssl::Error,
    },

    #[error("upstream request failed: {0}")]
    Upstream(#[from] hyper::Error),

    #[error("upstream {0} timed out")]
    Timeout(String),

    #[error("upstream switched protocols without an upgrade request")]
    UnexpectedUpgrade,
}

impl ProxyError {
    /// Status code reported to the client
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::NoRoute(_) => StatusCode::NOT_FOUND,
            ProxyError::InvalidTarget(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Connect { .. }
            | ProxyError::Handshake { .. }
            | ProxyError::Upstream(_)
            | ProxyError::UnexpectedUpgrade => StatusCode::BAD_GATEWAY,
        }
    }

    /// Body text reported to the client
    pub fn client_message(&self) -> String {
        match self {
            ProxyError::NoRoute(_) => self.to_string(),
            ProxyError::InvalidTarget(_) => "Internal Server Error".to_string(),
            ProxyError::Timeout(_) => "Gateway Timeout".to_string(),
            _ => "Bad Gateway".to_string(),
        }
    }
}

/// Sends rewritten requests to origins, one connection per request
#[derive(Clone)]
pub struct Forwarder {
    tls: OutboundTls,
    timeout: Duration,
}

impl Forwarder {
    pub fn new(tls: OutboundTls, timeout: Duration) -> Self {
        Self { tls, timeout }
    }

    /// Forward `req` to the origin described by `rewrite`.
    ///
    /// Nothing is retried; a failed attempt is returned to the caller.
    pub async fn forward<B>(
        &self,
        mut req: Request<B>,
        target: &PrefixTarget,
        rewrite: &RewriteResult,
        remote_addr: SocketAddr,
    ) -> Result<Response<ProxyBody>, ProxyError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let uri = rewrite
            .target_uri()
            .map_err(|e| ProxyError::InvalidTarget(format!("{}: {}", rewrite.target_url(), e)))?;
        let (host, port) = connect_target(&uri, rewrite)?;

        let client_upgrade = if is_upgrade_request(req.headers()) {
            Some(hyper::upgrade::on(&mut req))
        } else {
            None
        };

        let outbound = build_outbound_request(req, rewrite, remote_addr)?;
        let client_tls = self.tls.for_target(target);

        let response = tokio::time::timeout(self.timeout, async {
            let tcp = TcpStream::connect((host.as_str(), port))
                .await
                .map_err(|source| ProxyError::Connect {
                    addr: format!("{}:{}", host, port),
                    source,
                })?;

            match client_tls {
                None => send_request(tcp, outbound).await,
                Some(connector) => {
                    let tls = connector.connect(&host, tcp).await.map_err(|source| {
                        ProxyError::Handshake {
                            host: host.clone(),
                            source,
                        }
                    })?;
                    send_request(tls, outbound).await
                }
            }
        })
        .await
        .map_err(|_| ProxyError::Timeout(rewrite.host.clone()))??;

        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            return match client_upgrade {
                Some(client_upgrade) => Ok(tunnel(client_upgrade, response)),
                None => Err(ProxyError::UnexpectedUpgrade),
            };
        }

        let (mut parts, body) = response.into_parts();
        remove_hop_headers(&mut parts.headers);

        Ok(Response::from_parts(
            parts,
            body.map_err(BoxError::from).boxed_unsync(),
        ))
    }
}

/// Host (without IPv6 brackets) and port to dial for `uri`
fn connect_target(uri: &Uri, rewrite: &RewriteResult) -> Result<(String, u16), ProxyError> {
    let host = uri
        .host()
        .map(|h| h.trim_start_matches('[').trim_end_matches(']'))
        .filter(|h| !h.is_empty())
        .ok_or_else(|| ProxyError::InvalidTarget(rewrite.target_url()))?;
    let port = uri.port_u16().unwrap_or(rewrite.scheme.default_port());
    Ok((host.to_string(), port))
}

async fn send_request<S, B>(stream: S, req: Request<B>) -> Result<Response<hyper::body::Incoming>, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;

    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            debug!("Upstream connection error: {}", e);
        }
    });

    Ok(sender.send_request(req).await?)
}

/// Turn the inbound request into the origin-form request sent upstream
fn build_outbound_request<B>(
    req: Request<B>,
    rewrite: &RewriteResult,
    remote_addr: SocketAddr,
) -> Result<Request<B>, ProxyError> {
    let (mut parts, body) = req.into_parts();

    let upgrade = if is_upgrade_request(&parts.headers) {
        parts.headers.get(UPGRADE).cloned()
    } else {
        None
    };

    remove_hop_headers(&mut parts.headers);

    if let Some(protocol) = upgrade {
        parts
            .headers
            .insert(CONNECTION, HeaderValue::from_static("upgrade"));
        parts.headers.insert(UPGRADE, protocol);
    }

    parts.uri = rewrite
        .path_and_query()
        .parse()
        .map_err(|e| ProxyError::InvalidTarget(format!("{}: {}", rewrite.target_url(), e)))?;
    parts.version = Version::HTTP_11;

    let host = HeaderValue::from_str(&rewrite.host)
        .map_err(|e| ProxyError::InvalidTarget(format!("{}: {}", rewrite.host, e)))?;
    parts.headers.insert(HOST, host);

    append_forwarded_for(&mut parts.headers, remote_addr.ip());

    Ok(Request::from_parts(parts, body))
}

/// Whether the request asks to switch protocols on this connection
fn is_upgrade_request(headers: &HeaderMap) -> bool {
    headers.contains_key(UPGRADE)
        && headers
            .get_all(CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
}

/// Strip hop-by-hop headers, including any named by `Connection`
pub fn remove_hop_headers(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }

    for name in HOP_HEADERS {
        headers.remove(*name);
    }
}

/// Append the client IP, folding any earlier `X-Forwarded-For` lines into one
fn append_forwarded_for(headers: &mut HeaderMap, ip: IpAddr) {
    let prior: Vec<&str> = headers
        .get_all(&X_FORWARDED_FOR)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();

    let value = if prior.is_empty() {
        ip.to_string()
    } else {
        format!("{}, {}", prior.join(", "), ip)
    };

    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

/// Hand the 101 back to the client and splice both upgraded connections
fn tunnel(client: OnUpgrade, mut response: Response<hyper::body::Incoming>) -> Response<ProxyBody> {
    let upstream = hyper::upgrade::on(&mut response);

    tokio::spawn(async move {
        match tokio::try_join!(client, upstream) {
            Ok((client, upstream)) => {
                let mut client = TokioIo::new(client);
                let mut upstream = TokioIo::new(upstream);
                match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
                    Ok((sent, received)) => {
                        debug!("Upgraded connection closed: {} bytes up, {} bytes down", sent, received)
                    }
                    Err(e) => debug!("Upgraded connection error: {}", e),
                }
            }
            Err(e) => debug!("Protocol upgrade failed: {}", e),
        }
    });

    let (parts, _) = response.into_parts();
    Response::from_parts(parts, empty_body())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rewrite::Scheme;
    use http_body_util::Empty;

    fn rewrite_result(host: &str, path: &str, query: &str) -> RewriteResult {
        RewriteResult {
            scheme: Scheme::Http,
            host: host.to_string(),
            path: path.to_string(),
            query: query.to_string(),
        }
    }

    fn remote() -> SocketAddr {
        "10.0.0.7:51000".parse().unwrap()
    }

    #[test]
    fn test_outbound_request_overrides_host_and_target() {
        let req = Request::builder()
            .method("POST")
            .uri("/api/users?id=1")
            .header(HOST, "localhost:8080")
            .header("x-custom", "kept")
            .body(Empty::<Bytes>::new())
            .unwrap();

        let outbound =
            build_outbound_request(req, &rewrite_result("api.example.com", "/api/users", "id=1"), remote())
                .unwrap();

        assert_eq!(outbound.method(), "POST");
        assert_eq!(outbound.uri(), "/api/users?id=1");
        assert_eq!(outbound.headers()[HOST], "api.example.com");
        assert_eq!(outbound.headers()["x-custom"], "kept");
        assert_eq!(outbound.headers()[&X_FORWARDED_FOR], "10.0.0.7");
    }

    #[test]
    fn test_outbound_request_strips_hop_headers() {
        let req = Request::builder()
            .uri("/x")
            .header(CONNECTION, "keep-alive, x-hop")
            .header("keep-alive", "timeout=5")
            .header("x-hop", "1")
            .header("proxy-authorization", "Basic Zm9vOmJhcg==")
            .header("te", "trailers")
            .header("x-forwarded-for", "192.0.2.1")
            .body(Empty::<Bytes>::new())
            .unwrap();

        let outbound = build_outbound_request(req, &rewrite_result("origin", "/x", ""), remote()).unwrap();
        let headers = outbound.headers();

        assert!(!headers.contains_key(CONNECTION));
        assert!(!headers.contains_key("keep-alive"));
        assert!(!headers.contains_key("x-hop"));
        assert!(!headers.contains_key("proxy-authorization"));
        assert!(!headers.contains_key("te"));
        assert_eq!(headers[&X_FORWARDED_FOR], "192.0.2.1, 10.0.0.7");
        assert_eq!(outbound.uri(), "/x");
    }

    #[test]
    fn test_forwarded_for_joins_every_prior_line() {
        let req = Request::builder()
            .uri("/x")
            .header("x-forwarded-for", "192.0.2.1")
            .header("x-forwarded-for", "198.51.100.2, 203.0.113.3")
            .body(Empty::<Bytes>::new())
            .unwrap();

        let outbound = build_outbound_request(req, &rewrite_result("origin", "/x", ""), remote()).unwrap();
        let values: Vec<_> = outbound.headers().get_all(&X_FORWARDED_FOR).iter().collect();

        assert_eq!(values.len(), 1);
        assert_eq!(values[0], "192.0.2.1, 198.51.100.2, 203.0.113.3, 10.0.0.7");
    }

    #[test]
    fn test_outbound_request_keeps_upgrade() {
        let req = Request::builder()
            .uri("/ws")
            .header(CONNECTION, "Upgrade")
            .header(UPGRADE, "websocket")
            .body(Empty::<Bytes>::new())
            .unwrap();

        assert!(is_upgrade_request(req.headers()));
        let outbound = build_outbound_request(req, &rewrite_result("origin", "/ws", ""), remote()).unwrap();

        assert_eq!(outbound.headers()[CONNECTION], "upgrade");
        assert_eq!(outbound.headers()[UPGRADE], "websocket");
    }

    #[test]
    fn test_upgrade_requires_connection_token() {
        let mut headers = HeaderMap::new();
        headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
        assert!(!is_upgrade_request(&headers));

        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, upgrade"));
        assert!(is_upgrade_request(&headers));
    }

    #[test]
    fn test_connect_target() {
        let rewrite = rewrite_result("api.example.com", "/", "");
        let uri: Uri = "http://api.example.com/".parse().unwrap();
        assert_eq!(
            connect_target(&uri, &rewrite).unwrap(),
            ("api.example.com".to_string(), 80)
        );

        let rewrite = RewriteResult {
            scheme: Scheme::Https,
            ..rewrite_result("[::1]:8443", "/", "")
        };
        let uri = rewrite.target_uri().unwrap();
        assert_eq!(connect_target(&uri, &rewrite).unwrap(), ("::1".to_string(), 8443));
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(ProxyError::NoRoute("api".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ProxyError::InvalidTarget("x".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(ProxyError::Timeout("x".into()).status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(ProxyError::UnexpectedUpgrade.status(), StatusCode::BAD_GATEWAY);

        let connect = ProxyError::Connect {
            addr: "127.0.0.1:1".into(),
            source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
        };
        assert_eq!(connect.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(connect.client_message(), "Bad Gateway");
        assert_eq!(
            ProxyError::NoRoute("api".into()).client_message(),
            "No proxy configuration found for path prefix: api"
        );
    }
}
