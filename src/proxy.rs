//! Proxy server implementation
//! Accepts HTTP/HTTPS connections and dispatches each request to an origin or the static tree

use crate::classifier::{classify, Route};
use crate::config::Config;
use crate::forward::{Forwarder, ProxyError};
use crate::registry::PrefixRegistry;
use crate::rewrite::rewrite;
use crate::static_files::StaticFiles;
use crate::tls::{self, OutboundTls};
use anyhow::{anyhow, Result};
use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Body, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use openssl::ssl::SslContext;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type of every response this server produces
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(15);

/// Per-request decision between the proxy path and the static tree
pub struct Dispatcher {
    registry: Arc<PrefixRegistry>,
    forwarder: Forwarder,
    static_files: StaticFiles,
}

impl Dispatcher {
    pub fn new(registry: Arc<PrefixRegistry>, forwarder: Forwarder, static_files: StaticFiles) -> Self {
        Self {
            registry,
            forwarder,
            static_files,
        }
    }

    /// Handle one request; failures become error responses
    pub async fn handle<B>(&self, req: Request<B>, remote_addr: SocketAddr) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let path = req.uri().path().to_string();

        let prefix = match classify(&self.registry, &path) {
            Route::Static => return self.static_files.serve(req).await,
            Route::Proxy(prefix) => prefix,
        };

        match self.proxy(req, prefix, remote_addr).await {
            Ok(response) => response,
            Err(e @ ProxyError::NoRoute(_)) => {
                debug!("{}", e);
                error_response(e.status(), &e.client_message())
            }
            Err(e) => {
                error!("Proxy error for {}: {}", path, e);
                error_response(e.status(), &e.client_message())
            }
        }
    }

    async fn proxy<B>(
        &self,
        req: Request<B>,
        prefix: &str,
        remote_addr: SocketAddr,
    ) -> Result<Response<ProxyBody>, ProxyError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let target = self
            .registry
            .lookup(prefix)
            .ok_or_else(|| ProxyError::NoRoute(prefix.to_string()))?;

        let rewrite = rewrite(target, req.uri().path(), req.uri().query().unwrap_or(""));

        info!(
            "Proxying request: {} {} -> {}",
            req.method(),
            req.uri(),
            rewrite.target_url()
        );
        debug!(
            "Path prefix: {}, target domain: {}, from {}",
            prefix, rewrite.host, remote_addr
        );

        self.forwarder
            .forward(req, target, &rewrite, remote_addr)
            .await
    }
}

/// Request activity on one inbound connection
struct ConnectionActivity {
    opened: Instant,
    in_flight: AtomicUsize,
    /// Milliseconds after `opened` at which the last request finished
    last_done_ms: AtomicU64,
}

impl ConnectionActivity {
    fn new() -> Self {
        Self {
            opened: Instant::now(),
            in_flight: AtomicUsize::new(0),
            last_done_ms: AtomicU64::new(0),
        }
    }

    fn begin(self: &Arc<Self>) -> RequestGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        RequestGuard(self.clone())
    }

    /// When the connection becomes idle for `limit`, if nothing happens first
    fn idle_deadline(&self, limit: Duration) -> Instant {
        if self.in_flight.load(Ordering::SeqCst) > 0 {
            return Instant::now() + limit;
        }
        let last = Duration::from_millis(self.last_done_ms.load(Ordering::SeqCst));
        self.opened + last + limit
    }

    fn is_idle(&self, limit: Duration) -> bool {
        self.in_flight.load(Ordering::SeqCst) == 0 && Instant::now() >= self.idle_deadline(limit)
    }
}

struct RequestGuard(Arc<ConnectionActivity>);

impl Drop for RequestGuard {
    fn drop(&mut self) {
        let elapsed = self.0.opened.elapsed().as_millis() as u64;
        self.0.last_done_ms.store(elapsed, Ordering::SeqCst);
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Proxy server
pub struct ProxyServer {
    addr: String,
    shutdown_grace: Duration,
    handshake_timeout: Duration,
    idle_timeout: Duration,
    tls: Option<SslContext>,
    dispatcher: Arc<Dispatcher>,
}

impl ProxyServer {
    /// Create a server from a validated configuration
    pub fn new(config: &Config) -> Result<Self> {
        let tls = match (&config.cert_file, &config.key_file) {
            (Some(cert), Some(key)) => Some(tls::load_server_tls_config(cert, key)?),
            _ => None,
        };

        for target in config.registry.iter().filter(|t| t.skips_verification()) {
            warn!(
                "Certificate verification disabled for /{} -> {}",
                target.prefix,
                target.effective_domain()
            );
        }

        let forwarder = Forwarder::new(OutboundTls::new()?, config.upstream_timeout);
        let dispatcher = Dispatcher::new(
            Arc::new(config.registry.clone()),
            forwarder,
            StaticFiles::new(&config.static_dir),
        );

        Ok(Self {
            addr: config.bind_addr(),
            shutdown_grace: config.shutdown_grace,
            handshake_timeout: config.handshake_timeout,
            idle_timeout: config.idle_timeout,
            tls,
            dispatcher: Arc::new(dispatcher),
        })
    }

    /// Configured listen address
    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_https(&self) -> bool {
        self.tls.is_some()
    }

    /// Bind the configured address and serve until `shutdown` resolves
    pub async fn run(self: Arc<Self>, shutdown: impl Future<Output = ()>) -> Result<()> {
        let listener = TcpListener::bind(&self.addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` resolves.
    ///
    /// Open connections are then asked to finish and given the grace period
    /// before this returns.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> Result<()> {
        let local_addr = listener.local_addr()?;
        if self.is_https() {
            info!("HTTPS server listening on {}", local_addr);
        } else {
            info!("HTTP server listening on {}", local_addr);
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let (done_tx, mut done_rx) = mpsc::channel::<()>(1);
        tokio::pin!(shutdown);

        loop {
            let (stream, remote_addr) = tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                },
            };

            let server = self.clone();
            let stop = stop_rx.clone();
            let done = done_tx.clone();

            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, remote_addr, stop).await {
                    debug!("Connection error from {}: {}", remote_addr, e);
                }
                drop(done);
            });
        }

        info!("Shutting down server...");
        drop(listener);
        let _ = stop_tx.send(true);
        drop(done_tx);

        if tokio::time::timeout(self.shutdown_grace, done_rx.recv())
            .await
            .is_err()
        {
            warn!(
                "Server forced to shutdown: connections still open after {:?}",
                self.shutdown_grace
            );
        }

        Ok(())
    }

    /// Handle a single inbound connection, terminating TLS when configured
    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        remote_addr: SocketAddr,
        mut stop: watch::Receiver<bool>,
    ) -> Result<()> {
        let Some(context) = &self.tls else {
            return self.serve_connection(stream, remote_addr, stop).await;
        };

        let handshake = tokio::time::timeout(self.handshake_timeout, tls::accept(context, stream));
        let stream = tokio::select! {
            accepted = handshake => match accepted {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    debug!("TLS handshake failed from {}: {}", remote_addr, e);
                    return Ok(());
                }
                Err(_) => {
                    debug!("TLS handshake timed out from {}", remote_addr);
                    return Ok(());
                }
            },
            _ = stop.changed() => return Ok(()),
        };

        self.serve_connection(stream, remote_addr, stop).await
    }

    async fn serve_connection<S>(
        &self,
        stream: S,
        remote_addr: SocketAddr,
        mut stop: watch::Receiver<bool>,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let activity = Arc::new(ConnectionActivity::new());
        let dispatcher = self.dispatcher.clone();
        let service = service_fn({
            let activity = activity.clone();
            move |req: Request<Incoming>| {
                let dispatcher = dispatcher.clone();
                let guard = activity.begin();
                async move {
                    let response = dispatcher.handle(req, remote_addr).await;
                    drop(guard);
                    Ok::<_, Infallible>(response)
                }
            }
        });

        let conn = http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(false)
            .timer(TokioTimer::new())
            .header_read_timeout(HEADER_READ_TIMEOUT)
            .serve_connection(TokioIo::new(stream), service)
            .with_upgrades();
        tokio::pin!(conn);

        let result = loop {
            let idle_deadline = activity.idle_deadline(self.idle_timeout);
            tokio::select! {
                result = conn.as_mut() => break result,
                _ = stop.changed() => {
                    conn.as_mut().graceful_shutdown();
                    break conn.await;
                }
                _ = tokio::time::sleep_until(idle_deadline) => {
                    if activity.is_idle(self.idle_timeout) {
                        debug!("Closing idle connection from {}", remote_addr);
                        conn.as_mut().graceful_shutdown();
                        break conn.await;
                    }
                }
            }
        };

        result.map_err(|e| anyhow!("HTTP service error: {}", e))
    }
}

/// Create error response
pub fn error_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(message.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Create full body
pub fn full_body(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Create empty body
pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}
