//! Static file serving for requests that match no proxy prefix

use crate::proxy::{error_response, BoxError, ProxyBody};
use http_body_util::BodyExt;
use hyper::{Request, Response, StatusCode};
use std::path::Path;
use tower::ServiceExt;
use tower_http::services::ServeDir;
use tracing::{debug, warn};

/// Serves files below a root directory
#[derive(Clone)]
pub struct StaticFiles {
    serve_dir: ServeDir,
}

impl StaticFiles {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            serve_dir: ServeDir::new(root),
        }
    }

    /// Serve the file named by the request path
    pub async fn serve<B>(&self, req: Request<B>) -> Response<ProxyBody>
    where
        B: Send + 'static,
    {
        let path = req.uri().path();
        if is_traversal(path) {
            warn!("Invalid path detected: {}", path);
            return error_response(StatusCode::BAD_REQUEST, "Invalid path");
        }

        debug!("Serving static file: {}", path);

        match self.serve_dir.clone().oneshot(req).await {
            Ok(response) => response.map(|body| body.map_err(BoxError::from).boxed_unsync()),
            Err(never) => match never {},
        }
    }
}

/// Whether any segment of the raw path is `..`
fn is_traversal(path: &str) -> bool {
    path.split(['/', '\\']).any(|segment| segment == "..")
}
