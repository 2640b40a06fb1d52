//! Serve - An HTTP/HTTPS front door
//!
//! Each request is either:
//! - Served from a local static directory
//! - Forwarded to a remote origin chosen by the first path segment
//!
//! Forwarded requests are rewritten by a fixed rule: with an explicit target
//! domain the path is kept as is, otherwise the prefix doubles as the domain
//! and is stripped from the path.

pub mod classifier;
pub mod config;
pub mod forward;
pub mod proxy;
pub mod registry;
pub mod rewrite;
pub mod static_files;
pub mod tls;

pub use classifier::{classify, Route};
pub use config::{Config, ConfigError, FileConfig, ProxyRule};
pub use forward::{Forwarder, ProxyError};
pub use proxy::{Dispatcher, ProxyServer};
pub use registry::{PrefixRegistry, PrefixTarget};
pub use rewrite::{rewrite, RewriteResult, Scheme};
pub use static_files::StaticFiles;
pub use tls::{build_client_tls_config, build_server_tls_config, OriginConnector, OutboundTls};
