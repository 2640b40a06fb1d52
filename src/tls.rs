//! TLS policy for the inbound listener and outbound origin connections
//!
//! Both directions accept TLS 1.0 through TLS 1.3 and share one ordered
//! cipher list. The legacy CBC/3DES suites come first so that old clients
//! (Android 4 era) can still connect; the AEAD suites follow. The listener
//! picks suites by its own order.

use openssl::error::ErrorStack;
use openssl::pkey::{PKey, PKeyRef, Private};
use openssl::ssl::{
    self, AlpnError, SslConnector, SslContext, SslContextBuilder, SslMethod, SslOptions,
    SslVerifyMode, SslVersion,
};
use openssl::x509::X509;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_openssl::SslStream;
use tracing::debug;

use crate::registry::PrefixTarget;

pub const MIN_PROTOCOL_VERSION: SslVersion = SslVersion::TLS1;
pub const MAX_PROTOCOL_VERSION: SslVersion = SslVersion::TLS1_3;

/// TLS 1.0-1.2 suites in preference order (OpenSSL names)
pub const CIPHER_SUITES: &[&str] = &[
    // Legacy tier
    "AES128-SHA",
    "AES256-SHA",
    "DES-CBC3-SHA",
    "ECDHE-RSA-AES128-SHA",
    "ECDHE-RSA-AES256-SHA",
    "ECDHE-ECDSA-AES128-SHA",
    "ECDHE-ECDSA-AES256-SHA",
    "ECDHE-RSA-RC4-SHA",
    // Modern tier
    "ECDHE-RSA-AES128-GCM-SHA256",
    "ECDHE-RSA-AES256-GCM-SHA384",
    "ECDHE-RSA-CHACHA20-POLY1305",
    "ECDHE-ECDSA-AES128-GCM-SHA256",
    "ECDHE-ECDSA-AES256-GCM-SHA384",
];

/// TLS 1.3 suites, configured separately by OpenSSL
pub const TLS13_CIPHER_SUITES: &str =
    "TLS_AES_128_GCM_SHA256:TLS_AES_256_GCM_SHA384:TLS_CHACHA20_POLY1305_SHA256";

const ALPN_HTTP1: &[u8] = b"\x08http/1.1";

/// Errors raised while building TLS configuration
#[derive(Debug, Error)]
pub enum TlsConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no certificates found in {0}")]
    NoCertificates(PathBuf),

    #[error("invalid certificate in {path}: {source}")]
    InvalidCertificate {
        path: PathBuf,
        #[source]
        source: ErrorStack,
    },

    #[error("no usable private key in {path}: {source}")]
    InvalidKey {
        path: PathBuf,
        #[source]
        source: ErrorStack,
    },

    #[error("certificate chain is empty")]
    EmptyChain,

    #[error("invalid TLS configuration: {0}")]
    OpenSsl(#[from] ErrorStack),
}

/// OpenSSL cipher string for [`CIPHER_SUITES`].
///
/// Security level 0 is required for OpenSSL 3 to negotiate TLS 1.0/1.1 and
/// the SHA-1 suites. Suites the linked OpenSSL lacks (RC4) are skipped.
pub fn cipher_list() -> String {
    format!("{}:@SECLEVEL=0", CIPHER_SUITES.join(":"))
}

fn apply_policy(builder: &mut SslContextBuilder) -> Result<(), ErrorStack> {
    builder.set_min_proto_version(Some(MIN_PROTOCOL_VERSION))?;
    builder.set_max_proto_version(Some(MAX_PROTOCOL_VERSION))?;
    builder.set_cipher_list(&cipher_list())?;
    builder.set_ciphersuites(TLS13_CIPHER_SUITES)?;
    Ok(())
}

/// Build the listener context from an already loaded key pair.
///
/// `certs` is the leaf followed by any intermediates.
pub fn build_server_tls_config(
    certs: &[X509],
    key: &PKeyRef<Private>,
) -> Result<SslContext, TlsConfigError> {
    let (leaf, chain) = certs.split_first().ok_or(TlsConfigError::EmptyChain)?;

    let mut builder = SslContextBuilder::new(SslMethod::tls_server())?;
    apply_policy(&mut builder)?;
    builder.set_options(SslOptions::CIPHER_SERVER_PREFERENCE);

    builder.set_certificate(leaf)?;
    for cert in chain {
        builder.add_extra_chain_cert(cert.clone())?;
    }
    builder.set_private_key(key)?;
    builder.check_private_key()?;

    builder.set_alpn_select_callback(|_, client| {
        ssl::select_next_proto(ALPN_HTTP1, client).ok_or(AlpnError::NOACK)
    });

    Ok(builder.build())
}

/// Build an origin-facing connector.
///
/// `skip_verify` disables certificate chain validation; hostname checks are
/// turned off per connection in [`OriginConnector::connect`].
pub fn build_client_tls_config(skip_verify: bool) -> Result<SslConnector, TlsConfigError> {
    let mut builder = SslConnector::builder(SslMethod::tls_client())?;
    apply_policy(&mut builder)?;
    builder.set_alpn_protos(ALPN_HTTP1)?;

    if skip_verify {
        builder.set_verify(SslVerifyMode::NONE);
    } else {
        // A vendored OpenSSL does not know where the system bundle lives
        if let Some(file) = openssl_probe::probe().cert_file {
            builder.set_ca_file(file)?;
        }
    }

    Ok(builder.build())
}

fn read(path: &Path) -> Result<Vec<u8>, TlsConfigError> {
    std::fs::read(path).map_err(|source| TlsConfigError::Read {
        path: path.to_path_buf(),
        source,
    })
}

/// Load a PEM certificate chain
pub fn load_certs(path: &Path) -> Result<Vec<X509>, TlsConfigError> {
    let certs = X509::stack_from_pem(&read(path)?).map_err(|source| {
        TlsConfigError::InvalidCertificate {
            path: path.to_path_buf(),
            source,
        }
    })?;

    if certs.is_empty() {
        return Err(TlsConfigError::NoCertificates(path.to_path_buf()));
    }

    Ok(certs)
}

/// Load a PEM private key (PKCS#1, PKCS#8 or SEC1)
pub fn load_private_key(path: &Path) -> Result<PKey<Private>, TlsConfigError> {
    PKey::private_key_from_pem(&read(path)?).map_err(|source| TlsConfigError::InvalidKey {
        path: path.to_path_buf(),
        source,
    })
}

/// Load credentials from disk and build the listener context
pub fn load_server_tls_config(
    cert_file: &Path,
    key_file: &Path,
) -> Result<SslContext, TlsConfigError> {
    let certs = load_certs(cert_file)?;
    let key = load_private_key(key_file)?;
    build_server_tls_config(&certs, &key)
}

/// Run the server side of the handshake on an accepted stream
pub async fn accept<S>(context: &SslContext, stream: S) -> Result<SslStream<S>, ssl::Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ssl = ssl::Ssl::new(context)?;
    let mut stream = SslStream::new(ssl, stream)?;
    Pin::new(&mut stream).accept().await?;
    Ok(stream)
}

/// Connector for one verification mode
#[derive(Clone)]
pub struct OriginConnector {
    connector: SslConnector,
    verify: bool,
}

impl OriginConnector {
    fn new(verify: bool) -> Result<Self, TlsConfigError> {
        Ok(Self {
            connector: build_client_tls_config(!verify)?,
            verify,
        })
    }

    pub fn verifies_certificates(&self) -> bool {
        self.verify
    }

    /// Run the client side of the handshake against `host`
    pub async fn connect<S>(&self, host: &str, stream: S) -> Result<SslStream<S>, ssl::Error>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let ssl = self
            .connector
            .configure()?
            .verify_hostname(self.verify)
            .into_ssl(host)?;
        let mut stream = SslStream::new(ssl, stream)?;
        Pin::new(&mut stream).connect().await?;
        Ok(stream)
    }
}

/// The two connectors an origin connection can use.
///
/// Built once at startup; each proxied request picks one by reference.
#[derive(Clone)]
pub struct OutboundTls {
    verified: OriginConnector,
    unverified: OriginConnector,
}

impl OutboundTls {
    pub fn new() -> Result<Self, TlsConfigError> {
        Ok(Self {
            verified: OriginConnector::new(true)?,
            unverified: OriginConnector::new(false)?,
        })
    }

    /// Connector for `target`, or `None` for plaintext origins
    pub fn for_target(&self, target: &PrefixTarget) -> Option<&OriginConnector> {
        if !target.use_secure_transport {
            return None;
        }

        if target.skip_certificate_verification {
            debug!(
                "Certificate verification disabled for prefix {} ({})",
                target.prefix,
                target.effective_domain()
            );
            Some(&self.unverified)
        } else {
            Some(&self.verified)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use openssl::asn1::Asn1Time;
    use openssl::hash::MessageDigest;
    use openssl::rsa::Rsa;
    use openssl::x509::X509NameBuilder;
    use std::fs;
    use tempfile::tempdir;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    fn rsa_identity() -> (X509, PKey<Private>) {
        let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();

        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_text("CN", "localhost").unwrap();
        let name = name.build();

        let mut cert = X509::builder().unwrap();
        cert.set_version(2).unwrap();
        cert.set_subject_name(&name).unwrap();
        cert.set_issuer_name(&name).unwrap();
        cert.set_pubkey(&key).unwrap();
        cert.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
        cert.set_not_after(&Asn1Time::days_from_now(1).unwrap()).unwrap();
        cert.sign(&key, MessageDigest::sha256()).unwrap();

        (cert.build(), key)
    }

    fn server_context() -> SslContext {
        let (cert, key) = rsa_identity();
        build_server_tls_config(&[cert], &key).unwrap()
    }

    fn peer(min: SslVersion, max: SslVersion, ciphers: &str) -> SslConnector {
        let mut builder = SslConnector::builder(SslMethod::tls_client()).unwrap();
        builder.set_verify(SslVerifyMode::NONE);
        builder.set_min_proto_version(Some(min)).unwrap();
        builder.set_max_proto_version(Some(max)).unwrap();
        builder.set_cipher_list(ciphers).unwrap();
        builder.build()
    }

    /// Handshake `client` against `server` in memory; returns (version, cipher)
    async fn handshake(server: &SslContext, client: &SslConnector) -> (String, String) {
        let (client_io, server_io) = duplex(64 * 1024);

        let server_side = async {
            let mut stream = accept(server, server_io).await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
        };

        let client_side = async {
            let ssl = client
                .configure()
                .unwrap()
                .verify_hostname(false)
                .into_ssl("localhost")
                .unwrap();
            let mut stream = SslStream::new(ssl, client_io).unwrap();
            Pin::new(&mut stream).connect().await.unwrap();

            stream.write_all(b"ping").await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping");

            let ssl = stream.ssl();
            (
                ssl.version_str().to_string(),
                ssl.current_cipher().map(|c| c.name()).unwrap_or("").to_string(),
            )
        };

        let ((), negotiated) = tokio::join!(server_side, client_side);
        negotiated
    }

    fn target(secure: bool, skip: bool) -> PrefixTarget {
        PrefixTarget {
            prefix: "api".to_string(),
            target_domain: String::new(),
            use_secure_transport: secure,
            skip_certificate_verification: skip,
        }
    }

    #[test]
    fn test_cipher_list_order() {
        let list = cipher_list();

        assert!(list.starts_with("AES128-SHA:AES256-SHA:DES-CBC3-SHA:"));
        assert!(list.ends_with(":ECDHE-ECDSA-AES256-GCM-SHA384:@SECLEVEL=0"));
        let legacy = list.find("ECDHE-RSA-AES128-SHA:").unwrap();
        let modern = list.find("ECDHE-RSA-AES128-GCM-SHA256").unwrap();
        assert!(legacy < modern);
    }

    #[test]
    fn test_server_context_requires_certificate() {
        assert!(matches!(
            build_server_tls_config(&[], &rsa_identity().1),
            Err(TlsConfigError::EmptyChain)
        ));
    }

    #[tokio::test]
    async fn test_legacy_tls10_client_accepted() {
        let server = server_context();
        let client = peer(
            SslVersion::TLS1,
            SslVersion::TLS1,
            "ECDHE-RSA-AES128-SHA:@SECLEVEL=0",
        );

        let (version, cipher) = handshake(&server, &client).await;
        assert_eq!(version, "TLSv1");
        assert_eq!(cipher, "ECDHE-RSA-AES128-SHA");
    }

    #[tokio::test]
    async fn test_legacy_tls11_client_accepted() {
        let server = server_context();
        let client = peer(SslVersion::TLS1_1, SslVersion::TLS1_1, "AES256-SHA:@SECLEVEL=0");

        let (version, cipher) = handshake(&server, &client).await;
        assert_eq!(version, "TLSv1.1");
        assert_eq!(cipher, "AES256-SHA");
    }

    #[tokio::test]
    async fn test_server_order_wins() {
        let server = server_context();
        // Client lists the GCM suite first; the server's list puts CBC first
        let client = peer(
            SslVersion::TLS1_2,
            SslVersion::TLS1_2,
            "ECDHE-RSA-AES256-GCM-SHA384:ECDHE-RSA-AES128-SHA:@SECLEVEL=0",
        );

        let (version, cipher) = handshake(&server, &client).await;
        assert_eq!(version, "TLSv1.2");
        assert_eq!(cipher, "ECDHE-RSA-AES128-SHA");
    }

    #[tokio::test]
    async fn test_modern_client_gets_tls13() {
        let server = server_context();
        let client = peer(SslVersion::TLS1_2, SslVersion::TLS1_3, "DEFAULT");

        let (version, _) = handshake(&server, &client).await;
        assert_eq!(version, "TLSv1.3");
    }

    #[tokio::test]
    async fn test_unverified_connector_accepts_self_signed() {
        let server = server_context();
        let tls = OutboundTls::new().unwrap();
        let (client_io, server_io) = duplex(64 * 1024);

        let server_side = async { accept(&server, server_io).await.is_ok() };
        let client_side = async {
            tls.for_target(&target(true, true))
                .unwrap()
                .connect("localhost", client_io)
                .await
                .is_ok()
        };

        let (accepted, connected) = tokio::join!(server_side, client_side);
        assert!(accepted);
        assert!(connected);
    }

    #[tokio::test]
    async fn test_verified_connector_rejects_self_signed() {
        let server = server_context();
        let tls = OutboundTls::new().unwrap();
        let (client_io, server_io) = duplex(64 * 1024);

        let server_side = async { accept(&server, server_io).await.is_ok() };
        let client_side = async {
            tls.for_target(&target(true, false))
                .unwrap()
                .connect("localhost", client_io)
                .await
                .is_ok()
        };

        let (_, connected) = tokio::join!(server_side, client_side);
        assert!(!connected);
    }

    #[test]
    fn test_outbound_selection() {
        let tls = OutboundTls::new().unwrap();

        assert!(tls.for_target(&target(false, false)).is_none());
        assert!(tls.for_target(&target(false, true)).is_none());

        assert!(tls.for_target(&target(true, false)).unwrap().verifies_certificates());
        assert!(!tls.for_target(&target(true, true)).unwrap().verifies_certificates());
    }

    #[test]
    fn test_load_pem_credentials() {
        let dir = tempdir().unwrap();
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");
        fs::write(&cert_path, cert.serialize_pem().unwrap()).unwrap();
        fs::write(&key_path, cert.serialize_private_key_pem()).unwrap();

        assert_eq!(load_certs(&cert_path).unwrap().len(), 1);
        assert!(load_private_key(&key_path).is_ok());
        assert!(load_server_tls_config(&cert_path, &key_path).is_ok());
    }

    #[test]
    fn test_load_rejects_empty_files() {
        let dir = tempdir().unwrap();
        let empty = dir.path().join("empty.pem");
        fs::write(&empty, "").unwrap();

        assert!(matches!(load_certs(&empty), Err(TlsConfigError::NoCertificates(_))));
        assert!(matches!(load_private_key(&empty), Err(TlsConfigError::InvalidKey { .. })));
        assert!(matches!(
            load_certs(&dir.path().join("missing.pem")),
            Err(TlsConfigError::Read { .. })
        ));
    }
}
