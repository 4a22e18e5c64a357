//! The shared upstream HTTP client(s) a [`crate::server::ProxyServer`]
//! dispatches `target`/`forward` requests through: a tuned
//! `hyper_util::client::legacy::Client` over a plain `HttpConnector`, plus
//! an HTTPS-capable `hyper-rustls` connector for TLS targets.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::Body as HttpBody;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn boxed<B>(body: B) -> BoxBody
where
    B: HttpBody<Data = Bytes> + Send + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    body.map_err(|e| {
        let err: Box<dyn std::error::Error + Send + Sync> = e.into();
        hyper::Error::new(hyper::error::Kind::BodyWrite, err)
    })
    .boxed()
}

/// Accepts any server certificate. Backs `options.secure == false` — callers
/// opt into this explicitly per target, it is never the default.
#[derive(Debug)]
struct AcceptAnyCert;

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::ED25519,
        ]
    }
}

fn new_http_connector(local_address: Option<std::net::IpAddr>) -> HttpConnector {
    let mut connector = HttpConnector::new();
    connector.set_connect_timeout(Some(Duration::from_secs(10)));
    connector.set_nodelay(true);
    connector.set_keepalive(Some(Duration::from_secs(90)));
    if let Some(addr) = local_address {
        connector.set_local_address(Some(addr));
    }
    connector
}

fn https_connector(reject_unauthorized: bool, http: HttpConnector) -> HttpsConnector<HttpConnector> {
    if reject_unauthorized {
        hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(http)
    } else {
        let mut tls = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
            .with_no_client_auth();
        tls.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls)
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(http)
    }
}

/// Holds the two pooled clients a `ProxyServer` dispatches through: one for
/// plain-TCP (`http`/`ws`) targets, one for TLS (`https`/`wss`) targets with
/// certificate verification toggled by `options.secure`. Re-instantiating
/// the insecure client per-request would defeat pooling, so both variants
/// are built once at `ProxyServer` construction time.
#[derive(Clone)]
pub struct ProxyClient {
    plain: Client<HttpConnector, BoxBody>,
    tls_verified: Client<HttpsConnector<HttpConnector>, BoxBody>,
    tls_insecure: Client<HttpsConnector<HttpConnector>, BoxBody>,
}

impl ProxyClient {
    pub fn new() -> Self {
        let executor = TokioExecutor::new();
        let plain = Client::builder(executor.clone())
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(32)
            .build(new_http_connector(None));

        let tls_verified = Client::builder(executor.clone())
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(32)
            .build(https_connector(true, new_http_connector(None)));

        let tls_insecure = Client::builder(executor)
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(32)
            .build(https_connector(false, new_http_connector(None)));

        ProxyClient {
            plain,
            tls_verified,
            tls_insecure,
        }
    }

    pub async fn request(
        &self,
        is_ssl: bool,
        reject_unauthorized: bool,
        req: hyper::Request<BoxBody>,
    ) -> Result<hyper::Response<hyper::body::Incoming>, hyper_util::client::legacy::Error> {
        if !is_ssl {
            self.plain.request(req).await
        } else if reject_unauthorized {
            self.tls_verified.request(req).await
        } else {
            self.tls_insecure.request(req).await
        }
    }
}

impl Default for ProxyClient {
    fn default() -> Self {
        Self::new()
    }
}
