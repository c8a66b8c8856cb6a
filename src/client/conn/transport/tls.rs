//! Wrap a transport with TLS.
//!
//! The handshake runs over whatever stream the inner transport produced, so
//! a proxied connection is encrypted end-to-end through the CONNECT tunnel.
//! Server identity is validated against the target host by the default
//! verifier; [`insecure_tls_config`] builds a configuration that skips
//! certificate and hostname validation while still checking handshake
//! signatures.

use std::io;
use std::sync::Arc;
use std::task::{Context, Poll};

use rustls::ClientConfig as TlsClientConfig;
use rustls::pki_types::ServerName;
use tower::ServiceExt as _;
use tracing::{Instrument as _, trace};

use super::super::{ClientStream, Target};
use crate::BoxFuture;
use crate::client::Error;

/// Wrapper around a transport which negotiates TLS after connecting.
#[derive(Debug, Clone)]
pub(crate) struct TlsTransport<T> {
    transport: T,
    config: Arc<TlsClientConfig>,
}

impl<T> TlsTransport<T> {
    pub(crate) fn new(transport: T, config: Arc<TlsClientConfig>) -> Self {
        Self { transport, config }
    }
}

impl<T> tower::Service<Target> for TlsTransport<T>
where
    T: tower::Service<Target, Response = ClientStream, Error = Error>
        + Clone
        + Send
        + 'static,
    T::Future: Send,
{
    type Response = ClientStream;
    type Error = Error;
    type Future = BoxFuture<'static, Result<ClientStream, Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.transport.poll_ready(cx)
    }

    fn call(&mut self, target: Target) -> Self::Future {
        let config = self.config.clone();
        let transport = self.transport.clone();
        let span = tracing::trace_span!("tls", host = %target.host);

        Box::pin(
            async move {
                let domain = ServerName::try_from(target.host.clone()).map_err(|error| {
                    Error::Tls(Arc::new(io::Error::new(io::ErrorKind::InvalidInput, error)))
                })?;

                let stream = transport.oneshot(target).await?;
                let tcp = match stream {
                    ClientStream::Plain(tcp) => tcp,
                    ClientStream::Tls(_) => {
                        return Err(Error::Tls(Arc::new(io::Error::other(
                            "transport is already encrypted",
                        ))));
                    }
                };

                trace!("transport connected, starting TLS handshake");
                let connector = tokio_rustls::TlsConnector::from(config);
                let tls = connector
                    .connect(domain, tcp)
                    .await
                    .map_err(|error| Error::Tls(Arc::new(error)))?;

                trace!("TLS handshake complete");
                Ok(ClientStream::Tls(Box::new(tls)))
            }
            .instrument(span),
        )
    }
}

/// Get a default TLS client configuration by loading the platform's native certificates.
pub(crate) fn default_tls_config() -> TlsClientConfig {
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs().expect("could not load platform certs") {
        roots.add(cert).unwrap();
    }

    let mut cfg = TlsClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    cfg.alpn_protocols.push(b"http/1.1".to_vec());
    cfg
}

/// Build a TLS client configuration which accepts any server certificate.
///
/// Handshake signatures are still verified; only the certificate chain and
/// hostname checks are skipped. Intended for the explicit
/// hostname-verification opt-out.
pub(crate) fn insecure_tls_config() -> TlsClientConfig {
    let provider = rustls::crypto::ring::default_provider();
    let verifier = danger::NoServerVerification::new(&provider);

    let mut cfg = TlsClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();

    cfg.alpn_protocols.push(b"http/1.1".to_vec());
    cfg
}

mod danger {
    use rustls::DigitallySignedStruct;
    use rustls::SignatureScheme;
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::crypto::{
        CryptoProvider, WebPkiSupportedAlgorithms, verify_tls12_signature, verify_tls13_signature,
    };
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};

    /// Certificate verifier that accepts any server identity.
    #[derive(Debug)]
    pub(super) struct NoServerVerification {
        algorithms: WebPkiSupportedAlgorithms,
    }

    impl NoServerVerification {
        pub(super) fn new(provider: &CryptoProvider) -> Self {
            Self {
                algorithms: provider.signature_verification_algorithms,
            }
        }
    }

    impl ServerCertVerifier for NoServerVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls12_signature(message, cert, dss, &self.algorithms)
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls13_signature(message, cert, dss, &self.algorithms)
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.algorithms.supported_schemes()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insecure_config_builds_with_http1_alpn() {
        let config = insecure_tls_config();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn invalid_domain_fails_before_connecting() {
        // ServerName rejects hosts that are neither DNS names nor IPs.
        assert!(ServerName::try_from("bad host name".to_string()).is_err());
    }
}
