//! Handshake-time client certificate handling.
//!
//! The client claim (`X-Road-Client`) only arrives with the HTTP request,
//! after the handshake has finished, so the handshake cannot know which
//! trusted set applies.  [`HandshakeVerifier`] therefore:
//!
//! - asks for a certificate only when some registered client uses
//!   `verify_client` (read from the store on every handshake),
//! - never requires one,
//! - checks proof of possession of the presented key,
//! - and leaves trust to the decision engine.

use std::fmt;
use std::sync::Arc;

use rustls::client::danger::HandshakeSignatureValid;
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, SignatureScheme};
use tracing::trace;

use crate::trust::TrustStore;

/// Provisional client-certificate verifier for the HTTPS listener.
pub struct HandshakeVerifier {
    store: TrustStore,
    provider: Arc<CryptoProvider>,
}

impl HandshakeVerifier {
    /// Create a verifier reading the request policy from `store`.
    pub fn new(store: TrustStore, provider: Arc<CryptoProvider>) -> Self {
        Self { store, provider }
    }
}

impl fmt::Debug for HandshakeVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeVerifier")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl ClientCertVerifier for HandshakeVerifier {
    fn offer_client_auth(&self) -> bool {
        self.store.current().requests_client_certificates()
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        trace!(
            leaf_len = end_entity.len(),
            intermediates = intermediates.len(),
            "Client certificate presented; trust deferred to request"
        );
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::ClientId;
    use crate::mtls::cert_manager::test_support::self_signed_der;
    use crate::trust::{AuthenticationPolicy, ConfigurationSnapshot};

    fn verifier(store: &TrustStore) -> HandshakeVerifier {
        HandshakeVerifier::new(
            store.clone(),
            Arc::new(rustls::crypto::aws_lc_rs::default_provider()),
        )
    }

    fn verifying_snapshot() -> ConfigurationSnapshot {
        let id: ClientId = "EE/GOV/A".parse().unwrap();
        ConfigurationSnapshot::builder(true)
            .client(
                id,
                AuthenticationPolicy::VerifyClient,
                vec![self_signed_der("is")],
            )
            .build()
            .unwrap()
    }

    #[test]
    fn offers_client_auth_only_while_a_client_verifies() {
        // GIVEN: a store with no verify_client clients
        let store = TrustStore::new(ConfigurationSnapshot::empty(true)).unwrap();
        let v = verifier(&store);
        assert!(!v.offer_client_auth());

        // WHEN: a verify_client client is published
        store.reload(verifying_snapshot()).unwrap();

        // THEN: the next handshake asks for a certificate
        assert!(v.offer_client_auth());
        assert!(!v.client_auth_mandatory());
    }

    #[test]
    fn any_presented_certificate_is_deferred() {
        let store = TrustStore::new(verifying_snapshot()).unwrap();
        let v = verifier(&store);
        let unknown = self_signed_der("not-registered");
        assert!(v.verify_client_cert(&unknown, &[], UnixTime::now()).is_ok());
    }

    #[test]
    fn advertises_provider_signature_schemes() {
        let store = TrustStore::new(ConfigurationSnapshot::empty(false)).unwrap();
        let schemes = verifier(&store).supported_verify_schemes();
        assert!(schemes.contains(&SignatureScheme::ECDSA_NISTP256_SHA256));
    }
}
