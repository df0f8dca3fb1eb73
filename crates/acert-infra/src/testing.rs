//! Throwaway PKI for tests
//!
//! Generates a self-signed root and leaf certificates signed by it. Only
//! compiled for tests and with the `test-utils` feature.

use std::path::Path;

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
};

use crate::mtls::IdentityPaths;

/// A leaf certificate and its private key, PEM encoded
#[derive(Clone)]
pub struct IssuedCert {
    /// Leaf certificate PEM
    pub cert_pem: String,
    /// Private key PEM (PKCS#8)
    pub key_pem: String,
}

/// Root CA able to sign agent and server leaves
pub struct TestPki {
    ca_cert: Certificate,
    ca_key: KeyPair,
}

impl Default for TestPki {
    fn default() -> Self {
        Self::new()
    }
}

impl TestPki {
    /// Generate a fresh root CA
    pub fn new() -> Self {
        let ca_key = KeyPair::generate().expect("CA key generation should succeed");
        let mut params = CertificateParams::default();
        params.distinguished_name = dn("acert test root");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let ca_cert = params
            .self_signed(&ca_key)
            .expect("CA self-signing should succeed");
        Self { ca_cert, ca_key }
    }

    /// Root certificate PEM (the trust bundle)
    pub fn ca_pem(&self) -> String {
        self.ca_cert.pem()
    }

    /// Client certificate whose CN is `agent_id`
    pub fn agent(&self, agent_id: &str) -> IssuedCert {
        let mut params = CertificateParams::default();
        params.distinguished_name = dn(agent_id);
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        self.sign(params)
    }

    /// Client certificate whose validity window ended long ago
    pub fn expired_agent(&self, agent_id: &str) -> IssuedCert {
        let mut params = CertificateParams::default();
        params.distinguished_name = dn(agent_id);
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        params.not_before = rcgen::date_time_ymd(2000, 1, 1);
        params.not_after = rcgen::date_time_ymd(2001, 1, 1);
        self.sign(params)
    }

    /// Server certificate valid for `dns_name`
    pub fn server(&self, dns_name: &str) -> IssuedCert {
        let mut params = CertificateParams::new(vec![dns_name.to_string()])
            .expect("server SAN should be valid");
        params.distinguished_name = dn(dns_name);
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        self.sign(params)
    }

    /// Leaf certificate whose subject has no common name
    pub fn leaf_without_cn(&self) -> IssuedCert {
        let mut params = CertificateParams::default();
        let mut name = DistinguishedName::new();
        name.push(
            DnType::OrganizationName,
            DnValue::Utf8String("acert".to_string()),
        );
        params.distinguished_name = name;
        self.sign(params)
    }

    /// Write `cert` plus the root bundle as `cert.pem`, `key.pem`, `ca.pem`
    pub fn write_identity(&self, dir: &Path, cert: &IssuedCert) -> IdentityPaths {
        let paths = IdentityPaths {
            cert: dir.join("cert.pem"),
            key: dir.join("key.pem"),
            ca: dir.join("ca.pem"),
        };
        std::fs::write(&paths.cert, &cert.cert_pem).expect("write cert");
        std::fs::write(&paths.key, &cert.key_pem).expect("write key");
        std::fs::write(&paths.ca, self.ca_pem()).expect("write ca");
        paths
    }

    fn sign(&self, params: CertificateParams) -> IssuedCert {
        let key = KeyPair::generate().expect("leaf key generation should succeed");
        let cert = params
            .signed_by(&key, &self.ca_cert, &self.ca_key)
            .expect("leaf signing should succeed");
        IssuedCert {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        }
    }
}

fn dn(common_name: &str) -> DistinguishedName {
    let mut name = DistinguishedName::new();
    name.push(
        DnType::CommonName,
        DnValue::Utf8String(common_name.to_string()),
    );
    name
}
