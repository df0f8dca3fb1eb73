//! `acert bootstrap`
//!
//! Plans the PKI acert runs on and ensures each piece through a
//! [`Provisioner`]:
//!
//! ```text
//! cert-manager release
//! Namespace        acert-system
//! ClusterIssuer    selfsigned-ca-issuer           (self-signed)
//! Certificate      acert-server-ca                (CA, via selfsigned-ca-issuer)
//! Issuer           acert-cluster-certificate-issuer (CA issuer backed by acert-server-ca)
//! Certificate      acert-grpc-server-cert         (server leaf, via the CA issuer)
//! Certificate      acert-agent-ca                 (CA, via selfsigned-ca-issuer)
//! ```

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use acert_common::{parse_duration, ACERT_SYSTEM_NAMESPACE, DEFAULT_SERVER_NAME};
use clap::Args;
use serde::Serialize;
use tracing::info;

use crate::provision::{ChartRef, Ensured, ManifestProvisioner, Provisioner, ResourceSpec};
use crate::schema::{collect, FieldValues, Prompter, StdinPrompter, SUBJECT_SCHEMA};
use crate::{Error, Result};

const CERT_MANAGER_API: &str = "cert-manager.io/v1";
const SELF_SIGNED_ISSUER: &str = "selfsigned-ca-issuer";
const SERVER_CA: &str = "acert-server-ca";
const SERVER_ISSUER: &str = "acert-cluster-certificate-issuer";
const SERVER_CERT: &str = "acert-grpc-server-cert";
const AGENT_CA: &str = "acert-agent-ca";

/// Bootstrap arguments
#[derive(Args, Debug, Clone)]
pub struct BootstrapArgs {
    /// Directory the manifests are rendered into
    #[arg(long, env = "ACERT_BOOTSTRAP_DIR", default_value = "acert-bootstrap")]
    pub out_dir: PathBuf,

    /// Namespace for acert system resources
    #[arg(long, default_value = ACERT_SYSTEM_NAMESPACE)]
    pub namespace: String,

    /// DNS name the gRPC server certificate is issued for
    #[arg(long, default_value = DEFAULT_SERVER_NAME)]
    pub server_dns_name: String,

    /// Lifetime of the server CA certificate
    #[arg(long, default_value = "87600h", value_parser = parse_duration)]
    pub server_ca_duration: Duration,

    /// Do not prompt for certificate subjects
    #[arg(long)]
    pub no_prompt: bool,

    /// Skip the cert-manager release
    #[arg(long)]
    pub skip_cert_manager: bool,

    /// cert-manager chart release name
    #[arg(long, default_value = "cert-manager")]
    pub cert_manager_release_name: String,

    /// cert-manager chart repository
    #[arg(long, default_value = "quay.io/jetstack/charts/cert-manager")]
    pub cert_manager_repository: String,

    /// cert-manager chart version
    #[arg(long, default_value = "v1.19.2")]
    pub cert_manager_version: String,

    /// cert-manager chart namespace
    #[arg(long, default_value = "cert-manager")]
    pub cert_manager_namespace: String,
}

impl BootstrapArgs {
    fn chart(&self) -> ChartRef {
        ChartRef {
            name: self.cert_manager_release_name.clone(),
            repository: self.cert_manager_repository.clone(),
            version: self.cert_manager_version.clone(),
            namespace: self.cert_manager_namespace.clone(),
        }
    }
}

/// Subjects for the three certificates acert issues
#[derive(Debug, Clone, Default)]
pub struct Subjects {
    /// Root CA signing the server certificate
    pub server_ca: FieldValues,
    /// gRPC server leaf certificate
    pub server: FieldValues,
    /// CA signing agent certificates
    pub agent_ca: FieldValues,
}

impl Subjects {
    /// Prompt for each certificate's subject in turn
    pub fn collect(prompter: &mut dyn Prompter) -> io::Result<Self> {
        Ok(Self {
            server_ca: collect(SUBJECT_SCHEMA, &mut Labeled::new(SERVER_CA, prompter))?,
            server: collect(SUBJECT_SCHEMA, &mut Labeled::new(SERVER_CERT, prompter))?,
            agent_ca: collect(SUBJECT_SCHEMA, &mut Labeled::new(AGENT_CA, prompter))?,
        })
    }
}

/// Prefixes prompt labels with the certificate being filled in
struct Labeled<'a> {
    certificate: &'static str,
    inner: &'a mut dyn Prompter,
}

impl<'a> Labeled<'a> {
    fn new(certificate: &'static str, inner: &'a mut dyn Prompter) -> Self {
        Self { certificate, inner }
    }
}

impl Prompter for Labeled<'_> {
    fn prompt(&mut self, label: &str) -> io::Result<String> {
        self.inner.prompt(&format!("[{}] {}", self.certificate, label))
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CertificateSpec {
    #[serde(rename = "isCA", skip_serializing_if = "std::ops::Not::not")]
    is_ca: bool,
    common_name: String,
    secret_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    duration: Option<String>,
    #[serde(skip_serializing_if = "serde_yaml::Mapping::is_empty")]
    subject: serde_yaml::Mapping,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    dns_names: Vec<String>,
    private_key: PrivateKey,
    #[serde(skip_serializing_if = "Option::is_none")]
    signature_algorithm: Option<&'static str>,
    usages: Vec<&'static str>,
    issuer_ref: IssuerRef,
}

#[derive(Serialize)]
struct PrivateKey {
    algorithm: &'static str,
    size: u32,
}

const RSA_4096: PrivateKey = PrivateKey {
    algorithm: "RSA",
    size: 4096,
};

#[derive(Serialize)]
struct IssuerRef {
    kind: &'static str,
    name: &'static str,
}

/// cert-manager duration string
fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}

fn to_value<T: Serialize>(spec: &T) -> Result<serde_yaml::Value> {
    serde_yaml::to_value(spec).map_err(|e| Error::validation(format!("failed to encode spec: {e}")))
}

/// Resources to ensure, in dependency order
pub fn plan(args: &BootstrapArgs, subjects: &Subjects) -> Result<Vec<ResourceSpec>> {
    let ns = args.namespace.as_str();

    let self_signed = serde_yaml::from_str::<serde_yaml::Value>("selfSigned: {}")
        .map_err(|e| Error::validation(e.to_string()))?;

    let server_ca = CertificateSpec {
        is_ca: true,
        common_name: SERVER_CA.to_string(),
        secret_name: SERVER_CA.to_string(),
        duration: Some(format_duration(args.server_ca_duration)),
        subject: subjects.server_ca.to_yaml(),
        dns_names: Vec::new(),
        private_key: RSA_4096,
        signature_algorithm: None,
        usages: vec!["cert sign"],
        issuer_ref: IssuerRef {
            kind: "ClusterIssuer",
            name: SELF_SIGNED_ISSUER,
        },
    };

    let mut ca_issuer = serde_yaml::Mapping::new();
    ca_issuer.insert("secretName".into(), SERVER_CA.into());
    let mut server_issuer = serde_yaml::Mapping::new();
    server_issuer.insert("ca".into(), ca_issuer.into());

    let server_cert = CertificateSpec {
        is_ca: false,
        common_name: args.server_dns_name.clone(),
        secret_name: SERVER_CERT.to_string(),
        duration: Some(format_duration(args.server_ca_duration)),
        subject: subjects.server.to_yaml(),
        dns_names: vec![args.server_dns_name.clone()],
        private_key: RSA_4096,
        signature_algorithm: Some("SHA256WithRSA"),
        usages: vec!["digital signature", "key encipherment", "server auth"],
        issuer_ref: IssuerRef {
            kind: "Issuer",
            name: SERVER_ISSUER,
        },
    };

    let agent_ca = CertificateSpec {
        is_ca: true,
        common_name: AGENT_CA.to_string(),
        secret_name: AGENT_CA.to_string(),
        duration: None,
        subject: subjects.agent_ca.to_yaml(),
        dns_names: Vec::new(),
        private_key: RSA_4096,
        signature_algorithm: None,
        usages: vec!["cert sign"],
        issuer_ref: IssuerRef {
            kind: "ClusterIssuer",
            name: SELF_SIGNED_ISSUER,
        },
    };

    Ok(vec![
        ResourceSpec::cluster("v1", "Namespace", ns),
        ResourceSpec::cluster(CERT_MANAGER_API, "ClusterIssuer", SELF_SIGNED_ISSUER)
            .with_spec(self_signed),
        ResourceSpec::namespaced(CERT_MANAGER_API, "Certificate", ns, SERVER_CA)
            .with_spec(to_value(&server_ca)?),
        ResourceSpec::namespaced(CERT_MANAGER_API, "Issuer", ns, SERVER_ISSUER)
            .with_spec(server_issuer.into()),
        ResourceSpec::namespaced(CERT_MANAGER_API, "Certificate", ns, SERVER_CERT)
            .with_spec(to_value(&server_cert)?),
        ResourceSpec::namespaced(CERT_MANAGER_API, "Certificate", ns, AGENT_CA)
            .with_spec(to_value(&agent_ca)?),
    ])
}

/// What a bootstrap run did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BootstrapSummary {
    /// Resources written by this run
    pub created: Vec<String>,
    /// Resources that were already present
    pub existing: Vec<String>,
    /// Release revision after install or upgrade
    pub release_revision: Option<u32>,
}

/// Ensure the release and every planned resource
pub async fn apply(
    args: &BootstrapArgs,
    subjects: &Subjects,
    provisioner: &dyn Provisioner,
) -> Result<BootstrapSummary> {
    let mut summary = BootstrapSummary::default();

    if !args.skip_cert_manager {
        let values = serde_yaml::from_str("crds:\n  enabled: true")
            .map_err(|e| Error::validation(e.to_string()))?;
        let release = provisioner.install_or_upgrade(&args.chart(), values).await?;
        info!(release = %release.name, revision = release.revision, "Chart installed successfully");
        summary.release_revision = Some(release.revision);
    }

    for resource in plan(args, subjects)? {
        match provisioner.ensure(&resource).await? {
            Ensured::Created => summary.created.push(resource.display_name()),
            Ensured::Existing => summary.existing.push(resource.display_name()),
        }
    }

    Ok(summary)
}

/// Run `acert bootstrap`
pub async fn run(args: BootstrapArgs) -> Result<()> {
    let subjects = if args.no_prompt {
        Subjects::default()
    } else {
        Subjects::collect(&mut StdinPrompter::stdio())?
    };

    let provisioner = ManifestProvisioner::new(&args.out_dir);
    let summary = apply(&args, &subjects, &provisioner).await?;

    info!(
        out_dir = %args.out_dir.display(),
        created = summary.created.len(),
        existing = summary.existing.len(),
        "Bootstrap manifests rendered"
    );
    Ok(())
}
