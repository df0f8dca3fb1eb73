//! Provisioning of the resources acert depends on
//!
//! [`Provisioner`] is an idempotent "make sure this exists" API plus a chart
//! install-or-upgrade. [`ManifestProvisioner`] renders everything into a
//! directory of YAML manifests that can be reviewed and applied with any
//! tool.
//!
//! File layout:
//!
//! ```text
//! <out>/namespace_acert-system.yaml                     cluster scoped: <kind>_<name>.yaml
//! <out>/certificate_acert-system_acert-server-ca.yaml   namespaced: <kind>_<namespace>_<name>.yaml
//! <out>/cert-manager.release.yaml                       <release>.release.yaml
//! ```
//!
//! Names may not contain `_`, so distinct resources never share a file.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// Provisioning errors
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Reading or writing a manifest failed
    #[error("failed to access {path}: {source}")]
    Io {
        /// File or directory involved
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// A manifest could not be rendered or an existing one parsed
    #[error("failed to encode or decode {path}: {source}")]
    Yaml {
        /// Manifest involved
        path: PathBuf,
        /// Underlying error
        source: serde_yaml::Error,
    },

    /// Name unusable as a file name component
    #[error("invalid resource name '{0}': use lowercase letters, digits, '-' and '.'")]
    InvalidName(String),
}

/// A resource to ensure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpec {
    /// API group and version, e.g. `cert-manager.io/v1`
    pub api_version: String,
    /// Resource kind, e.g. `Certificate`
    pub kind: String,
    /// Name and namespace
    pub metadata: ResourceMeta,
    /// Kind specific body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<serde_yaml::Value>,
}

/// Name and optional namespace of a resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceMeta {
    /// Resource name
    pub name: String,
    /// Namespace, absent for cluster scoped resources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl ResourceSpec {
    /// Cluster scoped resource
    pub fn cluster(api_version: &str, kind: &str, name: &str) -> Self {
        Self {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            metadata: ResourceMeta {
                name: name.to_string(),
                namespace: None,
            },
            spec: None,
        }
    }

    /// Namespaced resource
    pub fn namespaced(api_version: &str, kind: &str, namespace: &str, name: &str) -> Self {
        let mut resource = Self::cluster(api_version, kind, name);
        resource.metadata.namespace = Some(namespace.to_string());
        resource
    }

    /// Attach a spec
    pub fn with_spec(mut self, spec: serde_yaml::Value) -> Self {
        self.spec = Some(spec);
        self
    }

    /// `Kind/namespace/name` for logs
    pub fn display_name(&self) -> String {
        match &self.metadata.namespace {
            Some(ns) => format!("{}/{}/{}", self.kind, ns, self.metadata.name),
            None => format!("{}/{}", self.kind, self.metadata.name),
        }
    }
}

/// Outcome of [`Provisioner::ensure`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ensured {
    /// Already present, left untouched
    Existing,
    /// Newly created
    Created,
}

/// An OCI chart to install as a release
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartRef {
    /// Release name
    pub name: String,
    /// OCI repository, without scheme or tag
    pub repository: String,
    /// Chart version tag
    pub version: String,
    /// Namespace the release is installed into
    pub namespace: String,
}

impl ChartRef {
    /// `oci://<repository>:<version>`
    pub fn oci_reference(&self) -> String {
        format!("oci://{}:{}", self.repository, self.version)
    }
}

/// State of a release after [`Provisioner::install_or_upgrade`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseInfo {
    /// Release name
    pub name: String,
    /// Namespace of the release
    pub namespace: String,
    /// OCI reference of the installed chart
    pub chart: String,
    /// Starts at 1, incremented on every install or upgrade
    pub revision: u32,
    /// Values the release was last installed with
    pub values: serde_yaml::Value,
}

/// Creates the resources acert depends on
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Create `resource` unless it already exists. Existing resources are
    /// never modified.
    async fn ensure(&self, resource: &ResourceSpec) -> Result<Ensured, ProvisionError>;

    /// Install `chart` or upgrade the existing release with `values`
    async fn install_or_upgrade(
        &self,
        chart: &ChartRef,
        values: serde_yaml::Value,
    ) -> Result<ReleaseInfo, ProvisionError>;
}

/// Renders resources as YAML files under a directory
#[derive(Debug, Clone)]
pub struct ManifestProvisioner {
    out_dir: PathBuf,
}

impl ManifestProvisioner {
    /// Render into `out_dir`, created on first write
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
        }
    }

    /// Directory manifests are written to
    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    /// File `resource` is rendered to
    pub fn resource_path(&self, resource: &ResourceSpec) -> Result<PathBuf, ProvisionError> {
        let kind = resource.kind.to_ascii_lowercase();
        validate_name(&kind)?;
        validate_name(&resource.metadata.name)?;

        let file = match &resource.metadata.namespace {
            Some(ns) => {
                validate_name(ns)?;
                format!("{kind}_{ns}_{}.yaml", resource.metadata.name)
            }
            None => format!("{kind}_{}.yaml", resource.metadata.name),
        };
        Ok(self.out_dir.join(file))
    }

    /// File the release record for `chart` is written to
    pub fn release_path(&self, chart: &ChartRef) -> Result<PathBuf, ProvisionError> {
        validate_name(&chart.name)?;
        Ok(self.out_dir.join(format!("{}.release.yaml", chart.name)))
    }

    async fn create_out_dir(&self) -> Result<(), ProvisionError> {
        tokio::fs::create_dir_all(&self.out_dir)
            .await
            .map_err(|source| ProvisionError::Io {
                path: self.out_dir.clone(),
                source,
            })
    }
}

#[async_trait]
impl Provisioner for ManifestProvisioner {
    async fn ensure(&self, resource: &ResourceSpec) -> Result<Ensured, ProvisionError> {
        let path = self.resource_path(resource)?;
        let exists = tokio::fs::try_exists(&path)
            .await
            .map_err(|source| ProvisionError::Io {
                path: path.clone(),
                source,
            })?;
        if exists {
            debug!(resource = %resource.display_name(), path = %path.display(), "Resource already present");
            return Ok(Ensured::Existing);
        }

        self.create_out_dir().await?;
        let yaml = serde_yaml::to_string(resource).map_err(|source| ProvisionError::Yaml {
            path: path.clone(),
            source,
        })?;
        write_file(&path, yaml).await?;

        info!(resource = %resource.display_name(), path = %path.display(), "Resource created");
        Ok(Ensured::Created)
    }

    async fn install_or_upgrade(
        &self,
        chart: &ChartRef,
        values: serde_yaml::Value,
    ) -> Result<ReleaseInfo, ProvisionError> {
        let path = self.release_path(chart)?;

        let previous = match tokio::fs::read_to_string(&path).await {
            Ok(existing) => Some(
                serde_yaml::from_str::<ReleaseInfo>(&existing).map_err(|source| {
                    ProvisionError::Yaml {
                        path: path.clone(),
                        source,
                    }
                })?,
            ),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(source) => return Err(ProvisionError::Io { path, source }),
        };

        let revision = previous.as_ref().map_or(1, |r| r.revision.saturating_add(1));
        let release = ReleaseInfo {
            name: chart.name.clone(),
            namespace: chart.namespace.clone(),
            chart: chart.oci_reference(),
            revision,
            values,
        };

        self.create_out_dir().await?;
        let yaml = serde_yaml::to_string(&release).map_err(|source| ProvisionError::Yaml {
            path: path.clone(),
            source,
        })?;
        write_file(&path, yaml).await?;

        if previous.is_some() {
            info!(release = %release.name, revision, chart = %release.chart, "Release upgraded");
        } else {
            info!(release = %release.name, chart = %release.chart, "Release installed");
        }
        Ok(release)
    }
}

async fn write_file(path: &Path, contents: String) -> Result<(), ProvisionError> {
    tokio::fs::write(path, contents)
        .await
        .map_err(|source| ProvisionError::Io {
            path: path.to_path_buf(),
            source,
        })
}

/// Names end up in file names; allow DNS-label style names only
fn validate_name(name: &str) -> Result<(), ProvisionError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
        && !name.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(ProvisionError::InvalidName(name.to_string()))
    }
}
