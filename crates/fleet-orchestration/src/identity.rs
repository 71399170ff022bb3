//! Host identity material
//!
//! [`NebulaCert`] signs host certificates with the `nebula-cert` tool and keeps
//! them next to each other in one output directory as
//! `<type>-<hostname>.crt` and `<type>-<hostname>.key`.

use async_trait::async_trait;
use command_executor::{Command, Executor};
use nebula_config::Role;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::{Error, Result};

/// What to issue a certificate for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityRequest {
    /// Certificate name
    pub hostname: String,
    /// Host or lighthouse
    pub role: Role,
    /// Mesh address the certificate binds to
    pub ip: IpAddr,
    /// Mesh subnet prefix length
    pub prefix: u8,
    /// Groups embedded in the certificate
    pub groups: Vec<String>,
}

/// The three files every host needs
#[derive(Clone, PartialEq, Eq)]
pub struct IdentityMaterial {
    /// CA certificate
    pub ca_cert: String,
    /// Host certificate
    pub host_cert: String,
    /// Host private key
    pub host_key: String,
}

impl std::fmt::Debug for IdentityMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityMaterial")
            .field("ca_cert", &self.ca_cert.len())
            .field("host_cert", &self.host_cert.len())
            .field("host_key", &"<redacted>")
            .finish()
    }
}

/// Issues and reads host identities
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Whether a certificate and key already exist for this host
    fn has_identity(&self, role: Role, hostname: &str) -> bool;

    /// Issue a fresh certificate and key, replacing any existing pair
    async fn issue(&self, request: &IdentityRequest) -> Result<()>;

    /// Read the CA certificate and the host's pair
    async fn material(&self, role: Role, hostname: &str) -> Result<IdentityMaterial>;
}

/// Signs certificates with `nebula-cert`
#[derive(Debug, Clone)]
pub struct NebulaCert {
    binary: PathBuf,
    ca_cert: PathBuf,
    ca_key: PathBuf,
    output_dir: PathBuf,
}

impl NebulaCert {
    /// Sign with the given CA into `output_dir`
    pub fn new(
        ca_cert: impl Into<PathBuf>,
        ca_key: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            binary: PathBuf::from("nebula-cert"),
            ca_cert: ca_cert.into(),
            ca_key: ca_key.into(),
            output_dir: output_dir.into(),
        }
    }

    /// Use a specific `nebula-cert` binary
    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Where the host certificate lives
    pub fn cert_path(&self, role: Role, hostname: &str) -> PathBuf {
        self.output_dir.join(format!("{}-{}.crt", role, hostname))
    }

    /// Where the host key lives
    pub fn key_path(&self, role: Role, hostname: &str) -> PathBuf {
        self.output_dir.join(format!("{}-{}.key", role, hostname))
    }

    /// The `nebula-cert sign` invocation for `request`
    pub fn sign_command(&self, request: &IdentityRequest) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("sign")
            .arg("-name")
            .arg(&request.hostname)
            .arg("-ip")
            .arg(format!("{}/{}", request.ip, request.prefix))
            .arg("-ca-crt")
            .arg(&self.ca_cert)
            .arg("-ca-key")
            .arg(&self.ca_key)
            .arg("-out-crt")
            .arg(self.cert_path(request.role, &request.hostname))
            .arg("-out-key")
            .arg(self.key_path(request.role, &request.hostname));
        if !request.groups.is_empty() {
            cmd.arg("-groups").arg(request.groups.join(","));
        }
        cmd
    }
}

#[async_trait]
impl IdentityProvider for NebulaCert {
    fn has_identity(&self, role: Role, hostname: &str) -> bool {
        self.cert_path(role, hostname).is_file() && self.key_path(role, hostname).is_file()
    }

    async fn issue(&self, request: &IdentityRequest) -> Result<()> {
        async_fs::create_dir_all(&self.output_dir).await?;

        // nebula-cert refuses to overwrite existing output
        for path in [
            self.cert_path(request.role, &request.hostname),
            self.key_path(request.role, &request.hostname),
        ] {
            remove_if_present(&path).await?;
        }

        info!(host = %request.hostname, ip = %request.ip, "issuing certificate");
        let result = Executor::local("nebula-cert")
            .execute(self.sign_command(request))
            .await?;
        if !result.success() {
            return Err(Error::Identity(format!(
                "nebula-cert sign for {} exited with {}: {}",
                request.hostname,
                result.code(),
                result.stderr.trim()
            )));
        }
        debug!(host = %request.hostname, "certificate issued");
        Ok(())
    }

    async fn material(&self, role: Role, hostname: &str) -> Result<IdentityMaterial> {
        Ok(IdentityMaterial {
            ca_cert: read(&self.ca_cert).await?,
            host_cert: read(&self.cert_path(role, hostname)).await?,
            host_key: read(&self.key_path(role, hostname)).await?,
        })
    }
}

async fn remove_if_present(path: &Path) -> Result<()> {
    match async_fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn read(path: &Path) -> Result<String> {
    async_fs::read_to_string(path)
        .await
        .map_err(|e| Error::Identity(format!("cannot read {}: {}", path.display(), e)))
}
