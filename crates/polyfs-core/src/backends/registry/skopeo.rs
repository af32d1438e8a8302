//! `skopeo`-compatible helper session.
//!
//! The helper itself is stateless; the session pins the credentials, TLS
//! policy and proxy for one realm so every invocation under a lock uses the
//! same identity.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use polyfs_types::Address;
use serde::Deserialize;
use tracing::debug;

use crate::command::{CommandOutput, CommandRunner, CommandSpec};
use crate::error::{FsError, FsResult};
use crate::pool::{Connection, Connector};

/// Fragments of helper stderr that mean the registry refused our identity.
const AUTH_MARKERS: &[&str] = &[
    "unauthorized",
    "authentication required",
    "requested access to the resource is denied",
    "invalid username/password",
    "401",
];

/// Image metadata as printed by `inspect`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageInfo {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub digest: Option<String>,
    #[serde(default)]
    pub created: Option<DateTime<Utc>>,
    #[serde(default)]
    pub layers: Vec<String>,
    #[serde(default)]
    pub layers_data: Option<Vec<LayerData>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LayerData {
    #[serde(rename = "MIMEType", default)]
    pub mime_type: Option<String>,
    #[serde(rename = "Digest")]
    pub digest: String,
    #[serde(rename = "Size", default)]
    pub size: Option<i64>,
}

/// A layer to expose, with whatever size the helper reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerInfo {
    pub digest: String,
    pub size: Option<i64>,
}

impl LayerInfo {
    /// Blob file name in a `dir:` copy: the digest without its algorithm.
    pub fn blob_name(&self) -> &str {
        self.digest
            .split_once(':')
            .map_or(self.digest.as_str(), |(_, hex)| hex)
    }
}

impl ImageInfo {
    /// Layers in image order. `LayersData` wins when present since it carries
    /// sizes.
    pub fn layer_list(&self) -> Vec<LayerInfo> {
        match &self.layers_data {
            Some(data) if !data.is_empty() => data
                .iter()
                .map(|l| LayerInfo {
                    digest: l.digest.clone(),
                    size: l.size,
                })
                .collect(),
            _ => self
                .layers
                .iter()
                .map(|digest| LayerInfo {
                    digest: digest.clone(),
                    size: None,
                })
                .collect(),
        }
    }
}

/// Helper transport reference for an image address.
///
/// `docker://host[:port]/repo:tag` keeps its form; the `type` property picks
/// another transport (`oci`, `docker-archive`, ...) whose reference is the
/// address path.
pub fn image_reference(address: &Address) -> String {
    let transport = address.property("type").unwrap_or(address.scheme());
    match transport {
        "docker" => {
            let port = address.port().map(|p| format!(":{p}")).unwrap_or_default();
            format!("docker://{}{port}{}", address.host(), address.path())
        }
        other => format!("{other}:{}", address.path()),
    }
}

fn tls_verify(address: &Address) -> Option<bool> {
    address.property("tls-verify").and_then(|v| v.parse().ok())
}

/// One realm's helper identity.
#[derive(Debug)]
pub struct SkopeoSession {
    runner: Arc<dyn CommandRunner>,
    program: String,
    address: Address,
    creds: Option<String>,
}

impl SkopeoSession {
    fn command(&self, verb: &str) -> CommandSpec {
        let spec = CommandSpec::new(&self.program).arg(verb);
        match self.address.property("proxy") {
            Some(proxy) => spec.env("HTTPS_PROXY", proxy).env("HTTP_PROXY", proxy),
            None => spec,
        }
    }

    async fn run(&self, command: CommandSpec) -> FsResult<CommandOutput> {
        let output = self.runner.run(&command).await?;
        if output.success() {
            return Ok(output);
        }
        Err(self.classify_failure(&command, &output))
    }

    /// Auth-looking failures become authentication errors, the rest I/O.
    fn classify_failure(&self, command: &CommandSpec, output: &CommandOutput) -> FsError {
        let stderr = output.stderr.trim();
        let lowered = stderr.to_lowercase();
        if AUTH_MARKERS.iter().any(|m| lowered.contains(m)) {
            return match self.creds {
                Some(_) => FsError::auth_rejected(&self.address, stderr),
                None => FsError::auth_required(&self.address),
            };
        }
        let status = output
            .status
            .map_or_else(|| "a signal".to_string(), |s| s.to_string());
        FsError::backend(format!("{command} exited with {status}: {stderr}"))
    }

    /// `inspect` the image's manifest and config.
    pub async fn inspect(&self, image: &Address) -> FsResult<ImageInfo> {
        let mut command = self.command("inspect");
        if let Some(creds) = &self.creds {
            command = command.arg("--creds").arg(creds);
        }
        if let Some(verify) = tls_verify(image) {
            command = command.arg(format!("--tls-verify={verify}"));
        }
        let output = self.run(command.arg(image_reference(image))).await?;
        serde_json::from_slice(&output.stdout)
            .map_err(|e| FsError::backend(format!("unreadable inspect output for {image}: {e}")))
    }

    /// Copy the image into `dest` in `dir:` layout (one file per blob).
    pub async fn copy_to_dir(&self, image: &Address, dest: &Path) -> FsResult<()> {
        let mut command = self.command("copy");
        if let Some(creds) = &self.creds {
            command = command.arg("--src-creds").arg(creds);
        }
        if let Some(verify) = tls_verify(image) {
            command = command.arg(format!("--src-tls-verify={verify}"));
        }
        command = command
            .arg(image_reference(image))
            .arg(format!("dir:{}", dest.display()));
        self.run(command).await?;
        debug!(image = %image, dest = %dest.display(), "image copied");
        Ok(())
    }
}

#[async_trait]
impl Connection for SkopeoSession {
    async fn keep_alive(&mut self) -> FsResult<()> {
        Ok(())
    }
}

/// Opens [`SkopeoSession`]s after checking the helper runs at all.
#[derive(Debug)]
pub struct SkopeoConnector {
    runner: Arc<dyn CommandRunner>,
    program: String,
}

impl SkopeoConnector {
    pub fn new(runner: Arc<dyn CommandRunner>, program: impl Into<String>) -> Self {
        Self {
            runner,
            program: program.into(),
        }
    }
}

#[async_trait]
impl Connector<SkopeoSession> for SkopeoConnector {
    async fn connect(&self, address: &Address) -> FsResult<SkopeoSession> {
        let version = CommandSpec::new(&self.program).arg("--version");
        let output = self.runner.run(&version).await?;
        if !output.success() {
            return Err(FsError::backend(format!(
                "{} is not usable: {}",
                self.program,
                output.stderr.trim()
            )));
        }
        let creds = address.credentials().map(|c| match c.password() {
            Some(password) => format!("{}:{password}", c.login()),
            None => c.login().to_string(),
        });
        Ok(SkopeoSession {
            runner: self.runner.clone(),
            program: self.program.clone(),
            address: address.root(),
            creds,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_reference() {
        let docker = Address::parse("docker://registry.local:5000/library/alpine:3.19").unwrap();
        assert_eq!(
            image_reference(&docker),
            "docker://registry.local:5000/library/alpine:3.19"
        );

        let oci = Address::parse("oci:///srv/layouts/app:1.0").unwrap();
        assert_eq!(image_reference(&oci), "oci:/srv/layouts/app:1.0");

        let archive =
            Address::parse("docker://;type=docker-archive/tmp/image.tar").unwrap();
        assert_eq!(image_reference(&archive), "docker-archive:/tmp/image.tar");
    }

    #[test]
    fn test_inspect_json() {
        let json = r#"{
            "Name": "registry.local/app",
            "Digest": "sha256:aaaa",
            "Created": "2024-05-01T10:00:00Z",
            "Layers": ["sha256:1111", "sha256:2222"],
            "LayersData": [
                {"MIMEType": "application/vnd.oci.image.layer.v1.tar+gzip", "Digest": "sha256:1111", "Size": 10},
                {"MIMEType": "application/vnd.oci.image.layer.v1.tar", "Digest": "sha256:2222", "Size": 20}
            ]
        }"#;
        let info: ImageInfo = serde_json::from_str(json).unwrap();
        let layers = info.layer_list();
        assert_eq!(layers.len(), 2);
        assert_eq!(layers[1].size, Some(20));
        assert_eq!(layers[0].blob_name(), "1111");
        assert!(info.created.is_some());

        let bare: ImageInfo = serde_json::from_str(r#"{"Layers": ["sha256:33"]}"#).unwrap();
        assert_eq!(bare.layer_list()[0].size, None);
    }
}
