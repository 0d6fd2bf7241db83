//! Cloud CLI command construction.

use super::UploadError;
use crate::command::{CommandError, CommandRunner, CommandSpec};
use crate::config::{CloudCredentials, ConfigStore, OperatorConfig, KEY_USER};
use std::collections::BTreeMap;
use std::path::Path;

pub const AWS_DEFAULT_BASE: &str = "s3://tracedrop-upload";
pub const GCLOUD_DEFAULT_BASE: &str = "gs://tracedrop-upload";
pub const AWS_REGION: &str = "us-east-2";
pub const AWS_ACCELERATE_ENDPOINT: &str = "https://s3-accelerate.amazonaws.com";
pub const CREDENTIAL_CHECK_FUNCTION: &str = "upload-credential-check";
pub const DEFAULT_CHECKER_QUALIFIER: &str = "PROD";
pub const GCLOUD_DEFAULT_GROUP: &str = "tracedrop-users";

/// Builds the commands for one object-store provider.
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Destination base used when the operator configured none.
    fn default_base(&self) -> &'static str;

    /// Variables the commands need on top of the inherited environment.
    fn env_overlay(&self) -> BTreeMap<String, String>;

    /// Command verifying the operator's key with the service. `payload` is
    /// the `publickey=..,user=..,group=..` request body.
    fn checker_command(&self, payload: &str) -> Result<CommandSpec, UploadError>;

    /// Transfer command. Its argv ends with `<body> <address>` and carries
    /// `header` right after a `--*metadata` flag; deferred replays rely on
    /// that layout.
    fn upload_command(&self, header: &str, body: &Path, address: &str) -> CommandSpec;
}

#[derive(Debug, Clone)]
pub struct AwsTransport {
    credentials: Option<CloudCredentials>,
    qualifier: String,
    cli_v2: bool,
    transfer_acceleration: bool,
}

impl AwsTransport {
    pub fn new(credentials: Option<CloudCredentials>, cli_v2: bool) -> Self {
        Self {
            credentials,
            qualifier: DEFAULT_CHECKER_QUALIFIER.to_string(),
            cli_v2,
            transfer_acceleration: false,
        }
    }

    /// Build from operator config, asking `aws --version` which CLI
    /// generation is installed.
    pub async fn detect(
        runner: &dyn CommandRunner,
        config: &OperatorConfig,
    ) -> Result<Self, UploadError> {
        let spec = CommandSpec::new(["aws", "--version"]);
        let output = CommandError::check(&spec, runner.run(&spec).await?)?;
        // v1 printed its version on stderr
        let version = format!("{}{}", output.stdout_lossy(), output.stderr_lossy());
        let cli_v2 = version.trim_start().starts_with("aws-cli/2.");
        tracing::debug!(cli_v2, "detected aws cli");

        let mut transport = Self::new(config.cloud_credentials().cloned(), cli_v2);
        if let Some(qualifier) = &config.credential_checker {
            transport = transport.with_qualifier(qualifier.clone());
        }
        Ok(transport)
    }

    pub fn with_qualifier(mut self, qualifier: impl Into<String>) -> Self {
        self.qualifier = qualifier.into();
        self
    }

    pub fn with_transfer_acceleration(mut self, enabled: bool) -> Self {
        self.transfer_acceleration = enabled;
        self
    }
}

impl Transport for AwsTransport {
    fn name(&self) -> &'static str {
        "aws"
    }

    fn default_base(&self) -> &'static str {
        AWS_DEFAULT_BASE
    }

    fn env_overlay(&self) -> BTreeMap<String, String> {
        let mut env: BTreeMap<String, String> = BTreeMap::new();
        if let Some(creds) = &self.credentials {
            env.insert("AWS_DEFAULT_REGION".into(), AWS_REGION.into());
            env.insert("AWS_ACCESS_KEY_ID".into(), creds.access_key_id.clone());
            env.insert(
                "AWS_SECRET_ACCESS_KEY".into(),
                creds.secret_access_key.clone(),
            );
        }
        env
    }

    fn checker_command(&self, payload: &str) -> Result<CommandSpec, UploadError> {
        let mut argv: Vec<String> = [
            "aws",
            "lambda",
            "invoke",
            "--function-name",
            CREDENTIAL_CHECK_FUNCTION,
            "--qualifier",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        argv.push(self.qualifier.clone());
        if self.cli_v2 {
            argv.extend(["--cli-binary-format".to_string(), "raw-in-base64-out".to_string()]);
        }
        argv.extend([
            "--payload".to_string(),
            format!("\"{payload}\""),
            "/dev/null".to_string(),
        ]);
        Ok(CommandSpec::new(argv).with_env(self.env_overlay()))
    }

    fn upload_command(&self, header: &str, body: &Path, address: &str) -> CommandSpec {
        let mut argv = vec![
            "aws".to_string(),
            "s3".into(),
            "cp".into(),
            "--metadata".into(),
            header.to_string(),
        ];
        if self.transfer_acceleration {
            argv.extend([
                "--endpoint-url".to_string(),
                AWS_ACCELERATE_ENDPOINT.to_string(),
            ]);
        }
        argv.extend([body.to_string_lossy().into_owned(), address.to_string()]);
        CommandSpec::new(argv).with_env(self.env_overlay())
    }
}

/// Google Cloud Storage. The hosted credential check only exists on AWS,
/// so signed uploads are refused.
#[derive(Debug, Clone, Copy, Default)]
pub struct GcloudTransport;

impl GcloudTransport {
    /// Operator identity for gcloud: the configured user, else the active
    /// `gcloud` account; the group is fixed.
    pub async fn resolve_identity(
        runner: &dyn CommandRunner,
        store: &dyn ConfigStore,
    ) -> Result<(String, String), UploadError> {
        if let Some(user) = store.get(KEY_USER)?.filter(|u| !u.is_empty()) {
            return Ok((user, GCLOUD_DEFAULT_GROUP.to_string()));
        }

        let spec = CommandSpec::new([
            "gcloud",
            "config",
            "list",
            "account",
            "--format",
            "value(core.account)",
        ]);
        let output = CommandError::check(&spec, runner.run(&spec).await?)?;
        let user = output.stdout_lossy().trim().to_string();
        if user.is_empty() {
            return Err(UploadError::NotLoggedIn {
                provider: "gcloud",
                hint: "run `gcloud auth login`",
            });
        }
        Ok((user, GCLOUD_DEFAULT_GROUP.to_string()))
    }
}

impl Transport for GcloudTransport {
    fn name(&self) -> &'static str {
        "gcloud"
    }

    fn default_base(&self) -> &'static str {
        GCLOUD_DEFAULT_BASE
    }

    fn env_overlay(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    fn checker_command(&self, _payload: &str) -> Result<CommandSpec, UploadError> {
        Err(UploadError::Unsupported {
            provider: "gcloud",
            operation: "credential check",
        })
    }

    fn upload_command(&self, header: &str, body: &Path, address: &str) -> CommandSpec {
        CommandSpec::new([
            "gcloud".to_string(),
            "storage".into(),
            "cp".into(),
            "--custom-metadata".into(),
            header.to_string(),
            body.to_string_lossy().into_owned(),
            address.to_string(),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> CloudCredentials {
        CloudCredentials {
            access_key_id: "FAKE_KEY_ID".into(),
            secret_access_key: "FAKE_CRED".into(),
        }
    }

    #[test]
    fn test_aws_checker_v2_flags() {
        let spec = AwsTransport::new(Some(creds()), true)
            .with_qualifier("STAGING")
            .checker_command("publickey=K,user=u,group=g")
            .unwrap();
        assert_eq!(
            spec.argv,
            vec![
                "aws",
                "lambda",
                "invoke",
                "--function-name",
                "upload-credential-check",
                "--qualifier",
                "STAGING",
                "--cli-binary-format",
                "raw-in-base64-out",
                "--payload",
                "\"publickey=K,user=u,group=g\"",
                "/dev/null",
            ]
        );
        assert_eq!(spec.env["AWS_DEFAULT_REGION"], "us-east-2");
    }

    #[test]
    fn test_aws_checker_v1_has_no_binary_format() {
        let spec = AwsTransport::new(None, false).checker_command("p").unwrap();
        assert!(!spec.argv.iter().any(|a| a == "--cli-binary-format"));
        assert!(spec.env.is_empty());
    }

    #[test]
    fn test_aws_upload_with_acceleration() {
        let spec = AwsTransport::new(Some(creds()), true)
            .with_transfer_acceleration(true)
            .upload_command("user=u", Path::new("/tmp/p.tar.zst"), "s3://b/n.tar.zst");
        assert_eq!(
            spec.argv,
            vec![
                "aws",
                "s3",
                "cp",
                "--metadata",
                "user=u",
                "--endpoint-url",
                "https://s3-accelerate.amazonaws.com",
                "/tmp/p.tar.zst",
                "s3://b/n.tar.zst",
            ]
        );
        assert_eq!(spec.env["AWS_ACCESS_KEY_ID"], "FAKE_KEY_ID");
        assert_eq!(spec.env["AWS_SECRET_ACCESS_KEY"], "FAKE_CRED");
    }

    #[test]
    fn test_gcloud_refuses_credential_check() {
        assert!(matches!(
            GcloudTransport.checker_command("p"),
            Err(UploadError::Unsupported { .. })
        ));
        let spec = GcloudTransport.upload_command("h", Path::new("f"), "gs://b/n.tar.zst");
        assert_eq!(spec.argv[..4], ["gcloud", "storage", "cp", "--custom-metadata"]);
    }
}
