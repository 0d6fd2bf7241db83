//! Side-car descriptor for deferred uploads.
//!
//! Written as `<package>.cmd` next to the deferred package, owner-only since
//! the environment carries cloud credentials.

use super::UploadError;
use crate::command::CommandSpec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeferredDescriptor {
    /// Absent for unsigned uploads, which skip the credential check.
    pub checker_cmd: Option<Vec<String>>,
    pub upload_cmd: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl DeferredDescriptor {
    pub fn new(checker: Option<&CommandSpec>, upload: &CommandSpec) -> Self {
        let mut env = upload.env.clone();
        if let Some(checker) = checker {
            env.extend(checker.env.clone());
        }
        Self {
            checker_cmd: checker.map(|c| c.argv.clone()),
            upload_cmd: upload.argv.clone(),
            env,
        }
    }

    /// The recorded commands with the upload body redirected to `body`,
    /// each carrying the recorded environment.
    pub fn commands_for(
        &self,
        body: &Path,
    ) -> Result<(Option<CommandSpec>, CommandSpec), UploadError> {
        let mut argv = self.upload_cmd.clone();
        let Some(body_arg) = argv.len().checked_sub(2).and_then(|i| argv.get_mut(i)) else {
            return Err(UploadError::MalformedDescriptor(
                "upload command has no body and destination".into(),
            ));
        };
        *body_arg = body.to_string_lossy().into_owned();

        let checker = self
            .checker_cmd
            .as_ref()
            .map(|argv| CommandSpec::new(argv.clone()).with_env(self.env.clone()));
        let upload = CommandSpec::new(argv).with_env(self.env.clone());
        Ok((checker, upload))
    }

    /// Destination of the recorded upload.
    pub fn address(&self) -> Result<&str, UploadError> {
        self.upload_cmd
            .last()
            .map(String::as_str)
            .ok_or_else(|| UploadError::MalformedDescriptor("empty upload command".into()))
    }

    /// Metadata header of the recorded upload: the value after the
    /// provider's `--*metadata` flag.
    pub fn header(&self) -> Result<&str, UploadError> {
        self.upload_cmd
            .iter()
            .position(|arg| arg.starts_with("--") && arg.ends_with("metadata"))
            .and_then(|i| self.upload_cmd.get(i + 1))
            .map(String::as_str)
            .ok_or_else(|| UploadError::MalformedDescriptor("upload command has no header".into()))
    }

    pub fn write(&self, path: &Path) -> Result<(), UploadError> {
        let io_err = |source| UploadError::Io {
            path: path.display().to_string(),
            source,
        };
        let json = serde_json::to_vec_pretty(self)?;

        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(path).map_err(io_err)?;
        file.write_all(&json).map_err(io_err)?;
        file.write_all(b"\n").map_err(io_err)?;
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self, UploadError> {
        let json = fs::read(path).map_err(|source| UploadError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(serde_json::from_slice(&json)?)
    }
}

/// `<package>.cmd`
pub fn sidecar_path(package: &Path) -> PathBuf {
    let mut name = package.as_os_str().to_owned();
    name.push(".cmd");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sidecar_path_appends_suffix() {
        assert_eq!(
            sidecar_path(Path::new("/tmp/dry-run")),
            PathBuf::from("/tmp/dry-run.cmd")
        );
    }

    #[test]
    fn test_json_shape() {
        let mut env = BTreeMap::new();
        env.insert("AWS_DEFAULT_REGION".to_string(), "us-east-2".to_string());
        let upload = CommandSpec::new(["aws", "s3", "cp"]).with_env(env);
        let descriptor = DeferredDescriptor::new(None, &upload);

        let value = serde_json::to_value(&descriptor).unwrap();
        assert!(value["checkerCmd"].is_null());
        assert_eq!(value["uploadCmd"][2], "cp");
        assert_eq!(value["env"]["AWS_DEFAULT_REGION"], "us-east-2");
    }

    #[cfg(unix)]
    #[test]
    fn test_written_owner_only_and_reads_back() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("pkg.cmd");
        let descriptor = DeferredDescriptor::new(
            Some(&CommandSpec::new(["aws", "lambda", "invoke"])),
            &CommandSpec::new(["aws", "s3", "cp"]),
        );
        descriptor.write(&path).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(DeferredDescriptor::read(&path).unwrap(), descriptor);
    }

    #[test]
    fn test_commands_redirect_body_and_keep_env() {
        let mut env = BTreeMap::new();
        env.insert("AWS_ACCESS_KEY_ID".to_string(), "FAKE_KEY_ID".to_string());
        let descriptor = DeferredDescriptor::new(
            Some(&CommandSpec::new(["aws", "lambda", "invoke"]).with_env(env.clone())),
            &CommandSpec::new([
                "aws",
                "s3",
                "cp",
                "--metadata",
                "user=u,group=g",
                "/old/dry-run",
                "s3://bucket/abc.tar.zst",
            ])
            .with_env(env),
        );

        let (checker, upload) = descriptor.commands_for(Path::new("/new/pkg")).unwrap();
        assert_eq!(checker.unwrap().env["AWS_ACCESS_KEY_ID"], "FAKE_KEY_ID");
        assert_eq!(upload.argv[5], "/new/pkg");
        assert_eq!(upload.argv[6], "s3://bucket/abc.tar.zst");
        assert_eq!(upload.env["AWS_ACCESS_KEY_ID"], "FAKE_KEY_ID");
        assert_eq!(descriptor.header().unwrap(), "user=u,group=g");
        assert_eq!(descriptor.address().unwrap(), "s3://bucket/abc.tar.zst");
    }

    #[test]
    fn test_gcloud_header_flag_is_found() {
        let descriptor = DeferredDescriptor::new(
            None,
            &CommandSpec::new(["gcloud", "storage", "cp", "--custom-metadata", "h", "b", "a"]),
        );
        assert_eq!(descriptor.header().unwrap(), "h");
    }

    #[test]
    fn test_truncated_upload_command_is_malformed() {
        let descriptor = DeferredDescriptor::new(None, &CommandSpec::new(["aws"]));
        assert!(matches!(
            descriptor.commands_for(Path::new("/pkg")),
            Err(UploadError::MalformedDescriptor(_))
        ));
        assert!(matches!(descriptor.header(), Err(UploadError::MalformedDescriptor(_))));
    }
}
