//! Upload coordination.
//!
//! Per attempt: derive the object address from the nonce, run the credential
//! pre-flight for signed packages, then either transfer now or hand the
//! package and its commands over for a later replay. Nothing is retried.
//!
//! ```text
//! Validated -> Signed | Unsigned -> (CredentialChecked) -> Transferred | Deferred
//! ```
//!
//! A deferred package is replayed either from its side-car descriptor
//! ([`replay_deferred`]) or by rebuilding the commands from local settings
//! ([`Uploader::upload_package`]). Both keep the signing trailer on the
//! package until the transfer succeeds, so a failed replay can be rerun.

pub mod descriptor;
pub mod metadata;
pub mod transport;

pub use descriptor::{sidecar_path, DeferredDescriptor};
pub use metadata::{build_header, object_address, MetadataFields};
pub use transport::{AwsTransport, GcloudTransport, Transport};

use crate::command::{CommandError, CommandRunner, CommandSpec};
use crate::config::ConfigError;
use crate::crypto::{random_nonce, CryptoData};
use crate::trailer::{append_trailer, extract_trailer, read_trailer, TrailerError};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Substring of the checker's response signalling rejected credentials.
pub const REJECTION_MARKER: &str = "Unhandled";

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("upload credentials rejected by the service; check TRACEDROP_USER_SECRET_KEY")]
    InvalidCredentials { response: String },

    #[error("credential check could not run: {0}")]
    CredentialCheck(#[source] CommandError),

    #[error("transfer failed with status {code:?}: {stderr}")]
    Transfer { code: Option<i32>, stderr: String },

    #[error("{operation} is not supported with {provider}")]
    Unsupported {
        provider: &'static str,
        operation: &'static str,
    },

    #[error("{provider} is not logged in; {hint}")]
    NotLoggedIn {
        provider: &'static str,
        hint: &'static str,
    },

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Trailer(#[from] TrailerError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("descriptor is not valid JSON: {0}")]
    Descriptor(#[from] serde_json::Error),

    #[error("malformed descriptor: {0}")]
    MalformedDescriptor(String),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl UploadError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidCredentials { .. } => 3,
            Self::Transfer { .. } | Self::CredentialCheck(_) | Self::Command(_) => 1,
            Self::Trailer(e) => e.exit_code(),
            Self::Unsupported { .. } | Self::NotLoggedIn { .. } | Self::Config(_) => 6,
            Self::Descriptor(_) | Self::MalformedDescriptor(_) | Self::Io { .. } => 7,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadMode {
    Immediate,
    /// Copy the package to `path` and record the commands next to it.
    Deferred { path: PathBuf },
}

#[derive(Debug, Clone)]
pub struct UploadRequest<'a> {
    pub package: &'a Path,
    pub crypto: Option<&'a CryptoData>,
    pub fields: &'a MetadataFields,
    pub mode: UploadMode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Transferred {
        address: String,
        header: String,
    },
    Deferred {
        address: String,
        header: String,
        package: PathBuf,
        descriptor: PathBuf,
    },
}

impl UploadOutcome {
    pub fn address(&self) -> &str {
        match self {
            Self::Transferred { address, .. } | Self::Deferred { address, .. } => address,
        }
    }

    pub fn header(&self) -> &str {
        match self {
            Self::Transferred { header, .. } | Self::Deferred { header, .. } => header,
        }
    }
}

pub struct Uploader<'a> {
    runner: &'a dyn CommandRunner,
    transport: &'a dyn Transport,
    base: String,
}

impl<'a> Uploader<'a> {
    pub fn new(runner: &'a dyn CommandRunner, transport: &'a dyn Transport) -> Self {
        Self {
            runner,
            transport,
            base: transport.default_base().to_string(),
        }
    }

    pub fn with_base(mut self, base: impl Into<String>) -> Self {
        self.base = base.into();
        self
    }

    pub async fn upload(&self, request: UploadRequest<'_>) -> Result<UploadOutcome, UploadError> {
        let nonce = match request.crypto {
            Some(crypto) => crypto.nonce.clone(),
            None => random_nonce(),
        };
        let address = object_address(&self.base, &nonce);
        let header = build_header(request.crypto, request.fields);
        let checker = request
            .crypto
            .map(|crypto| {
                self.transport
                    .checker_command(&metadata::credential_payload(crypto, request.fields))
            })
            .transpose()?;

        match request.mode {
            UploadMode::Immediate => {
                if let Some(checker) = &checker {
                    check_credentials(self.runner, checker).await?;
                }
                let upload = self
                    .transport
                    .upload_command(&header, request.package, &address);
                transfer(self.runner, &upload).await?;
                tracing::info!(address = %address, "upload complete");
                Ok(UploadOutcome::Transferred { address, header })
            }
            UploadMode::Deferred { path } => {
                fs::copy(request.package, &path).map_err(|source| UploadError::Io {
                    path: path.display().to_string(),
                    source,
                })?;

                let upload = self.transport.upload_command(&header, &path, &address);
                let descriptor = sidecar_path(&path);
                DeferredDescriptor::new(checker.as_ref(), &upload).write(&descriptor)?;

                if let Some(crypto) = request.crypto {
                    append_trailer(&path, crypto)?;
                }
                tracing::info!(
                    package = %path.display(),
                    descriptor = %descriptor.display(),
                    "upload deferred"
                );
                Ok(UploadOutcome::Deferred {
                    address,
                    header,
                    package: path,
                    descriptor,
                })
            }
        }
    }

    /// Replay a deferred package with commands rebuilt from `fields` and
    /// this uploader's transport.
    ///
    /// The trailer is stripped only for the duration of the attempt; on
    /// failure it is appended again.
    pub async fn upload_package(
        &self,
        package: &Path,
        fields: &MetadataFields,
        unsigned: bool,
    ) -> Result<UploadOutcome, UploadError> {
        if unsigned {
            return self
                .upload(UploadRequest {
                    package,
                    crypto: None,
                    fields,
                    mode: UploadMode::Immediate,
                })
                .await;
        }

        let (crypto, _) = read_trailer(package)?;
        // Providers without a credential check refuse before the package changes.
        self.transport.checker_command(&metadata::credential_payload(&crypto, fields))?;

        extract_trailer(package)?;
        let result = self
            .upload(UploadRequest {
                package,
                crypto: Some(&crypto),
                fields,
                mode: UploadMode::Immediate,
            })
            .await;
        restore_on_failure(package, &crypto, result)
    }
}

/// Replay a deferred upload exactly as recorded in `descriptor`.
///
/// Header, destination and environment all come from the descriptor, so
/// the replaying principal needs no operator configuration of its own. The
/// recorded upload body is redirected to `package`.
pub async fn replay_deferred(
    runner: &dyn CommandRunner,
    package: &Path,
    descriptor: &DeferredDescriptor,
) -> Result<UploadOutcome, UploadError> {
    let (checker, upload) = descriptor.commands_for(package)?;
    let address = descriptor.address()?.to_string();
    let header = descriptor.header()?.to_string();

    match checker {
        Some(checker) => {
            let (crypto, _) = read_trailer(package)?;
            extract_trailer(package)?;
            let result = async {
                check_credentials(runner, &checker).await?;
                transfer(runner, &upload).await
            }
            .await;
            restore_on_failure(package, &crypto, result)?;
        }
        None => transfer(runner, &upload).await?,
    }

    tracing::info!(address = %address, "deferred upload replayed");
    Ok(UploadOutcome::Transferred { address, header })
}

/// Put the trailer back after a failed attempt so the package stays replayable.
fn restore_on_failure<T>(
    package: &Path,
    crypto: &CryptoData,
    result: Result<T, UploadError>,
) -> Result<T, UploadError> {
    if result.is_err() {
        if let Err(e) = append_trailer(package, crypto) {
            tracing::error!(
                package = %package.display(),
                error = %e,
                "failed to restore signing trailer"
            );
        }
    }
    result
}

async fn check_credentials(
    runner: &dyn CommandRunner,
    checker: &CommandSpec,
) -> Result<(), UploadError> {
    let output = runner
        .run(checker)
        .await
        .map_err(UploadError::CredentialCheck)?;
    let output = CommandError::check(checker, output).map_err(UploadError::CredentialCheck)?;

    let response = output.stdout_lossy();
    if response.contains(REJECTION_MARKER) {
        return Err(UploadError::InvalidCredentials { response });
    }
    tracing::debug!("credentials accepted");
    Ok(())
}

async fn transfer(runner: &dyn CommandRunner, upload: &CommandSpec) -> Result<(), UploadError> {
    let output = runner.run(upload).await?;
    if !output.success() {
        return Err(UploadError::Transfer {
            code: output.code,
            stderr: output.stderr_lossy().trim().to_string(),
        });
    }
    Ok(())
}
