//! Streaming compress-and-sign pipeline.
//!
//! ```text
//!   archive ──A──▶ tee ──▶ payload file
//!                   │
//!                   └──B──▶ sha256 + ECDSA P-256 ──▶ signature
//! ```
//!
//! Streams A and B are bounded, so no stage ever holds the whole trace. The
//! bytes on disk and the bytes signed come from the same stream, and the
//! signature is only accepted after every stage, the tee included, has
//! reported success.

pub mod archive;
pub mod pipeline;
pub mod stream;

use crate::crypto::{CryptoData, KeyError, OperatorKey};
use archive::{write_archive, ArchiveOptions};
use pipeline::{Pipeline, StageOutput};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use stream::stream;
use thiserror::Error;

const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageName {
    Archive,
    Tee,
    Sign,
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Archive => "archive",
            Self::Tee => "tee",
            Self::Sign => "sign",
        })
    }
}

#[derive(Debug, Error)]
pub enum SignError {
    #[error("{stage} stage failed: {source}")]
    Stage {
        stage: StageName,
        #[source]
        source: io::Error,
    },

    #[error("{stage} stage panicked")]
    StagePanicked { stage: StageName },

    #[error("could not start {stage} stage: {source}")]
    StageSpawn {
        stage: StageName,
        #[source]
        source: io::Error,
    },

    #[error("sign stage produced no signature")]
    MissingSignature,

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error("failed to create payload {path}: {source}")]
    Payload {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl SignError {
    pub fn exit_code(&self) -> i32 {
        5
    }

    /// The stage that failed, if the failure belongs to one.
    pub fn stage(&self) -> Option<StageName> {
        match self {
            Self::Stage { stage, .. }
            | Self::StagePanicked { stage }
            | Self::StageSpawn { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SignerOptions {
    pub archive: ArchiveOptions,
    /// Maximum in-flight chunks per stream.
    pub stream_capacity: usize,
}

impl Default for SignerOptions {
    fn default() -> Self {
        Self {
            archive: ArchiveOptions::default(),
            stream_capacity: 16,
        }
    }
}

/// A finished payload and, for signed runs, its credentials.
#[derive(Debug, Clone)]
pub struct SignedPayload {
    pub payload: PathBuf,
    /// `sha256:<hex>` of the payload bytes.
    pub payload_digest: String,
    pub crypto: Option<CryptoData>,
}

#[derive(Debug, Clone, Default)]
pub struct Signer {
    options: SignerOptions,
}

impl Signer {
    pub fn new(options: SignerOptions) -> Self {
        Self { options }
    }

    /// Archive `source` into `payload` and sign the exact bytes written.
    ///
    /// The key is consumed; it lives only inside the sign stage.
    pub fn sign(
        &self,
        source: &Path,
        payload: &Path,
        key: OperatorKey,
    ) -> Result<SignedPayload, SignError> {
        let public_key = key.public_key_pem()?;
        let out = create_payload(payload)?;

        let mut pipeline = Pipeline::new();
        let cancel = pipeline.cancel_token();
        let (a_tx, mut a_rx) = stream(self.options.stream_capacity, cancel.clone());
        let (b_tx, mut b_rx) = stream(self.options.stream_capacity, cancel);

        let source = source.to_path_buf();
        let archive_options = self.options.archive.clone();
        pipeline.spawn(StageName::Archive, move || {
            let sink = BufWriter::with_capacity(CHUNK_SIZE, a_tx);
            let sink = write_archive(&source, sink, &archive_options)?;
            sink.into_inner().map_err(|e| e.into_error())?.finish()?;
            Ok(StageOutput::Done)
        })?;

        pipeline.spawn(StageName::Tee, move || {
            let mut file = BufWriter::with_capacity(CHUNK_SIZE, out);
            let mut b_tx = b_tx;
            let mut buf = vec![0u8; CHUNK_SIZE];
            loop {
                let n = a_rx.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                file.write_all(&buf[..n])?;
                b_tx.write_all(&buf[..n])?;
            }
            file.into_inner()
                .map_err(|e| e.into_error())?
                .sync_all()?;
            b_tx.finish()?;
            Ok(StageOutput::Done)
        })?;

        pipeline.spawn(StageName::Sign, move || {
            let mut hasher = Sha256::new();
            let mut buf = vec![0u8; CHUNK_SIZE];
            loop {
                let n = b_rx.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            let digest = hasher.finalize().as_slice().to_vec();
            let signature = key.sign_digest(&digest).map_err(io::Error::other)?;
            Ok(StageOutput::Signed { digest, signature })
        })?;

        let (digest, signature) = join_or_discard(pipeline, payload)?
            .into_iter()
            .find_map(|(_, output)| match output {
                StageOutput::Signed { digest, signature } => Some((digest, signature)),
                _ => None,
            })
            .ok_or(SignError::MissingSignature)?;

        let crypto = CryptoData::from_signature(public_key, &signature);
        let payload_digest = format!("sha256:{}", hex::encode(&digest));
        tracing::info!(
            payload = %payload.display(),
            digest = %payload_digest,
            nonce = %crypto.nonce,
            "signed payload"
        );

        Ok(SignedPayload {
            payload: payload.to_path_buf(),
            payload_digest,
            crypto: Some(crypto),
        })
    }

    /// Archive `source` straight into `payload` with no signing stage.
    pub fn archive_unsigned(
        &self,
        source: &Path,
        payload: &Path,
    ) -> Result<SignedPayload, SignError> {
        let out = create_payload(payload)?;

        let mut pipeline = Pipeline::new();
        let source = source.to_path_buf();
        let archive_options = self.options.archive.clone();
        pipeline.spawn(StageName::Archive, move || {
            let sink = DigestingWriter::new(BufWriter::with_capacity(CHUNK_SIZE, out));
            let sink = write_archive(&source, sink, &archive_options)?;
            let (file, digest) = sink.finish();
            file.into_inner().map_err(|e| e.into_error())?.sync_all()?;
            Ok(StageOutput::Digest(digest))
        })?;

        let digest = join_or_discard(pipeline, payload)?
            .into_iter()
            .find_map(|(_, output)| match output {
                StageOutput::Digest(digest) => Some(digest),
                _ => None,
            })
            .unwrap_or_default();

        let payload_digest = format!("sha256:{}", hex::encode(&digest));
        tracing::info!(
            payload = %payload.display(),
            digest = %payload_digest,
            "archived unsigned payload"
        );

        Ok(SignedPayload {
            payload: payload.to_path_buf(),
            payload_digest,
            crypto: None,
        })
    }
}

/// Join the pipeline, removing the partial payload if any stage failed.
fn join_or_discard(
    pipeline: Pipeline,
    payload: &Path,
) -> Result<Vec<(StageName, StageOutput)>, SignError> {
    pipeline.join().inspect_err(|err| {
        tracing::debug!(error = %err, "discarding partial payload");
        let _ = std::fs::remove_file(payload);
    })
}

fn create_payload(path: &Path) -> Result<File, SignError> {
    File::create(path).map_err(|source| SignError::Payload {
        path: path.display().to_string(),
        source,
    })
}

/// Writer that hashes everything passing through it.
struct DigestingWriter<W> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> DigestingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    fn finish(self) -> (W, Vec<u8>) {
        (self.inner, self.hasher.finalize().as_slice().to_vec())
    }
}

impl<W: Write> Write for DigestingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
