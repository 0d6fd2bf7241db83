//! `tracedrop upload` - Validate, package, sign and submit a trace.

use super::super::args::{Provider, UploadArgs};
use super::super::prompt::TerminalPrompt;
use super::{build_transport, config_store, load_operator, metadata_fields, report};
use crate::exit_codes::SUCCESS;
use anyhow::{bail, Context, Result};
use std::path::Path;
use tracedrop_core::packaging::{PrepareOptions, ProducerMetadata, TracePreparer};
use tracedrop_core::validate::ProcCpuinfo;
use tracedrop_core::{
    ensure_consent, CommandRunner, OperatorKey, Signer, TraceMetadata, UploadMode, UploadRequest,
    Uploader, Validator, WarningBudget,
};

pub async fn run(args: UploadArgs, runner: &dyn CommandRunner) -> Result<i32> {
    if !args.trace_dir.is_dir() {
        bail!("trace directory not found: {}", args.trace_dir.display());
    }

    let store = config_store()?;
    ensure_consent(
        &store,
        args.consent_to_current_privacy_policy,
        &TerminalPrompt,
    )?;

    let key_from_config =
        !args.unsigned && args.key_file.is_none() && args.transport.provider == Provider::Aws;
    let mut config =
        load_operator(args.transport.provider, &store, runner, key_from_config).await?;

    // The signer consumes the key; no copy stays behind in `config`.
    let key = {
        let configured = config.take_signing_key();
        match &args.key_file {
            _ if args.unsigned => None,
            Some(path) => Some(read_key_file(path)?),
            None => configured,
        }
    };

    let meta = match &args.trace_info {
        Some(path) => TraceMetadata::from_file(path),
        None => TraceMetadata::from_rr(runner, &args.trace_dir).await,
    }
    .context("failed to read trace metadata")?;

    let mut budget = WarningBudget::new(args.allow_warnings);
    let warnings = Validator::new(&ProcCpuinfo).validate(&meta, &mut budget)?;
    if !warnings.is_empty() {
        tracing::info!(
            accepted = warnings.len(),
            remaining = budget.remaining(),
            "continuing with validation warnings"
        );
    }

    let prepare = PrepareOptions {
        skip_pack: args.no_pack,
        producer: ProducerMetadata {
            title: args.transport.title.clone(),
            url: args.transport.url.clone(),
        },
        user: config.user.clone(),
        group: config.group.clone(),
    };
    TracePreparer::new(runner)
        .prepare(&args.trace_dir, &prepare)
        .await
        .context("failed to prepare trace")?;

    let workdir = tempfile::Builder::new()
        .prefix("tracedrop-")
        .tempdir()
        .context("failed to create working directory")?;
    let payload = workdir.path().join("payload.tar.zst");

    let signed = {
        let source = args.trace_dir.clone();
        let payload = payload.clone();
        tokio::task::spawn_blocking(move || {
            let signer = Signer::default();
            match key {
                Some(key) => signer.sign(&source, &payload, key),
                None => signer.archive_unsigned(&source, &payload),
            }
        })
        .await
        .context("signing task did not complete")??
    };

    let transport = build_transport(&args.transport, &config, runner).await?;
    let mut uploader = Uploader::new(runner, transport.as_ref());
    if let Some(base) = &config.upload_base {
        uploader = uploader.with_base(base.clone());
    }

    let fields = metadata_fields(&args.transport, &config);
    let mode = match args.defer {
        Some(path) => UploadMode::Deferred { path },
        None => UploadMode::Immediate,
    };
    let outcome = uploader
        .upload(UploadRequest {
            package: &signed.payload,
            crypto: signed.crypto.as_ref(),
            fields: &fields,
            mode,
        })
        .await?;

    report(&outcome);
    Ok(SUCCESS)
}

fn read_key_file(path: &Path) -> Result<OperatorKey> {
    let pem = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read key file: {}", path.display()))?;
    OperatorKey::from_pem(&pem).with_context(|| format!("invalid key file: {}", path.display()))
}
