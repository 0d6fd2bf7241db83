//! `tracedrop upload-package` - Submit a package produced by `upload --defer`.
//!
//! When the package's `.cmd` descriptor sits next to it, the recorded
//! commands are replayed as-is and no local operator configuration is
//! needed. Otherwise the upload is rebuilt from local settings.

use super::super::args::UploadPackageArgs;
use super::{build_transport, config_store, load_operator, metadata_fields, report};
use crate::exit_codes::SUCCESS;
use anyhow::{bail, Context, Result};
use tracedrop_core::trailer::read_trailer;
use tracedrop_core::upload::sidecar_path;
use tracedrop_core::{replay_deferred, CommandRunner, DeferredDescriptor, Uploader};

pub async fn run(args: UploadPackageArgs, runner: &dyn CommandRunner) -> Result<i32> {
    if !args.package.is_file() {
        bail!("package not found: {}", args.package.display());
    }

    let sidecar = sidecar_path(&args.package);
    if !args.ignore_descriptor && sidecar.is_file() {
        let descriptor = DeferredDescriptor::read(&sidecar)
            .with_context(|| format!("failed to read descriptor {}", sidecar.display()))?;
        let t = &args.transport;
        if t.title.is_some() || t.url.is_some() || t.extra_metadata.is_some() {
            tracing::warn!("header options are ignored when replaying a recorded descriptor");
        }
        tracing::info!(descriptor = %sidecar.display(), "replaying recorded upload");

        let outcome = replay_deferred(runner, &args.package, &descriptor).await?;
        report(&outcome);
        return Ok(SUCCESS);
    }

    // Reject a damaged package before touching config or cloud tooling.
    if !args.unsigned {
        read_trailer(&args.package).context("package carries no valid signing trailer")?;
    }

    let store = config_store()?;
    let config = load_operator(args.transport.provider, &store, runner, false).await?;
    let transport = build_transport(&args.transport, &config, runner).await?;

    let mut uploader = Uploader::new(runner, transport.as_ref());
    if let Some(base) = &config.upload_base {
        uploader = uploader.with_base(base.clone());
    }

    let fields = metadata_fields(&args.transport, &config);
    let outcome = uploader
        .upload_package(&args.package, &fields, args.unsigned)
        .await?;

    report(&outcome);
    Ok(SUCCESS)
}
