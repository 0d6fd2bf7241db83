use super::args::{Provider, TransportArgs};
use anyhow::{Context, Result};
use tracedrop_core::config::KEY_UPLOAD_BASE;
use tracedrop_core::upload::{AwsTransport, GcloudTransport, MetadataFields, Transport};
use tracedrop_core::{CommandRunner, ConfigStore, FileConfigStore, OperatorConfig, UploadOutcome};

mod dispatch;
pub mod keygen;
pub mod upload;
pub mod upload_package;

pub use dispatch::dispatch;

pub(crate) fn config_store() -> Result<FileConfigStore> {
    FileConfigStore::user_default().context("failed to locate configuration")
}

/// Operator identity for `provider`. gcloud operators never carry a secret
/// key; their identity may come from the active gcloud account.
pub(crate) async fn load_operator(
    provider: Provider,
    store: &dyn ConfigStore,
    runner: &dyn CommandRunner,
    require_secret_key: bool,
) -> Result<OperatorConfig> {
    match provider {
        Provider::Aws => OperatorConfig::load(store, require_secret_key)
            .context("failed to load operator configuration"),
        Provider::Gcloud => {
            let (user, group) = GcloudTransport::resolve_identity(runner, store)
                .await
                .context("failed to resolve gcloud identity")?;
            Ok(OperatorConfig {
                user,
                group,
                cloud: None,
                signing_key: None,
                upload_base: store.get(KEY_UPLOAD_BASE)?,
                credential_checker: None,
            })
        }
    }
}

pub(crate) async fn build_transport(
    args: &TransportArgs,
    config: &OperatorConfig,
    runner: &dyn CommandRunner,
) -> Result<Box<dyn Transport>> {
    Ok(match args.provider {
        Provider::Aws => Box::new(
            AwsTransport::detect(runner, config)
                .await
                .context("failed to query the aws CLI")?
                .with_transfer_acceleration(args.transfer_acceleration),
        ),
        Provider::Gcloud => Box::new(GcloudTransport),
    })
}

pub(crate) fn metadata_fields(args: &TransportArgs, config: &OperatorConfig) -> MetadataFields {
    MetadataFields {
        title: args.title.clone(),
        url: args.url.clone(),
        extra: args.extra_metadata.clone(),
        ..MetadataFields::new(&config.user, &config.group)
    }
}

pub(crate) fn report(outcome: &UploadOutcome) {
    match outcome {
        UploadOutcome::Transferred { address, .. } => {
            println!("Uploaded to {address}");
        }
        UploadOutcome::Deferred {
            package,
            descriptor,
            address,
            ..
        } => {
            println!("Package written to {}", package.display());
            println!("Upload commands written to {}", descriptor.display());
            println!("Destination: {address}");
        }
    }
}
