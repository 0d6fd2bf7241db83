//! Packaging, signing and submission of recorded execution traces.
//!
//! The crate is organised leaves first:
//!
//! - [`validate`]: trace-safety gate over recorded CPU features and environment
//! - [`packaging`]: in-place preparation of a trace directory before archiving
//! - [`signer`]: archive, tee, digest-and-sign pipeline producing a payload + [`CryptoData`]
//! - [`trailer`]: appendable, strippable credential record on a package
//! - [`upload`]: address derivation, credential pre-flight and transfer/deferral

pub mod command;
pub mod config;
pub mod consent;
pub mod crypto;
pub mod packaging;
pub mod signer;
pub mod trace_info;
pub mod trailer;
pub mod upload;
pub mod validate;

// Convenience re-exports
pub use command::{CommandError, CommandOutput, CommandRunner, CommandSpec, SystemRunner};
pub use config::{ConfigError, ConfigStore, FileConfigStore, MemoryConfigStore, OperatorConfig};
pub use consent::{ensure_consent, ConsentError, ConsentPrompt, PRIVACY_POLICY_VERSION};
pub use crypto::{CryptoData, OperatorKey};
pub use signer::{SignError, SignedPayload, Signer, SignerOptions, StageName};
pub use trace_info::TraceMetadata;
pub use trailer::{append_trailer, extract_trailer, TrailerError};
pub use upload::{
    replay_deferred, DeferredDescriptor, MetadataFields, UploadError, UploadMode, UploadOutcome,
    UploadRequest, Uploader,
};
pub use validate::{
    HostCapabilities, ValidationError, ValidationWarning, Validator, WarningBudget,
};
