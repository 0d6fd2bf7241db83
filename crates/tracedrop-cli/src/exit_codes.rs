//! Process exit codes. Part of the public contract: scripts branch on them.

use tracedrop_core::packaging::PackagingError;
use tracedrop_core::trace_info::TraceInfoError;
use tracedrop_core::{
    CommandError, ConfigError, ConsentError, SignError, TrailerError, UploadError,
    ValidationError,
};

pub const SUCCESS: i32 = 0;
pub const TRANSFER_FAILED: i32 = 1;
pub const VALIDATION_FATAL: i32 = 2;
pub const CREDENTIALS_REJECTED: i32 = 3;
pub const CORRUPT_PACKAGE: i32 = 4;
pub const SIGN_FAILED: i32 = 5;
pub const CONFIG_ERROR: i32 = 6;
pub const INTERNAL_ERROR: i32 = 7;

/// Pick the exit code for an error chain from the first library error in it.
pub fn for_error(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<ValidationError>() {
            return e.exit_code();
        }
        if let Some(e) = cause.downcast_ref::<UploadError>() {
            return e.exit_code();
        }
        if let Some(e) = cause.downcast_ref::<TrailerError>() {
            return e.exit_code();
        }
        if let Some(e) = cause.downcast_ref::<SignError>() {
            return e.exit_code();
        }
        if let Some(e) = cause.downcast_ref::<ConfigError>() {
            return e.exit_code();
        }
        if let Some(e) = cause.downcast_ref::<ConsentError>() {
            return e.exit_code();
        }
        if let Some(e) = cause.downcast_ref::<PackagingError>() {
            return e.exit_code();
        }
        if let Some(e) = cause.downcast_ref::<TraceInfoError>() {
            return match e {
                TraceInfoError::Incompatible => VALIDATION_FATAL,
                _ => INTERNAL_ERROR,
            };
        }
        if cause.downcast_ref::<CommandError>().is_some() {
            return INTERNAL_ERROR;
        }
    }
    INTERNAL_ERROR
}
