//! Privacy-policy consent cache.

use crate::config::{ConfigError, ConfigStore};
use thiserror::Error;

/// Current privacy policy revision. Bumping it re-prompts every operator.
pub const PRIVACY_POLICY_VERSION: u32 = 1;

pub const KEY_PRIVACY_POLICY_CONSENT: &str = "privacy_policy_consent";

#[derive(Debug, Error)]
pub enum ConsentError {
    #[error("privacy policy not accepted")]
    Declined,

    #[error(
        "consent to privacy policy version {version} is required; \
         rerun interactively or pass --consent-to-current-privacy-policy"
    )]
    NotInteractive { version: u32 },

    #[error("consent prompt failed: {0}")]
    Prompt(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ConsentError {
    pub fn exit_code(&self) -> i32 {
        6
    }
}

/// Asks the operator to accept the policy.
pub trait ConsentPrompt {
    fn confirm(&self, version: u32) -> Result<bool, ConsentError>;
}

/// For callers without a terminal: consent can only come from the cache or
/// from forcing it.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPrompt;

impl ConsentPrompt for NoPrompt {
    fn confirm(&self, version: u32) -> Result<bool, ConsentError> {
        Err(ConsentError::NotInteractive { version })
    }
}

/// Version the operator last consented to, if any. Unparseable values count
/// as no consent.
pub fn recorded_version(store: &dyn ConfigStore) -> Result<Option<u32>, ConfigError> {
    Ok(store
        .get(KEY_PRIVACY_POLICY_CONSENT)?
        .and_then(|v| v.trim().parse().ok()))
}

/// Make sure the operator has accepted [`PRIVACY_POLICY_VERSION`].
///
/// With `force` the consent is recorded without asking.
pub fn ensure_consent(
    store: &dyn ConfigStore,
    force: bool,
    prompt: &dyn ConsentPrompt,
) -> Result<(), ConsentError> {
    if recorded_version(store)? == Some(PRIVACY_POLICY_VERSION) {
        return Ok(());
    }

    if !force && !prompt.confirm(PRIVACY_POLICY_VERSION)? {
        return Err(ConsentError::Declined);
    }

    store.set(
        KEY_PRIVACY_POLICY_CONSENT,
        &PRIVACY_POLICY_VERSION.to_string(),
    )?;
    tracing::info!(version = PRIVACY_POLICY_VERSION, "privacy policy consent recorded");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfigStore;
    use std::cell::Cell;

    struct Answer {
        yes: bool,
        asked: Cell<u32>,
    }

    impl ConsentPrompt for Answer {
        fn confirm(&self, _version: u32) -> Result<bool, ConsentError> {
            self.asked.set(self.asked.get() + 1);
            Ok(self.yes)
        }
    }

    fn answer(yes: bool) -> Answer {
        Answer {
            yes,
            asked: Cell::new(0),
        }
    }

    #[test]
    fn test_current_consent_skips_prompt() {
        let store = MemoryConfigStore::new().with(KEY_PRIVACY_POLICY_CONSENT, "1");
        let prompt = answer(false);
        ensure_consent(&store, false, &prompt).unwrap();
        assert_eq!(prompt.asked.get(), 0);
    }

    #[test]
    fn test_stale_version_prompts_again() {
        let store = MemoryConfigStore::new().with(KEY_PRIVACY_POLICY_CONSENT, "0");
        let prompt = answer(true);
        ensure_consent(&store, false, &prompt).unwrap();
        assert_eq!(prompt.asked.get(), 1);
        assert_eq!(recorded_version(&store).unwrap(), Some(PRIVACY_POLICY_VERSION));
    }

    #[test]
    fn test_decline_records_nothing() {
        let store = MemoryConfigStore::new();
        assert!(matches!(
            ensure_consent(&store, false, &answer(false)),
            Err(ConsentError::Declined)
        ));
        assert_eq!(recorded_version(&store).unwrap(), None);
    }

    #[test]
    fn test_force_records_without_prompt() {
        let store = MemoryConfigStore::new();
        ensure_consent(&store, true, &NoPrompt).unwrap();
        assert_eq!(recorded_version(&store).unwrap(), Some(1));
    }

    #[test]
    fn test_no_prompt_requires_flag() {
        let err = ensure_consent(&MemoryConfigStore::new(), false, &NoPrompt).unwrap_err();
        assert!(err.to_string().contains("--consent-to-current-privacy-policy"));
    }
}
