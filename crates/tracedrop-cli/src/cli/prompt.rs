//! Terminal consent prompt.

use dialoguer::{theme::ColorfulTheme, Confirm};
use std::io::IsTerminal;
use tracedrop_core::{ConsentError, ConsentPrompt};

pub struct TerminalPrompt;

impl ConsentPrompt for TerminalPrompt {
    fn confirm(&self, version: u32) -> Result<bool, ConsentError> {
        if !std::io::stdin().is_terminal() {
            return Err(ConsentError::NotInteractive { version });
        }

        eprintln!(
            "Uploaded traces contain the memory and files of the recorded processes.\n\
             They are handled according to the tracedrop privacy policy, version {version}."
        );
        Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt("Do you accept the privacy policy?")
            .default(false)
            .interact()
            .map_err(|e| ConsentError::Prompt(e.to_string()))
    }
}
