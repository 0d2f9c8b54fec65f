use std::path::Path;

use anyhow::Result;
use console::style;

use super::confirm;
use crate::sandbox::snapshot::{self, RevertOutcome};
use crate::spinner;

pub fn run(storage: &Path, backup: &Path, assume_yes: bool) -> Result<()> {
    let confirmed = confirm(
        &format!(
            "{} will be deleted and restored from {}. Continue?",
            storage.display(),
            backup.display()
        ),
        assume_yes,
    )?;
    if !confirmed {
        return Ok(());
    }

    let outcome = spinner::with_spinner(&format!("Restoring {}", storage.display()), || {
        snapshot::revert(storage, backup)
    })?;
    match outcome {
        RevertOutcome::Restored => println!(
            "{} {} restored from {}",
            style("✓").green(),
            storage.display(),
            backup.display()
        ),
        RevertOutcome::EmptyStorage => println!(
            "{} no backup at {}; {} is now empty",
            style("!").yellow(),
            backup.display(),
            storage.display()
        ),
    }
    Ok(())
}
