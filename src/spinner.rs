use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Create a spinner with consistent styling.
fn create_spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.enable_steady_tick(Duration::from_millis(120));
    pb.set_style(
        ProgressStyle::default_spinner()
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"])
            .template("{spinner:.blue} {msg} {elapsed:.dim}")
            .unwrap(),
    );
    pb.set_message(msg.to_string());
    pb
}

/// Run an operation with a spinner, showing success/failure.
pub fn with_spinner<T, F>(msg: &str, op: F) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    with_spinner_status(msg, op, |result| result.is_ok())
}

/// Run an operation with a spinner; `succeeded` decides which mark it finishes with.
pub fn with_spinner_status<T, F, S>(msg: &str, op: F, succeeded: S) -> T
where
    F: FnOnce() -> T,
    S: FnOnce(&T) -> bool,
{
    let pb = create_spinner(msg);
    let result = op();
    if succeeded(&result) {
        pb.finish_with_message(format!("✔ {}", msg));
    } else {
        pb.finish_with_message(format!("✘ {}", msg));
    }
    result
}
