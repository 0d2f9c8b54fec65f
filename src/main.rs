mod cli;
mod cmd;
mod command;
mod config;
mod error;
mod logger;
mod sandbox;
mod spinner;

use anyhow::Result;
use tracing::{error, info};

/// Command line with secret flag values masked, for the log.
fn redacted_args(args: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut out = Vec::new();
    let mut mask_next = false;
    for arg in args {
        if mask_next {
            out.push("<redacted>".to_string());
            mask_next = false;
        } else if arg == "--password" {
            out.push(arg);
            mask_next = true;
        } else if arg.starts_with("--password=") {
            out.push("--password=<redacted>".to_string());
        } else {
            out.push(arg);
        }
    }
    out
}

fn main() -> Result<()> {
    logger::init()?;
    info!(args = ?redacted_args(std::env::args()), "deskvm start");

    match cli::run() {
        Ok(result) => {
            info!("deskvm finished successfully");
            Ok(result)
        }
        Err(err) => {
            error!(error = ?err, "deskvm failed");
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redacted_args_masks_password() {
        let args = ["deskvm", "up", "macos", "--password", "hunter2", "--password=x", "--user", "eval"]
            .map(String::from);
        assert_eq!(
            redacted_args(args),
            vec![
                "deskvm",
                "up",
                "macos",
                "--password",
                "<redacted>",
                "--password=<redacted>",
                "--user",
                "eval"
            ]
        );
    }
}
