use anyhow::Result;

use super::{load_config, print_json, resolve_profile};
use crate::sandbox::profile::OsFamily;

/// Print the effective launch profile for `family`, config overrides applied.
pub fn run(family: OsFamily, json: bool) -> Result<()> {
    let config = load_config(None)?;
    let profile = resolve_profile(&config, family, None);
    if json {
        return print_json(&profile);
    }
    print!("{}", serde_yaml::to_string(&profile)?);
    Ok(())
}
