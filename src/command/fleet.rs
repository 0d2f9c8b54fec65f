use anyhow::Result;
use console::style;
use tabled::{
    Table, Tabled,
    settings::{Padding, Style, object::Columns},
};

use super::args::FleetArgs;
use super::{confirm, load_config, print_json, resolve_profile, stop_timeout_for_image};
use crate::config::Config;
use crate::sandbox::fleet::{self, ExclusionSet};
use crate::sandbox::runtime::{ContainerSummary, Removal, RuntimeKind};
use crate::sandbox::runtime_from_config;
use crate::spinner;

#[derive(Tabled)]
struct ContainerRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "STATE")]
    state: String,
    #[tabled(rename = "IMAGE")]
    image: String,
}

impl From<&ContainerSummary> for ContainerRow {
    fn from(c: &ContainerSummary) -> Self {
        Self {
            id: short_id(&c.id).to_string(),
            name: c.name.clone(),
            state: c.state.to_string(),
            image: c.image.clone(),
        }
    }
}

fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

fn target_image(config: &Config, args: &FleetArgs) -> String {
    match (&args.image, args.family) {
        (Some(image), _) => image.clone(),
        (None, Some(family)) => resolve_profile(config, family, None).image_ref,
        // clap requires one of the two
        (None, None) => String::new(),
    }
}

fn print_table(containers: &[ContainerSummary]) {
    let rows: Vec<ContainerRow> = containers.iter().map(ContainerRow::from).collect();
    let mut table = Table::new(rows);
    table
        .with(Style::blank())
        .modify(Columns::new(0..4), Padding::new(0, 1, 0, 0));
    println!("{table}");
}

pub fn list(runtime_flag: Option<RuntimeKind>, args: &FleetArgs, json: bool) -> Result<()> {
    let config = load_config(runtime_flag)?;
    let runtime = runtime_from_config(&config);
    let image = target_image(&config, args);
    let exclusions = ExclusionSet::new(&args.exclude);
    let selected = fleet::select(&runtime, &image, &exclusions)?;

    if json {
        return print_json(&selected);
    }
    if selected.is_empty() {
        if exclusions.is_empty() {
            println!("No containers from {}", image);
        } else {
            println!("No containers from {} outside the exclusions", image);
        }
        return Ok(());
    }
    print_table(&selected);
    Ok(())
}

pub fn reap(
    runtime_flag: Option<RuntimeKind>,
    args: &FleetArgs,
    assume_yes: bool,
    json: bool,
) -> Result<()> {
    let config = load_config(runtime_flag)?;
    let runtime = runtime_from_config(&config);
    let image = target_image(&config, args);
    let candidates = fleet::select(&runtime, &image, &ExclusionSet::new(&args.exclude))?;

    if candidates.is_empty() {
        if json {
            return print_json(&fleet::ReapSummary::default());
        }
        println!("No containers from {} to reap", image);
        return Ok(());
    }

    let stop_timeout = stop_timeout_for_image(&config, &image);
    let summary = fleet::reap(&runtime, &candidates, stop_timeout, |candidates| {
        if !assume_yes {
            println!("The following containers will be stopped and removed:");
            print_table(candidates);
        }
        confirm(
            &format!("Reap {} container(s)?", candidates.len()),
            assume_yes,
        )
    })?;
    if summary.aborted {
        return Ok(());
    }

    if json {
        print_json(&summary)?;
    } else {
        println!(
            "{} removed {} ({} stopped), {} already gone, {} failed",
            style("✓").green(),
            summary.removed,
            summary.stopped,
            summary.already_absent,
            summary.failed.len()
        );
        for failure in &summary.failed {
            eprintln!("  {} {}", style("✘").red(), failure);
        }
    }
    summary.into_result()?;
    Ok(())
}

pub fn remove(runtime_flag: Option<RuntimeKind>, name: &str) -> Result<()> {
    let config = load_config(runtime_flag)?;
    let runtime = runtime_from_config(&config);
    let removal = spinner::with_spinner(&format!("Removing {}", name), || {
        Ok(fleet::remove_by_name(&runtime, name, |container| {
            stop_timeout_for_image(&config, &container.image)
        })?)
    })?;
    match removal {
        Removal::Done => println!("{} Removed {}", style("✓").green(), name),
        Removal::AlreadyAbsent => println!("No sandbox named '{}'", name),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::profile::OsFamily;
    use crate::sandbox::runtime::ContainerState;

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("0123456789abcdef"), "0123456789ab");
        assert_eq!(short_id("c1"), "c1");
    }

    #[test]
    fn test_row_from_summary() {
        let row = ContainerRow::from(&ContainerSummary {
            id: "0123456789abcdef".into(),
            image: "desk:latest".into(),
            name: "eval-1".into(),
            state: ContainerState::Exited,
        });
        assert_eq!(row.id, "0123456789ab");
        assert_eq!(row.state, "exited");
    }

    #[test]
    fn test_target_image_from_family() {
        let config = Config::default();
        let args = FleetArgs {
            image: None,
            family: Some(OsFamily::Windows),
            exclude: vec![],
        };
        assert_eq!(
            target_image(&config, &args),
            crate::sandbox::profile::LaunchProfile::builtin(OsFamily::Windows).image_ref
        );
    }
}
