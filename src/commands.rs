//! The command line interface for the simulation.
use crate::connection::LocalConnection;
use crate::log;
use crate::model::{FlowModel, Model};
use crate::reporter::ScreenReporter;
use crate::run::{RunOptions, run_scenarios};
use crate::settings::{Settings, get_settings_file_path};
use crate::system::CancelFlag;
use ::log::info;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use include_dir::{Dir, DirEntry, include_dir};
use platform_info::{PlatformInfo, PlatformInfoAPI, UNameAPI};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// The directory containing the bundled demo models.
pub const DEMOS_DIR: Dir = include_dir!("demos");

#[derive(Parser)]
#[command(version, about)]
/// The command line interface for the simulation.
pub struct Cli {
    /// Print the CLI help as markdown (for documentation builds).
    #[arg(long, hide = true)]
    pub markdown_help: bool,
    #[command(subcommand)]
    /// The available commands.
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
/// The available commands.
pub enum Commands {
    /// Run a model directory.
    Run {
        #[arg(help = "Path to the model directory")]
        /// Path to the model directory.
        model_dir: PathBuf,
    },
    /// Manage bundled demo models.
    Demo {
        #[command(subcommand)]
        /// The available subcommands for managing demo models.
        subcommand: DemoSubcommands,
    },
    /// Manage program settings.
    Settings {
        #[command(subcommand)]
        /// The available subcommands for managing settings.
        subcommand: SettingsSubcommands,
    },
}

#[derive(Subcommand)]
/// The available subcommands for managing demo models.
pub enum DemoSubcommands {
    /// List available demos.
    List,
    /// Run a demo.
    Run {
        /// The name of the demo to run.
        name: String,
    },
}

#[derive(Subcommand)]
/// The available subcommands for managing settings.
pub enum SettingsSubcommands {
    /// Show the active settings.
    Show,
    /// Print the settings file path.
    Path,
    /// Open the settings file in an editor.
    Edit,
}

/// Handle the `run` command.
pub fn handle_run_command(model_dir: &Path) -> Result<()> {
    let settings = Settings::load()?;
    if !log::is_logger_initialised() {
        log::init(Some(&settings.log_level), None).context("Failed to initialize logging.")?;
    }
    if let Ok(platform) = PlatformInfo::new() {
        info!(
            "running on {} {}",
            platform.sysname().to_string_lossy(),
            platform.release().to_string_lossy()
        );
    }

    let mut conn =
        LocalConnection::open(model_dir).context("Failed to load model directory.")?;
    let config = conn.config().clone();
    let options = RunOptions {
        run_name: config.run.name.clone(),
        scenario_ids: config.run.scenario_ids.clone(),
        foresight: config.run.foresight,
        time: config.time.clone(),
        files_path: conn.files_path(),
    };

    let mut reporter = ScreenReporter;
    let cancel = CancelFlag::new();
    let make_model = || Box::new(FlowModel::new()) as Box<dyn Model>;
    run_scenarios(&mut conn, &options, &mut reporter, &cancel, &make_model)?;
    info!("all runs complete");
    Ok(())
}

/// Handle the `demo run` command.
pub fn handle_demo_run_command(name: &str) -> Result<()> {
    let sub_dir = DEMOS_DIR.get_dir(name).context("Demo not found.")?;

    // unpack the demo into a temporary directory and run it from there
    let temp_dir = TempDir::new().context("Failed to create temporary directory.")?;
    for entry in sub_dir.entries() {
        match entry {
            DirEntry::File(f) => {
                let file_name = f.path().file_name().unwrap();
                fs::write(temp_dir.path().join(file_name), f.contents())?;
            }
            DirEntry::Dir(_) => {
                anyhow::bail!("Nested demo directories are not supported.");
            }
        }
    }

    handle_run_command(temp_dir.path())
}

/// Handle the `demo list` command.
pub fn handle_demo_list_command() -> Result<()> {
    for entry in DEMOS_DIR.dirs() {
        println!("{}", entry.path().display());
    }
    Ok(())
}

/// Handle the `settings` subcommands.
pub fn handle_settings_command(subcommand: &SettingsSubcommands) -> Result<()> {
    let path = get_settings_file_path();
    match subcommand {
        SettingsSubcommands::Show => {
            let settings = Settings::load()?;
            println!("{}", toml::to_string(&settings)?);
        }
        SettingsSubcommands::Path => println!("{}", path.display()),
        SettingsSubcommands::Edit => {
            if !path.is_file() {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&path, Settings::default_file_contents())?;
            }
            edit::edit_file(&path).context("Failed to open an editor.")?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demos_are_bundled() {
        assert!(DEMOS_DIR.get_dir("simple").is_some());
        let simple = DEMOS_DIR.get_dir("simple").unwrap();
        for file in ["model.toml", "network.json", "template.json", "data.json"] {
            assert!(
                simple.get_file(format!("simple/{file}")).is_some(),
                "missing {file}"
            );
        }
    }

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::try_parse_from(["hydronet", "run", "some/dir"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Run { .. })));
    }

    #[test]
    fn test_cli_parses_demo_run() {
        let cli = Cli::try_parse_from(["hydronet", "demo", "run", "simple"]).unwrap();
        let Some(Commands::Demo {
            subcommand: DemoSubcommands::Run { name },
        }) = cli.command
        else {
            panic!("expected demo run");
        };
        assert_eq!(name, "simple");
    }
}
