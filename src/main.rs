//! Provides the main entry point to the program.
use anyhow::Result;
use clap::Parser;
use hydronet::commands::{
    Cli, Commands, handle_demo_list_command, handle_demo_run_command, handle_run_command,
    handle_settings_command,
};

fn main() -> Result<()> {
    human_panic::setup_panic!();

    let cli = Cli::parse();
    if cli.markdown_help {
        clap_markdown::print_help_markdown::<Cli>();
        return Ok(());
    }

    match cli.command {
        Some(Commands::Run { model_dir }) => handle_run_command(&model_dir),
        Some(Commands::Demo { subcommand }) => match subcommand {
            hydronet::commands::DemoSubcommands::List => handle_demo_list_command(),
            hydronet::commands::DemoSubcommands::Run { name } => handle_demo_run_command(&name),
        },
        Some(Commands::Settings { subcommand }) => handle_settings_command(&subcommand),
        None => {
            Cli::parse_from(["hydronet", "--help"]);
            Ok(())
        }
    }
}
