// CLI module - command-line argument parsing
//
// Runtime flags select the config file and node identity; the config
// subcommand answers "what would the daemon see" without starting it.

use crate::config::{Config, VERSION};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// owlview - per-node viewer for the capture fleet
#[derive(Parser)]
#[command(name = "owlview")]
#[command(version = VERSION)]
#[command(about = "Session viewer and packet-hunt daemon", long_about = None)]
pub struct Cli {
    /// Config file (default: ~/.config/owlview/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Node name override (default: OWLVIEW_NODE or the config file)
    #[arg(short, long, global = true)]
    pub node: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Inspect configuration
    Config {
        /// Show effective configuration
        #[arg(long)]
        show: bool,

        /// Show config file path
        #[arg(long)]
        path: bool,
    },
}

/// Handle CLI subcommands. Returns true if one was handled (exit after).
pub fn handle_cli(cli: &Cli) -> bool {
    match &cli.command {
        Some(Commands::Config { show, path }) => {
            if *path {
                match cli.config.clone().or_else(Config::config_path) {
                    Some(p) => println!("{}", p.display()),
                    None => println!("(no config path resolvable)"),
                }
            }
            if *show || !*path {
                let config = Config::load(cli.config.as_ref(), cli.node.as_deref());
                println!("{:#?}", config);
            }
            true
        }
        None => false,
    }
}
