use std::env;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use once_cell::sync::OnceCell;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::ConfigLoader;
use crate::storage;

pub mod commands;

use self::commands::{EditArgs, MoveArgs, NewTripArgs, ShowArgs, TuiArgs};

#[derive(Parser, Debug)]
#[command(
    name = "tripdesk",
    version,
    about = "Keyboard-first trip itinerary editor"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Override the config file location (takes precedence over TRIPDESK_CONFIG)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Override the data directory (takes precedence over TRIPDESK_DATA)
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Minimum log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Open the itinerary editor (default)
    Tui(TuiArgs),
    /// List stored trips
    Trips,
    /// Create an empty trip
    NewTrip(NewTripArgs),
    /// Insert the sample Lisbon trip
    Seed,
    /// Print a trip's days, entries and todos
    Show(ShowArgs),
    /// Edit one field and wait until the store has it
    Edit(EditArgs),
    /// Move an item among its siblings and wait until the store has it
    Move(MoveArgs),
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    if let Some(path) = &cli.config {
        env::set_var("TRIPDESK_CONFIG", path);
    }
    if let Some(path) = &cli.data_dir {
        env::set_var("TRIPDESK_DATA", path);
    }

    let loader = ConfigLoader::discover()?;
    loader.paths().ensure_directories()?;
    let paths = loader.paths().clone();

    let command = cli.command.unwrap_or(Commands::Tui(TuiArgs::default()));
    // The editor owns the terminal, so its logs go to a file.
    let log_file = matches!(command, Commands::Tui(_)).then(|| paths.log_dir.as_path());
    init_tracing(&cli.log_level, log_file)
        .with_context(|| format!("initialising logging at level {}", cli.log_level))?;

    let config = loader.load_or_init()?;
    let store = storage::init(&config.storage)?;

    match command {
        Commands::Tui(args) => commands::run_tui(config, store, args),
        Commands::Trips => commands::list_trips(&store),
        Commands::NewTrip(args) => commands::new_trip(&store, args),
        Commands::Seed => commands::seed(&store),
        Commands::Show(args) => commands::show(&store, args),
        Commands::Edit(args) => commands::edit(&config, store, args),
        Commands::Move(args) => commands::move_item(&config, store, args),
    }
}

fn init_tracing(level: &str, log_dir: Option<&Path>) -> Result<()> {
    static INIT: OnceCell<()> = OnceCell::new();
    INIT.get_or_try_init(|| {
        let env_filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
        match log_dir {
            Some(dir) => {
                fs::create_dir_all(dir)
                    .with_context(|| format!("creating log directory {}", dir.display()))?;
                let path = dir.join("tripdesk.log");
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .with_context(|| format!("opening log file {}", path.display()))?;
                fmt()
                    .with_env_filter(env_filter)
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .init();
            }
            None => {
                fmt()
                    .with_env_filter(env_filter)
                    .with_writer(std::io::stderr)
                    .init();
            }
        }
        Ok(())
    })
    .map(|_| ())
}
