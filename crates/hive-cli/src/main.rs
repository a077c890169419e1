//! Hive - command line driver for the rig build pipeline
//!
//! Loads rig files into an in-memory scene, runs build stages, mirrors
//! components and manages the template library.

mod commands;
mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use hive_core::{MirrorPlane, Stage};
use std::path::PathBuf;
use tracing::{debug, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "hive")]
#[command(about = "Build, mirror and template Hive character rigs")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "hive.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every build stage up to the requested one
    Build {
        rig: PathBuf,
        /// guides, controls, deform, rig or polish
        #[arg(short, long, default_value = "rig")]
        stage: Stage,
        /// Restrict the build to these components (name:side)
        #[arg(long = "component")]
        components: Vec<String>,
        /// Keep building unrelated components after a failure
        #[arg(long)]
        continue_on_error: bool,
        /// Write the synced rig here
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Mirror a component onto its symmetric side
    Mirror {
        rig: PathBuf,
        source: String,
        /// Mirror guides onto this existing component instead
        #[arg(long)]
        target: Option<String>,
        /// xy, yz or xz; defaults to the rig setting
        #[arg(long)]
        plane: Option<MirrorPlane>,
        /// Write here instead of back to the rig file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Manage the template library
    Template {
        #[command(subcommand)]
        action: TemplateCommand,
    },
    /// Naming preset tools
    Naming {
        #[command(subcommand)]
        action: NamingCommand,
    },
}

#[derive(Subcommand, Debug)]
enum TemplateCommand {
    /// Snapshot a rig into the library
    Save {
        rig: PathBuf,
        name: String,
        #[arg(long = "component")]
        components: Vec<String>,
        /// Replace an existing template of the same name
        #[arg(long)]
        force: bool,
    },
    /// List stored templates
    List,
    /// Load a stored template into a rig file
    Apply {
        name: String,
        rig: PathBuf,
        /// Rebuild the rig from the template, keeping deform joints
        #[arg(long)]
        update: bool,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
enum NamingCommand {
    /// Check every rule against its example fields
    Validate { preset: Option<PathBuf> },
}

fn main() -> Result<()> {
    let args = Args::parse();

    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    debug!("Hive v{}", env!("CARGO_PKG_VERSION"));

    let config = config::load_config(&args.config)?;

    match args.command {
        Command::Build {
            rig,
            stage,
            components,
            continue_on_error,
            output,
        } => commands::build(
            &config,
            commands::BuildArgs {
                rig: &rig,
                stage,
                components: &components,
                continue_on_error,
                output: output.as_deref(),
            },
        ),
        Command::Mirror {
            rig,
            source,
            target,
            plane,
            output,
        } => commands::mirror(
            &config,
            &rig,
            &source,
            target.as_deref(),
            plane,
            output.as_deref(),
        ),
        Command::Template { action } => match action {
            TemplateCommand::Save {
                rig,
                name,
                components,
                force,
            } => commands::template_save(&config, &rig, &name, &components, force),
            TemplateCommand::List => commands::template_list(&config),
            TemplateCommand::Apply {
                name,
                rig,
                update,
                output,
            } => commands::template_apply(&config, &name, &rig, update, output.as_deref()),
        },
        Command::Naming {
            action: NamingCommand::Validate { preset },
        } => commands::naming_validate(&config, preset.as_deref()),
    }
}
