// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # pop
//!
//! Command-line front end of the pop orchestrator.
//!
//! ## Commands
//!
//! - `pop init` - Create the namespace hierarchy
//! - `pop add|deploy|start|stop|status` - Service operations
//! - `pop dump` - Print the whole namespace
//! - `pop agent` - Run the machine agent on this host
//! - `pop serve` - Run a coordination store server
//!
//! Every command except `serve` talks to the store at `--host:--port`.

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;
use tracing::{debug, info};

mod commands;

use commands::CommandContext;

/// pop - automated build, deployment and service management tool
#[derive(Parser)]
#[command(name = "pop")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Coordination store host
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Coordination store port
    #[arg(long, global = true)]
    pub port: Option<u16>,

    /// Namespace root (`/` or a single segment such as `/test`)
    #[arg(long, global = true, value_name = "PATH")]
    pub path_prefix: Option<String>,

    /// Increase verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Overwrite existing state where a command would refuse
    #[arg(short, long, global = true)]
    pub force: bool,

    /// Path to configuration file (overrides discovery)
    #[arg(short, long, global = true, env = "POP_CONFIG_PATH", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Identity of this machine (default: /etc/machine-id)
    #[arg(long, global = true, value_name = "ID")]
    pub machine_id: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the `machines` and `services` nodes
    Init {
        /// Digest identity granted full access, as `user:password`
        #[arg(long, value_name = "USER:PASSWORD")]
        admin_identity: Option<String>,
    },

    /// Register a new service
    Add {
        /// Service name
        #[arg(long)]
        name: String,

        /// Service type (see `pop add --help` for built-ins: echo, threaded-echo)
        #[arg(value_name = "TYPE")]
        service_type: String,

        /// Settings as key=value; values are parsed as YAML scalars
        #[arg(value_name = "KEY=VALUE")]
        options: Vec<String>,
    },

    /// Deploy a service to a machine
    Deploy {
        name: String,

        /// Target machine (default: this one)
        #[arg(long, value_name = "ID")]
        machine: Option<String>,
    },

    /// Run a service in the foreground on this machine
    Start { name: String },

    /// Stop a service running on this machine
    Stop { name: String },

    /// Show placement and liveness of a service
    Status { name: String },

    /// Print the whole namespace
    Dump {
        /// Output format: yaml or json
        #[arg(long, default_value = "yaml")]
        format: String,
    },

    /// Run the machine agent
    Agent {
        /// Reconcile once and exit
        #[arg(long)]
        once: bool,

        /// Seconds between reconciliation rounds
        #[arg(long, value_name = "SECS")]
        interval: Option<u64>,
    },

    /// Serve an in-memory coordination store over TCP
    Serve {
        /// Listen address (default: --host:--port)
        #[arg(long, value_name = "ADDR")]
        bind: Option<String>,
    },
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Commands::Init { .. } => "init",
            Commands::Add { .. } => "add",
            Commands::Deploy { .. } => "deploy",
            Commands::Start { .. } => "start",
            Commands::Stop { .. } => "stop",
            Commands::Status { .. } => "status",
            Commands::Dump { .. } => "dump",
            Commands::Agent { .. } => "agent",
            Commands::Serve { .. } => "serve",
        }
    }
}

fn main() {
    let cli = Cli::parse();
    let verbose = cli.global.verbose;

    eprintln!("pop - automated build, deployment and service management tool.");
    eprintln!("{}", "-".repeat(63));

    if let Err(e) = init_logging(verbose) {
        eprintln!("{}", format_error(&e));
        std::process::exit(1);
    }

    let name = cli.command.name();
    match run(cli) {
        Ok(()) => info!("done - '{}' completed OK.", name),
        Err(err) => {
            if verbose >= 2 {
                debug!("{:?}", err);
            }
            eprintln!("{}", format_error(&err));
            std::process::exit(1);
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let ctx = CommandContext::from_args(&cli.global)?;
    match cli.command {
        Commands::Init { admin_identity } => commands::init::run(&ctx, admin_identity),
        Commands::Add {
            name,
            service_type,
            options,
        } => commands::service::add(&ctx, &name, &service_type, &options),
        Commands::Deploy { name, machine } => {
            commands::service::deploy(&ctx, &name, machine.as_deref())
        }
        Commands::Start { name } => commands::service::start(&ctx, &name),
        Commands::Stop { name } => commands::service::stop(&ctx, &name),
        Commands::Status { name } => commands::service::status(&ctx, &name),
        Commands::Dump { format } => commands::service::dump(&ctx, &format),
        Commands::Agent { once, interval } => commands::agent::run(&ctx, once, interval),
        Commands::Serve { bind } => commands::serve::run(&ctx, bind),
    }
}

/// Lower-case the first character of each line and prefix the first with
/// `error - `.
fn format_error(err: &anyhow::Error) -> String {
    let message = format!("{:#}", err);
    message
        .lines()
        .enumerate()
        .map(|(i, line)| {
            let mut chars = line.chars();
            let line = match chars.next() {
                Some(first) => first.to_lowercase().chain(chars).collect(),
                None => String::new(),
            };
            if i == 0 {
                format!("error - {}", line)
            } else {
                line
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Initialize tracing subscriber for logging
fn init_logging(verbose: u8) -> Result<()> {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact();

    if verbose > 0 {
        builder.init();
    } else {
        builder.without_time().init();
    }

    Ok(())
}
