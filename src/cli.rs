// CLI module - command-line argument parsing and handlers
//
// Two concerns live here: configuration management (`akita-agent config
// --show/--reset/--edit/--update/--path`) and run-mode selection
// (`akita-agent capture` / `akita-agent daemon`). Config subcommands are
// handled and exited before the async runtime ever starts; run-mode
// selection is handed back to `main` to drive the rest of startup.

use crate::config::{Config, VERSION};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::process::Command;

/// akita-agent - API-observability capture and daemon agent
#[derive(Parser)]
#[command(name = "akita-agent")]
#[command(version = VERSION)]
#[command(about = "Passive HTTP(S) capture and witness-upload agent", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage configuration
    Config {
        /// Show effective configuration
        #[arg(long)]
        show: bool,

        /// Reset config file to defaults
        #[arg(long)]
        reset: bool,

        /// Open config file in $EDITOR
        #[arg(long)]
        edit: bool,

        /// Update config with new defaults (preserves user values)
        #[arg(long)]
        update: bool,

        /// Show config file path
        #[arg(long)]
        path: bool,
    },

    /// Run the packet-capture pipeline (capture -> reassemble -> parse ->
    /// pair -> filter -> plugin -> upload)
    Capture {
        /// Override the configured capture interface for this run
        #[arg(long)]
        interface: Option<String>,

        /// Read from a `.pcap`/`.pcapng` file instead of a live interface,
        /// or convert a `.har` file directly into witnesses
        #[arg(long)]
        offline_file: Option<String>,
    },

    /// Run the daemon coordinator: multiplex local clients onto
    /// server-managed traces via the localhost control surface
    Daemon,
}

/// What `main` should do once argument parsing and any config subcommands
/// have been handled.
pub enum RunMode {
    Capture { interface: Option<String>, offline_file: Option<String> },
    Daemon,
}

/// Parse CLI arguments. Config subcommands are executed immediately and
/// return `None` (caller should exit 0); otherwise returns the run mode
/// `main` should drive, defaulting to `Capture` with no overrides.
pub fn parse_run_mode() -> Option<RunMode> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Config { show, reset, edit, update, path }) => {
            if path {
                handle_config_path();
            } else if show {
                handle_config_show();
            } else if reset {
                handle_config_reset();
            } else if edit {
                handle_config_edit();
            } else if update {
                handle_config_update();
            } else {
                println!("Usage: akita-agent config [--show|--reset|--edit|--update|--path]");
                println!();
                println!("Options:");
                println!("  --show    Display effective configuration");
                println!("  --reset   Reset config file to defaults");
                println!("  --edit    Open config file in $EDITOR");
                println!("  --update  Update config with new defaults (preserves user values)");
                println!("  --path    Show config file path");
            }
            None
        }
        Some(Commands::Capture { interface, offline_file }) => Some(RunMode::Capture { interface, offline_file }),
        Some(Commands::Daemon) => Some(RunMode::Daemon),
        None => Some(RunMode::Capture { interface: None, offline_file: None }),
    }
}

fn handle_config_path() {
    match Config::config_path() {
        Some(path) => println!("{}", path.display()),
        None => {
            eprintln!("Error: Could not determine config path");
            std::process::exit(2);
        }
    }
}

fn handle_config_show() {
    let config = Config::from_env();

    println!("# Effective configuration (env > file > defaults)");
    println!();
    println!("log_dir = {:?}", config.log_dir.display().to_string());
    println!();
    println!("[capture]");
    println!("interface = {:?}", config.capture.interface);
    println!("offline_file = {:?}", config.capture.offline_file);
    println!("bpf_filter = {:?}", config.capture.bpf_filter);
    println!("parse_tls_handshakes = {}", config.capture.parse_tls_handshakes);
    println!("max_http_length = {}", config.capture.max_http_length);
    println!();
    println!("[filters]");
    println!("allow_hosts = {:?}", config.filters.allow_hosts);
    println!("deny_hosts = {:?}", config.filters.deny_hosts);
    println!("rate_limit_per_minute = {}", config.filters.rate_limit_per_minute);
    println!();
    println!("[backend]");
    println!("endpoint = {:?}", config.backend.endpoint);
    println!("batch_max_events = {}", config.backend.batch_max_events);
    println!();
    println!("[daemon]");
    println!("bind_addr = {}", config.daemon.bind_addr);
    println!("control_plane_url = {:?}", config.daemon.control_plane_url);
    println!();
    println!("[telemetry]");
    println!("enabled = {}", config.telemetry.enabled);
    println!("report_interval_secs = {}", config.telemetry.report_interval_secs);

    println!();
    if let Some(path) = Config::config_path() {
        if path.exists() {
            println!("# Source: {}", path.display());
        } else {
            println!("# Source: defaults (no config file)");
        }
    }
}

fn handle_config_reset() {
    let Some(path) = Config::config_path() else {
        eprintln!("Error: Could not determine config path");
        std::process::exit(2);
    };

    if path.exists() {
        eprint!("Config file exists at {}. Overwrite? [y/N] ", path.display());
        std::io::stderr().flush().unwrap();

        let mut input = String::new();
        std::io::stdin().read_line(&mut input).unwrap();

        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Aborted.");
            return;
        }
    }

    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            eprintln!("Error creating directory: {}", e);
            std::process::exit(2);
        }
    }

    if let Err(e) = std::fs::write(&path, Config::default().to_toml()) {
        eprintln!("Error writing config: {}", e);
        std::process::exit(2);
    }

    println!("Config reset to defaults: {}", path.display());
}

fn handle_config_edit() {
    let Some(path) = Config::config_path() else {
        eprintln!("Error: Could not determine config path");
        std::process::exit(2);
    };

    if !path.exists() {
        Config::ensure_config_exists();
        println!("Created new config file: {}", path.display());
    }

    let editor = std::env::var("EDITOR")
        .or_else(|_| std::env::var("VISUAL"))
        .unwrap_or_else(|_| if cfg!(windows) { "notepad".to_string() } else { "nano".to_string() });

    println!("Opening {} with {}", path.display(), editor);

    let status = Command::new(&editor).arg(&path).status();

    match status {
        Ok(s) if s.success() => {}
        Ok(s) => {
            eprintln!("Editor exited with status: {}", s);
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("Failed to launch editor '{}': {}", editor, e);
            eprintln!("Set $EDITOR environment variable to your preferred editor");
            std::process::exit(1);
        }
    }
}

fn handle_config_update() {
    let Some(path) = Config::config_path() else {
        eprintln!("Error: Could not determine config path");
        std::process::exit(2);
    };

    if !path.exists() {
        Config::ensure_config_exists();
        println!("Created new config file: {}", path.display());
        return;
    }

    let existing = Config::from_env();
    let updated = existing.to_toml();

    let backup_path = path.with_extension("toml.bak");
    if let Err(e) = std::fs::copy(&path, &backup_path) {
        eprintln!("Warning: Could not create backup: {}", e);
    } else {
        println!("Backup created: {}", backup_path.display());
    }

    if let Err(e) = std::fs::write(&path, updated) {
        eprintln!("Error writing config: {}", e);
        std::process::exit(2);
    }

    println!("Config updated with latest structure: {}", path.display());
    println!("Your values have been preserved.");
}
