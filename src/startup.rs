// Startup module - displays banner and module loading status
//
// Shows version info and which subsystems are active for the selected
// run mode before the async runtime's tasks start logging over it.

use crate::cli::RunMode;
use crate::config::{Config, VERSION};

mod colors {
    pub const RESET: &str = "\x1b[0m";
    pub const BOLD: &str = "\x1b[1m";
    pub const DIM: &str = "\x1b[2m";
    pub const CYAN: &str = "\x1b[36m";
    pub const GREEN: &str = "\x1b[32m";
}

pub struct ModuleStatus {
    pub name: &'static str,
    pub enabled: bool,
    pub description: &'static str,
}

/// Print the startup banner and module loading status to stdout.
pub fn print_startup(config: &Config, mode: &RunMode) {
    use colors::*;

    println!();
    println!("  {BOLD}{CYAN}akita-agent{RESET} {DIM}v{VERSION}{RESET}");
    println!("  {DIM}API-observability capture agent{RESET}");
    println!();

    if let Some(path) = Config::config_path() {
        if path.exists() {
            println!("  {DIM}Config:{RESET} {GREEN}\u{2713}{RESET} {}", path.display());
        } else {
            println!("  {DIM}Config:{RESET} {DIM}(using defaults){RESET}");
        }
    }
    println!();

    println!("  {DIM}Loading modules...{RESET}");
    for module in &module_status(config, mode) {
        print_module_status(module);
    }
    println!();

    match mode {
        RunMode::Capture { interface, offline_file } => {
            let source = offline_file
                .clone()
                .or_else(|| interface.clone())
                .or_else(|| config.capture.offline_file.clone())
                .or_else(|| config.capture.interface.clone())
                .unwrap_or_else(|| "(first available interface)".to_string());
            println!("  {BOLD}Capturing from{RESET} {source}");
        }
        RunMode::Daemon => {
            println!("  {BOLD}Daemon listening on{RESET} {}", config.daemon.bind_addr);
        }
    }
    println!();
}

fn module_status(config: &Config, mode: &RunMode) -> Vec<ModuleStatus> {
    let capture_mode = matches!(mode, RunMode::Capture { .. });
    vec![
        ModuleStatus {
            name: "capture",
            enabled: capture_mode,
            description: "Packet capture & TCP reassembly",
        },
        ModuleStatus {
            name: "parser",
            enabled: capture_mode,
            description: "HTTP/1.x + TLS handshake parsing",
        },
        ModuleStatus {
            name: "filters",
            enabled: capture_mode,
            description: "Allow/deny/tracker/rate-limit chain",
        },
        ModuleStatus {
            name: "pipeline",
            enabled: capture_mode,
            description: "Obfuscation plugin chain",
        },
        ModuleStatus {
            name: "collector",
            enabled: true,
            description: "Batched, retried witness upload",
        },
        ModuleStatus {
            name: "daemon",
            enabled: matches!(mode, RunMode::Daemon),
            description: "Localhost control surface",
        },
        ModuleStatus {
            name: "telemetry",
            enabled: config.telemetry.enabled,
            description: "Self-stats reporting",
        },
    ]
}

fn print_module_status(module: &ModuleStatus) {
    use colors::*;

    let (icon, style) = if module.enabled {
        (format!("{GREEN}\u{2713}{RESET}"), "")
    } else {
        (format!("{DIM}\u{25cb}{RESET}"), DIM)
    };

    println!("    {icon} {style}{:<12}{RESET} {DIM}{}{RESET}", module.name, module.description);
}

/// Mirror the startup banner into the tracing log, so the same boot
/// sequence shows up in file/JSON logs as well as the terminal.
pub fn log_startup(config: &Config, mode: &RunMode) {
    tracing::info!("akita-agent v{} starting", VERSION);
    for module in &module_status(config, mode) {
        let icon = if module.enabled { "\u{2713}" } else { "\u{25cb}" };
        tracing::info!("  {} {} - {}", icon, module.name, module.description);
    }
    tracing::info!("ready");
}
