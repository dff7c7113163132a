use clap::Parser;
use std::path::PathBuf;

use lumi_setup::settings::Settings;

/// Install a curated set of desktop applications on a Debian-family system.
#[derive(Parser, Debug)]
#[command(name = "lumi-setup", version, about)]
struct Cli {
    /// Verbose (DEBUG) output on the terminal
    #[arg(long)]
    debug: bool,

    /// List logs, summaries and the checkpoint of earlier runs, then exit
    #[arg(long)]
    view_logs: bool,

    /// Configuration file (defaults to ~/.config/lumi-setup/config.toml when present)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Ignore and reset any checkpoint left by an interrupted run
    #[arg(long)]
    fresh: bool,

    /// Print the step registry, then exit
    #[arg(long)]
    list_steps: bool,

    /// Print the effective configuration as TOML, then exit
    #[arg(long)]
    print_config: bool,

    /// Report which catalog applications have newer versions available, then exit
    #[arg(long)]
    check_updates: bool,
}

fn main() {
    let cli = Cli::parse();

    let settings = match Settings::load(cli.config.as_deref()) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(2);
        }
    };

    if cli.print_config {
        exit_on_error(lumi_setup::run_print_config(&settings));
        return;
    }
    if cli.list_steps {
        exit_on_error(lumi_setup::run_list_steps(&settings));
        return;
    }
    if cli.view_logs {
        exit_on_error(lumi_setup::run_view_logs(&settings));
        return;
    }

    if let Err(e) = lumi_setup::init_logging(&settings, cli.debug) {
        eprintln!("Failed to initialize logging: {:#}", e);
    }

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {}", e);
            std::process::exit(2);
        }
    };

    if cli.check_updates {
        let result = rt.block_on(lumi_setup::run_check_updates(&settings));
        exit_on_error(result.map(|_| ()));
        return;
    }

    match rt.block_on(lumi_setup::run_install(settings, cli.fresh)) {
        Ok(report) => std::process::exit(lumi_setup::exit_code(&report)),
        Err(e) => {
            log::error!("[PHASE: fatal] [STEP: startup] {:?}", e);
            eprintln!("Installer error: {:#}", e);
            std::process::exit(2);
        }
    }
}

fn exit_on_error(result: anyhow::Result<()>) {
    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
