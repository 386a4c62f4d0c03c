use std::path::PathBuf;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use tether_core::App;
use tether_core::config::Config;

/// Headless front-end for the Tether orchestration core. The terminal UI
/// ships separately; this binary serves scripted, single-prompt runs.
#[derive(Debug, Parser)]
#[command(name = "tether", version)]
struct Cli {
    /// Run a single prompt non-interactively and exit.
    #[arg(short, long)]
    prompt: Option<String>,

    /// Suppress incremental streaming output; print only the final message.
    #[arg(short, long, default_value_t = false)]
    quiet: bool,

    /// Skip all permission prompts for this run.
    #[arg(long, default_value_t = false)]
    yolo: bool,

    /// Working directory for the session (defaults to the current one).
    #[arg(long, value_name = "DIR")]
    cwd: Option<PathBuf>,
}

fn init_tracing(debug: bool) {
    let default_directive = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let cwd = match cli.cwd {
        Some(dir) => dir,
        None => match std::env::current_dir() {
            Ok(dir) => dir,
            Err(e) => {
                eprintln!("tether: unable to determine working directory: {e}");
                std::process::exit(1);
            }
        },
    };

    let mut config = match Config::load(&cwd) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("tether: failed to load config: {e}");
            std::process::exit(1);
        }
    };
    if cli.yolo {
        config.app.yolo = true;
    }
    init_tracing(config.options.debug);

    let app = match App::new(config).await {
        Ok(app) => app,
        Err(e) => {
            eprintln!("tether: initialization failed: {e}");
            std::process::exit(1);
        }
    };

    let exit_code = match &cli.prompt {
        Some(prompt) => {
            if let Err(e) = app.append_input_history(prompt) {
                tracing::warn!("failed to persist input history: {e}");
            }
            let run = app.run_non_interactive(prompt, cli.quiet);
            tokio::select! {
                result = run => match result {
                    Ok(()) => 0,
                    Err(e) => {
                        error!("agent run failed: {e}");
                        1
                    }
                },
                _ = tokio::signal::ctrl_c() => {
                    if let Some(agent) = &app.coder_agent {
                        agent.cancel_all();
                    }
                    130
                }
            }
        }
        None => {
            eprintln!("tether: no prompt given; pass --prompt to run headless");
            2
        }
    };

    app.shutdown().await;
    std::process::exit(exit_code);
}
