//! cogent CLI: batch runner for command scripts.

use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;

use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, NamedSource, Result};

use cogent::agent::Agent;
use cogent::command::{Command, split_script};
use cogent::config::AgentConfig;
use cogent::error::CogentError;
use cogent::event::AgentEvent;
use cogent::production::parse_productions;
use cogent::symbol::SymbolTable;

#[derive(Parser)]
#[command(name = "cogent", version, about = "Symbolic cognitive-architecture engine")]
struct Cli {
    /// Agent configuration file (TOML).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the selection seed.
    #[arg(long, global = true)]
    seed: Option<u64>,

    /// Print events and results as JSON lines.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a command script against a fresh agent.
    Run {
        /// Path to the script.
        script: PathBuf,
    },

    /// Parse a production file and report diagnostics.
    Check {
        /// Path to the production file.
        file: PathBuf,
    },
}

fn main() -> Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .unicode(true)
                .context_lines(3)
                .build(),
        )
    }))
    .ok(); // Ignore error if hook already set (e.g., in tests)

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => AgentConfig::load(path)?,
        None => AgentConfig::default(),
    };
    if let Some(seed) = cli.seed {
        config.seed = seed;
    }

    match cli.command {
        Commands::Run { script } => run_script(&script, config, cli.json),
        Commands::Check { file } => check(&file),
    }
}

fn run_script(path: &Path, config: AgentConfig, json: bool) -> Result<()> {
    let text = std::fs::read_to_string(path).into_diagnostic()?;
    let mut agent = Agent::new(config)?;
    let events = agent.subscribe();

    for line in split_script(&text)? {
        let command: Command = line.parse()?;
        let outcome = match agent.execute(command) {
            Ok(outcome) => outcome,
            Err(e) => {
                print_events(&events, json)?;
                return Err(with_source(e, path, &line));
            }
        };
        print_events(&events, json)?;
        if json {
            println!("{}", serde_json::to_string(&outcome).into_diagnostic()?);
        } else {
            println!("{outcome}");
        }
    }

    agent.shutdown();
    print_events(&events, json)?;
    Ok(())
}

fn check(path: &Path) -> Result<()> {
    let text = std::fs::read_to_string(path).into_diagnostic()?;
    let symbols = SymbolTable::new();
    match parse_productions(&text, &symbols) {
        Ok(productions) => {
            for p in &productions {
                println!("{}", p.name);
            }
            println!("{} production(s) ok", productions.len());
            Ok(())
        }
        Err(e) => Err(with_source(e.into(), path, &text)),
    }
}

/// Attach the offending text so labelled spans render in context.
fn with_source(err: CogentError, path: &Path, text: &str) -> miette::Report {
    miette::Report::new(err).with_source_code(NamedSource::new(
        path.display().to_string(),
        text.to_string(),
    ))
}

fn print_events(events: &Receiver<AgentEvent>, json: bool) -> Result<()> {
    for event in events.try_iter() {
        if json {
            println!("{}", serde_json::to_string(&event).into_diagnostic()?);
        } else {
            println!("{event}");
        }
    }
    Ok(())
}
