use clap::{Parser, Subcommand};
use replay_cache::cli;
use replay_cache::config::resolve_config_path;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "replay-cache")]
#[command(about = "Chunked cache and replay for partitioned queries", long_about = None)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log debug output to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Split, generate, replay and print the result as JSON
    Run,
    /// Populate partition logs without replaying
    Generate,
    /// Purge expired partition logs and chunk results
    Sweep,
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Init {
        #[arg(long)]
        stdout: bool,
    },
    Validate,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config_path = resolve_config_path(cli.config.as_deref());

    let command = cli.command.unwrap_or(Commands::Run);
    if let Commands::Config { action } = command {
        cli::init_tracing(cli.verbose);
        return match action {
            ConfigAction::Init { stdout } => cli::config::init(stdout),
            ConfigAction::Validate => cli::config::validate(config_path),
        };
    }

    let config = match cli::run::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(cli::run::RunError::ConfigNotFound) => {
            eprintln!("Error: config not found");
            eprintln!("Searched locations:");
            for path in cli::run::searched_locations() {
                eprintln!("  {}", path.display());
            }
            eprintln!("\nUse --config <path> to specify a config file, or run 'replay-cache config init' to generate one.");
            std::process::exit(1);
        }
        Err(e) => return Err(e.into()),
    };
    cli::init_tracing(cli.verbose || config.debug);

    match command {
        Commands::Generate => cli::run::generate(&config).await?,
        Commands::Sweep => cli::run::sweep(&config).await?,
        _ => cli::run::run(&config).await?,
    }

    Ok(())
}
