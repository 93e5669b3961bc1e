use clap::Parser;
use tracing::error;

use caas::cli::{Cli, Commands};
use caas::client::{Client, ExitError};

#[tokio::main]
async fn main() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Server(args) => {
            if let Err(err) = caas::server::run(args.into_config()).await {
                error!("{err:#}");
                std::process::exit(1);
            }
        }
        Commands::Client(args) => {
            std::process::exit(run_client(args).await);
        }
    }
}

/// The process exit code mirrors the remote command's exit code; local
/// and protocol failures exit 1 with the reason on stderr.
async fn run_client(args: caas::cli::ClientArgs) -> i32 {
    let (cfg, request) = match args.into_parts() {
        Ok(parts) => parts,
        Err(err) => {
            eprintln!("{err:#}");
            return 1;
        }
    };

    let mut client = Client::new(cfg);
    if let Err(err) = client.connect().await {
        match err.downcast_ref::<ExitError>() {
            // The refusal reason already streamed to stderr.
            Some(exit) => return exit.exit_code,
            None => {
                eprintln!("{err:#}");
                return 1;
            }
        }
    }

    let code = match client.exec(&request).await {
        Ok(()) => 0,
        Err(err) => {
            if !err.message.is_empty() {
                eprintln!("{err}");
            }
            err.exit_code
        }
    };
    client.close();
    code
}
