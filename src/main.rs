//! Trama CLI — incremental builds for generative media pipelines.

use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "trama",
    version,
    about = "Incremental build engine for generative media pipelines — blueprint DAGs, BLAKE3 manifests, append-only provenance"
)]
struct Cli {
    #[command(subcommand)]
    command: trama::cli::Commands,
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = trama::cli::dispatch(cli.command) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
