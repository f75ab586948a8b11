use clap::Parser;
use colored::*;
use tracing_subscriber::EnvFilter;

use abtune::cli::{self, Args};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("abtune=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let report = match cli::run(&args) {
        Ok(report) => report,
        Err(e) => {
            eprintln!("{} {}", "error:".bright_red().bold(), e);
            std::process::exit(1);
        }
    };

    if args.json {
        match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                eprintln!("{} {}", "error:".bright_red().bold(), e);
                std::process::exit(1);
            }
        }
    } else {
        print!("{}", cli::render_text(&report));
    }
}
