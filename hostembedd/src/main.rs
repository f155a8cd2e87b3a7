mod protocol;
mod session;

use clap::Parser;
use hostembed_core::DeviceConfig;
use protocol::{error_line, ok_line, Request, Response};
use session::Session;
use std::io::{self, BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "hostembedd",
    version,
    about = "Serves host-resident embedding tables over stdin/stdout"
)]
struct Args {
    /// Device configuration file (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Start from the tables in this checkpoint directory
    #[arg(long)]
    restore: Option<PathBuf>,

    #[arg(long)]
    log_level: Option<String>,
}

fn main() {
    let args = Args::parse();
    let filter = match args.log_level.as_deref() {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let startup = DeviceConfig::load_or_default(args.config.as_deref()).and_then(|config| {
        match &args.restore {
            Some(dir) => Session::restore(config, dir),
            None => Ok(Session::new(config)),
        }
    });
    let mut session = match startup {
        Ok(session) => session,
        Err(e) => {
            println!("{}", error_line(e.code(), e.to_string()));
            process::exit(1);
        }
    };

    let stdin = io::stdin();
    let reader = BufReader::new(stdin.lock());
    let stdout = io::stdout();
    let mut out = stdout.lock();

    for line in reader.lines() {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                let _ = writeln!(out, "{}", error_line("E_IO", e.to_string()));
                continue;
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        let request: Request = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(e) => {
                let _ = writeln!(out, "{}", error_line("E_PARSE", e.to_string()));
                let _ = out.flush();
                continue;
            }
        };

        let reply = match session.handle(request) {
            Ok(response) => {
                let line = ok_line(&response);
                if matches!(response, Response::Shutdown) {
                    let _ = writeln!(out, "{}", line);
                    let _ = out.flush();
                    tracing::info!("shutdown requested");
                    process::exit(0);
                }
                line
            }
            Err(e) => {
                tracing::debug!(code = e.code(), error = %e, "request failed");
                error_line(e.code(), e.to_string())
            }
        };
        let _ = writeln!(out, "{}", reply);
        let _ = out.flush();
    }
}
