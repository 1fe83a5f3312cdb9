use std::process;
use std::sync::Arc;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
use xcomet::transport::{ServerConfig, serve};
use xcomet::{EvaluationService, HealthMonitor, SupervisorConfig, WorkerManager};

#[derive(Debug, Default, PartialEq, Eq)]
struct Cli {
    host: Option<String>,
    port: Option<u16>,
    preload: bool,
    model: Option<String>,
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();

    let cli = match parse_args(&args) {
        Ok(cli) => cli,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("Usage: xcomet-server [--host <host>] [--port <port>] [--preload] [--model <id>]");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --host <host>    Address to listen on [default: 127.0.0.1]");
            eprintln!("  --port <port>    Port to listen on [default: 8000]");
            eprintln!("  --preload        Load the model at boot instead of on first request");
            eprintln!("  --model <id>     Scoring model [default: $XCOMET_MODEL or Unbabel/XCOMET-XL]");
            process::exit(2);
        }
    };

    init_tracing();

    if let Err(e) = run(cli).await {
        tracing::error!(error = %e, "xcomet-server failed");
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Result<Cli, String> {
    let mut cli = Cli::default();

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--host" => {
                i += 1;
                cli.host = Some(args.get(i).ok_or("--host requires a value")?.clone());
            }
            "--port" => {
                i += 1;
                let value = args.get(i).ok_or("--port requires a value")?;
                let port = value
                    .parse::<u16>()
                    .map_err(|_| format!("invalid port: {value}"))?;
                cli.port = Some(port);
            }
            "--model" => {
                i += 1;
                cli.model = Some(args.get(i).ok_or("--model requires a value")?.clone());
            }
            "--preload" => cli.preload = true,
            "--help" | "-h" => return Err(String::new()),
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }

    Ok(cli)
}

/// Initialize tracing with XCOMET_LOG and LOG_FORMAT support.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let base_level = match std::env::var("XCOMET_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };

        let filter_str = format!(
            "xcomet={level},xcomet_server={level},xcomet::worker={level}",
            level = base_level
        );

        EnvFilter::new(filter_str)
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = SupervisorConfig::from_env();
    if let Some(model) = cli.model {
        config = config.with_model(model);
    }
    if cli.preload {
        config = config.with_preload(true);
    }
    tracing::info!(?config, "Starting xCOMET supervisor");

    let manager = WorkerManager::new(config)?;
    let service = Arc::new(EvaluationService::new(Arc::clone(&manager)));
    let monitor = HealthMonitor::new(Arc::clone(&manager)).spawn();

    if manager.config().preload {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            match manager.ensure_ready().await {
                Ok(port) => tracing::info!(port, "xCOMET worker preloaded"),
                Err(e) => tracing::warn!(error = %e, "xCOMET worker preload failed"),
            }
        });
    }

    let defaults = ServerConfig::default();
    let server = ServerConfig {
        host: cli.host.unwrap_or(defaults.host),
        port: cli.port.unwrap_or(defaults.port),
    };
    serve(server, service).await?;

    if let Err(e) = monitor.await {
        tracing::warn!(error = %e, "Health monitor task failed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("xcomet-server")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn no_arguments_uses_defaults() {
        assert_eq!(parse_args(&args(&[])).unwrap(), Cli::default());
    }

    #[test]
    fn all_flags() {
        let cli = parse_args(&args(&[
            "--host",
            "0.0.0.0",
            "--port",
            "9000",
            "--preload",
            "--model",
            "Unbabel/XCOMET-XXL",
        ]))
        .unwrap();
        assert_eq!(
            cli,
            Cli {
                host: Some("0.0.0.0".to_string()),
                port: Some(9000),
                preload: true,
                model: Some("Unbabel/XCOMET-XXL".to_string()),
            }
        );
    }

    #[test]
    fn usage_errors() {
        assert_eq!(
            parse_args(&args(&["--port"])).unwrap_err(),
            "--port requires a value"
        );
        assert_eq!(
            parse_args(&args(&["--port", "http"])).unwrap_err(),
            "invalid port: http"
        );
        assert_eq!(
            parse_args(&args(&["serve"])).unwrap_err(),
            "unexpected argument: serve"
        );
        assert_eq!(parse_args(&args(&["-h"])).unwrap_err(), "");
    }
}
