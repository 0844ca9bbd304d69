use anyhow::Context;
use audit_exporter::prelude::*;
use clap::Parser;
use colored::Colorize;
use std::path::PathBuf;

/// audit-exporter - export kernel audit executions as Prometheus metrics
#[derive(Parser, Debug)]
#[command(name = "audit-exporter")]
#[command(version, about, long_about = None)]
struct Cli {
    /// JSON rule set to install before exporting
    rules: PathBuf,

    /// Configuration file layered over the default locations
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load(cli.config.as_deref()).context("Loading configuration")?;
    init_tracing(&config)?;

    let control = AuditctlControl::new(config.audit.auditctl.clone());
    let provisioned = Provisioner::new(control, &config.audit)
        .provision(&cli.rules)
        .await?;

    for warning in &provisioned.warnings {
        eprintln!("{} {}", "Warning:".yellow().bold(), warning);
    }

    let source = RecordStreamSource::open(
        config.audit.record_path.clone(),
        config.audit.follow,
        config.audit.poll_interval(),
    )
    .await?;

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    Exporter::new(config)?.run(source, shutdown).await?;

    Ok(())
}

#[tokio::main]
async fn main() {
    // Bad invocations print usage and exit cleanly
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            std::process::exit(0);
        }
    };

    match run(cli).await {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("{} {}", "Error:".red().bold(), e);

            if let Some(source) = e.source() {
                eprintln!("\n{} {}", "Caused by:".yellow(), source);
            }

            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_rules_path_is_required() {
        assert!(Cli::try_parse_from(["audit-exporter"]).is_err());
    }

    #[test]
    fn test_extra_positional_is_rejected() {
        assert!(Cli::try_parse_from(["audit-exporter", "a.json", "b.json"]).is_err());
    }

    #[test]
    fn test_parses_rules_and_config() {
        let cli =
            Cli::try_parse_from(["audit-exporter", "rules.json", "--config", "exporter.toml"])
                .unwrap();
        assert_eq!(cli.rules, PathBuf::from("rules.json"));
        assert_eq!(cli.config, Some(PathBuf::from("exporter.toml")));
    }
}
