use anyhow::{Context, bail};
use certstep::cli::{Action, CommandLineArguments};
use certstep::coordinator::OrderCoordinator;
use certstep::error::Error;
use certstep::{CRATE_NAME, config, interactive};
use clap::Parser;
use crossterm::style::Stylize;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

const ENV_FILTER_NAME: &str = "CERTSTEP_LOG";

/// Exit code of a verification whose record is not (yet) visible
const EXIT_NOT_VERIFIED: u8 = 2;

async fn run(cli: CommandLineArguments, interactive: bool) -> anyhow::Result<ExitCode> {
    let mut config = config::load(&cli.config)?;
    if config.email.trim().is_empty() && cli.email.is_none() {
        if !interactive {
            bail!(
                "No email configured. Set `email` in {} or pass --email",
                cli.config.display()
            );
        }
        config.email = interactive::ask_email()?;
        config::save(&config, &cli.config)?;
    }
    cli.apply_overrides(&mut config);

    let action = match cli.order.action {
        Some(action) => action,
        None if interactive => {
            println!("{}", format!("{CRATE_NAME} certificate issuance").green());
            interactive::ask_action()?
        }
        None => bail!(
            "An action (create, verify, finish) must be specified (a non-interactive terminal was detected, so interactive options have been disabled)"
        ),
    };
    let domain = match cli.order.domain {
        Some(domain) => domain,
        None if interactive => interactive::ask_domain()?,
        None => bail!("A domain must be specified with --domain"),
    };

    let coordinator = OrderCoordinator::from_config(&config)
        .await
        .context("Loading configuration failed")?;
    match action {
        Action::Create => {
            let created = coordinator.create_order(&domain).await?;
            interactive::print_order_created(&created);
        }
        Action::Verify => {
            let result = coordinator.verify_order(&domain).await?;
            interactive::print_verification(&result);
            if !result.matched {
                return Ok(ExitCode::from(EXIT_NOT_VERIFIED));
            }
        }
        Action::Finish => {
            let issued = coordinator.finish_order(&domain).await.map_err(|e| {
                if matches!(e, Error::ChallengeNotFound { .. }) {
                    anyhow::Error::new(e)
                } else if e.is_retryable() {
                    anyhow::Error::new(e).context("Finishing the order failed, it can be retried later")
                } else {
                    anyhow::Error::new(e).context("Finishing the order failed, start over with create")
                }
            })?;
            interactive::print_certificate_issued(&issued);
        }
    }
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = CommandLineArguments::parse();
    let filter = EnvFilter::try_from_env(ENV_FILTER_NAME).unwrap_or_else(|_| {
        EnvFilter::try_from_env("RUST_LOG")
            .unwrap_or_else(|_| EnvFilter::new(if cli.verbose { "certstep=debug,info" } else { "info" }))
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();
    let interactive = interactive::is_interactive() && !cli.noninteractive;
    let result = run(cli, interactive).await;
    if interactive && result.is_err() {
        // Wrap last line to avoid anyhow conflicts with the interactive terminal
        println!();
    }
    result
}
