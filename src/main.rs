use std::fmt::Debug;
use std::fmt::Display;

use campaign_mailer::configuration::get_configuration;
use campaign_mailer::startup::Application;
use campaign_mailer::telemetry::get_subscriber;
use campaign_mailer::telemetry::init_subscriber;
use campaign_mailer::upload::init_sweeper_worker;
use tokio::task::JoinError;

fn report_exit(
    name: &str,
    outcome: Result<Result<(), impl Debug + Display>, JoinError>,
) {
    match outcome {
        Ok(Ok(())) => {
            tracing::info!("{name} exited gracefully")
        }

        Ok(Err(e)) => {
            tracing::error!(
                error.cause_chain=?e,
                error.message=%e,
                "{name} failed (inner)"
            )
        }

        Err(e) => {
            tracing::error!(
                error.cause_chain=?e,
                error.message=%e,
                "{name} failed (outer)"
            )
        }
    }
}

/// Initialise telemetry, load config, and start the server next to the staging
/// sweeper
#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let subscriber = get_subscriber("campaign-mailer", "info", std::io::stdout);
    init_subscriber(subscriber);

    let cfg = get_configuration()?;

    let application = Application::build(cfg.clone()).await?;
    let sweeper = init_sweeper_worker(cfg, application.uploads());

    let server_thread = tokio::spawn(application.run_until_stopped());
    let sweeper_thread = tokio::spawn(sweeper);

    // whichever stops first takes the other down with it
    tokio::select! {
        o = server_thread => { report_exit("API", o) },
        o = sweeper_thread => { report_exit("Staging sweeper", o) },
    }

    Ok(())
}
