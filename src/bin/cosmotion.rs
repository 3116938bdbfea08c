use std::process;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use cosmotion::config::Settings;
use cosmotion::pipeline::Pipeline;

fn run(settings: Settings) -> Result<(), failure::Error> {
    let config = settings.into_config()?;
    let summary = Pipeline::new(config).run()?;

    println!(
        "Best trial {} of {}: AUC@{} {}",
        summary.best_trial, summary.trials, summary.k, summary.best_score
    );

    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::parse();

    if let Err(err) = run(settings) {
        error!("{}", err);
        for cause in err.iter_causes() {
            error!("caused by: {}", cause);
        }
        process::exit(1);
    }
}
