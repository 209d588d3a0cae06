use logflow::{app, config::AppConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

    let use_ansi = atty::is(atty::Stream::Stdout);
    let json_output = std::env::var("LOG_FORMAT").map(|f| f == "json").unwrap_or(false);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("logflow={},tower_http=debug", log_level).into()),
        )
        .with(json_output.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json_output).then(|| tracing_subscriber::fmt::layer().with_ansi(use_ansi)))
        .init();

    let config = AppConfig::from_env()?;

    app::run(config).await?;

    Ok(())
}
