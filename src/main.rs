use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use lingo::config::Config;
use lingo::dispatch::client_pool::ClientPool;
use lingo::engine::Engine;
use lingo::requester::Services;
use lingo::tester::ApiTester;

/// Test every API key of one configured model and print the results as JSON.
#[derive(Debug, Parser)]
#[command(name = "lingo", version)]
struct Cli {
    /// Model id to test (defaults to the configured active model)
    #[arg(long)]
    model: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    dotenvy::dotenv().ok();

    let config = Config::load()?;

    let model_id = cli.model.unwrap_or_else(|| config.active_model_id.clone());
    let model = config
        .get_model(&model_id)
        .with_context(|| format!("model {model_id:?} not found in config"))?;

    tracing::info!("lingo api test starting for model {}", model.id);

    let engine = Arc::new(Engine::new());
    let services = Services {
        pool: Arc::new(ClientPool::new(config.proxy())),
        tracker: engine.clone(),
        matrix: Arc::new(config.thinking_matrix()?),
    };

    let tester = ApiTester::new(&config, &engine, services);
    let result = tester.run(model).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);

    if !result.success {
        std::process::exit(1);
    }
    Ok(())
}
