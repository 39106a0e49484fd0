use agent_portal::AppResources;
use agent_portal::api::start_webserver;
use agent_portal::config::load_config_or_panic;
use migration::{Migrator, MigratorTrait};
use sea_orm::Database;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

fn initialize_tracing() {
    let default_directives = "agent_portal=info,tower_http=info,sea_orm=warn";
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true).with_level(true))
        .init();
}

#[tokio::main]
async fn main() -> color_eyre::eyre::Result<()> {
    color_eyre::install()?;
    if let Err(e) = dotenvy::dotenv() {
        // A missing .env is the normal case outside development.
        if !e.not_found() {
            eprintln!("Failed to read .env: {e}");
        }
    }
    initialize_tracing();

    let config = load_config_or_panic();
    tracing::info!(
        environment = ?config.environment,
        listen_addr = %config.listen_addr,
        state_backend = ?config.state.backend,
        platform_mode = config.platform_mode.enabled,
        "Configuration loaded"
    );

    let db = Arc::new(Database::connect(&config.database_url).await?);
    Migrator::up(db.as_ref(), None).await?;

    let resources = AppResources::build(config, db).await?;
    let _sweeper = resources.spawn_sweeper();

    start_webserver(resources).await?;
    Ok(())
}
