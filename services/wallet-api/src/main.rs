use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use dotenv::dotenv;
use tracing::info;
use tracing_subscriber::EnvFilter;
use wallet_api::{auth::JwtAuth, config::Config, handlers, services};

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(true)
        .with_target(false);

    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    let config = Config::from_env().context("Failed to load configuration")?;
    init_tracing(&config);
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    info!("Starting Wallet API on port {}", config.server.port);

    let wallet = services::build_wallet(&config).await?;
    let registry = services::metrics_registry()?;
    let _sweeper = services::spawn_sweeper(&wallet);

    let jwt_secret = config.auth.jwt_secret.clone();
    let admin_scope = config.auth.admin_scope.clone();

    HttpServer::new(move || {
        let cors = Cors::permissive();

        App::new()
            .wrap(JwtAuth::new(&jwt_secret, &admin_scope))
            .wrap(cors)
            .wrap(middleware::Logger::default())
            .wrap(middleware::NormalizePath::trim())
            .app_data(web::Data::new(wallet.clone()))
            .app_data(web::Data::new(registry.clone()))
            .configure(handlers::configure_routes)
    })
    .workers(config.server.workers.max(1))
    .bind((config.server.host.as_str(), config.server.port))?
    .run()
    .await?;

    Ok(())
}
