//! services/api/src/bin/api.rs

use api_lib::{
    adapters::{dispatcher_for, DbAdapter, LogMailer, OpenAiChatAdapter, UpstashVectorAdapter},
    config::Config,
    error::ApiError,
    web::{cors_layer, create_router, run_local_jobs, AppState, Ports},
};
use async_openai::{config::OpenAIConfig, Client};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tutor_core::ports::SystemClock;

#[tokio::main]
async fn main() -> Result<(), ApiError> {
    // --- 1. Load Configuration & Set Up Logging ---
    let config = Config::from_env()?;
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config.log_level.to_string()))
        .with(tracing_subscriber::fmt::layer())
        .init();
    info!("Configuration loaded. Starting server...");

    // --- 2. Connect to Database & Run Migrations ---
    info!("Connecting to database...");
    let db_pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await?;
    let db = Arc::new(DbAdapter::new(db_pool));
    info!("Running database migrations...");
    db.run_migrations().await?;
    info!("Database migrations complete.");

    // --- 3. Initialize Service Adapters ---
    let openai_client =
        Client::with_config(OpenAIConfig::new().with_api_key(config.openai_api_key.clone()));
    let generator = Arc::new(OpenAiChatAdapter::new(openai_client, config.chat_model.clone()));

    let http = reqwest::Client::new();
    let vectors = Arc::new(UpstashVectorAdapter::new(
        http.clone(),
        config.vector_index.clone(),
        config.resource_index.clone(),
    ));
    let (jobs, local_jobs) = dispatcher_for(&config.jobs, http);
    if local_jobs.is_some() {
        warn!("INNGEST_EVENT_KEY is not set; jobs will run in-process.");
    }

    // --- 4. Build the Shared AppState ---
    let ports = Ports {
        users: db.clone(),
        lessons: db.clone(),
        courses: db.clone(),
        sessions: db.clone(),
        messages: db.clone(),
        recommendations: db.clone(),
        sittings: db,
        vectors,
        generator,
        jobs,
        mailer: Arc::new(LogMailer),
        clock: Arc::new(SystemClock),
    };
    let app_state = Arc::new(AppState::new(ports, config.jobs_secret.clone()));

    if let Some(receiver) = local_jobs {
        tokio::spawn(run_local_jobs(app_state.clone(), receiver));
    }

    // --- 5. Create the Web Router ---
    let app = create_router(app_state.clone()).layer(cors_layer(&config.cors_origin)?);

    // --- 6. Start the Server ---
    info!("Starting server on {}", config.bind_address);
    info!(
        "Swagger UI available at http://{}/swagger-ui",
        config.bind_address
    );
    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Replies still being written when the server stopped.
    app_state.chat.wait_for_pending_writes().await;
    let failures = app_state.chat.persistence_failures();
    if failures > 0 {
        warn!(failures, "Some assistant replies could not be saved during this run.");
    }
    info!("Server stopped.");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for the shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received.");
}
