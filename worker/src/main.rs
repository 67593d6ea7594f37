use actix_web::{web, App, HttpResponse, HttpServer, Responder};
use anyhow::Result;
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod config;
mod state;

use api::create_api_router;
use config::WorkerConfig;
use state::AppState;

async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    // 初始化日志
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vulnscan_worker=debug,vulnscan_core=info,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = WorkerConfig::from_env()?;
    if config.sandbox_program.is_none() {
        tracing::warn!("VULNSCAN_SANDBOX is not set, scans will run outside a sandbox");
    }

    // 初始化状态
    let state = AppState::new(&config).await?;

    // 启动服务器
    tracing::info!(worker_version = %config.worker_version, "vulnscan worker listening on {}", config.bind_address);

    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .wrap(TracingLogger::default())
            // 健康检查
            .route("/health", web::get().to(health_check))
            .service(create_api_router())
    })
    .bind(&config.bind_address)?
    .run()
    .await?;

    Ok(())
}
