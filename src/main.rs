use hyper::Server;
use hyper::service::{make_service_fn, service_fn};
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use vihara_image_compressor::config::AppConfig;
use vihara_image_compressor::handlers::ImageHandler;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = AppConfig::from_env();
    let defaults = &config.compression.defaults;

    info!("Starting image compressor at {}", config.server_address());
    info!("- POST /compress with multipart/form-data (field `file`) or JSON");
    info!("- Max upload size: {} MB", config.compression.max_upload_mb);
    info!(
        "- Defaults: {}x{} max, quality {}, size ceiling {} MB",
        defaults.max_width, defaults.max_height, defaults.quality, defaults.max_size_mb
    );
    info!("- Compression timeout: {}s", config.compression.timeout_seconds);

    let addr = config.server_address().parse()?;
    let handler = Arc::new(ImageHandler::new(&config));

    let make_svc = make_service_fn(move |_conn| {
        let handler = Arc::clone(&handler);
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let handler = Arc::clone(&handler);
                async move { handler.handle_http_request(req).await }
            }))
        }
    });

    let server = Server::bind(&addr)
        .serve(make_svc)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutting down");
        });

    info!("Server running on http://{}", addr);

    if let Err(e) = server.await {
        error!("Server error: {}", e);
    }

    Ok(())
}
