use lap_predictor::{model::ModelBundle, server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lap_predictor=info".into()),
        )
        .init();

    let model_path =
        std::env::var("MODEL_PATH").unwrap_or_else(|_| "saved_model.json".to_string());
    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    // Refuse to start without a usable artifact; serving guaranteed-500
    // predictions helps nobody.
    let bundle = ModelBundle::load(&model_path)?;
    tracing::info!(
        "loaded model from {}; features[{}]: {:?}",
        model_path,
        bundle.features.len(),
        bundle.features
    );

    // Warmup on the median row to surface a broken ensemble before we
    // accept traffic.
    let warmup = bundle.predict_lap_time(&bundle.median_row())?;
    tracing::info!("warmup prediction ok ({warmup:.3}s)");

    let app = server::router(server::AppState::new(bundle));

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
