use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::{Context, Result};
use delivery_service::config::{Config, DestinationTarget, LogBackend};
use delivery_service::destination::{
    DeliveryHandler, DestinationController, DestinationIdentity, MockHandler, WebhookHandler,
};
use delivery_service::forwarder::{EventForwarder, KafkaForwarder};
use delivery_service::handlers::{self, Destinations};
use delivery_service::log::{EventLog, KafkaLog, MemoryForwarder, MemoryLog};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = terminate.recv() => {},
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler, waiting for Ctrl+C only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

async fn open_log(config: &Config) -> Result<(Arc<dyn EventForwarder>, Arc<dyn EventLog>)> {
    match config.log_backend()? {
        LogBackend::Kafka => {
            let settings = config.kafka_settings();
            let forwarder = KafkaForwarder::connect(settings.clone(), &config.events_topic)
                .await
                .context("Failed to initialize Kafka forwarder")?;
            Ok((Arc::new(forwarder), Arc::new(KafkaLog::new(settings))))
        }
        LogBackend::Memory => {
            let log = MemoryLog::new(config.topic_partitions);
            let forwarder = MemoryForwarder::new(log.clone(), &config.events_topic);
            Ok((Arc::new(forwarder), Arc::new(log)))
        }
    }
}

fn build_controllers(config: &Config, log: Arc<dyn EventLog>) -> Result<Destinations> {
    let settings = config.controller_settings();
    let mut destinations: Destinations = Vec::new();

    for spec in config.destination_specs()? {
        let handler: Arc<dyn DeliveryHandler> = match &spec.target {
            DestinationTarget::Mock => Arc::new(MockHandler::succeeding(Duration::ZERO)),
            DestinationTarget::Webhook(url) => Arc::new(
                WebhookHandler::new(url.clone(), config.webhook_timeout())
                    .with_context(|| format!("Failed to create webhook handler for {url}"))?,
            ),
        };

        destinations.push(Arc::new(DestinationController::new(
            DestinationIdentity::new(&config.events_topic, &spec.group_id),
            Arc::clone(&log),
            handler,
            settings,
        )));
    }

    Ok(destinations)
}

#[actix_web::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "delivery_service=debug,rdkafka=warn,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("Failed to load configuration")?;
    info!(
        backend = %config.log_backend,
        topic = %config.events_topic,
        destinations = config.destinations.len(),
        "Starting delivery-service"
    );

    let (forwarder, log) = open_log(&config).await?;
    let destinations = build_controllers(&config, log)?;

    for controller in &destinations {
        controller.start().await.with_context(|| {
            format!(
                "Failed to start destination {}",
                controller.identity().group_id
            )
        })?;
    }

    let bind_address = config.http_bind_address();
    let forwarder_data = web::Data::from(Arc::clone(&forwarder));
    let destinations_data = web::Data::new(destinations.clone());

    let server = HttpServer::new(move || {
        App::new()
            .wrap(Logger::default())
            .app_data(forwarder_data.clone())
            .app_data(destinations_data.clone())
            .configure(handlers::configure_routes)
    })
    .bind(&bind_address)
    .with_context(|| format!("Failed to bind HTTP server to {bind_address}"))?
    .disable_signals()
    .run();

    info!(address = %bind_address, "HTTP server listening");

    let server_handle = server.handle();
    let server_task = actix_web::rt::spawn(server);

    shutdown_signal().await;
    info!("Shutdown signal received");

    server_handle.stop(true).await;
    match server_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "HTTP server error"),
        Err(e) => error!(error = %e, "HTTP server task failed"),
    }

    for controller in &destinations {
        controller.stop().await;
    }
    forwarder.close().await;

    info!("delivery-service stopped");
    Ok(())
}
