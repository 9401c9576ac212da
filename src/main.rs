use std::sync::Arc;

use anyhow::{Error, Result};
use futures_util::StreamExt;
use push_fanout::{
    api::run_api_server,
    clients::{
        clock::SystemClock,
        fcm::FcmGateway,
        gateway::{DryRunGateway, PushGateway},
        rbmq::RabbitMqClient,
        redis::RedisStore,
        store::{DocumentStore, InMemoryStore},
    },
    config::Config,
    services::notifier::NotificationService,
    utils::process_message,
};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Error> {
    let _ = rustls::crypto::ring::default_provider().install_default();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "push_fanout=info,tower_http=info".into()),
        )
        .json()
        .init();

    let config = Config::load()?;

    let store: Arc<dyn DocumentStore> = match &config.redis_url {
        Some(url) => Arc::new(RedisStore::connect(url, &config.redis_key_prefix).await?),
        None => {
            warn!("REDIS_URL not set, using in-memory document store");
            Arc::new(InMemoryStore::new())
        }
    };

    let gateway: Arc<dyn PushGateway> = match &config.fcm_project_id {
        Some(project_id) => Arc::new(FcmGateway::new(&config, project_id).await?),
        None => {
            warn!("FCM_PROJECT_ID not set, push messages will only be logged");
            Arc::new(DryRunGateway)
        }
    };

    let service = Arc::new(NotificationService::new(
        &config,
        store,
        gateway,
        Arc::new(SystemClock),
    ));
    let jobs = service.spawn_background_jobs(&config.sweep_schedule());

    let api = run_api_server(service.clone(), config.server_port);

    tokio::select! {
        result = api => {
            if let Err(e) = result {
                error!(error = %e, "Health server exited with error");
                return Err(e);
            }
        }
        result = consume_events(&config, service.clone()) => {
            if let Err(e) = result {
                error!(error = %e, "Event consumer exited with error");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal, stopping gracefully...");
        }
    }

    for job in jobs {
        job.abort();
    }

    info!("Push fan-out worker stopped.");
    Ok(())
}

/// Feeds broker deliveries into the pipeline. Idles forever when no broker is
/// configured.
async fn consume_events(config: &Config, service: Arc<NotificationService>) -> Result<(), Error> {
    let Some(url) = &config.rabbitmq_url else {
        info!("RABBITMQ_URL not set, inbound event consumer disabled");
        std::future::pending::<()>().await;
        return Ok(());
    };

    let rabbitmq = RabbitMqClient::connect(url, &config.events_queue_name, config.prefetch_count).await?;
    let mut consumer = rabbitmq.create_consumer().await?;

    info!(queue = %config.events_queue_name, "Waiting for inbound events");

    while let Some(delivery) = consumer.next().await {
        let delivery = match delivery {
            Ok(delivery) => delivery,
            Err(e) => {
                error!(error = %e, "Consumer delivery error");
                continue;
            }
        };

        let tag = delivery.delivery_tag;
        let payload = String::from_utf8_lossy(&delivery.data);

        match process_message(&payload, &service).await {
            Ok(_) => rabbitmq.acknowledge(tag).await?,
            Err(e) if e.downcast_ref::<serde_json::Error>().is_some() => {
                warn!(error = %e, "Malformed event payload, discarding");
                rabbitmq.reject(tag, false).await?;
            }
            Err(e) => {
                error!(error = %e, "Event processing failed, requeueing");
                rabbitmq.reject(tag, true).await?;
            }
        }
    }

    warn!("Event consumer stream ended");
    Ok(())
}
