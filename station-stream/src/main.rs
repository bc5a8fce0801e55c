//! Turn the JDBC-sourced `stations` table into a compact, keyed stations topic.
use std::time::Duration;

use anyhow::{Context, Result};
use common_kafka::connect::ConnectClient;
use common_kafka::decoder::{JsonPayload, RawPayload};
use common_kafka::kafka_consumer::{JsonKafkaClient, KafkaBrokerClient, RawKafkaClient};
use common_kafka::kafka_producer::{create_kafka_producer, flush};
use common_kafka::provisioning::{ensure_topic, KafkaTopicAdmin};
use common_kafka::TopicConsumer;
use envconfig::Envconfig;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use station_stream::config::Config;
use station_stream::handlers::{LoggingHandler, StationTransformHandler};
use station_stream::metrics::{app, serve, setup_metrics_recorder, Readiness};
use station_stream::station::Station;

fn setup_tracing(log_format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let log_layer = match log_format {
        "json" => fmt::layer().json().with_filter(filter).boxed(),
        _ => fmt::layer()
            .with_target(true)
            .with_level(true)
            .with_filter(filter)
            .boxed(),
    };

    tracing_subscriber::registry().with(log_layer).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::init_from_env().context("failed to load configuration from env")?;
    setup_tracing(&config.log_format);
    info!("Starting station-stream");

    let shutdown = CancellationToken::new();
    let readiness = Readiness::default();

    let recorder_handle = setup_metrics_recorder().context("failed to install metrics recorder")?;
    let router = app(Some(recorder_handle), readiness.clone());
    let bind = config.bind();
    let server_shutdown = shutdown.clone();
    let mut server = tokio::spawn(async move { serve(router, &bind, server_shutdown).await });

    match config.connector() {
        Some(connector) => {
            let connect = ConnectClient::new(&config.connect_url, config.connect_timeout_ms.0)?;
            connect
                .ensure_connector(&connector)
                .await
                .context("failed to register connector")?;
        }
        None => info!("CONNECT_URL is empty, not registering the connector"),
    }

    let admin = KafkaTopicAdmin::new(&config.kafka, Duration::from_secs(30))?;
    ensure_topic(&admin, &config.output_topic())
        .await
        .context("failed to provision the output topic")?;

    let producer = create_kafka_producer(&config.kafka)
        .await
        .context("failed to create kafka producer")?;

    let loop_config = config.consumer.loop_config();
    let session_timeout_ms = config.consumer.kafka_consumer_session_timeout_ms;
    let mut loops = JoinSet::new();

    let subscription = config.consumer.subscription()?;
    let client: JsonKafkaClient<Station> = KafkaBrokerClient::new(
        &config.kafka,
        &subscription,
        session_timeout_ms,
        JsonPayload::new(),
    )?;
    let stations = TopicConsumer::new(
        client,
        subscription,
        StationTransformHandler::new(producer.clone(), &config.output_topic),
        loop_config,
        shutdown.clone(),
    )?;
    loops.spawn(stations.run());

    for subscription in config.extra_subscriptions()? {
        let client: RawKafkaClient =
            KafkaBrokerClient::new(&config.kafka, &subscription, session_timeout_ms, RawPayload)?;
        let consumer =
            TopicConsumer::new(client, subscription, LoggingHandler, loop_config, shutdown.clone())?;
        loops.spawn(consumer.run());
    }

    readiness.set(true);
    info!(consumers = loops.len(), "Consumers started");

    let server_exited = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("failed to listen for ctrl-c: {}", e);
            }
            info!("Shutting down");
            false
        }
        result = &mut server => {
            error!("http server exited: {:?}", result);
            true
        }
    };

    readiness.set(false);
    shutdown.cancel();

    while let Some(result) = loops.join_next().await {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("consumer did not shut down cleanly: {}", e),
            Err(e) => error!("consumer task failed: {}", e),
        }
    }
    flush(&producer, config.shutdown_flush_timeout_ms.0);

    if !server_exited {
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("http server failed: {}", e),
            Err(e) => error!("http server task failed: {}", e),
        }
    }

    info!("Stopped");
    Ok(())
}
