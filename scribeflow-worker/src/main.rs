/*
 *  Copyright 2025-2026 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! Worker daemon.
//!
//! Startup order: PostgreSQL, Redis, providers, then the AMQP consume loop.
//! Database/Redis being unreachable is fatal (the container restart policy
//! handles it); the AMQP connection reconnects forever with exponential
//! backoff and jitter, installing a fresh publish channel on every
//! reconnect. SIGINT/SIGTERM stops consumption and cancels in-flight task
//! contexts; unacked deliveries are redelivered after restart.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use lapin::options::{
    BasicConsumeOptions, BasicNackOptions, BasicQosOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Connection, ConnectionProperties};
use rand::Rng;
use tracing::{error, info, warn};

use scribeflow::audio::FfmpegChunker;
use scribeflow::bus::RedisEventBus;
use scribeflow::models::TaskMessage;
use scribeflow::providers;
use scribeflow::queue::{AmqpQueue, TASKS_QUEUE};
use scribeflow::replay::RedisReplayStore;
use scribeflow::store::{PgOutboxStore, PgTaskStore};
use scribeflow::worker::EngineSettings;
use scribeflow::{
    CancelToken, Config, Database, OutboxRelay, Reaper, RelayExit, WorkerEngine,
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    let database = Database::new(&config.database_url, config.db_pool_size);
    if let Err(e) = database.run_migrations().await {
        error!("Failed to run migrations: {}", e);
        std::process::exit(1);
    }
    info!("Database connected");

    let bus = match RedisEventBus::connect(&config.redis_url).await {
        Ok(bus) => Arc::new(bus),
        Err(e) => {
            error!("Failed to connect to Redis: {}", e);
            std::process::exit(1);
        }
    };
    let replay = match RedisReplayStore::connect(&config.redis_url).await {
        Ok(replay) => Arc::new(replay),
        Err(e) => {
            error!("Failed to connect to Redis: {}", e);
            std::process::exit(1);
        }
    };
    info!("Redis connected");

    let (stt, llm) = providers::from_config(&config.ai);
    let store = Arc::new(PgTaskStore::new(database.clone()));
    let queue = Arc::new(AmqpQueue::new());

    let engine = Arc::new(WorkerEngine::new(
        store.clone(),
        bus.clone(),
        replay,
        stt,
        llm,
        Arc::new(FfmpegChunker::new()),
        EngineSettings::from(&config),
    ));

    let shutdown = CancelToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    // Cancellation signals from the control plane.
    tokio::spawn(Arc::clone(&engine).run_cancellation_listener(shutdown.clone()));

    // Outbox relay, rebuilt on a fresh connection if its client dies.
    {
        let database_url = config.database_url.clone();
        let queue = queue.clone();
        let interval = config.outbox_interval;
        let batch = config.outbox_batch;
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                match PgOutboxStore::connect(&database_url).await {
                    Ok(outbox_store) => {
                        let relay = OutboxRelay::new(
                            Arc::new(outbox_store),
                            queue.clone(),
                            interval,
                            batch,
                        );
                        if relay.run(shutdown.clone()).await == RelayExit::Shutdown {
                            return;
                        }
                        warn!("Outbox relay store failed, reconnecting");
                    }
                    Err(e) => error!("Outbox store connect failed: {}", e),
                }
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(3)) => {}
                    _ = shutdown.cancelled() => return,
                }
            }
        });
    }

    // Stale-task recovery.
    {
        let reaper = Reaper::new(store, config.reaper_interval, config.reaper_timeout);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { reaper.run(shutdown).await });
    }

    consume_loop(engine.clone(), queue, &config, shutdown).await;

    // Cancel in-flight contexts; their deliveries stay unacked and will be
    // redelivered after restart.
    engine.active_tasks().cancel_all();
    info!("Worker exiting");
}

/// Resolves when SIGINT or SIGTERM arrives, cancelling `shutdown`.
async fn watch_signals(shutdown: CancelToken) {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
    info!("Received shutdown signal");
    shutdown.cancel();
}

/// Maintains the AMQP connection, reconnecting with exponential backoff and
/// jitter. Each successful connect runs `consume` until the connection or
/// channel breaks.
async fn consume_loop(
    engine: Arc<WorkerEngine>,
    queue: Arc<AmqpQueue>,
    config: &Config,
    shutdown: CancelToken,
) {
    let mut attempt: u32 = 0;
    loop {
        if shutdown.is_cancelled() {
            return;
        }

        match Connection::connect(&config.amqp_url, ConnectionProperties::default()).await {
            Ok(connection) => {
                if attempt > 0 {
                    info!("RabbitMQ connected (after {} retries)", attempt);
                } else {
                    info!("RabbitMQ connected");
                }
                attempt = 0;

                match consume(&engine, &queue, &connection, config, &shutdown).await {
                    Ok(()) => {
                        let _ = connection.close(200, "shutting down").await;
                        return;
                    }
                    Err(e) => warn!("RabbitMQ consumer stopped: {}, reconnecting", e),
                }
            }
            Err(e) => warn!("RabbitMQ connect failed: {}", e),
        }

        let delay = backoff_delay(attempt, config.reconnect_base, config.reconnect_cap);
        attempt = attempt.saturating_add(1);
        info!("Reconnecting in {:?}", delay);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.cancelled() => return,
        }
    }
}

/// Consumes the `tasks` queue on an established connection. Returns `Ok` on
/// shutdown, `Err` when the connection or channel breaks.
async fn consume(
    engine: &Arc<WorkerEngine>,
    queue: &Arc<AmqpQueue>,
    connection: &Connection,
    config: &Config,
    shutdown: &CancelToken,
) -> Result<(), lapin::Error> {
    // Separate publish channel; the old one is dead after a reconnect.
    let publish_channel = connection.create_channel().await?;
    queue.set_channel(publish_channel).await;

    let channel = connection.create_channel().await?;
    channel
        .basic_qos(config.queue_prefetch, BasicQosOptions::default())
        .await?;
    // Idempotent declaration keeps startup order unconstrained.
    channel
        .queue_declare(
            TASKS_QUEUE,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;

    let mut consumer = channel
        .basic_consume(
            TASKS_QUEUE,
            "scribeflow-worker",
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await?;

    info!("Worker ready for tasks");

    loop {
        let delivery = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            next = consumer.next() => match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => return Err(e),
                // Consumer stream exhausted means the channel died; let the
                // outer loop reconnect.
                None => {
                    return Err(lapin::Error::InvalidConnectionState(
                        lapin::ConnectionState::Closed,
                    ))
                }
            },
        };

        match serde_json::from_slice::<TaskMessage>(&delivery.data) {
            Ok(message) => {
                let engine = Arc::clone(engine);
                tokio::spawn(async move {
                    engine.process(message).await;
                    if let Err(e) = delivery.ack(Default::default()).await {
                        warn!("Failed to ack delivery: {}", e);
                    }
                });
            }
            Err(e) => {
                // Poison message: reject without requeue so it cannot wedge
                // the queue.
                error!("Error decoding message: {}", e);
                if let Err(e) = delivery
                    .nack(BasicNackOptions {
                        requeue: false,
                        ..Default::default()
                    })
                    .await
                {
                    warn!("Failed to nack poison message: {}", e);
                }
            }
        }
    }
}

/// Exponential backoff with jitter, preventing reconnect stampedes across
/// workers.
fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let exp = (base.as_secs_f64() * 2f64.powi(attempt.min(16) as i32)).min(cap.as_secs_f64());
    let jitter = rand::thread_rng().gen::<f64>() * exp * 0.5;
    Duration::from_secs_f64(exp + jitter)
}
