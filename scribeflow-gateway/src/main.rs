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

//! Gateway service.
//!
//! The long-connection anchor of the system: hosts the per-task SSE stream
//! endpoint (multiplexed through the in-process Broadcaster) and the thin
//! task control API. Identity arrives as an `X-User-Id` header; cookie
//! issuance and upload plumbing live in front of this service.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

use scribeflow::bus::RedisEventBus;
use scribeflow::error::ControlError;
use scribeflow::models::{TaskConfig, TaskResult};
use scribeflow::replay::RedisReplayStore;
use scribeflow::store::{PgTaskStore, TaskStore};
use scribeflow::{Broadcaster, CancelToken, Config, Database, StreamEndpoint, TaskControl};

#[derive(Clone)]
struct AppState {
    control: Arc<TaskControl>,
    stream: Arc<StreamEndpoint>,
    store: Arc<dyn TaskStore>,
}

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

    let store: Arc<dyn TaskStore> = Arc::new(PgTaskStore::new(database));
    let broadcaster = Arc::new(Broadcaster::new(bus.clone()));
    let shutdown = CancelToken::new();

    // The process's single bus subscription, fanned out to SSE listeners.
    tokio::spawn(Arc::clone(&broadcaster).run(shutdown.clone()));

    let state = AppState {
        control: Arc::new(TaskControl::new(store.clone(), replay.clone(), bus)),
        stream: Arc::new(StreamEndpoint::new(broadcaster, replay)),
        store,
    };

    let app = Router::new()
        .route("/api/tasks", post(create_task))
        .route("/api/tasks/:id", get(get_task))
        .route("/api/tasks/:id/cancel", post(cancel_task))
        .route("/api/tasks/:id/resummarize", post(resummarize_task))
        .route("/api/tasks/:id/events", get(stream_task_events))
        .route("/health", get(health))
        .with_state(state);

    let listener = match tokio::net::TcpListener::bind(&config.gateway_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {}", config.gateway_addr, e);
            std::process::exit(1);
        }
    };
    info!("Gateway starting on {}", config.gateway_addr);

    let serve_shutdown = shutdown.clone();
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let ctrl_c = tokio::signal::ctrl_c();
            #[cfg(unix)]
            {
                let mut sigterm =
                    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                        .expect("failed to install SIGTERM handler");
                tokio::select! {
                    _ = serve_shutdown.cancelled() => {}
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            #[cfg(not(unix))]
            {
                tokio::select! {
                    _ = serve_shutdown.cancelled() => {}
                    _ = ctrl_c => {}
                }
            }
            info!("Received shutdown signal");
        })
        .await;

    shutdown.cancel();
    if let Err(e) = result {
        error!("Gateway server error: {}", e);
    }
    info!("Gateway exiting");
}

fn user_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
}

fn control_error_response(err: ControlError) -> (StatusCode, String) {
    match err {
        ControlError::NotCancellable => (StatusCode::NOT_FOUND, err.to_string()),
        ControlError::Conflict | ControlError::MissingTranscript => {
            (StatusCode::CONFLICT, err.to_string())
        }
        other => {
            error!("Control operation failed: {}", other);
            (StatusCode::INTERNAL_SERVER_ERROR, "internal error".into())
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateTaskRequest {
    file_path: String,
    #[serde(default)]
    config: TaskConfig,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateTaskResponse {
    id: Uuid,
}

async fn create_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateTaskRequest>,
) -> impl IntoResponse {
    let Some(user) = user_id(&headers) else {
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    };
    if request.file_path.is_empty() {
        return (StatusCode::BAD_REQUEST, "filePath is required").into_response();
    }

    match state
        .control
        .create(&user, &request.file_path, request.config)
        .await
    {
        Ok(id) => (StatusCode::CREATED, Json(CreateTaskResponse { id })).into_response(),
        Err(e) => control_error_response(e).into_response(),
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TaskStatusResponse {
    id: Uuid,
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    transcript: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<String>,
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let Some(user) = user_id(&headers) else {
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    };

    let task = match state.store.get_task(id).await {
        Ok(task) => task,
        Err(scribeflow::error::StoreError::NotFound(_)) => {
            return (StatusCode::NOT_FOUND, "Task not found").into_response()
        }
        Err(e) => {
            error!(task_id = %id, "Task lookup failed: {}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response();
        }
    };
    if task.user_id != user {
        return (StatusCode::FORBIDDEN, "Forbidden").into_response();
    }

    let result: Option<TaskResult> = state.store.get_result(id).await.ok().flatten();
    Json(TaskStatusResponse {
        id: task.id,
        status: task.status.to_string(),
        error_message: task.error_message,
        transcript: result.as_ref().map(|r| r.transcript.clone()),
        summary: result.map(|r| r.summary),
    })
    .into_response()
}

async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let Some(user) = user_id(&headers) else {
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    };
    match state.control.cancel(id, &user).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => control_error_response(e).into_response(),
    }
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ResummarizeRequest {
    #[serde(default)]
    config: TaskConfig,
}

async fn resummarize_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    body: Option<Json<ResummarizeRequest>>,
) -> impl IntoResponse {
    let Some(user) = user_id(&headers) else {
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    };
    let request = body.map(|Json(r)| r).unwrap_or_default();
    match state.control.resummarize(id, &user, request.config).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => control_error_response(e).into_response(),
    }
}

async fn stream_task_events(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let user = user_id(&headers);
    match state.stream.handle(id, user.as_deref()).await {
        Ok(sse) => sse.into_response(),
        Err(reject) => reject.into_response(),
    }
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    // A cheap round-trip proves the database path is alive.
    match state.store.get_task(Uuid::nil()).await {
        Ok(_) | Err(scribeflow::error::StoreError::NotFound(_)) => {
            (StatusCode::OK, "OK").into_response()
        }
        Err(e) => {
            error!("Health check failed: {}", e);
            (StatusCode::SERVICE_UNAVAILABLE, "unhealthy").into_response()
        }
    }
}
