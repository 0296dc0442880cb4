//! Protocol server
//!
//! Serves framed JSON requests over the daemon's Unix socket. Each
//! connection is handled to completion by one task; a semaphore bounds
//! the pool at max(2, CPU cores). Handlers run under per-type budgets in
//! `spawn_blocking`, so a timed-out handler's work is abandoned rather
//! than joined and the response goes out on time.
//!
//! Malformed frames close the connection silently; malformed bodies in
//! well-formed frames get a `BadRequest` response. The accept loop checks
//! the shutdown flag between accepts; shutdown closes the listener and
//! drains workers within a bounded time.

pub mod error;
pub mod frame;
pub mod protocol;

use crate::daemon::{DaemonState, LogOutcome};
use error::{ErrorKind, WireError};
use frame::{FrameReader, FrameWriter};
use protocol::{
    error_response, ok_response, ExplainRequest, FeedbackRequest, LogRequest, RequestEnvelope,
    SearchRequest, SuggestRequest,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Handler budgets per request type.
const LOG_TIMEOUT: Duration = Duration::from_secs(1);
const SUGGEST_TIMEOUT: Duration = Duration::from_secs(5);
const MAINTENANCE_TIMEOUT: Duration = Duration::from_secs(30);
/// Worker drain bound at shutdown before hard termination.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum accepted command and cwd sizes on `log`.
const MAX_COMMAND_BYTES: usize = 64 * 1024;
const MAX_CWD_BYTES: usize = 4 * 1024;

/// Default and maximum `search` result limits.
const SEARCH_DEFAULT_LIMIT: usize = 20;
const SEARCH_MAX_LIMIT: usize = 100;

/// Accept connections until shutdown, then drain the worker pool.
pub async fn serve(state: Arc<DaemonState>, listener: UnixListener) -> anyhow::Result<()> {
    let workers = state.config.daemon.effective_workers();
    let semaphore = Arc::new(Semaphore::new(workers));
    let mut shutdown = state.subscribe_shutdown();
    let mut connections: JoinSet<()> = JoinSet::new();

    tracing::info!("Serving on {:?} with {} workers", state.paths.socket(), workers);

    loop {
        // worker slot first, then a connection for it
        let permit = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            permit = semaphore.clone().acquire_owned() => {
                match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                }
            }
        };

        let stream = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        tracing::warn!("Accept failed: {}", e);
                        continue;
                    }
                }
            }
        };

        let connection_state = state.clone();
        connections.spawn(async move {
            handle_connection(connection_state, stream).await;
            drop(permit);
        });
    }

    drop(listener);
    tracing::info!("Listener closed; draining {} connections", connections.len());

    let drain = async {
        while connections.join_next().await.is_some() {}
    };
    if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
        tracing::warn!("Worker pool did not drain within {:?}; aborting", DRAIN_TIMEOUT);
        connections.abort_all();
    }

    Ok(())
}

/// One connection, handled to completion. Requests on a connection are
/// strictly ordered: request N's response is written before N+1 is read.
async fn handle_connection(state: Arc<DaemonState>, stream: UnixStream) {
    let framing = state.config.protocol.framing;
    let (read_half, write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half, framing);
    let mut writer = FrameWriter::new(write_half, framing);
    let mut shutdown = state.subscribe_shutdown();

    loop {
        let frame = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            frame = reader.next() => frame,
        };
        let body = match frame {
            Ok(Some(body)) => body,
            Ok(None) => break,
            Err(e) => {
                // malformed frame: close with no response
                tracing::debug!("Closing connection on malformed frame: {}", e);
                break;
            }
        };

        let response = match RequestEnvelope::parse(&body) {
            Ok(envelope) => dispatch(&state, envelope).await,
            Err(e) => error_response(
                &Value::Null,
                &WireError::bad_request(format!("malformed request body: {}", e)),
            ),
        };

        let bytes = match serde_json::to_vec(&response) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!("Failed to serialize response: {}", e);
                break;
            }
        };
        if let Err(e) = writer.write(&bytes).await {
            tracing::debug!("Client went away mid-response: {}", e);
            break;
        }
    }
}

/// Route one request to its handler.
async fn dispatch(state: &Arc<DaemonState>, envelope: RequestEnvelope) -> Value {
    let id = envelope.id.clone();
    let result = match envelope.kind.as_str() {
        "ping" => Ok(json!({"status": "ok"})),
        "status" => handle_status(state),
        "log" => handle_log(state, &envelope).await,
        "suggest" => handle_suggest(state, envelope.data).await,
        "feedback" => handle_feedback(state, envelope.data).await,
        "search" => handle_search(state, envelope.data).await,
        "explain" => handle_explain(state, envelope.data).await,
        "shutdown" => {
            tracing::info!("Shutdown requested over protocol");
            state.request_shutdown();
            Ok(json!({"status": "ok"}))
        }
        other => Err(WireError::bad_request(format!("unknown request type {:?}", other))),
    };

    match result {
        Ok(data) => ok_response(&id, &envelope.kind, data),
        Err(error) => error_response(&id, &error),
    }
}

fn handle_status(state: &Arc<DaemonState>) -> Result<Value, WireError> {
    Ok(json!({
        "uptime_s": state.uptime_s(),
        "events_stored": state.store.events_stored(),
        "suggestions_served": state.engine.suggestions_served(),
        "degraded": state.engine.degraded_tiers(),
    }))
}

async fn handle_log(state: &Arc<DaemonState>, envelope: &RequestEnvelope) -> Result<Value, WireError> {
    let request: LogRequest = parse_payload(envelope.data.clone())?;
    if request.command.len() > MAX_COMMAND_BYTES {
        return Err(WireError::bad_request(format!(
            "command exceeds {} bytes",
            MAX_COMMAND_BYTES
        )));
    }
    if request.cwd.len() > MAX_CWD_BYTES {
        return Err(WireError::bad_request(format!(
            "cwd exceeds {} bytes",
            MAX_CWD_BYTES
        )));
    }

    // duplicate envelope ids coalesce to the original event
    let dedup_key = envelope.dedup_key();
    if let Some(key) = &dedup_key {
        if let Some(event_id) = state.log_dedup.get(key) {
            return Ok(json!({"id": event_id}));
        }
    }

    let task_state = state.clone();
    let outcome = run_blocking(LOG_TIMEOUT, move || {
        task_state
            .handle_log(&request)
            .map_err(WireError::from)
    })
    .await?;

    match outcome {
        LogOutcome::Stored(event_id) => {
            if let Some(key) = dedup_key {
                state.log_dedup.insert(key, event_id);
            }
            Ok(json!({"id": event_id}))
        }
        LogOutcome::Rejected => Ok(json!({"rejected": "privacy"})),
    }
}

async fn handle_suggest(state: &Arc<DaemonState>, data: Value) -> Result<Value, WireError> {
    let request: SuggestRequest = parse_payload(data)?;
    let task_state = state.clone();
    let outcome = run_blocking(SUGGEST_TIMEOUT, move || {
        let params = crate::engine::SuggestParams {
            partial: request.partial,
            cwd: request.cwd,
            history: request.history,
            limit: request.limit,
            preferences: request.preferences,
        };
        task_state.engine.suggest(&params).map_err(WireError::from)
    })
    .await?;

    serde_json::to_value(&outcome)
        .map_err(|e| WireError::new(ErrorKind::BackendError, e.to_string()))
}

async fn handle_feedback(state: &Arc<DaemonState>, data: Value) -> Result<Value, WireError> {
    let request: FeedbackRequest = parse_payload(data)?;
    let task_state = state.clone();
    run_blocking(SUGGEST_TIMEOUT, move || {
        task_state
            .engine
            .record_feedback(&request.explain_id, request.accepted)
            .map_err(WireError::from)
    })
    .await?;
    Ok(json!({"status": "ok"}))
}

async fn handle_search(state: &Arc<DaemonState>, data: Value) -> Result<Value, WireError> {
    let request: SearchRequest = parse_payload(data)?;
    let limit = request
        .limit
        .unwrap_or(SEARCH_DEFAULT_LIMIT)
        .min(SEARCH_MAX_LIMIT);
    let task_state = state.clone();
    let events = run_blocking(MAINTENANCE_TIMEOUT, move || {
        task_state
            .query
            .search(&request.query, limit)
            .map_err(|e| WireError::new(ErrorKind::BackendError, e.to_string()))
    })
    .await?;
    Ok(json!({"events": events}))
}

async fn handle_explain(state: &Arc<DaemonState>, data: Value) -> Result<Value, WireError> {
    let request: ExplainRequest = parse_payload(data)?;
    let task_state = state.clone();
    let breakdown = run_blocking(SUGGEST_TIMEOUT, move || {
        task_state
            .engine
            .explain(&request.explain_id)
            .map_err(WireError::from)
    })
    .await?;
    serde_json::to_value(&breakdown)
        .map_err(|e| WireError::new(ErrorKind::BackendError, e.to_string()))
}

fn parse_payload<T: serde::de::DeserializeOwned>(data: Value) -> Result<T, WireError> {
    serde_json::from_value(data)
        .map_err(|e| WireError::bad_request(format!("invalid request data: {}", e)))
}

/// Run a blocking handler under a budget. On timeout the work is
/// abandoned (the blocking task keeps running to completion in the
/// background, but its result is discarded).
async fn run_blocking<T, F>(budget: Duration, f: F) -> Result<T, WireError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, WireError> + Send + 'static,
{
    match tokio::time::timeout(budget, tokio::task::spawn_blocking(f)).await {
        Err(_) => Err(WireError::timeout("handler exceeded its time budget")),
        Ok(Err(join_error)) => Err(WireError::new(
            ErrorKind::BackendError,
            join_error.to_string(),
        )),
        Ok(Ok(result)) => result,
    }
}
