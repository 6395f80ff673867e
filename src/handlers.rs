use std::{
    convert::Infallible,
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use axum::{
    extract::State,
    http::header::CONTENT_TYPE,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures_util::StreamExt;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    errors::AppError,
    models::{ChatCompletionsChunk, ChatCompletionsRequest, ChatCompletionsResponse, ModelCard, ModelList},
    state::AppState,
};

pub async fn healthz() -> &'static str {
    "ok"
}

pub async fn metrics(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(body) => (
            [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(error) => AppError::Internal(format!("metrics render failed: {error}")).into_response(),
    }
}

pub async fn list_models(State(state): State<AppState>) -> Json<ModelList> {
    Json(ModelList {
        object: "list",
        data: vec![ModelCard {
            id: state.model.model().to_owned(),
            object: "model",
            owned_by: state.model.engine().to_owned(),
        }],
    })
}

pub async fn chat_completions(
    State(state): State<AppState>,
    Json(request): Json<ChatCompletionsRequest>,
) -> Response {
    let stream = request.stream;
    let _inflight = state.metrics.inflight_guard();

    let response = match process_chat_completions(state.clone(), request).await {
        Ok(response) => response,
        Err(error) => error.into_response(),
    };

    state.metrics.observe_request(
        "/v1/chat/completions",
        "POST",
        stream,
        response.status().as_u16(),
    );

    response
}

async fn process_chat_completions(
    state: AppState,
    request: ChatCompletionsRequest,
) -> Result<Response, AppError> {
    request.validate().map_err(AppError::BadRequest)?;

    info!(
        engine = %state.model.engine(),
        model = %state.model.model(),
        requested_model = %request.model.as_deref().unwrap_or_default(),
        stream = request.stream,
        messages = request.messages.len(),
        client_user = %request.user.as_deref().unwrap_or_default(),
        "chat request accepted"
    );

    if request.stream {
        stream_completion(state, request).await
    } else {
        one_shot_completion(state, request).await
    }
}

async fn one_shot_completion(
    state: AppState,
    request: ChatCompletionsRequest,
) -> Result<Response, AppError> {
    let started = Instant::now();
    let engine = state.model.engine();
    let outcome = state
        .model
        .invoke(&request.messages, &request.generation)
        .await;
    state
        .metrics
        .observe_generation(engine, false, outcome.is_ok(), started.elapsed());
    let content = outcome.map_err(|error| {
        state.metrics.observe_generation_error(engine, "invoke");
        AppError::from(error)
    })?;

    let payload = ChatCompletionsResponse::new(
        format!("chatcmpl-{}", Uuid::new_v4()),
        unix_timestamp(),
        state.model.model().to_owned(),
        content,
    );
    Ok(Json(payload).into_response())
}

async fn stream_completion(
    state: AppState,
    request: ChatCompletionsRequest,
) -> Result<Response, AppError> {
    let started = Instant::now();
    let created = unix_timestamp();
    let response_id = format!("chatcmpl-{}", Uuid::new_v4());
    let model = state.model.model().to_owned();
    let engine = state.model.engine().to_owned();

    let mut fragments = state
        .model
        .invoke_stream(&request.messages, &request.generation)
        .await
        .map_err(|error| {
            state.metrics.observe_generation_error(&engine, "stream_start");
            state
                .metrics
                .observe_generation(&engine, true, false, started.elapsed());
            AppError::from(error)
        })?;

    let metrics = state.metrics.clone();
    let outbound = async_stream::stream! {
        yield Ok::<Event, Infallible>(json_event(ChatCompletionsChunk::role(&response_id, created, &model)));

        while let Some(next) = fragments.next().await {
            match next {
                Ok(fragment) => {
                    metrics.observe_fragment(&engine);
                    let delta_chunk = ChatCompletionsChunk::delta(&response_id, created, &model, fragment);
                    yield Ok::<Event, Infallible>(json_event(delta_chunk));
                }
                Err(error) => {
                    metrics.observe_generation_error(&engine, "stream_read");
                    metrics.observe_generation(&engine, true, false, started.elapsed());
                    warn!(engine = %engine, error = %error, "backend stream error");
                    let error_json = serde_json::json!({
                        "error": {
                            "message": error.to_string(),
                            "type": "backend_error"
                        }
                    });
                    yield Ok::<Event, Infallible>(Event::default().data(error_json.to_string()));
                    yield Ok::<Event, Infallible>(Event::default().data("[DONE]"));
                    return;
                }
            }
        }

        metrics.observe_generation(&engine, true, true, started.elapsed());
        yield Ok::<Event, Infallible>(json_event(ChatCompletionsChunk::finish(&response_id, created, &model)));
        yield Ok::<Event, Infallible>(Event::default().data("[DONE]"));
    };

    Ok(Sse::new(outbound)
        .keep_alive(KeepAlive::new().interval(std::time::Duration::from_secs(10)))
        .into_response())
}

fn json_event<T: serde::Serialize>(payload: T) -> Event {
    match serde_json::to_string(&payload) {
        Ok(serialized) => Event::default().data(serialized),
        Err(error) => {
            let fallback = serde_json::json!({
                "error": {
                    "message": format!("serialization error: {error}"),
                    "type": "server_error"
                }
            });
            Event::default().data(fallback.to_string())
        }
    }
}

fn unix_timestamp() -> i64 {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    duration.as_secs() as i64
}
