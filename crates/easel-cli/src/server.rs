use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Query, RawQuery, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use easel_contracts::requests::ImageParams;
use easel_engine::render::ErrorImageRenderer;
use easel_engine::resolver::RequestContext;
use easel_engine::{AssetEngine, ImageReply, API_KEY_OVERRIDE_HEADER, FORWARD_DEPTH_HEADER};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    engine: Arc<AssetEngine>,
}

pub fn router(engine: Arc<AssetEngine>) -> Router {
    let routes = engine.config().routes();
    let api = Router::new()
        .route(&format!("/{}", routes.image_endpoint), get(image))
        .route("/settings", get(read_settings).post(write_settings))
        .route("/credentials", get(credentials))
        .with_state(AppState { engine });

    let mount = routes.mount_path.trim_end_matches('/');
    let app = if mount.is_empty() {
        api
    } else {
        Router::new().nest(mount, api)
    };
    app.layer(TraceLayer::new_for_http())
}

async fn image(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    let params = ImageParams::from_query(query.as_deref().unwrap_or_default());
    let ctx = request_context(&headers);
    let engine = state.engine.clone();
    match tokio::task::spawn_blocking(move || engine.handle(&params, &ctx)).await {
        Ok(reply) => reply_into_response(reply),
        Err(err) => {
            tracing::error!(error = %err, "image worker failed");
            let image = ErrorImageRenderer.render(500, "image worker failed");
            let mut headers = vec![("content-type".to_string(), image.content_type.to_string())];
            headers.extend(
                image
                    .headers()
                    .into_iter()
                    .map(|(name, value)| (name.to_string(), value)),
            );
            reply_into_response(ImageReply {
                status: 200,
                headers,
                body: image.bytes,
            })
        }
    }
}

#[derive(Debug, Deserialize)]
struct SettingsQuery {
    #[serde(default)]
    target: String,
}

async fn read_settings(
    State(state): State<AppState>,
    Query(query): Query<SettingsQuery>,
) -> Response {
    let engine = state.engine.clone();
    match tokio::task::spawn_blocking(move || engine.read_mask_settings(&query.target)).await {
        Ok(lookup) => no_store(Json(lookup)),
        Err(err) => {
            tracing::error!(error = %err, "settings worker failed");
            no_store(Json(json!({ "exists": false })))
        }
    }
}

async fn write_settings(State(state): State<AppState>, body: String) -> Response {
    let payload: Value = match serde_json::from_str(&body) {
        Ok(payload) => payload,
        Err(_) => return no_store(Json(json!({ "success": false, "error": "invalid json" }))),
    };
    let target = payload
        .get("target")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let settings = payload.get("settings").cloned().unwrap_or(Value::Null);
    let engine = state.engine.clone();
    let outcome =
        tokio::task::spawn_blocking(move || engine.write_mask_settings(&target, &settings)).await;
    let body = match outcome {
        Ok(Ok(_)) => json!({ "success": true }),
        Ok(Err(err)) => json!({ "success": false, "error": err.to_string() }),
        Err(err) => {
            tracing::error!(error = %err, "settings worker failed");
            json!({ "success": false, "error": "settings write failed" })
        }
    };
    no_store(Json(body))
}

async fn credentials(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let api_key = header_text(&headers, API_KEY_OVERRIDE_HEADER);
    let configured = state.engine.credentials_configured(api_key.as_deref());
    no_store(Json(json!({ "configured": configured })))
}

fn no_store(body: impl IntoResponse) -> Response {
    ([(header::CACHE_CONTROL, "no-cache, no-store, must-revalidate")], body).into_response()
}

pub fn request_context(headers: &HeaderMap) -> RequestContext {
    RequestContext {
        authorization: header_text(headers, header::AUTHORIZATION.as_str()),
        api_key_override: header_text(headers, API_KEY_OVERRIDE_HEADER),
        forward_depth: header_text(headers, FORWARD_DEPTH_HEADER)
            .and_then(|value| value.parse().ok())
            .unwrap_or(0),
        conditional: headers.contains_key(header::IF_MODIFIED_SINCE)
            || headers.contains_key(header::IF_NONE_MATCH),
    }
}

fn header_text(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

pub fn reply_into_response(reply: ImageReply) -> Response {
    let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::OK);
    let mut response = Response::new(Body::from(reply.body));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    for (name, value) in reply.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => tracing::warn!(header = %name, "dropping unrepresentable response header"),
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
    use easel_engine::ImageReply;

    use super::{reply_into_response, request_context};

    #[test]
    fn error_replies_keep_success_status_and_diagnostics() {
        let response = reply_into_response(ImageReply {
            status: 200,
            headers: vec![
                ("content-type".to_string(), "image/png".to_string()),
                ("x-error".to_string(), "true".to_string()),
                ("x-error-status".to_string(), "502".to_string()),
                ("x-bad".to_string(), "line\nbreak".to_string()),
            ],
            body: vec![1, 2, 3],
        });
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-error-status"], "502");
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");
        assert!(response.headers().get("x-bad").is_none());
    }

    #[test]
    fn not_modified_passes_through() {
        let response = reply_into_response(ImageReply {
            status: 304,
            headers: Vec::new(),
            body: Vec::new(),
        });
        assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
    }

    #[test]
    fn request_context_reads_forwarding_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer t"));
        headers.insert("x-easel-forward-depth", HeaderValue::from_static("3"));
        headers.insert("x-gemini-api-key", HeaderValue::from_static(" key "));
        headers.insert(header::IF_NONE_MATCH, HeaderValue::from_static("\"abc\""));
        let ctx = request_context(&headers);
        assert_eq!(ctx.authorization.as_deref(), Some("Bearer t"));
        assert_eq!(ctx.forward_depth, 3);
        assert_eq!(ctx.api_key_override(), Some("key"));
        assert!(ctx.conditional);

        let empty = request_context(&HeaderMap::new());
        assert_eq!(empty.forward_depth, 0);
        assert!(!empty.conditional);
    }
}
