use std::sync::Arc;

use axum::extract::{Query, Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::config::{Record, Store};
use crate::engine::{MappingEngine, MappingError, MappingInfo, Protocol};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<MappingEngine>,
    pub store: Arc<Store>,
    pub code: Arc<str>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/add", post(add_mapping))
        .route("/api/delete", delete(delete_mapping))
        .route("/api/query", get(query_mappings))
        .layer(middleware::from_fn_with_state(state.clone(), require_code))
        .with_state(state)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new<M>(status: StatusCode, message: M) -> Self
    where
        M: Into<String>,
    {
        Self { status, message: message.into() }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorResponse { error: self.message })).into_response()
    }
}

impl From<MappingError> for ApiError {
    fn from(e: MappingError) -> Self {
        let status = match &e {
            MappingError::Duplicate { .. } => StatusCode::CONFLICT,
            MappingError::NotFound { .. } => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        Self::new(status, e.to_string())
    }
}

/// Every route requires the access code in the Authorization header.
async fn require_code(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let code = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    if code != Some(&*state.code) {
        return Err(ApiError::new(StatusCode::UNAUTHORIZED, "unauthorized"));
    }

    Ok(next.run(request).await)
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddRequest {
    pub listen_addr: String,
    pub forward_addr: String,
    pub mapping_type: Protocol,
    /// Temporary mappings are not written to the config file.
    #[serde(default)]
    pub temp: bool,
}

async fn add_mapping(
    State(state): State<AppState>,
    Json(req): Json<AddRequest>,
) -> Result<StatusCode, ApiError> {
    // Best-effort pre-check; the registry's atomic insert is authoritative.
    if state.engine.exists_mapping(&req.listen_addr, req.mapping_type) {
        return Err(ApiError::new(
            StatusCode::CONFLICT,
            format!("a mapping for {} already exists", req.listen_addr),
        ));
    }

    state
        .engine
        .add_mapping(&req.listen_addr, &req.forward_addr, req.mapping_type)
        .await?;

    if !req.temp {
        // The mapping is live either way; a persistence failure only costs
        // the record its restart survival.
        match Record::from_mapping(&req.listen_addr, &req.forward_addr, req.mapping_type) {
            Some(record) => {
                if let Err(e) = state.store.append(record).await {
                    warn!("failed to persist mapping for {}: {e:#}", req.listen_addr);
                }
            }
            None => warn!("not persisting mapping for {}: unrepresentable port", req.listen_addr),
        }
    }

    Ok(StatusCode::OK)
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteParams {
    pub listen_addr: String,
    pub mapping_type: Protocol,
}

async fn delete_mapping(
    State(state): State<AppState>,
    Query(params): Query<DeleteParams>,
) -> Result<StatusCode, ApiError> {
    let result = state.engine.delete_mapping(&params.listen_addr, params.mapping_type);

    // The config record goes away even when a leg was already gone.
    if let Some((_, port)) = params
        .listen_addr
        .rsplit_once(':')
        .and_then(|(host, port)| Some((host, port.parse::<u16>().ok()?)))
    {
        if let Err(e) = state.store.remove(port, params.mapping_type).await {
            warn!("failed to persist removal of {}: {e:#}", params.listen_addr);
        }
    }

    result?;
    Ok(StatusCode::OK)
}

async fn query_mappings(State(state): State<AppState>) -> Json<Vec<MappingInfo>> {
    Json(state.engine.query_mappings())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    const CODE: &str = "test-code";

    async fn test_app(name: &str) -> Router {
        let path =
            std::env::temp_dir().join(format!("portway-api-{}-{name}.yml", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let state = AppState {
            engine: Arc::new(MappingEngine::new(Duration::from_secs(5))),
            store: Arc::new(Store::open(&path).await.unwrap()),
            code: CODE.into(),
        };

        router(state)
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn add_request(listen_addr: &str, code: &str) -> Request<Body> {
        let body = serde_json::json!({
            "listenAddr": listen_addr,
            "forwardAddr": "127.0.0.1:18080",
            "mappingType": "tcp",
            "temp": true,
        });

        Request::builder()
            .method("POST")
            .uri("/api/add")
            .header(header::AUTHORIZATION, code)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap()
    }

    #[tokio::test]
    async fn rejects_requests_without_the_code() {
        let app = test_app("no-code").await;

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/api/query").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/query")
                    .header(header::AUTHORIZATION, "wrong")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn add_query_delete_round_trip() {
        let app = test_app("round-trip").await;
        let listen = format!("127.0.0.1:{}", free_port());

        let response = app.clone().oneshot(add_request(&listen, CODE)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/query")
                    .header(header::AUTHORIZATION, CODE)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let mappings: Vec<MappingInfo> = serde_json::from_slice(&body).unwrap();
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].listen_addr, listen);
        assert_eq!(mappings[0].forward_addr, "127.0.0.1:18080");

        let delete_uri = format!("/api/delete?listenAddr={listen}&mappingType=tcp");
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(&delete_uri)
                    .header(header::AUTHORIZATION, CODE)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Deleting again reports the mapping as gone.
        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(&delete_uri)
                    .header(header::AUTHORIZATION, CODE)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn duplicate_add_conflicts() {
        let app = test_app("duplicate").await;
        let listen = format!("127.0.0.1:{}", free_port());

        let response = app.clone().oneshot(add_request(&listen, CODE)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app.oneshot(add_request(&listen, CODE)).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }
}
