use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use chrono::{DateTime, Utc};
use parallel_runner::clock::TEST_NOW_HEADER;
use parallel_runner::dispatcher::SERVER_VAR_HEADER_PREFIX;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tower_sessions::{MemoryStore, Session, SessionManagerLayer};
use tracing::info;

use crate::config::Config;
use crate::error::AppError;
use crate::users;

const USER_ID_KEY: &str = "user_id";
const SESSION_VALUE_KEY: &str = "session";

#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
}

pub fn router(config: Arc<Config>) -> Router {
    let sessions = SessionManagerLayer::new(MemoryStore::default()).with_secure(false);

    Router::new()
        .route("/", get(hello))
        .route("/previous_url", get(previous_url))
        .route("/server_variables", get(server_variables))
        .route("/status_code/{code}", get(status_code))
        .route("/echo", get(echo))
        .route("/dump", get(dump))
        .route("/dd", get(dd))
        .route("/user", post(web_user))
        .route("/api/user", post(api_user))
        .route("/auth/login", post(login))
        .route("/session", get(read_session).patch(write_session))
        .route("/sleep", get(slow))
        .route("/date", get(date))
        .layer(sessions)
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { config })
}

/// Binds `host:port` and serves until the process is killed.
pub async fn run_http_server(config: Arc<Config>, host: &str, port: u16) -> Result<(), std::io::Error> {
    let listener = bind(host, port).await?;
    info!("Server running on [http://{}]", listener.local_addr()?);
    axum::serve(listener, router(config)).await?;
    Ok(())
}

// Host and port stay separate so IPv6 literals such as `::1` resolve.
async fn bind(host: &str, port: u16) -> Result<TcpListener, std::io::Error> {
    TcpListener::bind((host, port)).await
}

fn wants_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|accept| accept.contains("json"))
}

async fn hello(headers: HeaderMap) -> Response {
    if wants_json(&headers) {
        Json(json!({ "content": "Hello World" })).into_response()
    } else {
        "Hello World".into_response()
    }
}

async fn previous_url(headers: HeaderMap) -> String {
    headers
        .get(header::REFERER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("/")
        .to_string()
}

async fn server_variables(State(state): State<AppState>, headers: HeaderMap) -> Json<Map<String, Value>> {
    let mut variables = Map::new();
    variables.insert(
        "DB_CONNECTION".to_string(),
        Value::String(state.config.db_connection.clone()),
    );
    for (name, value) in &headers {
        if let (Some(key), Ok(value)) = (
            name.as_str().strip_prefix(SERVER_VAR_HEADER_PREFIX),
            value.to_str(),
        ) {
            variables.insert(key.to_ascii_uppercase(), Value::String(value.to_string()));
        }
    }
    Json(variables)
}

async fn status_code(Path(code): Path<u16>) -> Result<Response, AppError> {
    let status = StatusCode::from_u16(code)
        .map_err(|_| AppError::BadRequest(format!("{} is not a status code", code)))?;
    Ok((status, Json(json!({ "status": code }))).into_response())
}

// Debug output goes to stdout, where the runner captures it.
async fn echo() -> &'static str {
    println!("echo foo");
    "bar"
}

async fn dump() -> &'static str {
    println!("dump(foo)");
    "bar"
}

async fn dd() -> (StatusCode, &'static str) {
    println!("dd(foo)");
    (StatusCode::INTERNAL_SERVER_ERROR, "dd(foo)")
}

async fn web_user(
    State(state): State<AppState>,
    session: Session,
    headers: HeaderMap,
) -> Result<Json<Value>, AppError> {
    if let Some(acting_as) = users::acting_as(&headers, &state.config.app_key, "web") {
        return users::resolve(&acting_as.identity)
            .map(Json)
            .ok_or(AppError::Unauthenticated);
    }

    let user_id: Option<String> = session.get(USER_ID_KEY).await?;
    user_id
        .as_deref()
        .and_then(users::find)
        .and_then(|u| serde_json::to_value(u).ok())
        .map(Json)
        .ok_or(AppError::Unauthenticated)
}

async fn api_user(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<Value>, AppError> {
    if let Some(acting_as) = users::acting_as(&headers, &state.config.app_key, "api") {
        return users::resolve(&acting_as.identity)
            .map(Json)
            .ok_or(AppError::Unauthenticated);
    }

    users::bearer(&headers)
        .and_then(users::by_token)
        .and_then(|u| serde_json::to_value(u).ok())
        .map(Json)
        .ok_or(AppError::Unauthenticated)
}

#[derive(Deserialize)]
struct Credentials {
    email: String,
    password: String,
}

async fn login(session: Session, Form(credentials): Form<Credentials>) -> Result<Json<Value>, AppError> {
    let user = users::attempt(&credentials.email, &credentials.password)
        .ok_or(AppError::InvalidCredentials)?;

    session.insert(USER_ID_KEY, user.id.to_string()).await?;
    info!("User {} logged in", user.email);

    serde_json::to_value(user)
        .map(Json)
        .map_err(|e| AppError::BadRequest(e.to_string()))
}

#[derive(Deserialize)]
struct SessionValue {
    session: String,
}

async fn write_session(session: Session, Query(value): Query<SessionValue>) -> Result<Json<Value>, AppError> {
    session.insert(SESSION_VALUE_KEY, value.session.clone()).await?;
    Ok(Json(json!({ "session": value.session })))
}

async fn read_session(session: Session) -> Result<Json<Value>, AppError> {
    let value: Option<String> = session.get(SESSION_VALUE_KEY).await?;
    Ok(Json(json!({ "session": value })))
}

async fn slow(State(state): State<AppState>) -> &'static str {
    tokio::time::sleep(Duration::from_millis(state.config.sleep_ms)).await;
    "slept"
}

/// The frozen test time when the runner sends one, otherwise the wall clock.
async fn date(headers: HeaderMap) -> Result<String, AppError> {
    let now = match headers.get(TEST_NOW_HEADER).map(|v| v.to_str()) {
        Some(Ok(at)) => DateTime::parse_from_rfc3339(at)
            .map_err(|e| AppError::BadRequest(format!("bad {} header: {}", TEST_NOW_HEADER, e)))?,
        Some(Err(_)) => return Err(AppError::BadRequest(format!("{} is not ASCII", TEST_NOW_HEADER))),
        None => Utc::now().fixed_offset(),
    };
    Ok(now.to_rfc3339())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parallel_runner::{Batch, Dispatcher, Endpoint, JwtIdentityEncoder, Method, RequestSpec};
    use std::net::SocketAddr;

    async fn spawn_app() -> SocketAddr {
        let config = Arc::new(Config {
            app_key: "key".to_string(),
            db_connection: "testbench".to_string(),
            sleep_ms: 10,
        });
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(config)).await.unwrap();
        });
        addr
    }

    #[tracing_test::traced_test]
    #[tokio::test]
    async fn test_routes_answer_in_process() {
        let endpoint = Endpoint::external(spawn_app().await);
        let dispatcher =
            Dispatcher::new(Duration::from_secs(5), Arc::new(JwtIdentityEncoder::new(b"key"))).unwrap();

        let specs = vec![
            RequestSpec::new(Method::GET, "/"),
            RequestSpec::new(Method::GET, "/status_code/418"),
            RequestSpec::new(Method::GET, "/date")
                .with_test_now(DateTime::parse_from_rfc3339("2023-01-01T00:00:00+00:00").ok()),
            RequestSpec::new(Method::POST, "/api/user"),
            RequestSpec::new(Method::GET, "/server_variables").with_server_variable("CUSTOM", "custom"),
            RequestSpec::new(Method::GET, "/status_code/99"),
        ];
        let handles = dispatcher.dispatch(&endpoint, Batch::new(specs));

        handles[0].wait().await.unwrap().assert_content("Hello World").unwrap();
        handles[1].wait().await.unwrap().assert_status(418).unwrap();
        handles[2]
            .wait()
            .await
            .unwrap()
            .assert_content("2023-01-01T00:00:00+00:00")
            .unwrap();
        handles[3].wait().await.unwrap().assert_status(401).unwrap();
        handles[4]
            .wait()
            .await
            .unwrap()
            .assert_json(&json!({"DB_CONNECTION": "testbench", "CUSTOM": "custom"}))
            .unwrap();
        handles[5].wait().await.unwrap().assert_status(400).unwrap();
    }

    #[tokio::test]
    async fn test_bind_takes_host_and_port_apart() {
        let v4 = bind("127.0.0.1", 0).await.unwrap();
        assert!(v4.local_addr().unwrap().is_ipv4());

        // Hosts without IPv6 cannot bind `::1`, but the literal must still parse.
        match bind("::1", 0).await {
            Ok(v6) => assert!(v6.local_addr().unwrap().is_ipv6()),
            Err(e) => assert_ne!(e.kind(), std::io::ErrorKind::InvalidInput, "{}", e),
        }
    }

    #[test]
    fn test_wants_json_reads_accept() {
        let mut headers = HeaderMap::new();
        assert!(!wants_json(&headers));
        headers.insert(header::ACCEPT, "application/json".parse().unwrap());
        assert!(wants_json(&headers));
    }
}
