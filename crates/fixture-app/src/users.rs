use axum::http::HeaderMap;
use parallel_runner::identity::{decode_acting_as, ACTING_AS_HEADER};
use parallel_runner::{ActingAs, Identity};
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: u64,
    pub name: &'static str,
    pub email: &'static str,
    #[serde(skip)]
    pub password: &'static str,
    #[serde(skip)]
    pub api_token: &'static str,
}

/// The seeded user table.
pub const USERS: &[User] = &[User {
    id: 1,
    name: "recca0120",
    email: "recca0120@gmail.com",
    password: "password",
    api_token: "6Uv0zov7V2dAk5wWE45HHHhz05gpsmw2",
}];

pub fn find(id: &str) -> Option<&'static User> {
    let id: u64 = id.parse().ok()?;
    USERS.iter().find(|u| u.id == id)
}

pub fn attempt(email: &str, password: &str) -> Option<&'static User> {
    USERS
        .iter()
        .find(|u| u.email == email && u.password == password)
}

pub fn by_token(token: &str) -> Option<&'static User> {
    USERS.iter().find(|u| u.api_token == token)
}

/// The verified acting-as identity, if the request carries one for `guard`.
pub fn acting_as(headers: &HeaderMap, app_key: &str, guard: &str) -> Option<ActingAs> {
    let token = headers.get(ACTING_AS_HEADER)?.to_str().ok()?;
    match decode_acting_as(token, app_key.as_bytes()) {
        Ok(acting_as) if acting_as.guard == guard => Some(acting_as),
        Ok(acting_as) => {
            warn!("Acting-as guard {} does not match {}", acting_as.guard, guard);
            None
        }
        Err(e) => {
            warn!("Rejected acting-as token: {}", e);
            None
        }
    }
}

/// What the app reports as "the current user" for an identity.
pub fn resolve(identity: &Identity) -> Option<Value> {
    match identity {
        Identity::Generic { claims } => Some(Value::Object(claims.clone())),
        Identity::Model { id } => find(id).and_then(|u| serde_json::to_value(u).ok()),
    }
}

pub fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}
