//! Acting-as identities and the hook that turns them into request headers.
//!
//! The runner never interprets guards or user records. It only carries an
//! opaque [`ActingAs`] value to an [`IdentityEncoder`], and the application
//! under test decides what the encoded header means.

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use reqwest::header::{HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::RunnerError;

/// Header the default encoder writes the signed identity into.
pub const ACTING_AS_HEADER: &str = "x-acting-as";

/// Guard used when `acting_as` is called without one.
pub const DEFAULT_GUARD: &str = "web";

/// Who a request should be authenticated as.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Identity {
    /// A free-form bag of attributes, e.g. `{"email": "..."}`.
    Generic { claims: Map<String, Value> },
    /// A persisted user the application can look up by primary key.
    Model { id: String },
}

impl Identity {
    pub fn generic<I, K, V>(claims: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        Identity::Generic {
            claims: claims
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn model(id: impl ToString) -> Self {
        Identity::Model { id: id.to_string() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActingAs {
    pub identity: Identity,
    pub guard: String,
}

impl ActingAs {
    pub fn new(identity: Identity, guard: Option<&str>) -> Self {
        Self {
            identity,
            guard: guard.unwrap_or(DEFAULT_GUARD).to_string(),
        }
    }
}

/// Serializes an acting-as identity into the request's authentication context.
pub trait IdentityEncoder: Send + Sync {
    fn encode(&self, acting_as: &ActingAs) -> Result<(HeaderName, HeaderValue), RunnerError>;
}

/// JWT payload produced by [`JwtIdentityEncoder`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActingAsClaims {
    #[serde(flatten)]
    pub acting_as: ActingAs,
    pub iat: i64,
    pub exp: i64,
}

/// Signs identities as short-lived HS256 tokens with the runner's app key.
#[derive(Clone)]
pub struct JwtIdentityEncoder {
    key: EncodingKey,
    ttl: Duration,
}

impl JwtIdentityEncoder {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            key: EncodingKey::from_secret(secret),
            ttl: Duration::minutes(10),
        }
    }
}

impl IdentityEncoder for JwtIdentityEncoder {
    fn encode(&self, acting_as: &ActingAs) -> Result<(HeaderName, HeaderValue), RunnerError> {
        let now = Utc::now();
        let claims = ActingAsClaims {
            acting_as: acting_as.clone(),
            iat: now.timestamp(),
            exp: (now + self.ttl).timestamp(),
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.key)
            .map_err(|e| RunnerError::InvalidRequest(format!("cannot sign identity: {}", e)))?;

        let value = HeaderValue::from_str(&token)
            .map_err(|e| RunnerError::InvalidRequest(e.to_string()))?;

        Ok((HeaderName::from_static(ACTING_AS_HEADER), value))
    }
}

/// Verifies a token produced by [`JwtIdentityEncoder`]. Used by applications
/// that want to honor the acting-as header.
pub fn decode_acting_as(token: &str, secret: &[u8]) -> Result<ActingAs, jsonwebtoken::errors::Error> {
    let data = decode::<ActingAsClaims>(
        token,
        &DecodingKey::from_secret(secret),
        &Validation::new(Algorithm::HS256),
    )?;
    Ok(data.claims.acting_as)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_generic_identity_round_trips_through_jwt() {
        let encoder = JwtIdentityEncoder::new(b"secret");
        let acting_as = ActingAs::new(
            Identity::generic([("email", "recca0120@gmail.com")]),
            None,
        );

        let (name, value) = encoder.encode(&acting_as).unwrap();
        assert_eq!(name.as_str(), ACTING_AS_HEADER);

        let decoded = decode_acting_as(value.to_str().unwrap(), b"secret").unwrap();
        assert_eq!(decoded, acting_as);
        assert_eq!(decoded.guard, DEFAULT_GUARD);
    }

    #[test]
    fn test_model_identity_keeps_guard() {
        let encoder = JwtIdentityEncoder::new(b"secret");
        let acting_as = ActingAs::new(Identity::model(1), Some("api"));

        let (_, value) = encoder.encode(&acting_as).unwrap();
        let decoded = decode_acting_as(value.to_str().unwrap(), b"secret").unwrap();

        assert_eq!(decoded.guard, "api");
        assert_eq!(decoded.identity, Identity::Model { id: "1".to_string() });
    }

    #[test]
    fn test_wrong_secret_is_rejected() {
        let encoder = JwtIdentityEncoder::new(b"secret");
        let acting_as = ActingAs::new(Identity::model("7"), None);
        let (_, value) = encoder.encode(&acting_as).unwrap();

        assert!(decode_acting_as(value.to_str().unwrap(), b"other").is_err());
    }

    #[test]
    fn test_identity_serializes_with_kind_tag() {
        let value = serde_json::to_value(Identity::model(3)).unwrap();
        assert_eq!(value, json!({"kind": "model", "id": "3"}));
    }
}
