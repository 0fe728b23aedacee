use assert_json_diff::{assert_json_matches_no_panic, CompareMode, Config as JsonConfig};
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::borrow::Cow;

use crate::AssertionFailure;

/// A fully received response. Read-only once the handle resolves.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: Vec<u8>,
    url: reqwest::Url,
}

impl Response {
    pub(crate) fn new(status: StatusCode, headers: HeaderMap, body: Vec<u8>, url: reqwest::Url) -> Self {
        Self {
            status,
            headers,
            body,
            url,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn url(&self) -> &reqwest::Url {
        &self.url
    }

    /// Body decoded as UTF-8, lossily.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    pub fn assert_ok(&self) -> Result<&Self, AssertionFailure> {
        self.assert_status(StatusCode::OK.as_u16())
    }

    pub fn assert_status(&self, code: u16) -> Result<&Self, AssertionFailure> {
        if self.status.as_u16() != code {
            return Err(AssertionFailure::new(format!(
                "expected response status code [{}] but received {}\n{}",
                code,
                self.status.as_u16(),
                self.excerpt()
            )));
        }
        Ok(self)
    }

    pub fn assert_see(&self, needle: &str) -> Result<&Self, AssertionFailure> {
        if !self.text().contains(needle) {
            return Err(AssertionFailure::new(format!(
                "expected to see {:?} in response body\n{}",
                needle,
                self.excerpt()
            )));
        }
        Ok(self)
    }

    pub fn assert_dont_see(&self, needle: &str) -> Result<&Self, AssertionFailure> {
        if self.text().contains(needle) {
            return Err(AssertionFailure::new(format!(
                "did not expect to see {:?} in response body\n{}",
                needle,
                self.excerpt()
            )));
        }
        Ok(self)
    }

    pub fn assert_content(&self, expected: &str) -> Result<&Self, AssertionFailure> {
        let actual = self.text();
        if actual != expected {
            return Err(AssertionFailure::new(format!(
                "response content mismatch\n  expected: {:?}\n  actual:   {:?}",
                expected, actual
            )));
        }
        Ok(self)
    }

    pub fn assert_header(&self, name: &str, expected: &str) -> Result<&Self, AssertionFailure> {
        match self.headers.get(name).map(|v| v.to_str()) {
            Some(Ok(actual)) if actual == expected => Ok(self),
            Some(Ok(actual)) => Err(AssertionFailure::new(format!(
                "header [{}] was {:?}, expected {:?}",
                name, actual, expected
            ))),
            Some(Err(_)) => Err(AssertionFailure::new(format!(
                "header [{}] is not valid UTF-8",
                name
            ))),
            None => Err(AssertionFailure::new(format!("header [{}] not present", name))),
        }
    }

    /// Every key in `expected` must be present in the body with an equal value.
    /// Extra keys in the body are allowed.
    pub fn assert_json(&self, expected: &Value) -> Result<&Self, AssertionFailure> {
        let actual = self.parse_json()?;
        assert_json_matches_no_panic(&actual, expected, JsonConfig::new(CompareMode::Inclusive))
            .map_err(|diff| AssertionFailure::new(format!("JSON subset mismatch:\n{}", diff)))?;
        Ok(self)
    }

    /// Compares the value at a dotted path (`data.0.email`) with `expected`.
    pub fn assert_json_path(&self, path: &str, expected: impl Into<Value>) -> Result<&Self, AssertionFailure> {
        let expected = expected.into();
        let actual = self.parse_json()?;

        let found = actual.pointer(&to_pointer(path)).ok_or_else(|| {
            AssertionFailure::new(format!("JSON path [{}] not found in {}", path, actual))
        })?;

        if *found != expected {
            return Err(AssertionFailure::new(format!(
                "JSON path [{}] mismatch\n  expected: {}\n  actual:   {}",
                path, expected, found
            )));
        }
        Ok(self)
    }

    fn parse_json(&self) -> Result<Value, AssertionFailure> {
        serde_json::from_slice(&self.body).map_err(|e| {
            AssertionFailure::new(format!("response is not valid JSON ({})\n{}", e, self.excerpt()))
        })
    }

    fn excerpt(&self) -> String {
        const LIMIT: usize = 512;
        let text = self.text();
        match text.char_indices().nth(LIMIT) {
            Some((cut, _)) => format!("body: {}...", &text[..cut]),
            None => format!("body: {}", text),
        }
    }
}

fn to_pointer(path: &str) -> String {
    if path.is_empty() {
        return String::new();
    }
    path.split('.')
        .map(|segment| segment.replace('~', "~0").replace('/', "~1"))
        .fold(String::new(), |mut pointer, segment| {
            pointer.push('/');
            pointer.push_str(&segment);
            pointer
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn response(status: u16, body: &str) -> Response {
        Response::new(
            StatusCode::from_u16(status).unwrap(),
            HeaderMap::new(),
            body.as_bytes().to_vec(),
            "http://127.0.0.1/".parse().unwrap(),
        )
    }

    #[test]
    fn test_status_assertions() {
        let ok = response(200, "Hello World");
        assert!(ok.assert_ok().is_ok());
        assert!(ok.assert_status(404).is_err());

        let err = response(504, "").assert_ok().unwrap_err();
        assert!(err.message.contains("[200]"));
        assert!(err.message.contains("504"));
    }

    #[test]
    fn test_see_and_content_chain() -> Result<(), AssertionFailure> {
        let resp = response(200, "Hello World");
        resp.assert_ok()?
            .assert_see("Hello")?
            .assert_dont_see("Goodbye")?
            .assert_content("Hello World")?;

        assert!(resp.assert_content("Hello").is_err());
        Ok(())
    }

    #[test]
    fn test_json_subset() {
        let resp = response(200, r#"{"DB_CONNECTION":"testbench","CUSTOM":"custom","extra":1}"#);
        assert!(resp
            .assert_json(&json!({"DB_CONNECTION": "testbench", "CUSTOM": "custom"}))
            .is_ok());

        let err = resp.assert_json(&json!({"CUSTOM": "other"})).unwrap_err();
        assert!(err.message.contains("CUSTOM"));
    }

    #[test]
    fn test_json_path() {
        let resp = response(200, r#"{"email":"a@b.c","data":[{"id":7}]}"#);
        assert!(resp.assert_json_path("email", "a@b.c").is_ok());
        assert!(resp.assert_json_path("data.0.id", 7).is_ok());
        assert!(resp.assert_json_path("data.1.id", 7).is_err());
        assert!(resp.assert_json_path("email", "x@y.z").is_err());
    }

    #[test]
    fn test_json_assertion_on_html_fails() {
        let err = response(200, "<html>").assert_json(&json!({})).unwrap_err();
        assert!(err.message.contains("not valid JSON"));
    }

    #[test]
    fn test_pointer_escaping() {
        assert_eq!(to_pointer("a.b/c.0"), "/a/b~1c/0");
        assert_eq!(to_pointer(""), "");
    }
}
