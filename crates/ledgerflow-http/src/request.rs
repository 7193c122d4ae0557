//! Grouped-request wire types.
//!
//! A batch is a JSON array of sub-requests POSTed in one call; the service
//! answers with a JSON array of sub-responses. The `id` field is the only
//! correlation key between the two.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BatchError;

/// One logical HTTP operation inside a batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpBatchRequest {
    pub method: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    /// Correlation id. Left empty, it is assigned as `req_<index>`.
    #[serde(default)]
    pub id: String,
}

impl HttpBatchRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new("GET", path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new("POST", path)
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Serialize `payload` as the request body.
    pub fn json<T: Serialize>(self, payload: &T) -> Result<Self, BatchError> {
        Ok(self.with_body(serde_json::to_value(payload)?))
    }
}

/// The service's answer to one sub-request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpBatchResponse {
    pub status_code: u16,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub id: String,
}

impl HttpBatchResponse {
    /// Returns `true` if the sub-request succeeded: no error string and status < 400.
    pub fn is_success(&self) -> bool {
        self.error_message().is_none() && self.status_code < 400
    }

    fn error_message(&self) -> Option<&str> {
        self.error.as_deref().filter(|e| !e.is_empty())
    }

    /// The failure this sub-response reports, if any.
    pub fn to_error(&self) -> Option<BatchError> {
        if self.is_success() {
            return None;
        }
        let message = self
            .error_message()
            .map(str::to_string)
            .unwrap_or_else(|| format!("HTTP {}", self.status_code));
        Some(BatchError::Request {
            id: self.id.clone(),
            status: self.status_code,
            message,
        })
    }

    fn has_body(&self) -> bool {
        !matches!(self.body, None | Some(Value::Null))
    }
}

/// Outcome of [`execute_batch`](crate::HttpBatchExecutor::execute_batch).
///
/// `responses` is always fully populated. `error` carries the aggregate
/// failure when sub-requests failed and the executor does not continue on
/// error, or the first skipped chunk's error when it does.
#[derive(Debug, Default)]
pub struct HttpBatchResult {
    pub responses: Vec<HttpBatchResponse>,
    pub error: Option<BatchError>,
}

impl HttpBatchResult {
    /// Find the sub-response for `request_id`.
    pub fn response(&self, request_id: &str) -> Option<&HttpBatchResponse> {
        self.responses.iter().find(|r| r.id == request_id)
    }

    /// Sub-responses that report a failure.
    pub fn failed(&self) -> impl Iterator<Item = &HttpBatchResponse> {
        self.responses.iter().filter(|r| !r.is_success())
    }

    /// `true` when there is no aggregate error and every sub-request succeeded.
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.failed().next().is_none()
    }

    /// Turn an aggregate error into `Err`, dropping the responses.
    pub fn into_result(self) -> Result<Vec<HttpBatchResponse>, BatchError> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.responses),
        }
    }

    /// Deserialize the body of the sub-response for `request_id`.
    ///
    /// Returns `Ok(None)` when the sub-response succeeded without a body.
    pub fn parse_response<T: DeserializeOwned>(
        &self,
        request_id: &str,
    ) -> Result<Option<T>, BatchError> {
        let response = self.checked(request_id)?;
        if !response.has_body() {
            return Ok(None);
        }
        let body = response.body.clone().unwrap_or(Value::Null);
        Ok(Some(serde_json::from_value(body)?))
    }

    /// Like [`parse_response`](Self::parse_response) without decoding the body.
    pub fn check_response(&self, request_id: &str) -> Result<(), BatchError> {
        self.checked(request_id).map(|_| ())
    }

    fn checked(&self, request_id: &str) -> Result<&HttpBatchResponse, BatchError> {
        let response = self
            .response(request_id)
            .ok_or_else(|| BatchError::NotFound(request_id.to_string()))?;
        match response.to_error() {
            Some(e) => Err(e),
            None => Ok(response),
        }
    }
}

/// Deserialize the body of the sub-response for `request_id` in `result`.
///
/// Fails when `result` is absent, the id is unknown, or the sub-response
/// reports an error string or a status of 400 or above.
pub fn parse_response<T: DeserializeOwned>(
    result: Option<&HttpBatchResult>,
    request_id: &str,
) -> Result<Option<T>, BatchError> {
    result
        .ok_or_else(|| BatchError::Invalid("no batch result".into()))?
        .parse_response(request_id)
}
