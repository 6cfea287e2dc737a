use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Error body shapes the backend and its proxies are known to return
#[derive(Debug, Deserialize)]
struct ErrorBody {
    detail: Option<serde_json::Value>,
    message: Option<String>,
    error_description: Option<String>,
    error: Option<String>,
}

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            return body.to_string();
        }
        let mut end = MAX_ERROR_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
    }

    /// Pull a human-readable message out of a JSON error body.
    /// `detail` may be a string or a list of validation errors.
    fn extract_message(body: &str) -> Option<String> {
        let parsed: ErrorBody = serde_json::from_str(body).ok()?;

        let detail = parsed.detail.and_then(|detail| match detail {
            serde_json::Value::String(s) => Some(s),
            serde_json::Value::Array(items) => {
                let messages: Vec<String> = items
                    .iter()
                    .filter_map(|item| item.get("msg").and_then(|m| m.as_str()))
                    .map(str::to_string)
                    .collect();
                (!messages.is_empty()).then(|| messages.join("; "))
            }
            _ => None,
        });

        detail
            .or(parsed.message)
            .or(parsed.error_description)
            .or(parsed.error)
            .filter(|m| !m.trim().is_empty())
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let message = Self::extract_message(body)
            .map(|m| Self::truncate_body(&m))
            .unwrap_or_else(|| status.to_string());

        match status.as_u16() {
            401 => ApiError::Unauthorized(message),
            403 => ApiError::AccessDenied(message),
            404 => ApiError::NotFound(message),
            429 => ApiError::RateLimited(message),
            500..=599 => ApiError::ServerError(message),
            _ => ApiError::RequestFailed(message),
        }
    }

    /// The human-readable part, without the category prefix
    pub fn message(&self) -> String {
        match self {
            ApiError::AccessDenied(m)
            | ApiError::Unauthorized(m)
            | ApiError::NotFound(m)
            | ApiError::RateLimited(m)
            | ApiError::ServerError(m)
            | ApiError::RequestFailed(m)
            | ApiError::InvalidResponse(m) => m.clone(),
            ApiError::NetworkError(e) => e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn test_message_from_detail_string() {
        let err = ApiError::from_status(StatusCode::NOT_FOUND, r#"{"detail": "Agent run not found"}"#);
        assert!(matches!(err, ApiError::NotFound(ref m) if m == "Agent run not found"));
    }

    #[test]
    fn test_message_from_validation_list() {
        let body = r#"{"detail": [{"loc": ["body", "x"], "msg": "field required"}, {"msg": "too long"}]}"#;
        let err = ApiError::from_status(StatusCode::UNPROCESSABLE_ENTITY, body);
        assert_eq!(err.message(), "field required; too long");
        assert!(matches!(err, ApiError::RequestFailed(_)));
    }

    #[test]
    fn test_message_from_alternate_fields() {
        let err = ApiError::from_status(StatusCode::FORBIDDEN, r#"{"message": "Not your org"}"#);
        assert_eq!(err.message(), "Not your org");

        let err = ApiError::from_status(
            StatusCode::UNAUTHORIZED,
            r#"{"error": "invalid_token", "error_description": "Token expired"}"#,
        );
        assert!(matches!(err, ApiError::Unauthorized(ref m) if m == "Token expired"));
    }

    #[test]
    fn test_falls_back_to_status_line() {
        let err = ApiError::from_status(StatusCode::BAD_GATEWAY, "<html>upstream down</html>");
        assert!(matches!(err, ApiError::ServerError(ref m) if m == "502 Bad Gateway"));

        let err = ApiError::from_status(StatusCode::TOO_MANY_REQUESTS, "");
        assert_eq!(err.message(), "429 Too Many Requests");

        let err = ApiError::from_status(StatusCode::BAD_REQUEST, r#"{"detail": ""}"#);
        assert_eq!(err.message(), "400 Bad Request");
    }

    #[test]
    fn test_truncate_body() {
        let long = "é".repeat(400);
        let truncated = ApiError::truncate_body(&long);
        assert!(truncated.contains("truncated, 800 total bytes"));
        assert_eq!(ApiError::truncate_body("short"), "short");
    }
}
