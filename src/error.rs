use reqwest::StatusCode;

/// Classification of failures reported by the SlideRule service.
///
/// Errors returned by the client are `anyhow::Error`; use
/// `err.downcast_ref::<SlideruleError>()` to tell a retryable condition
/// (server under load) apart from one that will not go away on its own.
#[derive(Debug, thiserror::Error)]
pub enum SlideruleError {
    #[error("{0}")]
    Fatal(String),
    #[error("{0}")]
    Transient(String),
}

impl SlideruleError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SlideruleError::Transient(_))
    }
}

pub(crate) fn fatal(msg: impl Into<String>) -> anyhow::Error {
    SlideruleError::Fatal(msg.into()).into()
}

#[derive(Debug, serde::Deserialize)]
pub(crate) struct ServerErrorResponse {
    #[serde(default)]
    pub(crate) error: Option<String>,
    #[serde(default)]
    pub(crate) error_msg: Option<String>,
    #[serde(default)]
    pub(crate) message: Option<String>,
    #[serde(default)]
    pub(crate) detail: Option<String>,
}

impl ServerErrorResponse {
    fn text(&self) -> &str {
        self.error
            .as_deref()
            .or(self.error_msg.as_deref())
            .or(self.message.as_deref())
            .or(self.detail.as_deref())
            .unwrap_or("")
    }
}

pub(crate) fn format_http_error(status: StatusCode, url: &str, body: &str) -> anyhow::Error {
    let server_msg = serde_json::from_str::<ServerErrorResponse>(body)
        .map(|e| e.text().to_string())
        .unwrap_or_else(|_| body.trim().to_string());

    if status == StatusCode::SERVICE_UNAVAILABLE {
        return SlideruleError::Transient(format!(
            "Server experiencing heavy load, stalling on request to {}",
            url
        ))
        .into();
    }

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return fatal(format!(
            "HTTP error {} from endpoint {}\n- Check the organization name and that PS_USERNAME/PS_PASSWORD (or ~/.netrc) hold valid provisioning system credentials\n\nServer message: {}",
            status.as_u16(),
            url,
            server_msg
        ));
    }

    if server_msg.is_empty() {
        fatal(format!("HTTP error {} from endpoint {}", status.as_u16(), url))
    } else {
        fatal(format!(
            "HTTP error {} from endpoint {}\n{}",
            status.as_u16(),
            url,
            server_msg
        ))
    }
}
