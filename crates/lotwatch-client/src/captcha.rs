use std::time::Duration;

use lotwatch_core::error::AppError;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::http::{send_error, status_error};
use crate::session::{CaptchaOutcome, Challenge};

const DEFAULT_SOLVER_TIMEOUT: Duration = Duration::from_secs(120);

/// Client for an external CAPTCHA-solving service.
///
/// Posts `{"site_key", "page_url"}` to `{base_url}/solve` with a bearer key
/// and expects `{"status": "solved" | "unsolved", "token"}` back.
#[derive(Clone)]
pub struct HttpCaptchaSolver {
    client: Client,
    base_url: String,
    api_key: String,
    timeout: Duration,
}

impl HttpCaptchaSolver {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, AppError> {
        Self::with_timeout(base_url, api_key, DEFAULT_SOLVER_TIMEOUT)
    }

    pub fn with_timeout(
        base_url: &str,
        api_key: &str,
        timeout: Duration,
    ) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::ConfigError(format!("CAPTCHA client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            timeout,
        })
    }

    pub async fn solve(&self, challenge: &Challenge) -> Result<CaptchaOutcome, AppError> {
        let url = format!("{}/solve", self.base_url);
        let request = SolveRequest {
            site_key: &challenge.site_key,
            page_url: &challenge.page_url,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| send_error(e, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let headers = response.headers().clone();
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &headers, &body));
        }

        let body: SolveResponse = response
            .json()
            .await
            .map_err(|e| AppError::Generic(format!("Failed to parse solver response: {e}")))?;

        Ok(body.into_outcome())
    }
}

#[derive(Serialize)]
struct SolveRequest<'a> {
    site_key: &'a str,
    page_url: &'a str,
}

#[derive(Debug, Deserialize)]
struct SolveResponse {
    status: String,
    #[serde(default)]
    token: Option<String>,
}

impl SolveResponse {
    fn into_outcome(self) -> CaptchaOutcome {
        match (self.status.as_str(), self.token) {
            ("solved", Some(token)) if !token.is_empty() => CaptchaOutcome::Solved(token),
            _ => CaptchaOutcome::Unsolved,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> CaptchaOutcome {
        serde_json::from_str::<SolveResponse>(raw)
            .unwrap()
            .into_outcome()
    }

    #[test]
    fn test_solved_response() {
        assert_eq!(
            parse(r#"{"status": "solved", "token": "abc"}"#),
            CaptchaOutcome::Solved("abc".into())
        );
    }

    #[test]
    fn test_unsolved_responses() {
        assert_eq!(parse(r#"{"status": "unsolved"}"#), CaptchaOutcome::Unsolved);
        assert_eq!(parse(r#"{"status": "solved"}"#), CaptchaOutcome::Unsolved);
        assert_eq!(
            parse(r#"{"status": "solved", "token": ""}"#),
            CaptchaOutcome::Unsolved
        );
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let solver = HttpCaptchaSolver::new("https://solver.example/v1/", "k").unwrap();
        assert_eq!(solver.base_url, "https://solver.example/v1");
    }
}
