use crate::evaluator::{BacktestMetrics, EvalRequest, Evaluator, EvaluatorError};
use async_trait::async_trait;
use log::{debug, warn};
use std::time::Duration;

/// Calls the simulation engine over HTTP: `POST {base_url}/evaluate`.
#[derive(Clone)]
pub struct HttpEvaluator {
    client: reqwest::Client,
    base_url: String,
}

impl HttpEvaluator {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, EvaluatorError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EvaluatorError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self) -> String {
        format!("{}/evaluate", self.base_url)
    }
}

#[async_trait]
impl Evaluator for HttpEvaluator {
    async fn evaluate(&self, request: &EvalRequest) -> Result<BacktestMetrics, EvaluatorError> {
        let resp = self
            .client
            .post(self.endpoint())
            .json(request)
            .send()
            .await
            .map_err(|e| EvaluatorError::Transport(e.to_string()))?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(
                "⚠ evaluator returned {} for {}: {}",
                status, request.strategy_ref, text
            );
            return Err(match status {
                400 | 422 => EvaluatorError::Rejected {
                    status,
                    message: text,
                },
                429 | 500..=599 => EvaluatorError::Unavailable { status },
                _ => EvaluatorError::Failed(format!("unexpected status {}: {}", status, text)),
            });
        }

        let body = resp
            .text()
            .await
            .map_err(|e| EvaluatorError::Transport(e.to_string()))?;
        debug!("evaluator response for {}: {}", request.strategy_ref, body);

        serde_json::from_str::<BacktestMetrics>(&body).map_err(|e| {
            EvaluatorError::InvalidResponse(format!("{}, raw body: {}", e, body))
        })
    }
}
