//! Client side of the decision service.
//!
//! The inference process speaks newline-delimited JSON over loopback TCP,
//! one request per connection:
//!
//! ```text
//! → {"foreground_app":270057011,"idle_time":0,"time_last_request":42000}
//! ← {"prediction":0,"confidence":0.99,"model_available":true}
//! ```

use crate::core::features::FeatureVector;
use crate::supervisor::ProcessState;
use serde::Deserialize;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::watch;

/// Default time budget for one request, connection included.
pub const DEFAULT_DECISION_TIMEOUT: Duration = Duration::from_millis(250);

/// A productivity prediction for one sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub is_productive: bool,
    /// Always within `[0, 1]`
    pub confidence: f64,
}

impl Prediction {
    pub fn new(is_productive: bool, confidence: f64) -> Self {
        Self {
            is_productive,
            confidence: confidence.clamp(0.0, 1.0),
        }
    }
}

/// Future returned by [`DecisionService::predict`].
pub type PredictionFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Prediction, DecisionError>> + Send + 'a>>;

/// Anything that can turn features into a prediction.
pub trait DecisionService: Send + Sync {
    fn predict<'a>(&'a self, features: &'a FeatureVector) -> PredictionFuture<'a>;
}

/// TCP client for the inference process.
#[derive(Debug, Clone)]
pub struct TcpDecisionClient {
    addr: SocketAddr,
    timeout: Duration,
    availability: Option<watch::Receiver<ProcessState>>,
}

impl TcpDecisionClient {
    pub fn new(addr: SocketAddr, timeout: Duration) -> Self {
        Self {
            addr,
            timeout,
            availability: None,
        }
    }

    /// Only contact the service while the supervised process reports
    /// [`ProcessState::Ready`].
    pub fn with_availability(mut self, state: watch::Receiver<ProcessState>) -> Self {
        self.availability = Some(state);
        self
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    async fn exchange(&self, features: &FeatureVector) -> Result<Prediction, DecisionError> {
        let mut request =
            serde_json::to_string(features).map_err(|e| DecisionError::Protocol(e.to_string()))?;
        request.push('\n');

        let stream = TcpStream::connect(self.addr)
            .await
            .map_err(|e| DecisionError::Connect(e.to_string()))?;
        let (read_half, mut write_half) = stream.into_split();

        write_half
            .write_all(request.as_bytes())
            .await
            .map_err(|e| DecisionError::Connect(e.to_string()))?;

        let mut response = String::new();
        BufReader::new(read_half)
            .read_line(&mut response)
            .await
            .map_err(|e| DecisionError::Connect(e.to_string()))?;

        parse_response(&response)
    }
}

impl DecisionService for TcpDecisionClient {
    fn predict<'a>(&'a self, features: &'a FeatureVector) -> PredictionFuture<'a> {
        Box::pin(async move {
            if let Some(availability) = &self.availability {
                let state = *availability.borrow();
                if state != ProcessState::Ready {
                    return Err(DecisionError::NotReady(state));
                }
            }

            tokio::time::timeout(self.timeout, self.exchange(features))
                .await
                .map_err(|_| DecisionError::Timeout)?
        })
    }
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    prediction: Option<i64>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default = "default_model_available")]
    model_available: bool,
    #[serde(default)]
    error: Option<String>,
}

fn default_model_available() -> bool {
    true
}

/// Interpret one response line.
pub fn parse_response(line: &str) -> Result<Prediction, DecisionError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(DecisionError::Protocol("empty response".to_string()));
    }

    let wire: WireResponse =
        serde_json::from_str(line).map_err(|e| DecisionError::Protocol(e.to_string()))?;

    if !wire.model_available {
        return Err(DecisionError::NoModel(wire.error));
    }

    let is_productive = match wire.prediction {
        Some(1) => true,
        Some(0) => false,
        Some(other) => {
            return Err(DecisionError::Protocol(format!("unexpected prediction {other}")))
        }
        None => return Err(DecisionError::NoModel(wire.error)),
    };

    match wire.confidence {
        Some(confidence) if confidence.is_finite() => Ok(Prediction::new(is_productive, confidence)),
        _ => Err(DecisionError::Protocol("missing or invalid confidence".to_string())),
    }
}

/// Reasons a prediction could not be obtained. All of them mean "fall back
/// to the interval".
#[derive(Debug, Clone, PartialEq)]
pub enum DecisionError {
    /// The supervised inference process is not Ready
    NotReady(ProcessState),
    Connect(String),
    Timeout,
    Protocol(String),
    /// The service answered but has no model loaded yet
    NoModel(Option<String>),
}

impl std::fmt::Display for DecisionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecisionError::NotReady(state) => write!(f, "Inference service is {state}"),
            DecisionError::Connect(e) => write!(f, "Connection error: {e}"),
            DecisionError::Timeout => write!(f, "Decision service timed out"),
            DecisionError::Protocol(e) => write!(f, "Protocol error: {e}"),
            DecisionError::NoModel(Some(e)) => write!(f, "No model available: {e}"),
            DecisionError::NoModel(None) => write!(f, "No model available"),
        }
    }
}

impl std::error::Error for DecisionError {}
