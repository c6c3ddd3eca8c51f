//! Remote control panel
//!
//! The panel is the supervisory authority: on every reconciliation the
//! controller logs in, uploads its state report and gets back a directive with
//! the relay outputs and AC settings it should apply.

use crate::config::RemoteConfig;
use crate::resources::{StateReport, RELAY_COUNT};
use log::debug;
use reqwest::blocking::Client;
use serde_json::{json, Value};
use std::time::Duration;

/// Errors from the remote panel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Request could not be sent or the panel answered with an error status
    Http(String),
    /// Login was refused
    Unauthorized,
    /// Expected key absent from the panel's answer
    MissingKey(String),
    /// Key present but its value has the wrong type or range
    Malformed { key: String, value: String },
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemoteError::Http(msg) => write!(f, "HTTP error: {}", msg),
            RemoteError::Unauthorized => write!(f, "Panel refused the credentials"),
            RemoteError::MissingKey(key) => write!(f, "Missing key '{}' in panel response", key),
            RemoteError::Malformed { key, value } => {
                write!(f, "Malformed value for '{}': {}", key, value)
            }
        }
    }
}

impl std::error::Error for RemoteError {}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(reqwest::StatusCode::UNAUTHORIZED) | Some(reqwest::StatusCode::FORBIDDEN) => {
                RemoteError::Unauthorized
            }
            _ => RemoteError::Http(err.to_string()),
        }
    }
}

/// Settings pushed by the panel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PanelDirective {
    /// `output1..output10`
    pub outputs: [bool; RELAY_COUNT],
    pub temp_set: u16,
    pub temp_on: bool,
    pub freeze_protect: bool,
    pub rented: bool,
}

impl PanelDirective {
    /// Parse the panel's answer. Every key must be present.
    pub fn from_json(body: &Value) -> Result<Self, RemoteError> {
        let mut outputs = [false; RELAY_COUNT];
        for (idx, output) in outputs.iter_mut().enumerate() {
            *output = flag(body, &format!("output{}", idx + 1))?;
        }

        Ok(Self {
            outputs,
            temp_set: setpoint(body, "temp_set")?,
            temp_on: flag(body, "temp_on")?,
            freeze_protect: flag(body, "freeze_protect")?,
            rented: flag(body, "rented")?,
        })
    }

    /// Relay outputs as a bitmask: output `n` is bit `n - 1`
    pub fn relay_mask(&self) -> u16 {
        self.outputs
            .iter()
            .enumerate()
            .filter(|(_, on)| **on)
            .fold(0, |mask, (idx, _)| mask | (1 << idx))
    }
}

fn field<'a>(body: &'a Value, key: &str) -> Result<&'a Value, RemoteError> {
    body.get(key)
        .ok_or_else(|| RemoteError::MissingKey(key.to_string()))
}

fn malformed(key: &str, value: &Value) -> RemoteError {
    RemoteError::Malformed {
        key: key.to_string(),
        value: value.to_string(),
    }
}

/// Truthiness as the panel sends it: booleans, 0/1 numbers, or strings like "true"/"on"/"1"
fn flag(body: &Value, key: &str) -> Result<bool, RemoteError> {
    let value = field(body, key)?;
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Null => Ok(false),
        Value::Number(n) => n
            .as_f64()
            .map(|v| v != 0.0)
            .ok_or_else(|| malformed(key, value)),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "on" | "yes" => Ok(true),
            "0" | "false" | "off" | "no" | "" => Ok(false),
            _ => Err(malformed(key, value)),
        },
        _ => Err(malformed(key, value)),
    }
}

/// Whole-degree setpoint; fractional values are truncated
fn setpoint(body: &Value, key: &str) -> Result<u16, RemoteError> {
    let value = field(body, key)?;
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match number {
        Some(v) if v.is_finite() && (0.0..=f64::from(u8::MAX)).contains(&v) => Ok(v.trunc() as u16),
        _ => Err(malformed(key, value)),
    }
}

/// Remote authority the supervisor reconciles with
pub trait RemoteAuthority {
    /// Log in and return a session token
    fn authenticate(&mut self) -> Result<String, RemoteError>;

    /// Upload `report` and receive the panel's directive
    fn exchange(&mut self, token: &str, report: &StateReport) -> Result<PanelDirective, RemoteError>;
}

/// JSON-over-HTTP panel client
pub struct PanelClient {
    http: Client,
    config: RemoteConfig,
}

impl PanelClient {
    pub fn new(config: RemoteConfig) -> Result<Self, RemoteError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { http, config })
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

impl RemoteAuthority for PanelClient {
    fn authenticate(&mut self) -> Result<String, RemoteError> {
        let url = self.url(&self.config.login_path);
        debug!("Logging in to panel at {}", url);

        let body: Value = self
            .http
            .post(&url)
            .json(&json!({
                "username": self.config.username,
                "password": self.config.password,
            }))
            .send()?
            .error_for_status()?
            .json()?;

        match field(&body, "token")? {
            Value::String(token) if !token.is_empty() => Ok(token.clone()),
            other => Err(malformed("token", other)),
        }
    }

    fn exchange(&mut self, token: &str, report: &StateReport) -> Result<PanelDirective, RemoteError> {
        let url = self.url(&self.config.exchange_path);
        debug!("Exchanging state with panel at {}", url);

        let body: Value = self
            .http
            .post(&url)
            .bearer_auth(token)
            .json(report)
            .send()?
            .error_for_status()?
            .json()?;

        PanelDirective::from_json(&body)
    }
}
