use serde_json::{Map, Value};

pub const DEFAULT_TEMPERATURE: f64 = 0.8;
pub const DEFAULT_MAX_RESPONSE_TOKENS: u32 = 512;
pub const DEFAULT_PROBABILITY_THRESHOLD: f64 = 0.9;
pub const DEFAULT_TOP_K: u32 = 50;

/// Token selection strategy for one generation call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SamplingMode {
    Greedy,
    TopP { threshold: f64, seed: Option<u64> },
    TopK { count: u32, seed: Option<u64> },
}

impl SamplingMode {
    /// Wire name, as accepted in the `samplingMode` payload field.
    pub fn as_str(&self) -> &'static str {
        match self {
            SamplingMode::Greedy => "greedy",
            SamplingMode::TopP { .. } => "top-p",
            SamplingMode::TopK { .. } => "top-k",
        }
    }
}

impl Default for SamplingMode {
    fn default() -> Self {
        SamplingMode::TopP {
            threshold: DEFAULT_PROBABILITY_THRESHOLD,
            seed: None,
        }
    }
}

/// Per-request generation options.
///
/// Built once from the request payload and never mutated afterwards.
/// Malformed or out-of-range fields fall back to their defaults instead of
/// failing the request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationOptions {
    pub temperature: f64,
    pub max_response_tokens: u32,
    pub sampling: SamplingMode,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            temperature: DEFAULT_TEMPERATURE,
            max_response_tokens: DEFAULT_MAX_RESPONSE_TOKENS,
            sampling: SamplingMode::default(),
        }
    }
}

impl GenerationOptions {
    pub fn from_payload(payload: &Map<String, Value>) -> Self {
        let mut options = Self::default();

        if let Some(temperature) = payload.get("temperature").and_then(Value::as_f64) {
            if (0.0..=2.0).contains(&temperature) {
                options.temperature = temperature;
            }
        }

        if let Some(max_tokens) = payload.get("maximumResponseTokens").and_then(Value::as_u64) {
            if max_tokens > 0 {
                options.max_response_tokens = u32::try_from(max_tokens).unwrap_or(u32::MAX);
            }
        }

        let seed = payload.get("seed").and_then(Value::as_u64);

        options.sampling = match payload.get("samplingMode").and_then(Value::as_str) {
            Some("greedy") => SamplingMode::Greedy,
            Some("top-k") => {
                let count = payload
                    .get("topK")
                    .and_then(Value::as_u64)
                    .filter(|count| *count > 0)
                    .map(|count| u32::try_from(count).unwrap_or(u32::MAX))
                    .unwrap_or(DEFAULT_TOP_K);
                SamplingMode::TopK { count, seed }
            }
            // "top-p" and anything unrecognised
            _ => {
                let threshold = payload
                    .get("probabilityThreshold")
                    .and_then(Value::as_f64)
                    .filter(|t| *t > 0.0 && *t <= 1.0)
                    .unwrap_or(DEFAULT_PROBABILITY_THRESHOLD);
                SamplingMode::TopP { threshold, seed }
            }
        };

        options
    }
}
