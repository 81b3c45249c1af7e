use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};

use crate::error::ChannelError;

/// Lifecycle state of one live assistant channel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ChannelState {
    /// No binding exists and no retry is pending.
    Disconnected,
    /// A binding was created and is waiting for its open signal.
    Connecting,
    /// The binding is open and accepts outbound frames.
    Open,
    /// The last binding failed; a backoff timer is pending.
    Reconnecting,
    /// Automatic retries are exhausted. Only a manual `connect()` recovers.
    Failed,
}

impl ChannelState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier of one transport binding, unique per channel instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BindingId(pub u64);

impl fmt::Display for BindingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "binding-{}", self.0)
    }
}

/// One known interaction between two drugs, as reported by the analysis service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DrugInteraction {
    #[serde(rename = "drugA")]
    pub drug_a: String,
    #[serde(rename = "drugB")]
    pub drug_b: String,
    /// Severity score in `0.0..=1.0`.
    pub severity: f64,
    #[serde(default)]
    pub mechanism: String,
}

/// Subset of a prior interaction-check response that is forwarded as chat context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AnalysisSnapshot {
    #[serde(default)]
    pub drugs: Vec<String>,
    #[serde(default)]
    pub drug_interactions: Vec<DrugInteraction>,
    #[serde(default)]
    pub organ_impacts: BTreeMap<String, f64>,
    #[serde(default)]
    pub global_risk: f64,
}

/// Structured context sent alongside each user message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RequestContext {
    pub drugs: Vec<String>,
    pub organ_impacts: BTreeMap<String, f64>,
    pub global_risk: f64,
    pub interactions: Vec<DrugInteraction>,
}

impl RequestContext {
    /// Build request context from the current drug list and the latest analysis.
    ///
    /// An empty `drugs` list falls back to the drugs recorded in the analysis.
    pub fn from_analysis(drugs: &[String], analysis: Option<&AnalysisSnapshot>) -> Self {
        let Some(analysis) = analysis else {
            return Self {
                drugs: drugs.to_vec(),
                ..Self::default()
            };
        };

        let drugs = if drugs.is_empty() {
            analysis.drugs.clone()
        } else {
            drugs.to_vec()
        };

        Self {
            drugs,
            organ_impacts: analysis.organ_impacts.clone(),
            global_risk: analysis.global_risk,
            interactions: analysis.drug_interactions.clone(),
        }
    }
}

/// Optional user location. Serializes to `{}` when nothing is known.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct Location {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lon: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
}

impl Location {
    pub fn is_known(&self) -> bool {
        self.lat.is_some() && self.lon.is_some()
    }
}

/// Outbound request frame: one user message plus its context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssistantRequest {
    pub message: String,
    pub context: RequestContext,
    pub location: Location,
}

impl AssistantRequest {
    pub fn new(message: impl Into<String>, context: RequestContext, location: Location) -> Self {
        Self {
            message: message.into(),
            context,
            location,
        }
    }
}

/// Healthcare facility suggested by the assistant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NearbyFacility {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub distance_km: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,
}

/// Inbound reply frame decoded from the assistant service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssistantReply {
    pub reply: String,
    #[serde(default)]
    pub nearby_facilities: Vec<NearbyFacility>,
}

/// Notification emitted by a live channel to its consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Lifecycle transition, in transition order.
    StateChanged {
        /// New channel state.
        state: ChannelState,
    },
    /// A reconnect timer was armed while in `Reconnecting`.
    RetryScheduled {
        /// Zero-based attempt index used for the delay.
        attempt: u32,
        /// Backoff delay before the next `Connecting` transition.
        delay_ms: u64,
    },
    /// A decoded assistant reply, in receipt order.
    Message(AssistantReply),
    /// Malformed frame or retry exhaustion. Never changes channel state.
    Diagnostic(ChannelError),
}
