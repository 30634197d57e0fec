use serde::{Deserialize, Serialize};

use super::job::Job;

/// Control messages a progress client sends to the gateway.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "subscribe:imports")]
    SubscribeImports,
}

/// Messages the gateway pushes to subscribed clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum ServerMessage {
    #[serde(rename = "import:subscribed")]
    Subscribed,
    #[serde(rename = "import:progress")]
    ImportProgress(ProgressData),
}

/// Progress payload: the gateway sends one snapshot per message, but the
/// channel itself carries arrays, so both shapes are accepted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ProgressData {
    One(Box<Job>),
    Many(Vec<Job>),
}

impl ProgressData {
    pub fn into_jobs(self) -> Vec<Job> {
        match self {
            ProgressData::One(job) => vec![*job],
            ProgressData::Many(jobs) => jobs,
        }
    }
}

/// Decode a payload published on the progress channel.
pub fn decode_channel_payload(payload: &str) -> Result<Vec<Job>, serde_json::Error> {
    serde_json::from_str::<ProgressData>(payload).map(ProgressData::into_jobs)
}
