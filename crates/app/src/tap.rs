use std::{collections::HashSet, time::Duration};

use axum::response::sse::{Event, KeepAlive};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_stream::{wrappers::BroadcastStream, Stream, StreamExt};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Http,
    Queue,
    Worker,
    Scheduler,
}

impl StageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StageKind::Http => "http",
            StageKind::Queue => "queue",
            StageKind::Worker => "worker",
            StageKind::Scheduler => "scheduler",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "http" => Some(Self::Http),
            "queue" => Some(Self::Queue),
            "worker" => Some(Self::Worker),
            "scheduler" => Some(Self::Scheduler),
            _ => None,
        }
    }
}

/// One observation of a job moving through the pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct StageEvent {
    pub ts: DateTime<Utc>,
    pub stage: StageKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<&'static str>,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub detail: Value,
}

impl StageEvent {
    pub fn new(stage: StageKind, message: impl Into<String>) -> Self {
        Self {
            ts: Utc::now(),
            stage,
            message: message.into(),
            job_id: None,
            task: None,
            detail: Value::Null,
        }
    }

    pub fn with_job(mut self, job_id: impl ToString, task: &'static str) -> Self {
        self.job_id = Some(job_id.to_string());
        self.task = Some(task);
        self
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = detail;
        self
    }

    pub fn into_sse_event(self) -> Result<Event, serde_json::Error> {
        let data = serde_json::to_string(&self)?;
        Ok(Event::default().event(self.stage.as_str()).data(data))
    }
}

/// Fan-out hub for stage events. Publishing with no subscribers is a no-op.
#[derive(Clone)]
pub struct TapHub {
    sender: broadcast::Sender<StageEvent>,
}

impl TapHub {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(128);
        Self { sender }
    }

    pub fn publish(&self, event: StageEvent) {
        if self.sender.send(event).is_err() {
            debug!(stage = "tap", "no tap subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StageEvent> {
        self.sender.subscribe()
    }
}

impl Default for TapHub {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default)]
pub struct TapFilter {
    stages: Option<HashSet<StageKind>>,
}

impl TapFilter {
    pub fn from_stages(stages: Option<HashSet<StageKind>>) -> Self {
        Self { stages }
    }

    pub fn matches(&self, event: &StageEvent) -> bool {
        match &self.stages {
            Some(stages) => stages.contains(&event.stage),
            None => true,
        }
    }
}

pub fn tap_stream(
    hub: TapHub,
    filter: TapFilter,
) -> impl Stream<Item = Result<Event, serde_json::Error>> + Send + 'static {
    BroadcastStream::new(hub.subscribe()).filter_map(move |result| match result {
        Ok(event) if filter.matches(&event) => Some(event.into_sse_event()),
        _ => None,
    })
}

pub fn tap_keep_alive() -> KeepAlive {
    KeepAlive::new()
        .interval(Duration::from_secs(20))
        .text("heartbeat")
}

/// Parses the comma separated `s` query parameter. An empty list means "all stages".
pub fn parse_stage_list(value: Option<String>) -> Result<Option<HashSet<StageKind>>, String> {
    let Some(raw) = value else {
        return Ok(None);
    };
    let mut set = HashSet::new();
    for item in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let stage = StageKind::parse(&item.to_lowercase())
            .ok_or_else(|| format!("unknown stage '{item}'"))?;
        set.insert(stage);
    }

    if set.is_empty() {
        Ok(None)
    } else {
        Ok(Some(set))
    }
}
