//! Serve events and the diagnostics attached to them.

use crate::config::{ResponseDefinition, StubMapping};
use crate::request::Request;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// One served request with its matched stub and in-progress response.
#[derive(Debug, Clone)]
pub struct ServeEvent {
    pub request: Request,
    pub stub: StubMapping,
    pub response: ResponseDefinition,
    sub_events: Vec<SubEvent>,
}

impl ServeEvent {
    /// Pair a request with its stub; the response starts as the stub's.
    pub fn new(request: Request, stub: StubMapping) -> Self {
        let response = stub.response.clone();
        Self {
            request,
            stub,
            response,
            sub_events: Vec::new(),
        }
    }

    /// Record a diagnostic.
    pub fn append_sub_event(&mut self, event: SubEvent) {
        self.sub_events.push(event);
    }

    pub fn sub_events(&self) -> &[SubEvent] {
        &self.sub_events
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubEventLevel {
    Info,
    Warning,
    Error,
}

/// Diagnostic recorded while serving a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubEvent {
    pub level: SubEventLevel,
    pub message: String,
    pub recorded_at: DateTime<Utc>,
}

impl SubEvent {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: SubEventLevel::Error,
            message: message.into(),
            recorded_at: Utc::now(),
        }
    }
}
