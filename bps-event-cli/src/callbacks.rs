//! Completion callbacks
//!
//! Records every completion the bridge delivers and every callback failure it
//! reports, so the run report can show both.

use bps_event::{CallbackFailure, Event, PayloadValue};
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;

/// One delivered completion
#[derive(Debug, Clone, Serialize)]
pub struct CompletionRecord {
    pub event: String,
    pub handle: String,
    pub domain: i32,
    pub code: u32,
    /// Payload as seen by the callback, one entry per present slot
    pub payload: Vec<String>,
    pub at: DateTime<Local>,
}

/// One callback failure reported through the bridge's error sink
#[derive(Debug, Clone, Serialize)]
pub struct FailureRecord {
    pub handle: String,
    pub panicked: bool,
    pub message: String,
    pub at: DateTime<Local>,
}

/// Shared log of completions and callback failures
#[derive(Debug, Default)]
pub struct CompletionLog {
    completions: Mutex<Vec<CompletionRecord>>,
    failures: Mutex<Vec<FailureRecord>>,
}

impl CompletionLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Callback that records the completed event under `label`
    ///
    /// The payload is reclaimed right after the callback returns, so it is
    /// read here or not at all.
    pub fn recorder(
        self: &Arc<Self>,
        label: String,
    ) -> impl FnOnce(&Event) -> anyhow::Result<()> + Send + 'static {
        let records = Arc::clone(self);
        move |event: &Event| -> anyhow::Result<()> {
            let payload = event
                .payload()?
                .values()
                .iter()
                .flatten()
                .map(|value| describe(value))
                .collect();
            let record = CompletionRecord {
                event: label,
                handle: event.handle()?.to_string(),
                domain: event.domain()?,
                code: event.code()?,
                payload,
                at: Local::now(),
            };
            log::debug!("Completion recorded for {} ({})", record.event, record.handle);
            records.completions.lock().push(record);
            Ok(())
        }
    }

    /// Error sink entry point for the bridge
    pub fn record_failure(&self, failure: CallbackFailure) {
        log::warn!("{}", failure);
        self.failures.lock().push(FailureRecord {
            handle: failure.handle.to_string(),
            panicked: failure.is_panic(),
            message: failure.to_string(),
            at: Local::now(),
        });
    }

    pub fn completions(&self) -> Vec<CompletionRecord> {
        self.completions.lock().clone()
    }

    pub fn failures(&self) -> Vec<FailureRecord> {
        self.failures.lock().clone()
    }
}

/// Render a value in the `type:value` form the command line accepts
pub fn describe(value: &PayloadValue) -> String {
    match value {
        PayloadValue::Text(text) => format!("text:{}", text),
        PayloadValue::Char(c) => format!("char:{}", c),
        other => format!("{}:{}", other.kind(), other),
    }
}
