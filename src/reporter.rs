//! Progress reporting.
//!
//! The run loop reports lifecycle events through the [`ProgressReporter`]
//! trait; the transport (HTTP post, websocket, message bus) is the
//! implementation's business. A reporter may be a no-op.
use serde::Serialize;

/// Lifecycle events a run reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, derive_more::Display)]
#[serde(rename_all = "lowercase")]
pub enum ReportAction {
    /// The run started.
    #[display("start")]
    Start,
    /// One step completed.
    #[display("step")]
    Step,
    /// Results were (partially) saved.
    #[display("save")]
    Save,
    /// The run failed.
    #[display("error")]
    Error,
    /// The run completed.
    #[display("done")]
    Done,
}

/// The payload attached to every report.
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct ReportPayload {
    /// The scenario being run.
    pub scenario_id: u32,
    /// Which unit of work within the request.
    pub run_number: usize,
    /// Progress through the run, 0-100.
    pub progress_percent: u8,
    /// Human-readable status line.
    pub status: String,
    /// Current simulation date, when stepping.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_date: Option<String>,
    /// Error or save detail, when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Something progress can be reported to.
pub trait ProgressReporter {
    /// Report one lifecycle event.
    fn report(&mut self, action: ReportAction, payload: &ReportPayload);
}

/// A reporter that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopReporter;

impl ProgressReporter for NoopReporter {
    fn report(&mut self, _action: ReportAction, _payload: &ReportPayload) {}
}

/// A reporter that writes progress to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScreenReporter;

impl ProgressReporter for ScreenReporter {
    fn report(&mut self, action: ReportAction, payload: &ReportPayload) {
        match action {
            ReportAction::Error => log::error!(
                "[scenario {} run {}] {}",
                payload.scenario_id,
                payload.run_number,
                payload.message.as_deref().unwrap_or("unknown error")
            ),
            ReportAction::Step => log::debug!(
                "[scenario {} run {}] {}% {}",
                payload.scenario_id,
                payload.run_number,
                payload.progress_percent,
                payload.current_date.as_deref().unwrap_or_default()
            ),
            _ => log::info!(
                "[scenario {} run {}] {action}: {}",
                payload.scenario_id,
                payload.run_number,
                payload.status
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A reporter that records what it was told, for run-loop tests.
    #[derive(Debug, Default)]
    pub struct RecordingReporter {
        pub events: Vec<(ReportAction, ReportPayload)>,
    }

    impl ProgressReporter for RecordingReporter {
        fn report(&mut self, action: ReportAction, payload: &ReportPayload) {
            self.events.push((action, payload.clone()));
        }
    }

    #[test]
    fn test_action_names() {
        assert_eq!(ReportAction::Start.to_string(), "start");
        assert_eq!(
            serde_json::to_string(&ReportAction::Error).unwrap(),
            "\"error\""
        );
    }

    #[test]
    fn test_payload_serialisation_skips_empty_fields() {
        let payload = ReportPayload {
            scenario_id: 9,
            run_number: 1,
            progress_percent: 40,
            status: "running".to_string(),
            current_date: None,
            message: None,
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(!json.contains("current_date"));
        assert!(!json.contains("message"));
    }

    #[test]
    fn test_recording_reporter() {
        let mut reporter = RecordingReporter::default();
        reporter.report(ReportAction::Start, &ReportPayload::default());
        reporter.report(ReportAction::Done, &ReportPayload::default());
        assert_eq!(reporter.events.len(), 2);
        assert_eq!(reporter.events[0].0, ReportAction::Start);
    }
}
