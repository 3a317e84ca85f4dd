use presence_core::{AttendanceLedger, PipelineError};
use serde_json::json;
use std::sync::Arc;
use tracing::Instrument;
use uuid::Uuid;
use zbus::interface;

use crate::engine::{EngineError, EngineHandle};
use crate::upload::{self, InputError};

/// Well-known bus name claimed by the daemon.
pub const BUS_NAME: &str = "org.freedesktop.Presence1";
/// Object path the service is exported at.
pub const OBJECT_PATH: &str = "/org/freedesktop/Presence1";

/// D-Bus interface for the Presence attendance daemon.
///
/// Bus name: org.freedesktop.Presence1
/// Object path: /org/freedesktop/Presence1
///
/// Every method returns a JSON document.
pub struct PresenceService {
    engine: EngineHandle,
    ledger: Arc<AttendanceLedger>,
    max_upload_bytes: usize,
}

impl PresenceService {
    pub fn new(engine: EngineHandle, ledger: Arc<AttendanceLedger>, max_upload_bytes: usize) -> Self {
        Self {
            engine,
            ledger,
            max_upload_bytes,
        }
    }

    /// Decode off the async runtime; large photos take a while.
    async fn decode(&self, image: Vec<u8>) -> zbus::fdo::Result<presence_core::RgbImage> {
        let max = self.max_upload_bytes;
        tokio::task::spawn_blocking(move || upload::decode_upload(&image, max))
            .await
            .map_err(|e| zbus::fdo::Error::Failed(format!("decoder task failed: {e}")))?
            .map_err(|e| input_error(&e))
    }
}

#[interface(name = "org.freedesktop.Presence1")]
impl PresenceService {
    /// Identify every face in an image without marking attendance.
    async fn recognize(&self, image: Vec<u8>) -> zbus::fdo::Result<String> {
        let span = tracing::info_span!("recognize", request_id = %Uuid::new_v4(), bytes = image.len());
        async {
            let rgb = self.decode(image).await?;
            let batch = self.engine.recognize(rgb).await.map_err(|e| engine_error(&e))?;
            to_json(&batch)
        }
        .instrument(span)
        .await
    }

    /// Mark every recognized face in an image present.
    async fn mark_attendance(&self, image: Vec<u8>) -> zbus::fdo::Result<String> {
        let span = tracing::info_span!("mark_attendance", request_id = %Uuid::new_v4(), bytes = image.len());
        async {
            let rgb = self.decode(image).await?;
            let update = self
                .engine
                .mark_attendance(rgb)
                .await
                .map_err(|e| engine_error(&e))?;
            to_json(&update)
        }
        .instrument(span)
        .await
    }

    /// Present and absent students for the current session.
    async fn attendance_report(&self) -> zbus::fdo::Result<String> {
        let report = self.ledger.report(self.engine.gallery().known_students());
        tracing::info!(present = report.count, absent = report.absent.len(), "attendance report");
        to_json(&report)
    }

    /// Clear the ledger and start a new session.
    async fn reset_attendance(&self) -> zbus::fdo::Result<String> {
        let count = self.ledger.reset();
        Ok(reset_reply(count).to_string())
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let known = self.engine.gallery().known_students().len();
        Ok(status_reply(known, &self.ledger).to_string())
    }
}

/// Models are loaded before the service is exported, so a reachable daemon is healthy.
fn status_reply(known_students: usize, ledger: &AttendanceLedger) -> serde_json::Value {
    json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "models_loaded": true,
        "known_students_count": known_students,
        "current_attendance": ledger.count(),
        "session_started": ledger.session_started().to_rfc3339(),
    })
}

fn reset_reply(count: usize) -> serde_json::Value {
    json!({ "message": "attendance reset", "count": count })
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(format!("encoding reply: {e}")))
}

/// Bad uploads are the caller's fault.
fn input_error(err: &InputError) -> zbus::fdo::Error {
    tracing::warn!(error = %err, "upload rejected");
    zbus::fdo::Error::InvalidArgs(err.to_string())
}

fn engine_error(err: &EngineError) -> zbus::fdo::Error {
    match err {
        EngineError::Pipeline(PipelineError::NoFaceRecognized {
            faces_detected,
            skipped,
        }) => {
            tracing::info!(faces_detected, skipped = skipped.len(), "no face recognized");
        }
        other => tracing::error!(error = %other, "recognition failed"),
    }
    zbus::fdo::Error::Failed(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_reply_shape() {
        assert_eq!(
            reset_reply(0),
            json!({ "message": "attendance reset", "count": 0 })
        );
    }

    #[test]
    fn test_status_reply_shape() {
        let ledger = AttendanceLedger::new();
        ledger.mark("alice");

        let reply = status_reply(3, &ledger);
        assert_eq!(reply["status"], "healthy");
        assert_eq!(reply["version"], env!("CARGO_PKG_VERSION"));
        assert_eq!(reply["models_loaded"], true);
        assert_eq!(reply["known_students_count"], 3);
        assert_eq!(reply["current_attendance"], 1);
        assert_eq!(reply["session_started"], ledger.session_started().to_rfc3339());
    }

    #[test]
    fn test_zero_sized_image_is_invalid_args() {
        let err = input_error(&InputError::NoPixels { width: 0, height: 0 });
        assert!(matches!(err, zbus::fdo::Error::InvalidArgs(_)));
    }

    #[test]
    fn test_input_errors_are_invalid_args() {
        let err = input_error(&InputError::TooLarge { size: 11, max: 10 });
        assert!(matches!(err, zbus::fdo::Error::InvalidArgs(msg) if msg.contains("too large")));
    }

    #[test]
    fn test_no_match_is_failed_with_message() {
        let err = engine_error(&EngineError::Pipeline(PipelineError::NoFaceRecognized {
            faces_detected: 2,
            skipped: Vec::new(),
        }));
        assert!(matches!(
            err,
            zbus::fdo::Error::Failed(msg) if msg == "no face recognized or all faces are unknown"
        ));
    }

    #[test]
    fn test_closed_engine_is_failed() {
        let err = engine_error(&EngineError::ChannelClosed);
        assert!(matches!(err, zbus::fdo::Error::Failed(msg) if msg.contains("engine thread exited")));
    }
}
