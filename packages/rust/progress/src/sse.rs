//! text/event-stream framing for progress subscriptions.

use futures::{Stream, StreamExt};
use serde_json::json;

use oncall_shared::{OncallError, ProgressEvent, Result};

use crate::subscription::Subscription;

/// Frame one event as `data: {json}\n\n`.
pub fn frame(event: &ProgressEvent) -> Result<String> {
    let body = serde_json::to_string(event)
        .map_err(|e| OncallError::validation(format!("unserializable progress event: {e}")))?;
    Ok(format!("data: {body}\n\n"))
}

/// Frame a subscriber-side error as a final `event: error` frame.
pub fn error_frame(err: &OncallError) -> String {
    let body = json!({ "kind": err.kind(), "message": err.to_string() });
    format!("event: error\ndata: {body}\n\n")
}

/// Turn a subscription into a stream of ready-to-write frames.
///
/// A stall ends the stream with an error frame instead of an `Err` item, so
/// the transport can forward every item verbatim.
pub fn event_stream(subscription: Subscription) -> impl Stream<Item = String> + Send {
    subscription.into_stream().map(|item| match item {
        Ok(event) => frame(&event).unwrap_or_else(|e| error_frame(&e)),
        Err(e) => error_frame(&e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use oncall_shared::{RegistryConfig, Stage};

    use crate::TaskRegistry;

    #[test]
    fn frame_is_single_data_line() {
        let event = ProgressEvent {
            stage: Stage::Triage,
            message: "Extracting 3 artifacts".into(),
            percentage: 5,
            completed: false,
        };
        let framed = frame(&event).unwrap();
        assert!(framed.starts_with("data: {"));
        assert!(framed.ends_with("}\n\n"));
        assert_eq!(framed.matches('\n').count(), 2);
        assert!(framed.contains(r#""stage":"TRIAGE""#));
    }

    #[test]
    fn stalled_error_frame() {
        let err = OncallError::StalledTask {
            task_id: oncall_shared::TaskId::new(),
            idle: std::time::Duration::from_secs(120),
        };
        let framed = error_frame(&err);
        assert!(framed.starts_with("event: error\n"));
        assert!(framed.contains(r#""kind":"stalled_task""#));
    }

    #[tokio::test]
    async fn stream_ends_with_completed_frame() {
        let reg = TaskRegistry::new(RegistryConfig::default());
        let id = reg.create_task();
        let failure = oncall_shared::TaskFailure {
            kind: oncall_shared::ErrorKind::Validation,
            stage: Stage::Triage,
            message: "no artifacts could be extracted".into(),
        };
        reg.complete(id, Err(failure)).unwrap();

        let frames: Vec<String> = event_stream(reg.subscribe(id).unwrap()).collect().await;
        assert_eq!(frames.len(), 1);
        assert!(frames[0].contains(r#""completed":true"#));
        assert!(frames[0].contains(r#""stage":"FAILED""#));
    }
}
