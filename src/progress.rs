use once_cell::sync::Lazy;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Global sink for progress lines. When a UI is active it installs a sink
/// here; otherwise lines go to stderr.
type ProgressSink = Arc<dyn Fn(String) + Send + Sync + 'static>;

static PROGRESS_SINK: Lazy<Mutex<Option<ProgressSink>>> = Lazy::new(|| Mutex::new(None));

static CANCELLED: AtomicBool = AtomicBool::new(false);
static CANCEL_REASON: Lazy<Mutex<String>> = Lazy::new(|| Mutex::new(String::new()));

pub fn install_progress_sink(sink: ProgressSink) {
    *PROGRESS_SINK.lock().unwrap() = Some(sink);
}

pub fn clear_progress_sink() {
    *PROGRESS_SINK.lock().unwrap() = None;
}

/// Emits a structured progress line (key=value fields by convention).
pub fn log_progress(message: impl AsRef<str>) {
    let line = message.as_ref().to_string();
    let sink = PROGRESS_SINK.lock().unwrap().clone();
    match sink {
        Some(sink) => sink(line),
        None => eprintln!("progress {line}"),
    }
}

pub fn request_cancellation(reason: impl Into<String>) {
    let reason = reason.into();
    if !CANCELLED.swap(true, Ordering::SeqCst) {
        *CANCEL_REASON.lock().unwrap() = reason.clone();
        log_progress(format!("phase=run status=cancellation-requested reason={reason}"));
    }
}

pub fn cancellation_requested() -> bool {
    CANCELLED.load(Ordering::SeqCst)
}

pub fn cancellation_reason() -> String {
    let reason = CANCEL_REASON.lock().unwrap().clone();
    if reason.is_empty() { "cancelled".to_string() } else { reason }
}

pub fn reset_cancellation() {
    CANCELLED.store(false, Ordering::SeqCst);
    CANCEL_REASON.lock().unwrap().clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn sink_receives_lines() {
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        install_progress_sink(Arc::new(move |line| {
            if line.contains("sink-test-marker") {
                count2.fetch_add(1, Ordering::SeqCst);
            }
        }));
        log_progress("phase=test status=sink-test-marker");
        clear_progress_sink();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancellation_flags() {
        reset_cancellation();
        assert!(!cancellation_requested());
        request_cancellation("test stop");
        assert!(cancellation_requested());
        assert_eq!(cancellation_reason(), "test stop");
        reset_cancellation();
        assert!(!cancellation_requested());
    }
}
