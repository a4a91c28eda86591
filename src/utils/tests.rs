use serial_test::serial;

use super::error::FeedError;
use super::logging;
use super::report::{ErrorSink, RecordingErrorSink, TracingErrorSink};

#[test]
#[serial]
fn logging_init_accepts_levels() {
    // Should not panic
    logging::init("info");
    logging::init("debug");
    logging::init("warn");
}

#[test]
#[serial]
fn log_filter_uses_configured_level() {
    temp_env::with_var_unset("RUST_LOG", || {
        assert_eq!(logging::filter_for("debug").to_string(), "debug");
        assert_eq!(
            logging::filter_for("railsub=trace").to_string(),
            "railsub=trace"
        );
    });
}

#[test]
#[serial]
fn log_filter_falls_back_on_invalid_directive() {
    temp_env::with_var_unset("RUST_LOG", || {
        assert_eq!(logging::filter_for("railsub=loud").to_string(), "info");
    });
}

#[test]
#[serial]
fn rust_log_overrides_configured_level() {
    temp_env::with_var("RUST_LOG", Some("warn"), || {
        assert_eq!(logging::filter_for("trace").to_string(), "warn");
    });
}

#[test]
fn recording_sink_keeps_reported_errors() {
    let sink = RecordingErrorSink::new();
    sink.report(&FeedError::MalformedMessage("not json".into()));
    sink.report(&FeedError::PersistenceFailure {
        user: 5,
        reason: "disk full".into(),
    });

    assert_eq!(sink.reported().len(), 2);
    assert_eq!(
        sink.count_matching(|e| matches!(e, FeedError::PersistenceFailure { .. })),
        1
    );
}

#[test]
fn tracing_sink_handles_every_class() {
    let sink = TracingErrorSink;
    sink.report(&FeedError::SlowConsumer {
        connection: "conn-1".into(),
        dropped: 3,
    });
    sink.report(&FeedError::TooManyConnections(10));
}

#[test]
fn only_connection_level_errors_close_the_connection() {
    assert!(FeedError::Unauthorized("user:42".into()).closes_connection());
    assert!(FeedError::ConnectionClosed("conn-1".into()).closes_connection());
    assert!(!FeedError::MalformedMessage("x".into()).closes_connection());
    assert!(!FeedError::UnknownLine("99".into()).closes_connection());
}
