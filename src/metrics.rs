//! Request metrics, exposed in the Prometheus text format.

use std::time::Duration;

use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};

pub const REQUEST_DURATION: &str = "api_gateway_request_duration_seconds";
pub const REQUEST_ERRORS: &str = "api_gateway_request_errors_total";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BadRequest,
    InvalidType,
    QueuePublish,
    ExternalCall,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::InvalidType => "invalid_type",
            ErrorKind::QueuePublish => "queue_publish",
            ErrorKind::ExternalCall => "external_call",
        }
    }
}

pub struct Metrics {
    registry: Registry,
    request_duration: HistogramVec,
    request_errors: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let request_duration = HistogramVec::new(
            HistogramOpts::new(REQUEST_DURATION, "Duration of HTTP requests."),
            &["handler", "code"],
        )?;
        let request_errors = IntCounterVec::new(
            Opts::new(REQUEST_ERRORS, "Total number of request errors."),
            &["handler", "error"],
        )?;

        registry.register(Box::new(request_duration.clone()))?;
        registry.register(Box::new(request_errors.clone()))?;

        Ok(Self {
            registry,
            request_duration,
            request_errors,
        })
    }

    pub fn observe_request(&self, handler: &str, code: u16, duration: Duration) {
        let code = code.to_string();
        self.request_duration
            .with_label_values(&[handler, code.as_str()])
            .observe(duration.as_secs_f64());
    }

    pub fn record_error(&self, handler: &str, kind: ErrorKind) {
        self.request_errors
            .with_label_values(&[handler, kind.as_str()])
            .inc();
    }

    pub fn error_count(&self, handler: &str, kind: ErrorKind) -> u64 {
        self.request_errors
            .with_label_values(&[handler, kind.as_str()])
            .get()
    }

    /// Encodes every registered series.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_observed_series() {
        let metrics = Metrics::new().unwrap();
        metrics.observe_request("send_notification", 200, Duration::from_millis(250));
        metrics.observe_request("send_notification", 200, Duration::from_millis(250));
        metrics.record_error("send_notification", ErrorKind::QueuePublish);

        let text = metrics.render().unwrap();

        assert!(text.contains("# TYPE api_gateway_request_duration_seconds histogram"));
        assert!(text.contains(
            "api_gateway_request_duration_seconds_count{code=\"200\",handler=\"send_notification\"} 2"
        ));
        assert!(text.contains(
            "api_gateway_request_duration_seconds_bucket{code=\"200\",handler=\"send_notification\",le=\"+Inf\"} 2"
        ));
        assert!(text.contains(
            "api_gateway_request_errors_total{error=\"queue_publish\",handler=\"send_notification\"} 1"
        ));
        assert_eq!(metrics.error_count("send_notification", ErrorKind::QueuePublish), 1);
        assert_eq!(metrics.error_count("send_notification", ErrorKind::BadRequest), 0);
    }
}
