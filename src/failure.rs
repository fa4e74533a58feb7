use crate::error::ReportError;
use crate::metric::MetricDescriptor;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Discovery,
    Throttled,
    Unavailable,
    Render,
    TimeBudget,
    Store,
    Recipient,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Discovery => "discovery",
            FailureKind::Throttled => "throttled",
            FailureKind::Unavailable => "unavailable",
            FailureKind::Render => "render",
            FailureKind::TimeBudget => "time budget",
            FailureKind::Store => "store",
            FailureKind::Recipient => "recipient",
        }
    }

    /// Failures that concern a single metric rather than the whole run.
    pub fn is_metric(&self) -> bool {
        matches!(
            self,
            FailureKind::Throttled
                | FailureKind::Unavailable
                | FailureKind::Render
                | FailureKind::TimeBudget
        )
    }
}

impl From<&ReportError> for FailureKind {
    fn from(error: &ReportError) -> Self {
        match error {
            ReportError::FetchThrottled(_) => FailureKind::Throttled,
            ReportError::RenderFailure(_) => FailureKind::Render,
            ReportError::StoreFailure(_) | ReportError::StoreTransient(_) => FailureKind::Store,
            ReportError::DiscoveryUnavailable(_) => FailureKind::Discovery,
            ReportError::EmptyRecipients => FailureKind::Recipient,
            _ => FailureKind::Unavailable,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Failure {
    pub subject: String,
    pub kind: FailureKind,
    pub reason: String,
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({}): {}", self.subject, self.kind.as_str(), self.reason)
    }
}

/// Append-only record of everything that went wrong without stopping the run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FailureLog {
    failures: Vec<Failure>,
}

impl FailureLog {
    pub fn record(&mut self, subject: impl Into<String>, kind: FailureKind, reason: impl Into<String>) {
        self.failures.push(Failure {
            subject: subject.into(),
            kind,
            reason: reason.into(),
        });
    }

    pub fn record_metric(&mut self, descriptor: &MetricDescriptor, error: &ReportError) {
        self.record(descriptor.to_string(), FailureKind::from(error), error.to_string());
    }

    pub fn iter(&self) -> impl Iterator<Item = &Failure> {
        self.failures.iter()
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// Number of per-metric failures (fetch, render, time budget).
    pub fn metric_failures(&self) -> usize {
        self.failures.iter().filter(|f| f.kind.is_metric()).count()
    }
}

#[cfg(test)]
mod tests {
    use crate::error::ReportError;
    use crate::failure::{FailureKind, FailureLog};
    use crate::metric::MetricDescriptor;

    #[test]
    fn test_record_and_tally() {
        let mut log = FailureLog::default();
        let descriptor = MetricDescriptor::new("AWS/EC2", "CPUUtilization", vec![]);
        log.record_metric(
            &descriptor,
            &ReportError::FetchThrottled("Rate exceeded".to_string()),
        );
        log.record("s3://bucket/key", FailureKind::Store, "SlowDown");
        log.record("not-an-address", FailureKind::Recipient, "invalid mailbox");

        assert_eq!(log.len(), 3);
        assert_eq!(log.metric_failures(), 1);
        assert!(log.iter().any(|f| f.kind == FailureKind::Store));
        assert_eq!(
            log.iter().next().unwrap().to_string(),
            "AWS/EC2/CPUUtilization (throttled): Throttled: Rate exceeded"
        );
    }
}
