use std::error::Error;

use rusoto_cloudwatch::{GetMetricStatisticsError, GetMetricWidgetImageError, ListMetricsError};
use rusoto_core::RusotoError;
use rusoto_s3::PutObjectError;
use rusoto_ses::SendRawEmailError;
use std::fmt;
use std::fmt::{Debug, Display, Formatter};
use std::num::TryFromIntError;

#[derive(Debug, PartialEq, Clone)]
pub enum ReportError {
    NoneValue,
    ToPrimitive,
    TryFromIntError,
    Config(String),
    EmptyRecipients,
    DiscoveryUnavailable(String),
    FetchThrottled(String),
    FetchUnavailable(String),
    FetchRejected(String),
    RenderFailure(String),
    Workbook(String),
    StoreTransient(String),
    StoreFailure(String),
    DispatchTransient(String),
    DispatchFailure(String),
}

impl ReportError {
    /// Whether a call that failed this way may succeed if attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReportError::FetchThrottled(_)
                | ReportError::FetchUnavailable(_)
                | ReportError::StoreTransient(_)
                | ReportError::DispatchTransient(_)
        )
    }
}

impl Display for ReportError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match *self {
            ReportError::NoneValue => write!(f, "Value is None"),
            ReportError::ToPrimitive => {
                write!(f, "Failed to convert bigDecimal to primitive")
            }
            ReportError::TryFromIntError => write!(f, "Failed to convert int"),
            ReportError::Config(ref message) => write!(f, "Invalid configuration: {}", message),
            ReportError::EmptyRecipients => write!(f, "No valid recipient address configured"),
            ReportError::DiscoveryUnavailable(ref message) => {
                write!(f, "Metric discovery unavailable: {}", message)
            }
            ReportError::FetchThrottled(ref message) => write!(f, "Throttled: {}", message),
            ReportError::FetchUnavailable(ref message) => {
                write!(f, "Metrics API unavailable: {}", message)
            }
            ReportError::FetchRejected(ref message) => {
                write!(f, "Metrics request rejected: {}", message)
            }
            ReportError::RenderFailure(ref message) => {
                write!(f, "Failed to render chart: {}", message)
            }
            ReportError::Workbook(ref message) => {
                write!(f, "Failed to build workbook: {}", message)
            }
            ReportError::StoreTransient(ref message) => {
                write!(f, "Report store temporarily unavailable: {}", message)
            }
            ReportError::StoreFailure(ref message) => {
                write!(f, "Failed to store report: {}", message)
            }
            ReportError::DispatchTransient(ref message) => {
                write!(f, "Email service temporarily unavailable: {}", message)
            }
            ReportError::DispatchFailure(ref message) => {
                write!(f, "Failed to send email: {}", message)
            }
        }
    }
}

impl Error for ReportError {}

impl From<TryFromIntError> for ReportError {
    fn from(_: TryFromIntError) -> ReportError {
        ReportError::TryFromIntError
    }
}

/// AWS reports throttling as an unmodelled error: HTTP 400 with a
/// `Throttling` code (CloudWatch, SES) or HTTP 429/503 `SlowDown` (S3).
pub fn is_throttling<E>(error: &RusotoError<E>) -> bool {
    match error {
        RusotoError::Unknown(response) => {
            let body = String::from_utf8_lossy(&response.body);
            response.status.as_u16() == 429 || body.contains("Throttl") || body.contains("SlowDown")
        }
        _ => false,
    }
}

/// Throttling, 5xx responses and connection errors. Anything else is a
/// rejected request and fails the same way when sent again.
pub fn is_transient<E>(error: &RusotoError<E>) -> bool {
    match error {
        RusotoError::HttpDispatch(_) => true,
        RusotoError::Unknown(response) => {
            response.status.is_server_error() || is_throttling(error)
        }
        _ => false,
    }
}

fn metrics_api_error<E: Error + 'static>(error: RusotoError<E>) -> ReportError {
    if is_throttling(&error) {
        ReportError::FetchThrottled(error.to_string())
    } else if is_transient(&error) {
        ReportError::FetchUnavailable(error.to_string())
    } else {
        ReportError::FetchRejected(error.to_string())
    }
}

impl From<RusotoError<ListMetricsError>> for ReportError {
    fn from(e: RusotoError<ListMetricsError>) -> ReportError {
        metrics_api_error(e)
    }
}

impl From<RusotoError<GetMetricStatisticsError>> for ReportError {
    fn from(e: RusotoError<GetMetricStatisticsError>) -> ReportError {
        metrics_api_error(e)
    }
}

impl From<RusotoError<GetMetricWidgetImageError>> for ReportError {
    fn from(e: RusotoError<GetMetricWidgetImageError>) -> ReportError {
        metrics_api_error(e)
    }
}

impl From<RusotoError<PutObjectError>> for ReportError {
    fn from(e: RusotoError<PutObjectError>) -> ReportError {
        if is_transient(&e) {
            ReportError::StoreTransient(e.to_string())
        } else {
            ReportError::StoreFailure(e.to_string())
        }
    }
}

impl From<RusotoError<SendRawEmailError>> for ReportError {
    fn from(e: RusotoError<SendRawEmailError>) -> ReportError {
        if is_transient(&e) {
            ReportError::DispatchTransient(e.to_string())
        } else {
            ReportError::DispatchFailure(e.to_string())
        }
    }
}

impl From<rust_xlsxwriter::XlsxError> for ReportError {
    fn from(e: rust_xlsxwriter::XlsxError) -> ReportError {
        ReportError::Workbook(e.to_string())
    }
}

impl From<png::EncodingError> for ReportError {
    fn from(e: png::EncodingError) -> ReportError {
        ReportError::RenderFailure(e.to_string())
    }
}

impl From<lettre::error::Error> for ReportError {
    fn from(e: lettre::error::Error) -> ReportError {
        ReportError::DispatchFailure(e.to_string())
    }
}
