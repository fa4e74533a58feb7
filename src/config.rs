use crate::error::ReportError;
use crate::chart::MAX_SIDE;
use crate::retry::RetryPolicy;
use crate::time_range::{Lookback, MAX_PERIOD_SECONDS};
use lettre::message::Mailbox;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_REGION: &str = "us-east-1";
const DEFAULT_FUNCTION_NAME: &str = "metrics-reporter";
const MAX_IMAGES_PER_ROW: u16 = 20;
const MAX_LINK_EXPIRY_HOURS: u64 = 168;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderMode {
    /// Fetch raw datapoints and draw the chart locally.
    Samples,
    /// Ask GetMetricWidgetImage for a pre-rendered PNG.
    Widget,
}

impl FromStr for RenderMode {
    type Err = ReportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "samples" | "local" => Ok(RenderMode::Samples),
            "widget" => Ok(RenderMode::Widget),
            other => Err(ReportError::Config(format!(
                "RENDER_MODE must be samples or widget, got {}",
                other
            ))),
        }
    }
}

/// Everything the job reads from its environment, resolved once at start-up.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub bucket: String,
    pub sender: Mailbox,
    pub recipients: String,
    pub lookback: Lookback,
    pub period: i64,
    pub max_metrics_per_namespace: usize,
    pub image_scale: f64,
    pub attach_excel: bool,
    pub max_email_mb: f64,
    pub namespaces: Vec<String>,
    pub home_region: String,
    pub regions: Vec<String>,
    pub prefix: String,
    pub images_per_row: u16,
    pub widget_width: u32,
    pub widget_height: u32,
    pub render_mode: RenderMode,
    pub widget_summary: bool,
    pub fetch_concurrency: usize,
    pub retry: RetryPolicy,
    pub delivery_reserve: Duration,
    pub run_timeout: Duration,
    pub link_expiry: Duration,
    pub function_name: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ReportError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ReportError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let bucket = get("S3_BUCKET").ok_or_else(|| missing("S3_BUCKET"))?;
        let sender_raw = get("SES_SENDER_EMAIL").ok_or_else(|| missing("SES_SENDER_EMAIL"))?;
        let sender = sender_raw.parse::<Mailbox>().map_err(|error| {
            ReportError::Config(format!("SES_SENDER_EMAIL {}: {}", sender_raw, error))
        })?;
        let home_region = get("AWS_REGION").unwrap_or_else(|| DEFAULT_REGION.to_string());
        let regions = get("REGIONS")
            .map(|raw| split_list(&raw))
            .filter(|regions| !regions.is_empty())
            .unwrap_or_else(|| vec![home_region.clone()]);

        let period = bounded(
            "PERIOD_SECONDS",
            parse(&get, "PERIOD_SECONDS", 300i64)?,
            1,
            MAX_PERIOD_SECONDS,
        )?;
        let image_scale: f64 = parse(&get, "IMG_SCALE", 0.35)?;
        if image_scale.is_nan() || image_scale <= 0.0 {
            return Err(ReportError::Config(format!(
                "IMG_SCALE must be positive, got {}",
                image_scale
            )));
        }

        Ok(Config {
            bucket,
            sender,
            recipients: get("SES_RECIPIENT_EMAILS").unwrap_or_default(),
            lookback: get("LOOKBACK_ISO")
                .unwrap_or_else(|| "-PT24H".to_string())
                .parse()?,
            period,
            max_metrics_per_namespace: parse(&get, "MAX_METRICS_PER_NS", 100)?,
            image_scale,
            attach_excel: parse_bool(&get, "ATTACH_EXCEL", true)?,
            max_email_mb: parse(&get, "MAX_EMAIL_MB", 7.0)?,
            namespaces: get("NAMESPACES").map(|raw| split_list(&raw)).unwrap_or_default(),
            home_region,
            regions,
            prefix: get("S3_PREFIX").unwrap_or_else(|| "cloudwatch/excel".to_string()),
            images_per_row: bounded(
                "IMAGES_PER_ROW",
                parse(&get, "IMAGES_PER_ROW", 2u16)?.max(1),
                1,
                MAX_IMAGES_PER_ROW,
            )?,
            widget_width: bounded("WIDGET_WIDTH", parse(&get, "WIDGET_WIDTH", 1067u32)?, 1, MAX_SIDE)?,
            widget_height: bounded("WIDGET_HEIGHT", parse(&get, "WIDGET_HEIGHT", 300u32)?, 1, MAX_SIDE)?,
            render_mode: get("RENDER_MODE")
                .map_or(Ok(RenderMode::Samples), |raw| raw.parse())?,
            widget_summary: parse_bool(&get, "WIDGET_SUMMARY", false)?,
            fetch_concurrency: parse(&get, "FETCH_CONCURRENCY", 8usize)?.max(1),
            retry: RetryPolicy::new(
                parse(&get, "RETRY_MAX_ATTEMPTS", 4)?,
                Duration::from_millis(parse(&get, "RETRY_BASE_DELAY_MS", 200)?),
            ),
            delivery_reserve: Duration::from_secs(parse(&get, "DELIVERY_RESERVE_SECS", 60)?),
            run_timeout: Duration::from_secs(parse(&get, "RUN_TIMEOUT_SECS", 900)?),
            link_expiry: Duration::from_secs(
                3600 * bounded(
                    "LINK_EXPIRY_HOURS",
                    parse(&get, "LINK_EXPIRY_HOURS", 168u64)?,
                    1,
                    MAX_LINK_EXPIRY_HOURS,
                )?,
            ),
            function_name: get("AWS_LAMBDA_FUNCTION_NAME")
                .unwrap_or_else(|| DEFAULT_FUNCTION_NAME.to_string()),
        })
    }
}

fn missing(key: &str) -> ReportError {
    ReportError::Config(format!("{} is required", key))
}

fn parse<T, G>(get: &G, key: &str, default: T) -> Result<T, ReportError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .parse()
            .map_err(|error| ReportError::Config(format!("{} {}: {}", key, raw, error))),
        None => Ok(default),
    }
}

fn bounded<T>(key: &str, value: T, min: T, max: T) -> Result<T, ReportError>
where
    T: PartialOrd + std::fmt::Display,
{
    if value < min || value > max {
        return Err(ReportError::Config(format!(
            "{} must be between {} and {}, got {}",
            key, min, max, value
        )));
    }
    Ok(value)
}

fn parse_bool<G>(get: &G, key: &str, default: bool) -> Result<bool, ReportError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key).map(|raw| raw.to_lowercase()) {
        None => Ok(default),
        Some(raw) => match raw.as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(ReportError::Config(format!("{} must be a boolean, got {}", key, raw))),
        },
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(String::from)
        .collect()
}
