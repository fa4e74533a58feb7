//! In-memory stand-ins for CloudWatch, S3 and SES used by the unit tests.

use crate::chart::ChartRenderer;
use crate::cloud_watch_metrics_client::{MetricPage, MetricsSource, StatisticsPage};
use crate::dispatcher::MailTransport;
use crate::error::ReportError;
use crate::metric::{MetricDescriptor, Sample};
use crate::store::ObjectStore;
use crate::time_range::TimeRange;
use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

#[derive(Default)]
pub struct FakeMetricsSource {
    metrics: Vec<MetricDescriptor>,
    samples: HashMap<MetricDescriptor, Vec<Sample>>,
    page_size: usize,
    list_throttles: AtomicUsize,
    throttled_metrics: HashSet<String>,
    fetch_delay: Option<std::time::Duration>,
    pub list_calls: AtomicUsize,
    pub fetch_calls: AtomicUsize,
    pub widget_calls: AtomicUsize,
}

pub fn samples(values: &[f64]) -> Vec<Sample> {
    let start = Utc.ymd(2020, 12, 1).and_hms(0, 0, 0);
    values
        .iter()
        .enumerate()
        .map(|(i, value)| Sample {
            timestamp: start + Duration::minutes(5 * i as i64),
            value: *value,
        })
        .collect()
}

fn descriptor(namespace: &str, name: &str, dimensions: &[(&str, &str)]) -> MetricDescriptor {
    MetricDescriptor::new(
        namespace,
        name,
        dimensions
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect(),
    )
}

impl FakeMetricsSource {
    pub fn with_metric(self, namespace: &str, name: &str, dimensions: &[(&str, &str)]) -> Self {
        self.with_series(namespace, name, dimensions, &[12.0, 48.5, 30.25])
    }

    pub fn with_series(
        mut self,
        namespace: &str,
        name: &str,
        dimensions: &[(&str, &str)],
        values: &[f64],
    ) -> Self {
        let descriptor = descriptor(namespace, name, dimensions);
        self.metrics.push(descriptor.clone());
        self.samples.insert(descriptor, samples(values));
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_list_throttles(self, count: usize) -> Self {
        self.list_throttles.store(count, Ordering::SeqCst);
        self
    }

    /// Every fetch of a metric with this name is throttled.
    pub fn with_throttled_metric(mut self, name: &str) -> Self {
        self.throttled_metrics.insert(name.to_string());
        self
    }

    pub fn with_fetch_delay(mut self, delay: std::time::Duration) -> Self {
        self.fetch_delay = Some(delay);
        self
    }
}

#[async_trait]
impl MetricsSource for FakeMetricsSource {
    async fn list_metrics(
        &self,
        namespace: Option<&str>,
        next_token: Option<String>,
    ) -> Result<MetricPage, ReportError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let throttles = self.list_throttles.load(Ordering::SeqCst);
        if throttles > 0 {
            self.list_throttles.store(throttles - 1, Ordering::SeqCst);
            return Err(ReportError::FetchThrottled("Rate exceeded".to_string()));
        }

        let matching: Vec<MetricDescriptor> = self
            .metrics
            .iter()
            .filter(|metric| namespace.map_or(true, |namespace| metric.namespace == namespace))
            .cloned()
            .collect();
        let offset: usize = next_token.map_or(0, |token| token.parse().unwrap());
        let page_size = if self.page_size == 0 {
            matching.len()
        } else {
            self.page_size
        };
        let end = std::cmp::min(offset + page_size, matching.len());
        Ok(MetricPage {
            metrics: matching[offset..end].to_vec(),
            next_token: if end < matching.len() {
                Some(end.to_string())
            } else {
                None
            },
        })
    }

    async fn get_statistics(
        &self,
        descriptor: &MetricDescriptor,
        _: &TimeRange,
        _: i64,
    ) -> Result<StatisticsPage, ReportError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.fetch_delay {
            tokio::time::sleep(delay).await;
        }
        if self.throttled_metrics.contains(&descriptor.name) {
            return Err(ReportError::FetchThrottled("Rate exceeded".to_string()));
        }
        let samples = self.samples.get(descriptor).cloned().unwrap_or_default();
        Ok(StatisticsPage {
            unit: if samples.is_empty() {
                None
            } else {
                Some("Percent".to_string())
            },
            samples,
        })
    }

    async fn get_widget_image(&self, _: &str) -> Result<Vec<u8>, ReportError> {
        self.widget_calls.fetch_add(1, Ordering::SeqCst);
        let renderer = ChartRenderer::new(40, 20);
        Ok(renderer
            .placeholder(&descriptor("Widget", "Image", &[]))
            .unwrap()
            .png)
    }
}

#[derive(Default)]
pub struct MemoryObjectStore {
    pub objects: Mutex<Vec<(String, Vec<u8>, String)>>,
    failures: AtomicUsize,
    denied: bool,
    attempts: AtomicUsize,
}

impl MemoryObjectStore {
    /// The first `count` puts fail with a retryable error.
    pub fn failing(count: usize) -> Self {
        let store = MemoryObjectStore::default();
        store.failures.store(count, Ordering::SeqCst);
        store
    }

    /// Every put fails with a permanent error.
    pub fn denying() -> Self {
        MemoryObjectStore {
            denied: true,
            ..Default::default()
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects
            .lock()
            .unwrap()
            .iter()
            .map(|(key, _, _)| key.clone())
            .collect()
    }

    pub fn last_body(&self) -> Vec<u8> {
        let objects = self.objects.lock().unwrap();
        let (_, body, _) = objects.last().unwrap();
        body.clone()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put_object(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<(), ReportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.denied {
            return Err(ReportError::StoreFailure("AccessDenied".to_string()));
        }
        let failures = self.failures.load(Ordering::SeqCst);
        if failures > 0 {
            self.failures.store(failures - 1, Ordering::SeqCst);
            return Err(ReportError::StoreTransient("SlowDown".to_string()));
        }
        self.objects
            .lock()
            .unwrap()
            .push((key.to_string(), body, content_type.to_string()));
        Ok(())
    }

    async fn link(&self, key: &str) -> Result<String, ReportError> {
        Ok(format!("https://reports.example.com/{}", key))
    }

    fn bucket(&self) -> &str {
        "reports-bucket"
    }
}

#[derive(Default)]
pub struct RecordingTransport {
    pub sent: Mutex<Vec<(String, Vec<String>, Vec<u8>)>>,
    failures: AtomicUsize,
    rejected: bool,
    attempts: AtomicUsize,
}

impl RecordingTransport {
    /// The first `count` sends fail with a retryable error.
    pub fn failing(count: usize) -> Self {
        let transport = RecordingTransport::default();
        transport.failures.store(count, Ordering::SeqCst);
        transport
    }

    /// Every send is rejected outright.
    pub fn rejecting() -> Self {
        RecordingTransport {
            rejected: true,
            ..Default::default()
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn last_message(&self) -> String {
        let sent = self.sent.lock().unwrap();
        let (_, _, raw) = sent.last().unwrap();
        String::from_utf8_lossy(raw).to_string()
    }
}

#[async_trait]
impl MailTransport for RecordingTransport {
    async fn send_raw(&self, sender: &str, recipients: &[String], raw: Vec<u8>) -> Result<String, ReportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.rejected {
            return Err(ReportError::DispatchFailure("Email address is not verified.".to_string()));
        }
        let failures = self.failures.load(Ordering::SeqCst);
        if failures > 0 {
            self.failures.store(failures - 1, Ordering::SeqCst);
            return Err(ReportError::DispatchTransient("Maximum sending rate exceeded".to_string()));
        }
        let mut sent = self.sent.lock().unwrap();
        sent.push((sender.to_string(), recipients.to_vec(), raw));
        Ok(format!("message-{}", sent.len()))
    }
}
