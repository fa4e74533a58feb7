use crate::cloud_watch_metrics_client::MetricsSource;
use crate::error::ReportError;
use crate::metric::{ChartImage, MetricDescriptor, MetricSeries};
use crate::retry::RetryPolicy;
use crate::time_range::{Lookback, TimeRange};
use serde_json::{json, Value};
use tracing::debug;

pub struct MetricFetcher<'a> {
    source: &'a dyn MetricsSource,
    retry: RetryPolicy,
    period: i64,
}

impl<'a> MetricFetcher<'a> {
    pub fn new(source: &'a dyn MetricsSource, retry: RetryPolicy, period: i64) -> Self {
        MetricFetcher {
            source,
            retry,
            period,
        }
    }

    /// Fetches the series for `descriptor`, one call per sub-window of the
    /// range so no call exceeds the per-request datapoint limit.
    pub async fn fetch(
        &self,
        descriptor: &MetricDescriptor,
        time_range: &TimeRange,
    ) -> Result<MetricSeries, ReportError> {
        let mut series = MetricSeries::empty(descriptor.clone());
        let mut unit = None;
        for window in time_range.windows(self.period) {
            let page = self
                .retry
                .run("get_metric_statistics", || {
                    self.source.get_statistics(descriptor, &window, self.period)
                })
                .await?;
            if unit.is_none() {
                unit = page.unit;
            }
            series.samples.extend(page.samples);
        }
        series
            .samples
            .sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        series.samples.dedup_by_key(|sample| sample.timestamp);
        if let Some(unit) = unit {
            series.unit = unit;
        }
        debug!(
            metric = %descriptor,
            samples = series.samples.len(),
            "fetched series"
        );
        Ok(series)
    }

    /// Asks CloudWatch to draw the chart itself.
    pub async fn render_widget(
        &self,
        descriptor: &MetricDescriptor,
        lookback: &Lookback,
        width: u32,
        height: u32,
    ) -> Result<ChartImage, ReportError> {
        let widget = widget_definition(descriptor, lookback, self.period, width, height).to_string();
        let png = self
            .retry
            .run("get_metric_widget_image", || {
                self.source.get_widget_image(&widget)
            })
            .await?;
        Ok(ChartImage {
            descriptor: descriptor.clone(),
            png,
            width,
            height,
        })
    }
}

/// GetMetricWidgetImage input for a single time-series.
pub fn widget_definition(
    descriptor: &MetricDescriptor,
    lookback: &Lookback,
    period: i64,
    width: u32,
    height: u32,
) -> Value {
    let mut metric = vec![
        Value::from(descriptor.namespace.as_str()),
        Value::from(descriptor.name.as_str()),
    ];
    for (key, value) in &descriptor.dimensions {
        metric.push(Value::from(key.as_str()));
        metric.push(Value::from(value.as_str()));
    }
    json!({
        "title": descriptor.title(),
        "view": "timeSeries",
        "stacked": false,
        "stat": "Average",
        "period": period,
        "metrics": [metric],
        "start": lookback.iso(),
        "end": "PT0M",
        "width": width,
        "height": height,
    })
}
