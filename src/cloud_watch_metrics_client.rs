use crate::error::ReportError;
use async_trait::async_trait;

use chrono::{DateTime, Utc};
use rusoto_cloudwatch::{
    CloudWatch, CloudWatchClient, Datapoint, Dimension, GetMetricStatisticsInput,
    GetMetricWidgetImageInput, ListMetricsInput, Metric,
};
use rusoto_core::Region;

use crate::metric::{MetricDescriptor, Sample};
use crate::time_range::TimeRange;

const DEFAULT_STATISTICS: [&'static str; 3] = ["Average", "Minimum", "Maximum"];

#[derive(Debug, PartialEq)]
pub struct MetricPage {
    pub metrics: Vec<MetricDescriptor>,
    pub next_token: Option<String>,
}

#[derive(Debug, PartialEq)]
pub struct StatisticsPage {
    pub samples: Vec<Sample>,
    pub unit: Option<String>,
}

/// The slice of the CloudWatch API the report pipeline depends on.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn list_metrics(
        &self,
        namespace: Option<&str>,
        next_token: Option<String>,
    ) -> Result<MetricPage, ReportError>;

    async fn get_statistics(
        &self,
        descriptor: &MetricDescriptor,
        time_range: &TimeRange,
        period: i64,
    ) -> Result<StatisticsPage, ReportError>;

    async fn get_widget_image(&self, widget: &str) -> Result<Vec<u8>, ReportError>;
}

pub struct CloudWatchMetricsClient {
    client: CloudWatchClient,
}

#[async_trait]
impl MetricsSource for CloudWatchMetricsClient {
    async fn list_metrics(
        &self,
        namespace: Option<&str>,
        next_token: Option<String>,
    ) -> Result<MetricPage, ReportError> {
        let output = self
            .client
            .list_metrics(ListMetricsInput {
                namespace: namespace.map(|namespace| namespace.to_string()),
                next_token,
                ..Default::default()
            })
            .await?;
        let metrics = output
            .metrics
            .unwrap_or_default()
            .into_iter()
            .filter_map(to_descriptor)
            .collect();
        Ok(MetricPage {
            metrics,
            next_token: output.next_token.filter(|token| !token.is_empty()),
        })
    }

    async fn get_statistics(
        &self,
        descriptor: &MetricDescriptor,
        time_range: &TimeRange,
        period: i64,
    ) -> Result<StatisticsPage, ReportError> {
        let output = self
            .client
            .get_metric_statistics(GetMetricStatisticsInput {
                start_time: time_range.format_start(),
                end_time: time_range.format_end(),
                metric_name: descriptor.name.clone(),
                namespace: descriptor.namespace.clone(),
                dimensions: Some(
                    descriptor
                        .dimensions
                        .iter()
                        .map(|(name, value)| Dimension {
                            name: name.clone(),
                            value: value.clone(),
                        })
                        .collect(),
                ),
                period,
                statistics: Some(
                    DEFAULT_STATISTICS
                        .iter()
                        .map(|statistic| statistic.to_string())
                        .collect(),
                ),
                ..Default::default()
            })
            .await?;
        self.collect_data_points(output.datapoints)
    }

    async fn get_widget_image(&self, widget: &str) -> Result<Vec<u8>, ReportError> {
        let output = self
            .client
            .get_metric_widget_image(GetMetricWidgetImageInput {
                metric_widget: widget.to_string(),
                output_format: Some("png".to_string()),
                ..Default::default()
            })
            .await?;
        output
            .metric_widget_image
            .map(|image| image.to_vec())
            .ok_or(ReportError::NoneValue)
    }
}

impl CloudWatchMetricsClient {
    pub fn new(region: Region) -> Self {
        Self::new_with_client(CloudWatchClient::new(region))
    }

    pub fn new_with_client(client: CloudWatchClient) -> Self {
        CloudWatchMetricsClient { client }
    }

    fn collect_data_points(
        &self,
        data_points: Option<Vec<Datapoint>>,
    ) -> Result<StatisticsPage, ReportError> {
        let data_points = data_points.map_or(vec![], |points| points);
        let mut unit = None;
        let mut samples = Vec::with_capacity(data_points.len());
        for data_point in data_points {
            let timestamp = data_point.timestamp.ok_or(ReportError::NoneValue)?;
            let timestamp = DateTime::parse_from_rfc3339(&timestamp)
                .map_err(|error| {
                    ReportError::FetchRejected(format!(
                        "invalid datapoint timestamp {:?}: {}",
                        timestamp, error
                    ))
                })?
                .with_timezone(&Utc);
            let value = data_point.average.ok_or(ReportError::NoneValue)?;
            if unit.is_none() {
                unit = data_point.unit;
            }
            samples.push(Sample { timestamp, value });
        }
        Ok(StatisticsPage { samples, unit })
    }
}

/// Metrics without a namespace or name cannot be queried again and are dropped.
fn to_descriptor(metric: Metric) -> Option<MetricDescriptor> {
    let dimensions = metric
        .dimensions
        .unwrap_or_default()
        .into_iter()
        .map(|dimension| (dimension.name, dimension.value))
        .collect();
    Some(MetricDescriptor::new(
        metric.namespace?,
        metric.metric_name?,
        dimensions,
    ))
}

#[cfg(test)]
mod tests {
    use crate::cloud_watch_metrics_client::{CloudWatchMetricsClient, MetricsSource};
    use crate::error::ReportError;
    use crate::metric::{MetricDescriptor, Sample};
    use crate::time_range::{Lookback, TimeRange};
    use chrono::{DateTime, TimeZone, Utc};
    use rusoto_cloudwatch::{CloudWatchClient, Datapoint};
    use rusoto_core::Region;
    use rusoto_mock::{
        MockCredentialsProvider, MockRequestDispatcher, MockResponseReader, ReadMockResponse,
    };
    use std::convert::TryFrom;
    use std::str::FromStr;

    fn range() -> TimeRange {
        let end = DateTime::<Utc>::from_str("2020-12-02T00:00:00.0+00:00").unwrap();
        TimeRange::try_from((end, &Lookback::from_str("-PT24H").unwrap())).unwrap()
    }

    fn descriptor() -> MetricDescriptor {
        MetricDescriptor::new(
            "AWS/EC2",
            "CPUUtilization",
            vec![("InstanceId".to_string(), "i-1234567890abcdef0".to_string())],
        )
    }

    #[tokio::test]
    async fn test_list_metrics() {
        let mock = CloudWatchClient::new_with(
            MockRequestDispatcher::default().with_body(&*MockResponseReader::read_response(
                "test_resources/valid",
                "list_metrics.xml",
            )),
            MockCredentialsProvider,
            Default::default(),
        );

        let client = CloudWatchMetricsClient::new_with_client(mock);
        let page = client.list_metrics(Some("AWS/EC2"), None).await.unwrap();

        assert_eq!(
            page.metrics,
            vec![
                descriptor(),
                MetricDescriptor::new("AWS/EC2", "NetworkIn", vec![]),
            ]
        );
        assert_eq!(page.next_token, Some("next-page-token".to_string()));
    }

    #[tokio::test]
    async fn test_get_statistics() {
        let mock = CloudWatchClient::new_with(
            MockRequestDispatcher::default().with_body(&*MockResponseReader::read_response(
                "test_resources/valid",
                "get_metric_statistics.xml",
            )),
            MockCredentialsProvider,
            Default::default(),
        );

        let client = CloudWatchMetricsClient::new_with_client(mock);
        let page = client
            .get_statistics(&descriptor(), &range(), 300)
            .await
            .unwrap();

        assert_eq!(page.unit, Some("Percent".to_string()));
        assert_eq!(
            page.samples,
            vec![
                Sample {
                    timestamp: Utc.ymd(2020, 12, 1).and_hms(0, 0, 0),
                    value: 10.0,
                },
                Sample {
                    timestamp: Utc.ymd(2020, 12, 1).and_hms(0, 5, 0),
                    value: 99.0,
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_get_statistics_throttled() {
        let mock = CloudWatchClient::new_with(
            MockRequestDispatcher::with_status(400).with_body(&*MockResponseReader::read_response(
                "test_resources/error",
                "throttling.xml",
            )),
            MockCredentialsProvider,
            Default::default(),
        );

        let client = CloudWatchMetricsClient::new_with_client(mock);
        let result = client.get_statistics(&descriptor(), &range(), 300).await;

        assert!(matches!(result, Err(ReportError::FetchThrottled(_))));
    }

    #[tokio::test]
    async fn test_get_statistics_unavailable() {
        let mock = CloudWatchClient::new_with(
            MockRequestDispatcher::with_status(500).with_body(&*MockResponseReader::read_response(
                "test_resources/error",
                "internal_failure.xml",
            )),
            MockCredentialsProvider,
            Default::default(),
        );

        let client = CloudWatchMetricsClient::new_with_client(mock);
        let result = client.get_statistics(&descriptor(), &range(), 300).await;

        match result {
            Err(ReportError::FetchUnavailable(_)) => {}
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_get_statistics_rejected() {
        let mock = CloudWatchClient::new_with(
            MockRequestDispatcher::with_status(400).with_body(
                "<ErrorResponse><Error><Type>Sender</Type><Code>InvalidParameterValue</Code>\
                 <Message>The parameter Period must be a multiple of 60.</Message></Error></ErrorResponse>",
            ),
            MockCredentialsProvider,
            Default::default(),
        );

        let client = CloudWatchMetricsClient::new_with_client(mock);
        let result = client.get_statistics(&descriptor(), &range(), 61).await;

        match result {
            Err(error @ ReportError::FetchRejected(_)) => assert!(!error.is_retryable()),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_collect_when_no_data_points() {
        let client = CloudWatchMetricsClient::new(Region::ApNortheast1);
        let page = client.collect_data_points(None).unwrap();
        assert!(page.samples.is_empty());
        assert_eq!(page.unit, None);
    }

    #[tokio::test]
    async fn test_dont_collect_when_no_value() {
        let client = CloudWatchMetricsClient::new(Region::ApNortheast1);
        let result = client.collect_data_points(Some(vec![Datapoint {
            average: None,
            maximum: None,
            minimum: None,
            extended_statistics: None,
            sample_count: None,
            sum: None,
            timestamp: Some("2020-12-01T00:00:00Z".to_string()),
            unit: None,
        }]));
        assert_eq!(result.err().unwrap(), ReportError::NoneValue)
    }
}
