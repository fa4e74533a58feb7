use crate::cloud_watch_metrics_client::MetricsSource;
use crate::error::ReportError;
use crate::metric::MetricDescriptor;
use crate::retry::RetryPolicy;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

const MAX_PAGES: usize = 100;
const MAX_NAMESPACES: usize = 500;

#[derive(Debug, Default, PartialEq)]
pub struct Discovery {
    /// Ordered by namespace, then metric name, then dimensions.
    pub descriptors: Vec<MetricDescriptor>,
    /// Metrics left out of each namespace by the per-namespace cap.
    pub skipped: Vec<(String, usize)>,
    /// Namespaces whose listing failed, with the reason.
    pub failed: Vec<(String, String)>,
}

impl Discovery {
    pub fn skipped_in(&self, namespace: &str) -> usize {
        self.skipped
            .iter()
            .find(|(name, _)| name == namespace)
            .map_or(0, |(_, count)| *count)
    }
}

pub struct MetricCatalog<'a> {
    source: &'a dyn MetricsSource,
    retry: RetryPolicy,
    max_metrics_per_namespace: usize,
}

impl<'a> MetricCatalog<'a> {
    pub fn new(source: &'a dyn MetricsSource, retry: RetryPolicy, max_metrics_per_namespace: usize) -> Self {
        MetricCatalog {
            source,
            retry,
            max_metrics_per_namespace,
        }
    }

    /// Discovers descriptors in `namespaces`, or in every namespace the account
    /// reports when the list is empty.
    pub async fn discover(&self, namespaces: &[String]) -> Result<Discovery, ReportError> {
        let targets: Vec<String> = if namespaces.is_empty() {
            self.list_namespaces().await?
        } else {
            let unique: BTreeSet<String> = namespaces.iter().cloned().collect();
            unique.into_iter().collect()
        };

        let mut discovery = Discovery::default();
        for namespace in &targets {
            match self.list_metrics_in_namespace(namespace).await {
                Ok(mut metrics) => {
                    metrics.sort();
                    metrics.dedup();
                    if metrics.len() > self.max_metrics_per_namespace {
                        let skipped = metrics.len() - self.max_metrics_per_namespace;
                        warn!(
                            namespace = namespace.as_str(),
                            skipped,
                            cap = self.max_metrics_per_namespace,
                            "metrics beyond cap skipped"
                        );
                        metrics.truncate(self.max_metrics_per_namespace);
                        discovery.skipped.push((namespace.clone(), skipped));
                    }
                    if metrics.is_empty() {
                        info!(namespace = namespace.as_str(), "no metrics found");
                    }
                    discovery.descriptors.extend(metrics);
                }
                Err(error) => {
                    warn!(namespace = namespace.as_str(), error = %error, "listing namespace failed");
                    discovery.failed.push((namespace.clone(), error.to_string()));
                }
            }
        }

        if !targets.is_empty() && discovery.failed.len() == targets.len() {
            return Err(ReportError::DiscoveryUnavailable(format!(
                "listing failed for every namespace ({})",
                discovery.failed[0].1
            )));
        }
        Ok(discovery)
    }

    async fn list_namespaces(&self) -> Result<Vec<String>, ReportError> {
        let mut namespaces = BTreeSet::new();
        let mut token = None;
        for _ in 0..MAX_PAGES {
            let page = self
                .retry
                .run("list_metrics", || self.source.list_metrics(None, token.clone()))
                .await
                .map_err(|error| ReportError::DiscoveryUnavailable(error.to_string()))?;
            namespaces.extend(page.metrics.into_iter().map(|metric| metric.namespace));
            token = page.next_token;
            if token.is_none() || namespaces.len() > MAX_NAMESPACES {
                break;
            }
        }
        debug!(count = namespaces.len(), "namespaces discovered");
        Ok(namespaces.into_iter().collect())
    }

    async fn list_metrics_in_namespace(
        &self,
        namespace: &str,
    ) -> Result<Vec<MetricDescriptor>, ReportError> {
        let mut metrics = Vec::new();
        let mut token = None;
        for _ in 0..MAX_PAGES {
            let page = self
                .retry
                .run("list_metrics", || {
                    self.source.list_metrics(Some(namespace), token.clone())
                })
                .await?;
            metrics.extend(
                page.metrics
                    .into_iter()
                    .filter(|metric| metric.namespace == namespace),
            );
            token = page.next_token;
            if token.is_none() {
                break;
            }
        }
        Ok(metrics)
    }
}

#[cfg(test)]
mod tests {
    use crate::catalog::MetricCatalog;
    use crate::error::ReportError;
    use crate::metric::MetricDescriptor;
    use crate::retry::RetryPolicy;
    use crate::testing::FakeMetricsSource;
    use std::time::Duration;

    fn retry() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(0))
    }

    fn names(descriptors: &[MetricDescriptor]) -> Vec<String> {
        descriptors.iter().map(|d| d.to_string()).collect()
    }

    #[tokio::test]
    async fn test_discover_all_namespaces_sorted() {
        let source = FakeMetricsSource::default()
            .with_metric("AWS/Lambda", "Errors", &[("FunctionName", "b")])
            .with_metric("AWS/EC2", "NetworkIn", &[])
            .with_metric("AWS/Lambda", "Errors", &[("FunctionName", "a")])
            .with_metric("AWS/EC2", "CPUUtilization", &[])
            .with_page_size(1);

        let catalog = MetricCatalog::new(&source, retry(), 100);
        let discovery = catalog.discover(&[]).await.unwrap();

        assert_eq!(
            names(&discovery.descriptors),
            vec![
                "AWS/EC2/CPUUtilization",
                "AWS/EC2/NetworkIn",
                "AWS/Lambda/Errors [FunctionName=a]",
                "AWS/Lambda/Errors [FunctionName=b]",
            ]
        );
        assert!(discovery.skipped.is_empty());
    }

    #[tokio::test]
    async fn test_discover_allow_list_with_unknown_namespace() {
        let source = FakeMetricsSource::default()
            .with_metric("AWS/EC2", "CPUUtilization", &[])
            .with_metric("AWS/Lambda", "Errors", &[]);

        let catalog = MetricCatalog::new(&source, retry(), 100);
        let discovery = catalog
            .discover(&["Custom/Missing".to_string(), "AWS/EC2".to_string()])
            .await
            .unwrap();

        assert_eq!(names(&discovery.descriptors), vec!["AWS/EC2/CPUUtilization"]);
        assert!(discovery.failed.is_empty());
    }

    #[tokio::test]
    async fn test_discover_caps_each_namespace() {
        let source = FakeMetricsSource::default()
            .with_metric("AWS/EC2", "D", &[])
            .with_metric("AWS/EC2", "C", &[])
            .with_metric("AWS/EC2", "B", &[])
            .with_metric("AWS/EC2", "A", &[])
            .with_metric("AWS/S3", "BucketSizeBytes", &[]);

        let catalog = MetricCatalog::new(&source, retry(), 2);
        let discovery = catalog.discover(&[]).await.unwrap();

        assert_eq!(
            names(&discovery.descriptors),
            vec!["AWS/EC2/A", "AWS/EC2/B", "AWS/S3/BucketSizeBytes"]
        );
        assert_eq!(discovery.skipped_in("AWS/EC2"), 2);
        assert_eq!(discovery.skipped_in("AWS/S3"), 0);
    }

    #[tokio::test]
    async fn test_discover_retries_throttled_listing() {
        let source = FakeMetricsSource::default()
            .with_metric("AWS/EC2", "CPUUtilization", &[])
            .with_list_throttles(2);

        let catalog = MetricCatalog::new(&source, retry(), 100);
        let discovery = catalog.discover(&["AWS/EC2".to_string()]).await.unwrap();

        assert_eq!(discovery.descriptors.len(), 1);
    }

    #[tokio::test]
    async fn test_discover_unavailable() {
        let source = FakeMetricsSource::default()
            .with_metric("AWS/EC2", "CPUUtilization", &[])
            .with_list_throttles(100);

        let catalog = MetricCatalog::new(&source, retry(), 100);
        let result = catalog.discover(&[]).await;

        assert!(matches!(result, Err(ReportError::DiscoveryUnavailable(_))));
    }

    #[tokio::test]
    async fn test_discover_empty_account() {
        let source = FakeMetricsSource::default();
        let catalog = MetricCatalog::new(&source, retry(), 100);
        let discovery = catalog.discover(&[]).await.unwrap();
        assert!(discovery.descriptors.is_empty());
    }
}
