use crate::catalog::MetricCatalog;
use crate::chart::ChartRenderer;
use crate::cloud_watch_metrics_client::MetricsSource;
use crate::config::{Config, RenderMode};
use crate::dispatcher::{parse_recipients, AttachmentPolicy, Dispatcher, MailTransport};
use crate::error::ReportError;
use crate::failure::{FailureKind, FailureLog};
use crate::fetcher::MetricFetcher;
use crate::metric::{ChartImage, MetricDescriptor, MetricSeries};
use crate::retry::RetryPolicy;
use crate::store::{ObjectStore, ReportArtifact, ReportStore};
use crate::time_range::{format_timestamp, Lookback, TimeRange};
use crate::workbook::{
    EntryContent, ReportContext, SheetEntry, SheetLayout, Summary, WorkbookBuilder,
};
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream, StreamExt};
use serde::Serialize;
use std::convert::TryFrom;
use std::sync::Arc;
use tokio::time::{timeout_at, Instant};
use tracing::{error, info, warn};

const MAX_BODY_FAILURES: usize = 50;
const TIME_BUDGET_EXHAUSTED: &str = "time budget exhausted";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Stage {
    Discovering,
    Fetching,
    Rendering,
    Building,
    Storing,
    Dispatching,
    Done,
    Failed,
}

/// Outcome of one invocation, returned to the Lambda runtime as JSON.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub stage: Stage,
    /// Stage that was running when the run failed.
    pub failed_during: Option<Stage>,
    pub error: Option<String>,
    pub summary: String,
    pub namespaces: usize,
    pub metrics: usize,
    pub charts: usize,
    pub failures: usize,
    pub skipped: usize,
    pub artifact: Option<ReportArtifact>,
    pub attached: bool,
    pub message_id: Option<String>,
    pub recipient_warnings: Vec<String>,
    pub problems: Vec<String>,
}

impl RunReport {
    fn new() -> Self {
        RunReport {
            stage: Stage::Discovering,
            failed_during: None,
            error: None,
            summary: String::new(),
            namespaces: 0,
            metrics: 0,
            charts: 0,
            failures: 0,
            skipped: 0,
            artifact: None,
            attached: false,
            message_id: None,
            recipient_warnings: vec![],
            problems: vec![],
        }
    }

    pub fn is_done(&self) -> bool {
        self.stage == Stage::Done
    }

    fn enter(&mut self, stage: Stage) {
        info!(stage = ?stage, "entering stage");
        self.stage = stage;
    }
}

struct Job {
    source: usize,
    group: usize,
    descriptor: MetricDescriptor,
}

/// One future sheet: a namespace, prefixed by its region when several are read.
struct Group {
    label: String,
    skipped: usize,
}

enum Fetched {
    Series(MetricSeries),
    Widget {
        image: ChartImage,
        series: Option<MetricSeries>,
    },
}

/// Settings every per-metric fetch of one run shares.
#[derive(Clone)]
struct FetchPlan {
    retry: RetryPolicy,
    period: i64,
    render_mode: RenderMode,
    lookback: Lookback,
    widget_summary: bool,
    range: TimeRange,
    renderer: ChartRenderer,
}

impl FetchPlan {
    async fn fetch(
        self,
        source: Arc<dyn MetricsSource>,
        descriptor: MetricDescriptor,
    ) -> Result<Fetched, ReportError> {
        let fetcher = MetricFetcher::new(source.as_ref(), self.retry, self.period);
        match self.render_mode {
            RenderMode::Samples => fetcher.fetch(&descriptor, &self.range).await.map(Fetched::Series),
            RenderMode::Widget => {
                let image = fetcher
                    .render_widget(
                        &descriptor,
                        &self.lookback,
                        self.renderer.width(),
                        self.renderer.height(),
                    )
                    .await?;
                let series = if self.widget_summary {
                    match fetcher.fetch(&descriptor, &self.range).await {
                        Ok(series) => Some(series),
                        Err(fetch_error) => {
                            warn!(metric = %descriptor, error = %fetch_error, "summary fetch failed");
                            None
                        }
                    }
                } else {
                    None
                };
                Ok(Fetched::Widget { image, series })
            }
        }
    }
}

pub struct Orchestrator {
    config: Config,
    sources: Vec<(String, Arc<dyn MetricsSource>)>,
    store: ReportStore,
    dispatcher: Dispatcher,
}

impl Orchestrator {
    /// `sources` pairs each metric region with its client, in report order.
    pub fn new(
        config: Config,
        sources: Vec<(String, Arc<dyn MetricsSource>)>,
        object_store: Arc<dyn ObjectStore>,
        transport: Arc<dyn MailTransport>,
    ) -> Self {
        let store = ReportStore::new(
            object_store,
            config.retry,
            &config.prefix,
            &config.function_name,
        );
        let dispatcher = Dispatcher::new(
            transport,
            config.sender.clone(),
            AttachmentPolicy::new(config.attach_excel, config.max_email_mb),
            config.retry,
        );
        Orchestrator {
            config,
            sources,
            store,
            dispatcher,
        }
    }

    /// Runs the whole pipeline once. `deadline` is the hard end of the
    /// invocation. Fetching stops at `deadline` minus the delivery reserve and
    /// every series fetched by then is still rendered.
    pub async fn run(&self, now: DateTime<Utc>, deadline: Instant) -> RunReport {
        let mut report = RunReport::new();
        let mut failures = FailureLog::default();

        match self.execute(now, deadline, &mut report, &mut failures).await {
            Ok(()) => {
                report.stage = Stage::Done;
                info!(summary = report.summary.as_str(), attached = report.attached, "report delivered");
            }
            Err(failure) => {
                error!(stage = ?report.stage, error = %failure, "run failed");
                if report.summary.is_empty() {
                    report.summary = format!("run failed during {:?}: {}", report.stage, failure);
                }
                report.failed_during = Some(report.stage);
                report.stage = Stage::Failed;
                report.error = Some(failure.to_string());
            }
        }
        report.failures = failures.len();
        report.problems = failures.iter().map(ToString::to_string).collect();
        report
    }

    async fn execute(
        &self,
        now: DateTime<Utc>,
        deadline: Instant,
        report: &mut RunReport,
        failures: &mut FailureLog,
    ) -> Result<(), ReportError> {
        report.enter(Stage::Discovering);
        let recipients = parse_recipients(&self.config.recipients);
        for rejected in &recipients.rejected {
            failures.record(rejected.as_str(), FailureKind::Recipient, "not a valid mailbox");
        }
        report.recipient_warnings = recipients.rejected.clone();
        if recipients.accepted.is_empty() {
            return Err(ReportError::EmptyRecipients);
        }

        let range = TimeRange::try_from((now, &self.config.lookback))?;
        let (jobs, groups) = self.discover(failures).await?;
        report.metrics = jobs.len();
        report.skipped = groups.iter().map(|group| group.skipped).sum();
        let cutoff = deadline
            .checked_sub(self.config.delivery_reserve)
            .unwrap_or_else(Instant::now);

        report.enter(Stage::Fetching);
        let fetched = self.fetch_all(&jobs, range, cutoff).await;

        report.enter(Stage::Rendering);
        let entries = self.render_all(&jobs, fetched, failures).await;

        report.enter(Stage::Building);
        let mut sheets: Vec<Vec<SheetEntry>> = groups.iter().map(|_| vec![]).collect();
        for (job, entry) in jobs.iter().zip(entries) {
            sheets[job.group].push(entry);
        }
        let renderer = self.renderer();
        let mut builder = WorkbookBuilder::new(
            ReportContext {
                generated_at: now,
                lookback: self.config.lookback.iso().to_string(),
                period: self.config.period,
                failures: failures.clone(),
            },
            SheetLayout {
                images_per_row: self.config.images_per_row,
                image_width: renderer.width(),
                image_height: renderer.height(),
            },
        );
        for (group, entries) in groups.iter().zip(sheets) {
            builder.add_sheet(&group.label, entries, group.skipped);
        }
        let workbook = builder.build();
        report.namespaces = workbook.sheets.len();
        report.charts = workbook.charts();
        report.summary = format!(
            "{} namespaces, {} metrics, {} charts, {} failed, {} skipped by cap",
            report.namespaces,
            report.metrics,
            report.charts,
            failures.metric_failures(),
            report.skipped
        );
        let bytes = workbook.serialize()?;
        info!(bytes = bytes.len(), sheets = report.namespaces, "workbook built");

        report.enter(Stage::Storing);
        let date = now.naive_utc().date();
        let artifact = match self.store.put(&bytes, date).await {
            Ok(artifact) => Some(artifact),
            Err(store_error) => {
                warn!(error = %store_error, "report not stored, sending without a stored copy");
                failures.record(self.store.key_for(date), FailureKind::Store, store_error.to_string());
                None
            }
        };
        report.artifact = artifact.clone();

        report.enter(Stage::Dispatching);
        let day = date.format("%Y-%m-%d");
        let envelope = self.dispatcher.compose(
            &recipients.accepted,
            &format!("CloudWatch metrics report {}", day),
            &self.body_lines(now, &report.summary, failures),
            &bytes,
            &format!("{}-{}.xlsx", self.config.function_name, day),
            artifact.as_ref(),
        );
        let delivery = self.dispatcher.send(&envelope).await?;
        report.attached = delivery.attached;
        report.message_id = Some(delivery.message_id);
        Ok(())
    }

    async fn discover(&self, failures: &mut FailureLog) -> Result<(Vec<Job>, Vec<Group>), ReportError> {
        let mut jobs = vec![];
        let mut groups: Vec<Group> = vec![];
        let mut unavailable = vec![];

        for (index, (region, source)) in self.sources.iter().enumerate() {
            let catalog = MetricCatalog::new(
                source.as_ref(),
                self.config.retry,
                self.config.max_metrics_per_namespace,
            );
            let discovery = match catalog.discover(&self.config.namespaces).await {
                Ok(discovery) => discovery,
                Err(discovery_error) => {
                    warn!(region = region.as_str(), error = %discovery_error, "discovery failed");
                    failures.record(region.as_str(), FailureKind::Discovery, discovery_error.to_string());
                    unavailable.push(discovery_error);
                    continue;
                }
            };
            for (namespace, reason) in &discovery.failed {
                failures.record(self.group_label(region, namespace), FailureKind::Discovery, reason.as_str());
            }

            let mut namespaces: Vec<&str> = discovery
                .descriptors
                .iter()
                .map(|descriptor| descriptor.namespace.as_str())
                .chain(discovery.skipped.iter().map(|(namespace, _)| namespace.as_str()))
                .collect();
            namespaces.sort_unstable();
            namespaces.dedup();
            let first_group = groups.len();
            for namespace in &namespaces {
                groups.push(Group {
                    label: self.group_label(region, namespace),
                    skipped: discovery.skipped_in(namespace),
                });
            }
            for descriptor in &discovery.descriptors {
                let offset = namespaces
                    .iter()
                    .position(|namespace| *namespace == descriptor.namespace)
                    .unwrap_or_default();
                jobs.push(Job {
                    source: index,
                    group: first_group + offset,
                    descriptor: descriptor.clone(),
                });
            }
            info!(
                region = region.as_str(),
                namespaces = namespaces.len(),
                metrics = discovery.descriptors.len(),
                "discovery finished"
            );
        }

        if unavailable.len() == self.sources.len() {
            return Err(unavailable.into_iter().next().unwrap_or_else(|| {
                ReportError::DiscoveryUnavailable("no metric regions configured".to_string())
            }));
        }
        Ok((jobs, groups))
    }

    fn group_label(&self, region: &str, namespace: &str) -> String {
        if self.sources.len() > 1 {
            format!("{} {}", region, namespace)
        } else {
            namespace.to_string()
        }
    }

    fn renderer(&self) -> ChartRenderer {
        ChartRenderer::scaled(
            self.config.widget_width,
            self.config.widget_height,
            self.config.image_scale,
        )
    }

    async fn fetch_all(
        &self,
        jobs: &[Job],
        range: TimeRange,
        cutoff: Instant,
    ) -> Vec<Result<Fetched, ReportError>> {
        let plan = FetchPlan {
            retry: self.config.retry,
            period: self.config.period,
            render_mode: self.config.render_mode,
            lookback: self.config.lookback.clone(),
            widget_summary: self.config.widget_summary,
            range,
            renderer: self.renderer(),
        };
        let pending: Vec<_> = jobs
            .iter()
            .map(|job| {
                let source = Arc::clone(&self.sources[job.source].1);
                plan.clone().fetch(source, job.descriptor.clone())
            })
            .collect();
        let fetched = stream::iter(pending).buffered(self.config.fetch_concurrency);
        collect_until(fetched, cutoff).await
    }

    /// Draws every fetched outcome. Jobs past the end of `fetched` were cut
    /// off by the time budget and become failure entries.
    async fn render_all(
        &self,
        jobs: &[Job],
        fetched: Vec<Result<Fetched, ReportError>>,
        failures: &mut FailureLog,
    ) -> Vec<SheetEntry> {
        let renderer = self.renderer();
        let pending: Vec<_> = jobs
            .iter()
            .zip(fetched)
            .map(|(job, outcome)| render_one(job.descriptor.clone(), outcome, renderer))
            .collect();
        let rendered: Vec<_> = stream::iter(pending)
            .buffered(self.config.fetch_concurrency)
            .collect()
            .await;

        let mut entries = Vec::with_capacity(jobs.len());
        for (entry, failure) in rendered {
            if let Some(failure) = failure {
                failures.record_metric(&entry.descriptor, &failure);
            }
            entries.push(entry);
        }
        for job in &jobs[entries.len()..] {
            failures.record(job.descriptor.to_string(), FailureKind::TimeBudget, TIME_BUDGET_EXHAUSTED);
            entries.push(SheetEntry {
                descriptor: job.descriptor.clone(),
                content: EntryContent::Failed {
                    reason: TIME_BUDGET_EXHAUSTED.to_string(),
                },
            });
        }
        entries
    }

    fn body_lines(&self, now: DateTime<Utc>, summary: &str, failures: &FailureLog) -> Vec<String> {
        let mut lines = vec![
            format!("CloudWatch metrics report generated at {}.", format_timestamp(&now)),
            format!(
                "Window {} with {} s periods, regions {}.",
                self.config.lookback.iso(),
                self.config.period,
                self.config.regions.join(", ")
            ),
            format!("{}.", summary),
        ];
        if !failures.is_empty() {
            lines.push(String::new());
            lines.push(format!("{} problem(s) were recorded:", failures.len()));
            for failure in failures.iter().take(MAX_BODY_FAILURES) {
                lines.push(format!("- {}", failure));
            }
            if failures.len() > MAX_BODY_FAILURES {
                lines.push(format!(
                    "- and {} more, listed on the Index sheet",
                    failures.len() - MAX_BODY_FAILURES
                ));
            }
        }
        lines
    }
}

/// Drains `stream` in order until it ends or `cutoff` passes.
async fn collect_until<S: Stream>(stream: S, cutoff: Instant) -> Vec<S::Item> {
    futures::pin_mut!(stream);
    let mut items = vec![];
    loop {
        match timeout_at(cutoff, stream.next()).await {
            Ok(Some(item)) => items.push(item),
            Ok(None) => break,
            Err(_) => {
                warn!(completed = items.len(), "time budget exhausted while fetching");
                break;
            }
        }
    }
    items
}

async fn render_one(
    descriptor: MetricDescriptor,
    outcome: Result<Fetched, ReportError>,
    renderer: ChartRenderer,
) -> (SheetEntry, Option<ReportError>) {
    let (content, failure) = match outcome {
        Err(fetch_error) => (
            EntryContent::Failed {
                reason: fetch_error.to_string(),
            },
            Some(fetch_error),
        ),
        Ok(Fetched::Widget { image, series }) => (
            EntryContent::Chart {
                image,
                summary: series.as_ref().map_or(Summary::Omitted, summarize),
            },
            None,
        ),
        Ok(Fetched::Series(series)) => {
            let summary = summarize(&series);
            let drawn = tokio::task::spawn_blocking(move || renderer.render(&series))
                .await
                .map_err(|join_error| ReportError::RenderFailure(join_error.to_string()))
                .and_then(|image| image);
            match drawn {
                Ok(image) => (EntryContent::Chart { image, summary }, None),
                Err(render_error) => {
                    warn!(metric = %descriptor, error = %render_error, "chart failed, using placeholder");
                    match renderer.placeholder(&descriptor) {
                        Ok(image) => (EntryContent::Chart { image, summary }, Some(render_error)),
                        Err(_) => (
                            EntryContent::Failed {
                                reason: render_error.to_string(),
                            },
                            Some(render_error),
                        ),
                    }
                }
            }
        }
    };
    (SheetEntry { descriptor, content }, failure)
}

fn summarize(series: &MetricSeries) -> Summary {
    match series.summary() {
        Ok(Some(statistics)) => Summary::Computed(statistics),
        Ok(None) => Summary::NoData,
        Err(summary_error) => {
            warn!(metric = %series.descriptor, error = %summary_error, "summary unavailable");
            Summary::NoData
        }
    }
}
