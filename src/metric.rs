use crate::error::ReportError;
use bigdecimal::{BigDecimal, FromPrimitive, ToPrimitive};
use chrono::{DateTime, Utc};
use std::convert::TryFrom;
use std::fmt;
use std::ops::{Add, Div};

/// Identity of one CloudWatch time-series. Dimensions are kept sorted by key so
/// that equal series compare equal regardless of API ordering.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MetricDescriptor {
    pub namespace: String,
    pub name: String,
    pub dimensions: Vec<(String, String)>,
}

impl MetricDescriptor {
    pub fn new<N, M>(namespace: N, name: M, mut dimensions: Vec<(String, String)>) -> Self
    where
        N: Into<String>,
        M: Into<String>,
    {
        dimensions.sort();
        dimensions.dedup();
        MetricDescriptor {
            namespace: namespace.into(),
            name: name.into(),
            dimensions,
        }
    }

    /// Metric name followed by its dimensions, e.g. `CPUUtilization [InstanceId=i-1]`.
    pub fn title(&self) -> String {
        if self.dimensions.is_empty() {
            return self.name.clone();
        }
        let dimensions: Vec<String> = self
            .dimensions
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect();
        format!("{} [{}]", self.name, dimensions.join(", "))
    }
}

impl fmt::Display for MetricDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.title())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricSeries {
    pub descriptor: MetricDescriptor,
    pub samples: Vec<Sample>,
    pub unit: String,
}

impl MetricSeries {
    pub fn empty(descriptor: MetricDescriptor) -> Self {
        MetricSeries {
            descriptor,
            samples: vec![],
            unit: "None".to_string(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Summary of the samples, or `None` when there is nothing to summarise.
    pub fn summary(&self) -> Result<Option<SummaryStatistics>, ReportError> {
        if self.samples.is_empty() {
            return Ok(None);
        }
        let mut total = BigDecimal::from(0);
        let mut minimum = f64::INFINITY;
        let mut maximum = f64::NEG_INFINITY;
        let length = u32::try_from(self.samples.len())?;
        let count = BigDecimal::from(length);
        for sample in &self.samples {
            let value = BigDecimal::from_f64(sample.value).ok_or(ReportError::ToPrimitive)?;
            total = total.add(value);
            minimum = minimum.min(sample.value);
            maximum = maximum.max(sample.value);
        }

        let decimal_average = total.div(count);
        let average = decimal_average
            .to_f64()
            .ok_or(ReportError::ToPrimitive)?;
        let last = self
            .samples
            .last()
            .map(|sample| sample.value)
            .ok_or(ReportError::NoneValue)?;
        Ok(Some(SummaryStatistics {
            minimum,
            maximum,
            average,
            last,
            count: self.samples.len(),
            unit: self.unit.clone(),
        }))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SummaryStatistics {
    pub minimum: f64,
    pub maximum: f64,
    pub average: f64,
    pub last: f64,
    pub count: usize,
    pub unit: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChartImage {
    pub descriptor: MetricDescriptor,
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
}
