use std::fmt;
use std::ops::{Range, Sub};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, WattBenchError};

pub const LATENCY_UNIT: &str = "s";

/// A distribution of elapsed-time samples for repeated executions of one
/// operation. `mean` and `stdev` are always recomputed from `values` by
/// [`Latency::from_values`]; they are carried in the serialized form for
/// readability but never trusted independently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Latency {
    pub unit: String,
    pub mean: f64,
    pub stdev: f64,
    pub values: Vec<f64>,
}

impl Latency {
    pub fn from_values(values: Vec<f64>) -> Self {
        let mean = if values.is_empty() {
            0.0
        } else {
            values.iter().sum::<f64>() / values.len() as f64
        };
        let stdev = if values.len() > 1 {
            (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64).sqrt()
        } else {
            0.0
        };

        Self {
            unit: LATENCY_UNIT.to_string(),
            mean,
            stdev,
            values,
        }
    }

    /// Single-sample latency at `index`.
    pub fn value_at(&self, index: usize) -> Latency {
        Latency::from_values(vec![self.values[index]])
    }

    /// Latency over a sub-range of the samples.
    pub fn sub_range(&self, range: Range<usize>) -> Latency {
        Latency::from_values(self.values[range].to_vec())
    }

    /// Concatenates the sample lists of all present inputs. Empty or
    /// all-absent input yields an absent result; a present/absent mix is
    /// an error, never silently coerced.
    pub fn aggregate(latencies: &[Option<Latency>]) -> Result<Option<Latency>> {
        if latencies.is_empty() || latencies.iter().all(|l| l.is_none()) {
            return Ok(None);
        }
        if latencies.iter().any(|l| l.is_none()) {
            return Err(WattBenchError::MissingMeasurements("latency"));
        }

        let mut unit: Option<&str> = None;
        let mut values = Vec::new();
        for latency in latencies.iter().flatten() {
            match unit {
                None => unit = Some(&latency.unit),
                Some(u) if u != latency.unit => {
                    return Err(WattBenchError::UnitMismatch(format!(
                        "cannot aggregate latencies in {} and {}",
                        u, latency.unit
                    )));
                }
                _ => {}
            }
            values.extend_from_slice(&latency.values);
        }

        Ok(Some(Latency::from_values(values)))
    }

    pub fn log(&self, prefix: &str) {
        info!(
            "\t+ {} latency: {:.6} \u{b1} 2 x {:.6} ({})",
            prefix, self.mean, self.stdev, self.unit
        );
    }
}

impl Sub<f64> for &Latency {
    type Output = Latency;

    /// Subtracts a constant bias from every sample, recomputing the
    /// derived statistics.
    fn sub(self, bias: f64) -> Latency {
        Latency::from_values(self.values.iter().map(|v| v - bias).collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThroughputUnit {
    #[serde(rename = "samples/s")]
    SamplesPerSec,
    #[serde(rename = "tokens/s")]
    TokensPerSec,
    #[serde(rename = "images/s")]
    ImagesPerSec,
    #[serde(rename = "steps/s")]
    StepsPerSec,
}

impl ThroughputUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThroughputUnit::SamplesPerSec => "samples/s",
            ThroughputUnit::TokensPerSec => "tokens/s",
            ThroughputUnit::ImagesPerSec => "images/s",
            ThroughputUnit::StepsPerSec => "steps/s",
        }
    }
}

impl fmt::Display for ThroughputUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Volume of work per unit time, derived from a latency distribution.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Throughput {
    pub unit: ThroughputUnit,
    pub value: f64,
}

impl Throughput {
    pub fn from_latency(latency: &Latency, volume: u64, unit: ThroughputUnit) -> Throughput {
        let value = if latency.mean > 0.0 {
            volume as f64 / latency.mean
        } else {
            0.0
        };
        Throughput { unit, value }
    }

    /// Sums same-unit values: valid when ranks process disjoint shards of
    /// one workload. Unlike [`Latency::aggregate`], an empty input is an
    /// error.
    pub fn aggregate(throughputs: &[Option<Throughput>]) -> Result<Throughput> {
        if throughputs.is_empty() {
            return Err(WattBenchError::EmptyAggregation("throughput"));
        }
        if throughputs.iter().any(|t| t.is_none()) {
            return Err(WattBenchError::MissingMeasurements("throughput"));
        }

        let mut unit: Option<ThroughputUnit> = None;
        let mut value = 0.0;
        for throughput in throughputs.iter().flatten() {
            match unit {
                None => unit = Some(throughput.unit),
                Some(u) if u != throughput.unit => {
                    return Err(WattBenchError::UnitMismatch(format!(
                        "cannot aggregate throughputs in {} and {}",
                        u, throughput.unit
                    )));
                }
                _ => {}
            }
            value += throughput.value;
        }

        match unit {
            Some(unit) => Ok(Throughput { unit, value }),
            None => Err(WattBenchError::EmptyAggregation("throughput")),
        }
    }

    pub fn log(&self, prefix: &str) {
        info!("\t+ {} throughput: {:.6} {}", prefix, self.value, self.unit);
    }
}
