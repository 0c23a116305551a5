use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::energy::{Efficiency, Energy};
use crate::error::{Result, WattBenchError};
use crate::latency::{Latency, Throughput};

/// One section's bundle of statistics, plus a machine-readable error
/// string for communicating failure detail out of the measurement layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Measurements {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency: Option<Latency>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throughput: Option<Throughput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub energy: Option<Energy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub efficiency: Option<Efficiency>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Measurements {
    pub fn from_error(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }

    /// Field-by-field aggregation across ranks: latency concatenates,
    /// throughput sums, energy takes component-wise max, efficiency
    /// averages. Throughput and efficiency stay absent when absent on
    /// every rank; their aggregation functions reject empty input, so
    /// they are only consulted when at least one rank measured them.
    pub fn aggregate(sections: &[&Measurements]) -> Result<Measurements> {
        let latencies: Vec<Option<Latency>> = sections.iter().map(|m| m.latency.clone()).collect();
        let throughputs: Vec<Option<Throughput>> = sections.iter().map(|m| m.throughput).collect();
        let energies: Vec<Option<Energy>> = sections.iter().map(|m| m.energy.clone()).collect();
        let efficiencies: Vec<Option<Efficiency>> =
            sections.iter().map(|m| m.efficiency).collect();

        let throughput = if throughputs.iter().all(|t| t.is_none()) {
            None
        } else {
            Some(Throughput::aggregate(&throughputs)?)
        };
        let efficiency = if efficiencies.iter().all(|e| e.is_none()) {
            None
        } else {
            Some(Efficiency::aggregate(&efficiencies)?)
        };

        let errors: Vec<&str> = sections
            .iter()
            .filter_map(|m| m.error.as_deref())
            .collect();
        let error = if errors.is_empty() {
            None
        } else {
            Some(errors.join(" | "))
        };

        Ok(Measurements {
            latency: Latency::aggregate(&latencies)?,
            throughput,
            energy: Energy::aggregate(&energies)?,
            efficiency,
            error,
        })
    }

    pub fn log(&self, prefix: &str) {
        if let Some(latency) = &self.latency {
            latency.log(prefix);
        }
        if let Some(throughput) = &self.throughput {
            throughput.log(prefix);
        }
        if let Some(energy) = &self.energy {
            energy.log(prefix);
        }
        if let Some(efficiency) = &self.efficiency {
            efficiency.log(prefix);
        }
        if let Some(error) = &self.error {
            tracing::warn!("\t+ {} error: {}", prefix, error);
        }
    }
}

/// A named mapping from section name (load, prefill, decode, train, ...)
/// to that section's measurements. One report is produced per rank and
/// persisted to a rank-indexed file; the parent gathers and aggregates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkReport {
    pub sections: BTreeMap<String, Measurements>,
}

impl BenchmarkReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, measurements: Measurements) {
        self.sections.insert(name.into(), measurements);
    }

    pub fn section(&self, name: &str) -> Option<&Measurements> {
        self.sections.get(name)
    }

    /// Section errors, if any rank-side measurement recorded one.
    pub fn errors(&self) -> Vec<(&str, &str)> {
        self.sections
            .iter()
            .filter_map(|(name, m)| m.error.as_deref().map(|e| (name.as_str(), e)))
            .collect()
    }

    /// Atomic create-then-close: the report is written to a temporary
    /// sibling and renamed into place, so a partially written file is
    /// never observable at `path`.
    pub fn save_json(&self, path: &Path) -> Result<()> {
        let file_name = path
            .file_name()
            .ok_or_else(|| WattBenchError::Report(format!("invalid report path: {}", path.display())))?;
        let mut tmp_name = std::ffi::OsString::from(".");
        tmp_name.push(file_name);
        tmp_name.push(".tmp");
        let tmp = path.with_file_name(tmp_name);

        fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn from_json(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Aggregates rank reports section by section. All reports must carry
    /// the same section set; a structural mismatch means a rank measured
    /// something different and the aggregate would be silently wrong.
    pub fn aggregate(reports: &[BenchmarkReport]) -> Result<BenchmarkReport> {
        let first = reports
            .first()
            .ok_or(WattBenchError::EmptyAggregation("report"))?;

        for report in reports {
            if report.sections.len() != first.sections.len()
                || !report.sections.keys().eq(first.sections.keys())
            {
                return Err(WattBenchError::Report(
                    "rank reports have mismatched section sets".to_string(),
                ));
            }
        }

        let mut sections = BTreeMap::new();
        for name in first.sections.keys() {
            let mut per_rank = Vec::with_capacity(reports.len());
            for report in reports {
                // existence checked above
                if let Some(m) = report.sections.get(name) {
                    per_rank.push(m);
                }
            }
            sections.insert(name.clone(), Measurements::aggregate(&per_rank)?);
        }

        Ok(BenchmarkReport { sections })
    }

    pub fn log(&self) {
        for (name, measurements) in &self.sections {
            measurements.log(name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::energy::EfficiencyUnit;
    use crate::latency::ThroughputUnit;

    fn rank_report(latency_values: Vec<f64>, throughput: f64) -> BenchmarkReport {
        let mut report = BenchmarkReport::new();
        report.insert(
            "prefill",
            Measurements {
                latency: Some(Latency::from_values(latency_values)),
                throughput: Some(Throughput {
                    unit: ThroughputUnit::TokensPerSec,
                    value: throughput,
                }),
                energy: None,
                efficiency: None,
                error: None,
            },
        );
        report
    }

    #[test]
    fn aggregate_combines_sections_field_by_field() {
        let a = rank_report(vec![1.0, 2.0], 10.0);
        let b = rank_report(vec![3.0], 15.0);
        let agg = BenchmarkReport::aggregate(&[a, b]).unwrap();

        let prefill = agg.section("prefill").unwrap();
        assert_eq!(prefill.latency.as_ref().unwrap().values, vec![1.0, 2.0, 3.0]);
        assert_eq!(prefill.throughput.unwrap().value, 25.0);
        assert!(prefill.energy.is_none());
    }

    #[test]
    fn aggregate_rejects_mismatched_section_sets() {
        let a = rank_report(vec![1.0], 10.0);
        let mut b = rank_report(vec![2.0], 10.0);
        b.insert("decode", Measurements::default());
        assert!(BenchmarkReport::aggregate(&[a, b]).is_err());
    }

    #[test]
    fn aggregate_rejects_empty_input() {
        assert!(BenchmarkReport::aggregate(&[]).is_err());
    }

    #[test]
    fn aggregate_keeps_energy_max_and_efficiency_mean() {
        let mut a = BenchmarkReport::new();
        a.insert(
            "decode",
            Measurements {
                latency: None,
                throughput: None,
                energy: Some(Energy::new(1.0, 1.0, 2.0, 4.0)),
                efficiency: Some(Efficiency {
                    unit: EfficiencyUnit::TokensPerKwh,
                    value: 10.0,
                }),
                error: None,
            },
        );
        let mut b = BenchmarkReport::new();
        b.insert(
            "decode",
            Measurements {
                latency: None,
                throughput: None,
                energy: Some(Energy::new(3.0, 2.0, 1.0, 6.0)),
                efficiency: Some(Efficiency {
                    unit: EfficiencyUnit::TokensPerKwh,
                    value: 20.0,
                }),
                error: None,
            },
        );

        let agg = BenchmarkReport::aggregate(&[a, b]).unwrap();
        let decode = agg.section("decode").unwrap();
        let energy = decode.energy.as_ref().unwrap();
        assert_eq!(energy.cpu, 3.0);
        assert_eq!(energy.gpu, 2.0);
        assert_eq!(energy.total, 6.0);
        assert_eq!(decode.efficiency.unwrap().value, 15.0);
    }

    #[test]
    fn aggregate_joins_section_errors() {
        let mut a = BenchmarkReport::new();
        a.insert("decode", Measurements::from_error("sampler died"));
        let mut b = BenchmarkReport::new();
        b.insert("decode", Measurements::from_error("nvml missing"));

        let agg = BenchmarkReport::aggregate(&[a, b]).unwrap();
        let error = agg.section("decode").unwrap().error.as_deref().unwrap();
        assert!(error.contains("sampler died"));
        assert!(error.contains("nvml missing"));
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("benchmark_report_rank_0.json");

        let report = rank_report(vec![0.5, 0.7], 42.0);
        report.save_json(&path).unwrap();

        let loaded = BenchmarkReport::from_json(&path).unwrap();
        assert_eq!(loaded, report);
    }

    #[test]
    fn save_leaves_no_temporary_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("benchmark_report_rank_0.json");
        rank_report(vec![0.5], 1.0).save_json(&path).unwrap();

        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("benchmark_report_rank_0.json")]);
    }
}
