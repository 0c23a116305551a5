use std::fmt;
use std::ops::Div;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, WattBenchError};

pub const ENERGY_UNIT: &str = "kWh";

/// A snapshot of consumed energy partitioned by machine component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Energy {
    pub unit: String,
    pub cpu: f64,
    pub ram: f64,
    pub gpu: f64,
    pub total: f64,
}

impl Energy {
    pub fn new(cpu: f64, ram: f64, gpu: f64, total: f64) -> Self {
        Self {
            unit: ENERGY_UNIT.to_string(),
            cpu,
            ram,
            gpu,
            total,
        }
    }

    /// Component-wise maximum, not sum: energy is measured at machine
    /// granularity, so concurrent ranks on one machine observe the same
    /// meter and summing would double count.
    pub fn aggregate(energies: &[Option<Energy>]) -> Result<Option<Energy>> {
        if energies.is_empty() || energies.iter().all(|e| e.is_none()) {
            return Ok(None);
        }
        if energies.iter().any(|e| e.is_none()) {
            return Err(WattBenchError::MissingMeasurements("energy"));
        }

        let mut unit: Option<&str> = None;
        let (mut cpu, mut ram, mut gpu, mut total) = (f64::MIN, f64::MIN, f64::MIN, f64::MIN);
        for energy in energies.iter().flatten() {
            match unit {
                None => unit = Some(&energy.unit),
                Some(u) if u != energy.unit => {
                    return Err(WattBenchError::UnitMismatch(format!(
                        "cannot aggregate energies in {} and {}",
                        u, energy.unit
                    )));
                }
                _ => {}
            }
            cpu = cpu.max(energy.cpu);
            ram = ram.max(energy.ram);
            gpu = gpu.max(energy.gpu);
            total = total.max(energy.total);
        }

        Ok(Some(Energy::new(cpu, ram, gpu, total)))
    }

    /// Component-wise delta between two snapshots of the same meter.
    pub fn checked_sub(&self, other: &Energy) -> Result<Energy> {
        if self.unit != other.unit {
            return Err(WattBenchError::UnitMismatch(format!(
                "cannot subtract energy in {} from energy in {}",
                other.unit, self.unit
            )));
        }

        Ok(Energy {
            unit: self.unit.clone(),
            cpu: self.cpu - other.cpu,
            ram: self.ram - other.ram,
            gpu: self.gpu - other.gpu,
            total: self.total - other.total,
        })
    }

    pub fn log(&self, prefix: &str) {
        info!("\t+ {} energy consumption:", prefix);
        info!("\t\t+ CPU: {:.9} ({})", self.cpu, self.unit);
        info!("\t\t+ GPU: {:.9} ({})", self.gpu, self.unit);
        info!("\t\t+ RAM: {:.9} ({})", self.ram, self.unit);
        info!("\t\t+ total: {:.9} ({})", self.total, self.unit);
    }
}

impl Div<f64> for &Energy {
    type Output = Energy;

    fn div(self, scalar: f64) -> Energy {
        Energy {
            unit: self.unit.clone(),
            cpu: self.cpu / scalar,
            ram: self.ram / scalar,
            gpu: self.gpu / scalar,
            total: self.total / scalar,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EfficiencyUnit {
    #[serde(rename = "samples/kWh")]
    SamplesPerKwh,
    #[serde(rename = "tokens/kWh")]
    TokensPerKwh,
    #[serde(rename = "images/kWh")]
    ImagesPerKwh,
}

impl EfficiencyUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            EfficiencyUnit::SamplesPerKwh => "samples/kWh",
            EfficiencyUnit::TokensPerKwh => "tokens/kWh",
            EfficiencyUnit::ImagesPerKwh => "images/kWh",
        }
    }
}

impl fmt::Display for EfficiencyUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Volume of work per unit of total energy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Efficiency {
    pub unit: EfficiencyUnit,
    pub value: f64,
}

impl Efficiency {
    pub fn from_energy(energy: &Energy, volume: u64, unit: EfficiencyUnit) -> Efficiency {
        let value = if energy.total > 0.0 {
            volume as f64 / energy.total
        } else {
            0.0
        };
        Efficiency { unit, value }
    }

    /// Arithmetic mean, not sum: efficiency already normalizes for volume,
    /// so rank values estimate the same machine-level quantity.
    pub fn aggregate(efficiencies: &[Option<Efficiency>]) -> Result<Efficiency> {
        if efficiencies.is_empty() {
            return Err(WattBenchError::EmptyAggregation("efficiency"));
        }
        if efficiencies.iter().any(|e| e.is_none()) {
            return Err(WattBenchError::MissingMeasurements("efficiency"));
        }

        let mut unit: Option<EfficiencyUnit> = None;
        let mut sum = 0.0;
        let mut count = 0usize;
        for efficiency in efficiencies.iter().flatten() {
            match unit {
                None => unit = Some(efficiency.unit),
                Some(u) if u != efficiency.unit => {
                    return Err(WattBenchError::UnitMismatch(format!(
                        "cannot aggregate efficiencies in {} and {}",
                        u, efficiency.unit
                    )));
                }
                _ => {}
            }
            sum += efficiency.value;
            count += 1;
        }

        match unit {
            Some(unit) => Ok(Efficiency {
                unit,
                value: sum / count as f64,
            }),
            None => Err(WattBenchError::EmptyAggregation("efficiency")),
        }
    }

    pub fn log(&self, prefix: &str) {
        info!("\t+ {} energy efficiency: {:.6} ({})", prefix, self.value, self.unit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn energy(cpu: f64, gpu: f64, ram: f64, total: f64) -> Energy {
        Energy::new(cpu, ram, gpu, total)
    }

    #[test]
    fn aggregate_takes_component_wise_max() {
        let e1 = energy(1.0, 2.0, 1.0, 4.0);
        let e2 = energy(3.0, 1.0, 2.0, 6.0);
        let agg = Energy::aggregate(&[Some(e1), Some(e2)]).unwrap().unwrap();
        assert_eq!(agg.cpu, 3.0);
        assert_eq!(agg.gpu, 2.0);
        assert_eq!(agg.ram, 2.0);
        assert_eq!(agg.total, 6.0);
    }

    #[test]
    fn aggregate_empty_is_absent() {
        assert!(Energy::aggregate(&[]).unwrap().is_none());
        assert!(Energy::aggregate(&[None, None]).unwrap().is_none());
    }

    #[test]
    fn aggregate_mixed_presence_fails() {
        let e = energy(1.0, 1.0, 1.0, 3.0);
        assert!(Energy::aggregate(&[Some(e), None]).is_err());
    }

    #[test]
    fn subtraction_is_component_wise() {
        let after = energy(3.0, 2.0, 1.0, 6.0);
        let before = energy(1.0, 1.0, 0.5, 2.5);
        let delta = after.checked_sub(&before).unwrap();
        assert_eq!(delta.cpu, 2.0);
        assert_eq!(delta.gpu, 1.0);
        assert_eq!(delta.ram, 0.5);
        assert_eq!(delta.total, 3.5);
    }

    #[test]
    fn subtraction_rejects_unit_mismatch() {
        let a = energy(1.0, 1.0, 1.0, 3.0);
        let mut b = energy(1.0, 1.0, 1.0, 3.0);
        b.unit = "Wh".to_string();
        assert!(a.checked_sub(&b).is_err());
    }

    #[test]
    fn division_scales_all_components() {
        let e = energy(2.0, 4.0, 6.0, 12.0);
        let half = &e / 2.0;
        assert_eq!(half.cpu, 1.0);
        assert_eq!(half.gpu, 2.0);
        assert_eq!(half.ram, 3.0);
        assert_eq!(half.total, 6.0);
    }

    #[test]
    fn serde_round_trip_preserves_components() {
        let e = energy(0.001, 0.002, 0.0005, 0.0035);
        let json = serde_json::to_string(&e).unwrap();
        let back: Energy = serde_json::from_str(&json).unwrap();
        assert_eq!(back, e);
    }

    #[test]
    fn efficiency_from_zero_energy_is_zero() {
        let e = energy(0.0, 0.0, 0.0, 0.0);
        let eff = Efficiency::from_energy(&e, 100, EfficiencyUnit::TokensPerKwh);
        assert_eq!(eff.value, 0.0);
    }

    #[test]
    fn efficiency_aggregation_averages() {
        let a = Efficiency { unit: EfficiencyUnit::TokensPerKwh, value: 10.0 };
        let b = Efficiency { unit: EfficiencyUnit::TokensPerKwh, value: 20.0 };
        let agg = Efficiency::aggregate(&[Some(a), Some(b)]).unwrap();
        assert_eq!(agg.value, 15.0);
    }

    #[test]
    fn efficiency_aggregation_rejects_empty_and_missing() {
        assert!(Efficiency::aggregate(&[]).is_err());
        let a = Efficiency { unit: EfficiencyUnit::TokensPerKwh, value: 10.0 };
        assert!(Efficiency::aggregate(&[Some(a), None]).is_err());
    }
}
