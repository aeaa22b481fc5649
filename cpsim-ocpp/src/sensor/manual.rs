//! Manual (synthetic) sensor source

use rand::Rng;

use super::{PortDemand, Sample};

/// Base power used by the jittered fallback when no manual power is set
pub const FALLBACK_BASE_POWER: f64 = 3000.0;

/// Synthesizes samples from the power requested for each port
#[derive(Debug, Clone)]
pub struct ManualSource {
    nominal_voltage: f64,
    jitter: f64,
}

impl ManualSource {
    pub fn new(nominal_voltage: f64, jitter: f64) -> Self {
        Self {
            nominal_voltage,
            jitter,
        }
    }

    /// Nominal voltage and `manual_power / voltage` for charging ports, zero otherwise
    pub fn samples(&self, demand: &[PortDemand]) -> Vec<Sample> {
        demand
            .iter()
            .map(|d| {
                if d.charging_active {
                    Sample::new(self.nominal_voltage, d.manual_power / self.nominal_voltage)
                } else {
                    Sample::default()
                }
            })
            .collect()
    }

    /// Stand-in samples for a failed sensor read, jittered by up to `±jitter` watts
    pub fn jittered(&self, demand: &[PortDemand]) -> Vec<Sample> {
        let mut rng = rand::thread_rng();

        demand
            .iter()
            .map(|d| {
                if !d.charging_active {
                    return Sample::default();
                }
                let base = if d.manual_power > 0.0 {
                    d.manual_power
                } else {
                    FALLBACK_BASE_POWER
                };
                let variation = if self.jitter > 0.0 {
                    rng.gen_range(-self.jitter..=self.jitter)
                } else {
                    0.0
                };
                Sample::new(self.nominal_voltage, (base + variation) / self.nominal_voltage)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn demand(active: bool, power: f64) -> PortDemand {
        PortDemand {
            charging_active: active,
            manual_power: power,
        }
    }

    #[test]
    fn test_samples_follow_demand() {
        let source = ManualSource::new(220.0, 200.0);
        let samples = source.samples(&[demand(true, 2200.0), demand(false, 5000.0)]);

        assert_eq!(samples[0], Sample::new(220.0, 10.0));
        assert_eq!(samples[1], Sample::default());
    }

    #[test]
    fn test_jitter_bounds() {
        let source = ManualSource::new(220.0, 200.0);
        for _ in 0..100 {
            let samples = source.jittered(&[demand(true, 0.0), demand(true, 1000.0), demand(false, 0.0)]);
            let fallback = samples[0].power();
            let manual = samples[1].power();

            assert!((2800.0 - 1e-6..=3200.0 + 1e-6).contains(&fallback));
            assert!((800.0 - 1e-6..=1200.0 + 1e-6).contains(&manual));
            assert_eq!(samples[2], Sample::default());
        }
    }

    #[test]
    fn test_no_jitter() {
        let source = ManualSource::new(220.0, 0.0);
        let samples = source.jittered(&[demand(true, 2200.0)]);
        assert_eq!(samples[0], Sample::new(220.0, 10.0));
    }
}
