use candle_core::{bail, Result};

/// Step-driven scalar schedule, used for annealing the KL-divergence weight.
///
/// The current training step is always passed in explicitly; the schedule
/// itself holds no counter.
#[derive(Debug, Clone)]
pub enum DecaySchedule {
    Constant(f64),
    /// `values` has one more entry than `boundaries`; value `j` applies to
    /// steps in `[boundaries[j-1], boundaries[j])`.
    PiecewiseConstant {
        boundaries: Vec<usize>,
        values: Vec<f64>,
    },
    /// `initial * decay_rate^(step / decay_steps)`
    ExponentialDecay {
        initial: f64,
        decay_rate: f64,
        decay_steps: usize,
    },
    /// Linear ramp from `initial` to `final_value` over `decay_steps` steps.
    LinearDecay {
        initial: f64,
        final_value: f64,
        decay_steps: usize,
    },
}

impl DecaySchedule {
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Constant(_) => Ok(()),
            Self::PiecewiseConstant { boundaries, values } => {
                if values.len() != boundaries.len() + 1 {
                    bail!(
                        "piecewise-constant schedule needs {} values for {} boundaries",
                        boundaries.len() + 1,
                        boundaries.len()
                    );
                }
                if boundaries.windows(2).any(|w| w[0] >= w[1]) {
                    bail!("piecewise-constant boundaries must be strictly increasing");
                }
                Ok(())
            }
            Self::ExponentialDecay { decay_steps, .. } | Self::LinearDecay { decay_steps, .. } => {
                if *decay_steps == 0 {
                    bail!("decay_steps must be positive");
                }
                Ok(())
            }
        }
    }

    /// Evaluate the schedule at a training step.
    pub fn at(&self, step: usize) -> f64 {
        match self {
            Self::Constant(value) => *value,
            Self::PiecewiseConstant { boundaries, values } => {
                let idx = boundaries.iter().take_while(|&&b| step >= b).count();
                values[idx.min(values.len() - 1)]
            }
            Self::ExponentialDecay {
                initial,
                decay_rate,
                decay_steps,
            } => initial * decay_rate.powf(step as f64 / *decay_steps as f64),
            Self::LinearDecay {
                initial,
                final_value,
                decay_steps,
            } => {
                let frac = (step as f64 / *decay_steps as f64).min(1.0);
                initial + (final_value - initial) * frac
            }
        }
    }
}

impl Default for DecaySchedule {
    fn default() -> Self {
        Self::Constant(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn piecewise_schedule_picks_segment() {
        let sched = DecaySchedule::PiecewiseConstant {
            boundaries: vec![10, 20],
            values: vec![0.0, 0.5, 1.0],
        };
        sched.validate().unwrap();
        assert_eq!(sched.at(0), 0.0);
        assert_eq!(sched.at(10), 0.5);
        assert_eq!(sched.at(19), 0.5);
        assert_eq!(sched.at(25), 1.0);
    }

    #[test]
    fn linear_schedule_saturates() {
        let sched = DecaySchedule::LinearDecay {
            initial: 0.0,
            final_value: 1.0,
            decay_steps: 100,
        };
        assert_eq!(sched.at(50), 0.5);
        assert_eq!(sched.at(1000), 1.0);
    }

    #[test]
    fn bad_piecewise_config_is_rejected() {
        let sched = DecaySchedule::PiecewiseConstant {
            boundaries: vec![10, 20],
            values: vec![0.0, 0.5],
        };
        assert!(sched.validate().is_err());
    }
}
