//! Stochastic forcing perturbations.
//!
//! A [`NoiseGenerator`] produces, for one ensemble member and one window, a
//! coefficient sequence per perturbed variable. Coefficients are constant in
//! time (one draw broadcast over the window) unless process noise is enabled,
//! in which case a random walk is overlaid in the variable's transformed space.
//!
//! # Reproducibility
//!
//! Every draw rooted at the configured seed first rewinds the generator to a
//! stream derived from `(seed, window, member, variable)`. Replaying the same
//! combination in the same call order is bit-identical, and members never
//! share a stream.

use rand_distr::{Distribution, LogNormal, Normal};
use serde::{Deserialize, Serialize};

use super::config::{PerturbationStrategy, PerturbedVariable, RunSetup};
use super::errors::{DaError, DaResult};
use super::types::ForcingTable;
use crate::common::rng::{stream_key, DrawRng};
use crate::common::stats::{cumulative_sum, rms};
use crate::common::transforms::{gexpit, glogit};

/// Stream tag separating posterior-replay draws from fresh draws.
const POSTERIOR_STREAM: u64 = 0x0050_4f53;

/// Per-step posterior mean and standard deviation of one variable's noise,
/// in the transformed (Gaussian) space, as stored by a previous run.
#[derive(Debug, Clone, PartialEq)]
pub struct PosteriorNoise {
    /// Posterior mean per step
    pub mean: Vec<f64>,
    /// Posterior standard deviation per step
    pub sd: Vec<f64>,
}

/// Constant-per-window segment recovered from a stored posterior series.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NoiseSegment {
    /// Segment mean
    pub mean: f64,
    /// Root-mean-square of the per-step standard deviations
    pub sd: f64,
    /// Number of steps in the segment
    pub steps: usize,
}

impl PosteriorNoise {
    /// Recover the window structure of the stored series.
    ///
    /// Consecutive steps with bit-identical means form one segment. When every
    /// step is distinct (time-varying noise) the whole series collapses to a
    /// single segment with the averaged mean. Standard deviations never define
    /// boundaries: collapsed windows legitimately share a zero spread.
    pub fn segments(&self) -> Vec<NoiseSegment> {
        let n = self.mean.len();
        if n == 0 {
            return Vec::new();
        }

        let mut runs: Vec<(usize, usize)> = Vec::new();
        let mut start = 0;
        for t in 1..=n {
            if t == n || self.mean[t].to_bits() != self.mean[start].to_bits() {
                runs.push((start, t));
                start = t;
            }
        }

        if runs.len() == n && n > 1 {
            return vec![NoiseSegment {
                mean: self.mean.iter().sum::<f64>() / n as f64,
                sd: rms(&self.sd),
                steps: n,
            }];
        }

        runs.into_iter()
            .map(|(a, b)| NoiseSegment {
                mean: self.mean[a],
                sd: rms(&self.sd[a..b]),
                steps: b - a,
            })
            .collect()
    }
}

/// Gaussian-space distribution of one variable's coefficients, summarising an
/// updated ensemble. Used to redraw parameters for the next window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PosteriorShape {
    /// Mean in the transformed space
    pub mu: f64,
    /// Standard deviation in the transformed space
    pub sigma: f64,
}

/// Where a member's coefficients come from in a given window.
#[derive(Debug, Clone, Copy)]
pub enum NoiseSource<'p> {
    /// Fresh draws from the configured prior.
    Fresh,
    /// Fresh draws from a posterior shape, one entry per perturbed variable.
    Shape(&'p [PosteriorShape]),
    /// Replay of a previous run's posterior, one entry per perturbed variable.
    Posterior(&'p [PosteriorNoise]),
    /// Given physical-space coefficients, one per perturbed variable
    /// (rejuvenation, smoother updates, external sources).
    Supplied(&'p [f64]),
}

/// Perturbation coefficient generator for one stream.
#[derive(Debug, Clone)]
pub struct NoiseGenerator<'a> {
    setup: &'a RunSetup,
    rng: DrawRng,
    draw: DrawRng,
}

impl<'a> NoiseGenerator<'a> {
    /// Create a generator rooted at `rng`.
    pub fn new(setup: &'a RunSetup, rng: DrawRng) -> Self {
        let draw = rng.clone();
        Self { setup, rng, draw }
    }

    /// Generator for one member in one window.
    pub fn for_member(&mut self, window: usize, member: usize) -> NoiseGenerator<'a> {
        NoiseGenerator::new(
            self.setup,
            self.rng.fork(stream_key(&[window as u64, member as u64])),
        )
    }

    /// Generator on an arbitrary sub-stream (filters, rejuvenation, MCMC).
    pub fn substream(&mut self, key: &[u64]) -> NoiseGenerator<'a> {
        NoiseGenerator::new(self.setup, self.rng.fork(stream_key(key)))
    }

    /// Generator used for non-perturbation randomness such as resampling
    /// offsets. Continues the current draw stream.
    pub fn rng(&mut self) -> &mut DrawRng {
        &mut self.draw
    }

    fn begin_draw(&mut self, key: &[u64]) {
        self.draw = self.rng.fork(stream_key(key));
        self.draw.reset();
    }

    fn sample(
        &mut self,
        strategy: PerturbationStrategy,
        mean: f64,
        std_dev: f64,
        variable: &PerturbedVariable,
    ) -> DaResult<f64> {
        let normal = || {
            Normal::new(mean, std_dev).map_err(|e| {
                DaError::configuration(format!("invalid noise for '{}': {}", variable.name, e))
            })
        };
        match strategy {
            PerturbationStrategy::Normal => Ok(normal()?.sample(&mut self.draw)),
            PerturbationStrategy::Lognormal => {
                let dist = LogNormal::new(mean, std_dev).map_err(|e| {
                    DaError::configuration(format!("invalid noise for '{}': {}", variable.name, e))
                })?;
                Ok(dist.sample(&mut self.draw))
            }
            PerturbationStrategy::LogitNormalMult | PerturbationStrategy::LogitNormalAdd => {
                let (lo, hi) = bounds_of(variable)?;
                Ok(gexpit(normal()?.sample(&mut self.draw), lo, hi))
            }
        }
    }

    /// One draw from the given distribution, broadcast over `steps`.
    pub fn generate(
        &mut self,
        strategy: PerturbationStrategy,
        steps: usize,
        mean: f64,
        std_dev: f64,
        variable: &PerturbedVariable,
    ) -> DaResult<Vec<f64>> {
        self.begin_draw(&[variable.index as u64]);
        let value = self.sample(strategy, mean, std_dev, variable)?;
        Ok(vec![value; steps])
    }

    /// Redraw a coefficient series from a stored posterior, replicating its
    /// window structure step for step.
    pub fn generate_from_posterior(
        &mut self,
        posterior: &PosteriorNoise,
        variable: &PerturbedVariable,
    ) -> DaResult<Vec<f64>> {
        let mut series = Vec::with_capacity(posterior.mean.len());
        for (k, segment) in posterior.segments().iter().enumerate() {
            self.begin_draw(&[POSTERIOR_STREAM, variable.index as u64, k as u64]);
            let value = self.sample(variable.strategy, segment.mean, segment.sd, variable)?;
            series.extend(std::iter::repeat(value).take(segment.steps));
        }
        Ok(series)
    }

    /// Overlay a temporally correlated random walk on a coefficient series.
    ///
    /// The cumulative sum of independent normal increments is added directly
    /// (normal), in log space (lognormal) or in logit space (bounded families).
    /// Disabled when dynamic noise is off or in spatial-propagation runs.
    pub fn add_process_noise(
        &mut self,
        coefficients: Vec<f64>,
        variable: &PerturbedVariable,
    ) -> DaResult<Vec<f64>> {
        if !self.setup.process_noise_enabled() || variable.process_noise == 0.0 {
            return Ok(coefficients);
        }

        let increments = Normal::new(0.0, variable.process_noise).map_err(|e| {
            DaError::configuration(format!("invalid process noise for '{}': {}", variable.name, e))
        })?;
        let steps: Vec<f64> = (0..coefficients.len())
            .map(|_| increments.sample(&mut self.draw))
            .collect();
        let walk = cumulative_sum(&steps);

        let out = match variable.strategy {
            PerturbationStrategy::Normal => coefficients
                .iter()
                .zip(&walk)
                .map(|(c, w)| c + w)
                .collect(),
            PerturbationStrategy::Lognormal => coefficients
                .iter()
                .zip(&walk)
                .map(|(c, w)| (c.ln() + w).exp())
                .collect(),
            PerturbationStrategy::LogitNormalMult | PerturbationStrategy::LogitNormalAdd => {
                let (lo, hi) = bounds_of(variable)?;
                coefficients
                    .iter()
                    .zip(&walk)
                    .map(|(&c, w)| gexpit(glogit(c, lo, hi) + w, lo, hi))
                    .collect()
            }
        };
        Ok(out)
    }

    /// Coefficient series of one variable for a window of `steps`.
    pub fn coefficients(
        &mut self,
        source: NoiseSource<'_>,
        steps: usize,
        variable: &PerturbedVariable,
    ) -> DaResult<Vec<f64>> {
        let base = match source {
            NoiseSource::Fresh => self.generate(
                variable.strategy,
                steps,
                variable.mean_error,
                variable.sd_error,
                variable,
            )?,
            NoiseSource::Shape(shapes) => {
                let shape = shapes.get(variable.index).ok_or_else(|| {
                    DaError::configuration(format!("no posterior shape for '{}'", variable.name))
                })?;
                self.generate(variable.strategy, steps, shape.mu, shape.sigma, variable)?
            }
            NoiseSource::Posterior(posteriors) => {
                let posterior = posteriors.get(variable.index).ok_or_else(|| {
                    DaError::configuration(format!("no stored posterior for '{}'", variable.name))
                })?;
                if posterior.mean.len() != steps || posterior.sd.len() != steps {
                    return Err(DaError::DimensionMismatch {
                        expected: steps,
                        actual: posterior.mean.len(),
                        context: format!("stored posterior of '{}'", variable.name),
                    });
                }
                self.generate_from_posterior(posterior, variable)?
            }
            NoiseSource::Supplied(values) => {
                let value = *values.get(variable.index).ok_or_else(|| {
                    DaError::DimensionMismatch {
                        expected: self.setup.variables().len(),
                        actual: values.len(),
                        context: "supplied coefficients".to_string(),
                    }
                })?;
                // Process noise below continues from this stream.
                self.begin_draw(&[variable.index as u64]);
                vec![value; steps]
            }
        };
        self.add_process_noise(base, variable)
    }

    /// Perturb every configured variable of `forcing`.
    ///
    /// Returns the perturbed forcing and the coefficient series of each
    /// variable, in configuration order. Log-normal and multiplicative
    /// logit-normal coefficients scale the forcing; the others are added.
    pub fn perturb(
        &mut self,
        forcing: &ForcingTable,
        source: NoiseSource<'_>,
    ) -> DaResult<(ForcingTable, Vec<Vec<f64>>)> {
        let steps = forcing.steps();
        let mut perturbed = forcing.clone();
        let mut noise = Vec::with_capacity(self.setup.variables().len());

        for variable in self.setup.variables() {
            let coefficients = self.coefficients(source, steps, variable)?;
            let column = forcing.column(&variable.name).ok_or_else(|| {
                DaError::configuration(format!("forcing has no variable '{}'", variable.name))
            })?;
            let values: Vec<f64> = column
                .iter()
                .zip(&coefficients)
                .map(|(x, c)| {
                    if variable.strategy.is_multiplicative() {
                        x * c
                    } else {
                        x + c
                    }
                })
                .collect();
            perturbed.set_column(&variable.name, &values)?;
            noise.push(coefficients);
        }

        Ok((perturbed, noise))
    }
}

fn bounds_of(variable: &PerturbedVariable) -> DaResult<(f64, f64)> {
    variable.bounds.ok_or_else(|| {
        DaError::configuration(format!("'{}' has no physical bounds", variable.name))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assim::config::RunConfig;

    fn setup(strategy: &str, seed: Option<u64>, dyn_noise: Option<f64>) -> RunSetup {
        let mut cfg = RunConfig {
            algorithm: "PBS".into(),
            ensemble_members: 10,
            seed,
            vars_to_perturbate: vec!["Tair".into()],
            perturbation_strategy: vec![strategy.into()],
            assimilated_variables: vec!["SWE".into()],
            ..RunConfig::default()
        };
        cfg.mean_errors.insert("Tair".into(), 0.0);
        cfg.sd_errors.insert("Tair".into(), 1.0);
        cfg.lower_bounds.insert("Tair".into(), -4.0);
        cfg.upper_bounds.insert("Tair".into(), 4.0);
        if let Some(mag) = dyn_noise {
            cfg.add_dynamic_noise = true;
            cfg.dyn_noise.insert("Tair".into(), mag);
        }
        RunSetup::new(cfg).unwrap()
    }

    #[test]
    fn test_normal_single_draw_broadcast() {
        let setup = setup("normal", Some(42), None);
        let var = setup.variables()[0].clone();
        let mut gen = NoiseGenerator::new(&setup, DrawRng::new(Some(42)));
        let noise = gen
            .generate(PerturbationStrategy::Normal, 5, 0.0, 1.0, &var)
            .unwrap();
        assert_eq!(noise.len(), 5);
        assert!(noise.iter().all(|&v| v == noise[0]));
    }

    #[test]
    fn test_seeded_generation_is_deterministic() {
        let setup = setup("lognormal", Some(7), None);
        let var = setup.variables()[0].clone();
        let mut gen = NoiseGenerator::new(&setup, DrawRng::new(Some(7)));
        let a = gen.generate(PerturbationStrategy::Lognormal, 4, 0.0, 0.3, &var).unwrap();
        let b = gen.generate(PerturbationStrategy::Lognormal, 4, 0.0, 0.3, &var).unwrap();
        assert_eq!(a, b);
        assert!(a[0] > 0.0);

        let mut other = NoiseGenerator::new(&setup, DrawRng::new(Some(7)));
        let c = other.generate(PerturbationStrategy::Lognormal, 4, 0.0, 0.3, &var).unwrap();
        assert_eq!(a, c);
    }

    #[test]
    fn test_members_get_distinct_streams() {
        let setup = setup("normal", Some(1), None);
        let var = setup.variables()[0].clone();
        let mut root = NoiseGenerator::new(&setup, DrawRng::new(Some(1)));
        let a = root.for_member(0, 0).coefficients(NoiseSource::Fresh, 3, &var).unwrap();
        let b = root.for_member(0, 1).coefficients(NoiseSource::Fresh, 3, &var).unwrap();
        let a2 = root.for_member(0, 0).coefficients(NoiseSource::Fresh, 3, &var).unwrap();
        assert_ne!(a, b);
        assert_eq!(a, a2);
    }

    #[test]
    fn test_bounded_draw_stays_inside() {
        let setup = setup("logitnormal_adi", None, None);
        let var = setup.variables()[0].clone();
        let mut gen = NoiseGenerator::new(&setup, DrawRng::new(None));
        for _ in 0..200 {
            let v = gen
                .generate(PerturbationStrategy::LogitNormalAdd, 2, 0.0, 5.0, &var)
                .unwrap();
            assert!(v[0] > -4.0 && v[0] < 4.0);
        }
    }

    #[test]
    fn test_zero_process_noise_is_noop() {
        let setup = setup("normal", Some(3), Some(0.0));
        let var = setup.variables()[0].clone();
        let mut gen = NoiseGenerator::new(&setup, DrawRng::new(Some(3)));
        let input = vec![0.25; 6];
        let out = gen.add_process_noise(input.clone(), &var).unwrap();
        assert_eq!(out, input);
    }

    #[test]
    fn test_process_noise_random_walk() {
        let setup = setup("logitnormal_mult", Some(3), Some(0.2));
        let var = setup.variables()[0].clone();
        let mut gen = NoiseGenerator::new(&setup, DrawRng::new(Some(3)));
        let out = gen.coefficients(NoiseSource::Fresh, 50, &var).unwrap();
        assert_eq!(out.len(), 50);
        assert!(out.windows(2).any(|w| w[0] != w[1]));
        assert!(out.iter().all(|&v| v > -4.0 && v < 4.0));
    }

    #[test]
    fn test_posterior_segments_follow_windows() {
        let posterior = PosteriorNoise {
            mean: vec![0.1, 0.1, 0.1, -0.3, -0.3],
            sd: vec![0.0, 0.0, 0.0, 0.3, 0.4],
        };
        let segs = posterior.segments();
        assert_eq!(segs.len(), 2);
        assert_eq!(segs[0].steps, 3);
        assert_eq!(segs[0].sd, 0.0);
        assert_eq!(segs[1].steps, 2);
        assert!((segs[1].sd - 0.125f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_posterior_dynamic_case_single_segment() {
        let posterior = PosteriorNoise {
            mean: vec![0.1, 0.2, 0.3, 0.4],
            sd: vec![1.0; 4],
        };
        let segs = posterior.segments();
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].steps, 4);
        assert!((segs[0].mean - 0.25).abs() < 1e-12);
        assert!((segs[0].sd - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_generate_from_posterior_replicates_structure() {
        let setup = setup("normal", Some(11), None);
        let var = setup.variables()[0].clone();
        let mut gen = NoiseGenerator::new(&setup, DrawRng::new(Some(11)));
        let posterior = PosteriorNoise {
            mean: vec![1.0, 1.0, 2.0, 2.0, 2.0],
            sd: vec![0.0; 5],
        };
        let series = gen.generate_from_posterior(&posterior, &var).unwrap();
        assert_eq!(series, vec![1.0, 1.0, 2.0, 2.0, 2.0]);
    }

    #[test]
    fn test_perturb_applies_additive_and_multiplicative() {
        let mut cfg = RunConfig {
            ensemble_members: 2,
            seed: Some(5),
            vars_to_perturbate: vec!["Prec".into(), "Tair".into()],
            perturbation_strategy: vec!["lognormal".into(), "normal".into()],
            assimilated_variables: vec!["SWE".into()],
            ..RunConfig::default()
        };
        for v in ["Prec", "Tair"] {
            cfg.mean_errors.insert(v.into(), 0.0);
            cfg.sd_errors.insert(v.into(), 0.5);
        }
        let setup = RunSetup::new(cfg).unwrap();
        let forcing = ForcingTable::from_columns(vec![
            ("Prec".into(), vec![2.0, 4.0]),
            ("Tair".into(), vec![270.0, 272.0]),
        ])
        .unwrap();
        let mut gen = NoiseGenerator::new(&setup, DrawRng::new(Some(5)));
        let (pert, noise) = gen
            .perturb(&forcing, NoiseSource::Supplied(&[1.5, -1.0]))
            .unwrap();
        assert_eq!(pert.column("Prec").unwrap(), vec![3.0, 6.0]);
        assert_eq!(pert.column("Tair").unwrap(), vec![269.0, 271.0]);
        assert_eq!(noise[0], vec![1.5, 1.5]);
    }
}
