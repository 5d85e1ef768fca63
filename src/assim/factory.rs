//! Filter construction.
//!
//! The algorithm is resolved once per run; the engine holds the boxed filter
//! for every cell and window.

use super::config::{Algorithm, RunSetup};
use super::filters::{
    AdaptiveParticleBatchSmoother, AssimilationFilter, EnsembleSmoother, OpenLoopFilter,
    ParticleBatchSmoother, ParticleFilter, ProposalParticleBatchSmoother, SmootherMcmc,
};

/// Build the filter of the configured algorithm.
pub fn build_filter(setup: &RunSetup) -> Box<dyn AssimilationFilter> {
    let config = setup.config();
    match setup.algorithm() {
        Algorithm::DeterministicOpenLoop => Box::new(OpenLoopFilter),
        Algorithm::Pf => Box::new(ParticleFilter),
        Algorithm::Pbs => Box::new(ParticleBatchSmoother),
        Algorithm::ProPbs => Box::new(ProposalParticleBatchSmoother),
        Algorithm::AdaPbs => Box::new(AdaptiveParticleBatchSmoother::new(config.ada_neff_target)),
        Algorithm::Es => Box::new(EnsembleSmoother::es()),
        Algorithm::Ies => Box::new(EnsembleSmoother::ies(config.max_iterations)),
        Algorithm::Pies => Box::new(EnsembleSmoother::pies(config.max_iterations)),
        Algorithm::IesMcmc | Algorithm::IesMcmcAi => Box::new(SmootherMcmc::new(
            config.max_iterations,
            config.mcmc_samples,
            config.mcmc_burn_in,
            config.mcmc_proposal_scale,
            setup.algorithm() == Algorithm::IesMcmcAi,
        )),
    }
}
