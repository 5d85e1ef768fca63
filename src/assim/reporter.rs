//! Observability for cell assimilation.
//!
//! The engine calls a [`WindowReporter`] at key points of every window without
//! the core algorithm knowing who listens.
//!
//! # Zero-Cost Abstraction
//!
//! The default [`NoOpReporter`] has empty callbacks that compile away.
//!
//! # Example
//!
//! ```ignore
//! use snowda::assim::{DebugReporter, WindowReporter};
//!
//! let mut reporter = DebugReporter::new();
//! // ... run a cell with the reporter ...
//! println!("{} filter updates", reporter.update_events().len());
//! ```

use super::engine::CellOutcome;
use super::ensemble::Ensemble;
use super::filters::FilterUpdate;
use super::noise::PosteriorShape;
use super::types::{AssimilationWindow, CellIndex};

// ============================================================================
// WindowReporter Trait
// ============================================================================

/// Observability trait for window execution.
///
/// All methods have empty default implementations; override the events you
/// care about. Reporters take `&mut self` and need not be `Send + Sync`.
pub trait WindowReporter {
    /// Called after the prior ensemble of a window has been forecast.
    fn on_prior(&mut self, _window: &AssimilationWindow, _ensemble: &Ensemble) {}

    /// Called after the filter update of a window.
    fn on_filter_update(&mut self, _window: &AssimilationWindow, _update: &FilterUpdate) {}

    /// Called after the ensemble was resampled.
    fn on_resample(&mut self, _window: &AssimilationWindow, _indices: &[usize]) {}

    /// Called after parameters were redrawn for the next window.
    fn on_rejuvenation(&mut self, _window: &AssimilationWindow, _shape: &[PosteriorShape]) {}

    /// Called once per cell with its outcome.
    fn on_cell_complete(&mut self, _cell: CellIndex, _outcome: &CellOutcome) {}
}

// ============================================================================
// NoOpReporter
// ============================================================================

/// Reporter that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpReporter;

impl NoOpReporter {
    /// Create a new no-op reporter.
    pub fn new() -> Self {
        Self
    }
}

impl WindowReporter for NoOpReporter {}

// ============================================================================
// DebugReporter
// ============================================================================

/// Captured summary of one filter update.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateEvent {
    /// Window the update belongs to
    pub window: AssimilationWindow,
    /// Effective sample size reported by the filter
    pub effective_size: Option<f64>,
    /// Iterations or tempering stages
    pub iterations: usize,
    /// True when the update changed nothing
    pub pass_through: bool,
}

/// Reporter that captures events for post-hoc inspection.
#[derive(Debug, Clone, Default)]
pub struct DebugReporter {
    /// Windows whose prior was forecast, with the member count
    priors: Vec<(AssimilationWindow, usize)>,

    /// Filter update summaries
    updates: Vec<UpdateEvent>,

    /// Resampling indices per window
    resamples: Vec<(AssimilationWindow, Vec<usize>)>,

    /// Posterior shapes used for rejuvenation
    rejuvenations: Vec<(AssimilationWindow, Vec<PosteriorShape>)>,

    /// Cell outcomes
    outcomes: Vec<(CellIndex, CellOutcome)>,
}

impl DebugReporter {
    /// Create a new debug reporter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear all captured events.
    pub fn clear(&mut self) {
        self.priors.clear();
        self.updates.clear();
        self.resamples.clear();
        self.rejuvenations.clear();
        self.outcomes.clear();
    }

    /// Captured prior events.
    pub fn prior_events(&self) -> &[(AssimilationWindow, usize)] {
        &self.priors
    }

    /// Captured filter updates.
    pub fn update_events(&self) -> &[UpdateEvent] {
        &self.updates
    }

    /// Captured resampling events.
    pub fn resample_events(&self) -> &[(AssimilationWindow, Vec<usize>)] {
        &self.resamples
    }

    /// Captured rejuvenation events.
    pub fn rejuvenation_events(&self) -> &[(AssimilationWindow, Vec<PosteriorShape>)] {
        &self.rejuvenations
    }

    /// Captured cell outcomes.
    pub fn outcomes(&self) -> &[(CellIndex, CellOutcome)] {
        &self.outcomes
    }

    /// Total number of captured events.
    pub fn total_events(&self) -> usize {
        self.priors.len()
            + self.updates.len()
            + self.resamples.len()
            + self.rejuvenations.len()
            + self.outcomes.len()
    }
}

impl WindowReporter for DebugReporter {
    fn on_prior(&mut self, window: &AssimilationWindow, ensemble: &Ensemble) {
        self.priors.push((*window, ensemble.len()));
    }

    fn on_filter_update(&mut self, window: &AssimilationWindow, update: &FilterUpdate) {
        self.updates.push(UpdateEvent {
            window: *window,
            effective_size: update.effective_size,
            iterations: update.iterations,
            pass_through: update.is_pass_through(),
        });
    }

    fn on_resample(&mut self, window: &AssimilationWindow, indices: &[usize]) {
        self.resamples.push((*window, indices.to_vec()));
    }

    fn on_rejuvenation(&mut self, window: &AssimilationWindow, shape: &[PosteriorShape]) {
        self.rejuvenations.push((*window, shape.to_vec()));
    }

    fn on_cell_complete(&mut self, cell: CellIndex, outcome: &CellOutcome) {
        self.outcomes.push((cell, outcome.clone()));
    }
}

// ============================================================================
// LoggingReporter
// ============================================================================

/// Reporter that logs events through the `log` facade.
///
/// - `on_cell_complete`: INFO
/// - `on_filter_update`, `on_rejuvenation`: DEBUG
/// - `on_prior`, `on_resample`: TRACE
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingReporter {
    /// Whether to include per-member details
    verbose: bool,
}

impl LoggingReporter {
    /// Create a new logging reporter.
    pub fn new() -> Self {
        Self { verbose: false }
    }

    /// Create a verbose logging reporter that includes member details.
    pub fn verbose() -> Self {
        Self { verbose: true }
    }
}

impl WindowReporter for LoggingReporter {
    fn on_prior(&mut self, window: &AssimilationWindow, ensemble: &Ensemble) {
        log::trace!(
            "Window {} [{}, {}): prior forecast of {} members",
            window.index,
            window.start,
            window.end,
            ensemble.len()
        );
    }

    fn on_filter_update(&mut self, window: &AssimilationWindow, update: &FilterUpdate) {
        if update.is_pass_through() {
            log::debug!("Window {}: no valid observations, prior kept", window.index);
            return;
        }
        log::debug!(
            "Window {}: update after {} iteration(s), Neff={:.2}",
            window.index,
            update.iterations,
            update.effective_size.unwrap_or(f64::NAN)
        );
        if self.verbose {
            if let Some(weights) = &update.weights {
                for (m, w) in weights.iter().enumerate() {
                    log::trace!("  member {}: weight={:.6}", m, w);
                }
            }
        }
    }

    fn on_resample(&mut self, window: &AssimilationWindow, indices: &[usize]) {
        let mut distinct = indices.to_vec();
        distinct.sort_unstable();
        distinct.dedup();
        log::trace!(
            "Window {}: resampled, {} distinct members survive",
            window.index,
            distinct.len()
        );
    }

    fn on_rejuvenation(&mut self, window: &AssimilationWindow, shape: &[PosteriorShape]) {
        for (i, s) in shape.iter().enumerate() {
            log::debug!(
                "Window {}: variable {} redrawn from N({:.4}, {:.4})",
                window.index,
                i,
                s.mu,
                s.sigma
            );
        }
    }

    fn on_cell_complete(&mut self, cell: CellIndex, outcome: &CellOutcome) {
        log::info!("Cell {}: {}", cell.tag(), outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_reporter_captures() {
        let mut reporter = DebugReporter::new();
        let w = AssimilationWindow::new(0, 0, 3);
        reporter.on_filter_update(&w, &FilterUpdate::pass_through());
        reporter.on_resample(&w, &[0, 0, 1]);
        reporter.on_cell_complete(CellIndex::new(0, 0), &CellOutcome::OpenLoop);
        assert_eq!(reporter.total_events(), 3);
        assert!(reporter.update_events()[0].pass_through);
        reporter.clear();
        assert_eq!(reporter.total_events(), 0);
    }

    #[test]
    fn test_noop_and_logging_accept_events() {
        let w = AssimilationWindow::new(1, 3, 5);
        let mut noop = NoOpReporter::new();
        noop.on_resample(&w, &[1, 1]);
        let mut logging = LoggingReporter::verbose();
        logging.on_resample(&w, &[1, 1]);
        logging.on_filter_update(&w, &FilterUpdate::pass_through());
    }
}
