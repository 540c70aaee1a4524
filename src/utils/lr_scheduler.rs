//! Learning rate scheduler trait and the piecewise-constant schedule
//!
//! Training runs through an ordered list of phases. Each phase lasts a fixed
//! number of epochs and trains with `initial_lr * multiplier`.

use crate::config::SchedulePhase;

/// Core trait for learning rate schedulers.
///
/// Schedulers adjust the learning rate during training based on the current epoch.
///
/// # Example
///
/// ```ignore
/// let mut scheduler = PiecewiseSchedule::new(0.1, vec![SchedulePhase::new(2, 1.0)]);
///
/// for epoch in 0..scheduler.total_epochs() {
///     let lr = scheduler.get_lr();
///     // ... train with current learning rate ...
///     scheduler.step();
/// }
/// ```
pub trait LRScheduler {
    /// Get the learning rate for the current epoch.
    fn get_lr(&self) -> f32;

    /// Advance the scheduler to the next epoch.
    ///
    /// Call this once per epoch, at the end of the epoch.
    fn step(&mut self);

    /// Reset the scheduler to its initial state (epoch 0).
    fn reset(&mut self);
}

/// Piecewise-constant learning-rate schedule.
///
/// Phases are consumed strictly in order. During phase `i` the learning rate
/// is `initial_lr * phases[i].multiplier`; phases with zero epochs are skipped.
/// Once every phase is exhausted the last multiplier stays in effect.
///
/// # Example
///
/// ```
/// use cnn_sgd::config::SchedulePhase;
/// use cnn_sgd::utils::lr_scheduler::{LRScheduler, PiecewiseSchedule};
///
/// let mut scheduler = PiecewiseSchedule::new(
///     0.1,
///     vec![SchedulePhase::new(2, 1.0), SchedulePhase::new(1, 0.1)],
/// );
/// assert_eq!(scheduler.get_lr(), 0.1);
/// scheduler.step();
/// scheduler.step();
/// assert!((scheduler.get_lr() - 0.01).abs() < 1e-7);
/// ```
#[derive(Debug, Clone)]
pub struct PiecewiseSchedule {
    initial_lr: f32,
    phases: Vec<SchedulePhase>,
    current_epoch: usize,
    current_lr: f32,
}

impl PiecewiseSchedule {
    /// Creates a schedule starting at epoch 0.
    pub fn new(initial_lr: f32, phases: Vec<SchedulePhase>) -> Self {
        let mut schedule = Self {
            initial_lr,
            phases,
            current_epoch: 0,
            current_lr: initial_lr,
        };
        schedule.current_lr = schedule.lr_at(0);
        schedule
    }

    /// Total number of epochs across all phases.
    pub fn total_epochs(&self) -> usize {
        self.phases.iter().map(|p| p.epochs).sum()
    }

    /// Current (0-indexed) epoch.
    pub fn current_epoch(&self) -> usize {
        self.current_epoch
    }

    /// Index of the phase the current epoch belongs to, or None once all
    /// phases are exhausted.
    pub fn phase_index(&self) -> Option<usize> {
        self.phase_of(self.current_epoch)
    }

    /// True once every scheduled epoch has been stepped through.
    pub fn is_finished(&self) -> bool {
        self.current_epoch >= self.total_epochs()
    }

    pub fn phases(&self) -> &[SchedulePhase] {
        &self.phases
    }

    fn phase_of(&self, epoch: usize) -> Option<usize> {
        let mut end = 0;
        for (i, phase) in self.phases.iter().enumerate() {
            end += phase.epochs;
            if epoch < end {
                return Some(i);
            }
        }
        None
    }

    fn lr_at(&self, epoch: usize) -> f32 {
        let multiplier = match self.phase_of(epoch) {
            Some(i) => self.phases[i].multiplier,
            None => self.phases.last().map_or(1.0, |p| p.multiplier),
        };
        self.initial_lr * multiplier
    }
}

impl LRScheduler for PiecewiseSchedule {
    fn get_lr(&self) -> f32 {
        self.current_lr
    }

    fn step(&mut self) {
        self.current_epoch += 1;
        self.current_lr = self.lr_at(self.current_epoch);
    }

    fn reset(&mut self) {
        self.current_epoch = 0;
        self.current_lr = self.lr_at(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_phase() -> PiecewiseSchedule {
        PiecewiseSchedule::new(
            1.0,
            vec![
                SchedulePhase::new(2, 1.0),
                SchedulePhase::new(0, 0.5),
                SchedulePhase::new(3, 0.1),
            ],
        )
    }

    #[test]
    fn test_total_epochs() {
        assert_eq!(three_phase().total_epochs(), 5);
    }

    #[test]
    fn test_zero_epoch_phase_is_skipped() {
        let mut scheduler = three_phase();
        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push((scheduler.phase_index(), scheduler.get_lr()));
            scheduler.step();
        }
        assert_eq!(seen[1], (Some(0), 1.0));
        assert_eq!(seen[2], (Some(2), 0.1));
        assert!(scheduler.is_finished());
        assert_eq!(scheduler.phase_index(), None);
    }

    #[test]
    fn test_reset_restores_first_phase() {
        let mut scheduler = three_phase();
        for _ in 0..4 {
            scheduler.step();
        }
        scheduler.reset();
        assert_eq!(scheduler.current_epoch(), 0);
        assert_eq!(scheduler.get_lr(), 1.0);
    }

    #[test]
    fn test_first_phase_with_zero_epochs() {
        let scheduler = PiecewiseSchedule::new(
            0.5,
            vec![SchedulePhase::new(0, 1.0), SchedulePhase::new(1, 0.2)],
        );
        assert!((scheduler.get_lr() - 0.1).abs() < 1e-7);
    }
}
