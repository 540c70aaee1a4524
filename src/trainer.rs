//! Epoch and mini-batch orchestration
//!
//! The trainer normalizes every split with the training-set channel
//! statistics, walks the learning-rate phases in order, shuffles the training
//! set each epoch, and records train/validation/test loss and accuracy after
//! every epoch.

use crate::config::TrainingConfig;
use crate::error::{NetworkError, Result};
use crate::model::Cnn;
use crate::utils::{ChannelStats, LRScheduler, PiecewiseSchedule};
use ndarray::{s, Array2, Array4, ArrayView1, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

/// Images as (N, C, H, W) and one-hot labels as (classes, N) for each split.
#[derive(Debug, Clone)]
pub struct DataSplits {
    pub x_train: Array4<f32>,
    pub y_train: Array2<f32>,
    pub x_val: Array4<f32>,
    pub y_val: Array2<f32>,
    pub x_test: Array4<f32>,
    pub y_test: Array2<f32>,
}

impl DataSplits {
    pub fn new(
        (x_train, y_train): (Array4<f32>, Array2<f32>),
        (x_val, y_val): (Array4<f32>, Array2<f32>),
        (x_test, y_test): (Array4<f32>, Array2<f32>),
    ) -> Result<Self> {
        let splits = Self {
            x_train,
            y_train,
            x_val,
            y_val,
            x_test,
            y_test,
        };
        splits.validate()?;
        Ok(splits)
    }

    /// Checks that every split is non-empty, that images and labels agree on
    /// the sample count, and that all splits share image and label shapes.
    pub fn validate(&self) -> Result<()> {
        let splits = [
            ("train", &self.x_train, &self.y_train),
            ("val", &self.x_val, &self.y_val),
            ("test", &self.x_test, &self.y_test),
        ];
        let (_, c, h, w) = self.x_train.dim();
        let classes = self.y_train.nrows();
        for (name, x, y) in splits {
            let n = x.dim().0;
            if n == 0 {
                return Err(NetworkError::InvalidData(format!("{name} split is empty")));
            }
            if y.ncols() != n {
                return Err(NetworkError::InvalidData(format!(
                    "{name} split has {n} images but {} label columns",
                    y.ncols()
                )));
            }
            if x.dim() != (n, c, h, w) || y.nrows() != classes {
                return Err(NetworkError::InvalidData(format!(
                    "{name} split shapes {:?}/{:?} disagree with the training split",
                    x.shape(),
                    y.shape()
                )));
            }
        }
        Ok(())
    }
}

/// Metrics of one completed epoch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub learning_rate: f32,
    pub train_loss: f32,
    pub train_accuracy: f32,
    pub val_loss: f32,
    pub val_accuracy: f32,
    pub test_loss: f32,
    pub test_accuracy: f32,
}

/// Per-epoch metrics, one entry appended to every sequence per epoch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsHistory {
    pub train_loss: Vec<f32>,
    pub train_accuracy: Vec<f32>,
    pub val_loss: Vec<f32>,
    pub val_accuracy: Vec<f32>,
    pub test_loss: Vec<f32>,
    pub test_accuracy: Vec<f32>,
    pub learning_rates: Vec<f32>,
}

impl MetricsHistory {
    pub fn epochs(&self) -> usize {
        self.train_loss.len()
    }

    fn push(&mut self, metrics: EpochMetrics) {
        self.learning_rates.push(metrics.learning_rate);
        self.train_loss.push(metrics.train_loss);
        self.train_accuracy.push(metrics.train_accuracy);
        self.val_loss.push(metrics.val_loss);
        self.val_accuracy.push(metrics.val_accuracy);
        self.test_loss.push(metrics.test_loss);
        self.test_accuracy.push(metrics.test_accuracy);
    }

    /// Metrics of the most recent epoch.
    pub fn last(&self) -> Option<EpochMetrics> {
        let i = self.epochs().checked_sub(1)?;
        Some(EpochMetrics {
            learning_rate: self.learning_rates[i],
            train_loss: self.train_loss[i],
            train_accuracy: self.train_accuracy[i],
            val_loss: self.val_loss[i],
            val_accuracy: self.val_accuracy[i],
            test_loss: self.test_loss[i],
            test_accuracy: self.test_accuracy[i],
        })
    }
}

// First index of the largest value
fn argmax(column: ArrayView1<'_, f32>) -> usize {
    let mut best = 0;
    for (i, &v) in column.iter().enumerate() {
        if v > column[best] {
            best = i;
        }
    }
    best
}

/// Drives a [`Cnn`] through a piecewise learning-rate schedule.
///
/// # Example
///
/// ```no_run
/// use cnn_sgd::config::load_config;
/// use cnn_sgd::{Cnn, DataSplits, Trainer};
///
/// # fn splits() -> DataSplits { unimplemented!() }
/// let config = load_config("config/cifar10.json").unwrap();
/// let model = Cnn::new(&config.model).unwrap();
/// let mut trainer = Trainer::new(model, &config).unwrap();
/// let history = trainer.train(&splits()).unwrap();
/// println!("final val accuracy: {:?}", history.val_accuracy.last());
/// ```
#[derive(Debug)]
pub struct Trainer {
    model: Cnn,
    batch_size: usize,
    schedule: PiecewiseSchedule,
    history: MetricsHistory,
    rng: StdRng,
    log_every: usize,
}

impl Trainer {
    pub fn new(model: Cnn, config: &TrainingConfig) -> Result<Self> {
        config.validate()?;
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Ok(Self {
            model,
            batch_size: config.batch_size,
            schedule: PiecewiseSchedule::new(config.initial_lr, config.lr_schedule.clone()),
            history: MetricsHistory::default(),
            rng,
            log_every: config.log_every,
        })
    }

    pub fn model(&self) -> &Cnn {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut Cnn {
        &mut self.model
    }

    pub fn into_model(self) -> Cnn {
        self.model
    }

    pub fn history(&self) -> &MetricsHistory {
        &self.history
    }

    pub fn schedule(&self) -> &PiecewiseSchedule {
        &self.schedule
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Fraction of columns whose argmax matches the argmax of the one-hot target.
    pub fn compute_accuracy(outputs: &Array2<f32>, targets: &Array2<f32>) -> Result<f32> {
        if outputs.shape() != targets.shape() {
            return Err(NetworkError::shape(
                "accuracy",
                targets.shape(),
                outputs.shape(),
            ));
        }
        let n = outputs.ncols();
        if n == 0 {
            return Err(NetworkError::InvalidData(
                "accuracy of an empty batch".to_string(),
            ));
        }
        let correct = outputs
            .columns()
            .into_iter()
            .zip(targets.columns())
            .filter(|(o, t)| argmax(o.view()) == argmax(t.view()))
            .count();
        Ok(correct as f32 / n as f32)
    }

    /// Runs every scheduled epoch and returns the metric history of this run.
    ///
    /// All three splits are normalized with the per-channel mean and std of
    /// the training images; validation and test data never contribute to
    /// those statistics.
    pub fn train(&mut self, data: &DataSplits) -> Result<&MetricsHistory> {
        data.validate()?;
        let stats = ChannelStats::from_batch(&data.x_train)?;
        let x_train = stats.normalize(&data.x_train)?;
        let x_val = stats.normalize(&data.x_val)?;
        let x_test = stats.normalize(&data.x_test)?;

        self.history = MetricsHistory::default();
        self.schedule.reset();
        let total_epochs = self.schedule.total_epochs();
        let mut current_phase = None;

        while !self.schedule.is_finished() {
            let lr = self.schedule.get_lr();
            let phase = self.schedule.phase_index();
            if phase != current_phase {
                log::info!("starting training with learning rate {lr}");
                current_phase = phase;
            }
            let epoch = self.schedule.current_epoch() + 1;
            log::info!("epoch {epoch}/{total_epochs}");

            let (train_loss, train_accuracy) = self.train_epoch(&x_train, &data.y_train, lr)?;
            let (val_loss, val_accuracy) = self.evaluate(&x_val, &data.y_val)?;
            let (test_loss, test_accuracy) = self.evaluate(&x_test, &data.y_test)?;

            log::info!(
                "epoch {epoch} summary: train loss {train_loss:.4}, accuracy {train_accuracy:.4}; \
                 val loss {val_loss:.4}, accuracy {val_accuracy:.4}; \
                 test loss {test_loss:.4}, accuracy {test_accuracy:.4}"
            );
            self.history.push(EpochMetrics {
                learning_rate: lr,
                train_loss,
                train_accuracy,
                val_loss,
                val_accuracy,
                test_loss,
                test_accuracy,
            });
            self.schedule.step();
        }
        Ok(&self.history)
    }

    /// One shuffled pass over `(x, y)` with learning rate `lr`.
    ///
    /// Images and label columns are permuted together. A trailing partial
    /// batch is dropped. Returns the mean batch loss and accuracy.
    pub fn train_epoch(&mut self, x: &Array4<f32>, y: &Array2<f32>, lr: f32) -> Result<(f32, f32)> {
        let m = x.dim().0;
        if y.ncols() != m {
            return Err(NetworkError::shape("training labels", &[y.nrows(), m], y.shape()));
        }
        let num_batches = m / self.batch_size;
        if num_batches == 0 {
            return Err(NetworkError::InvalidData(format!(
                "{m} training samples cannot fill a batch of {}",
                self.batch_size
            )));
        }

        let mut indices: Vec<usize> = (0..m).collect();
        indices.shuffle(&mut self.rng);
        let x_shuffled = x.select(Axis(0), &indices);
        let y_shuffled = y.select(Axis(1), &indices);

        let mut total_loss = 0.0;
        let mut total_accuracy = 0.0;
        for j in 0..num_batches {
            let start = j * self.batch_size;
            let end = start + self.batch_size;
            let batch_x = x_shuffled.slice(s![start..end, .., .., ..]).to_owned();
            let batch_y = y_shuffled.slice(s![.., start..end]).to_owned();

            let output = self.model.forward(&batch_x, true)?;
            let loss = self.model.compute_loss(&output, &batch_y)?;
            let accuracy = Self::compute_accuracy(&output, &batch_y)?;
            let grads = self.model.backward(&batch_y)?;
            self.model.update_parameters(&grads, lr)?;

            total_loss += loss;
            total_accuracy += accuracy;
            if self.log_every > 0 && (j + 1) % self.log_every == 0 {
                log::debug!(
                    "batch {}/{num_batches}: loss {loss:.4}, accuracy {accuracy:.4}",
                    j + 1
                );
            }
        }

        let batches = num_batches as f32;
        Ok((total_loss / batches, total_accuracy / batches))
    }

    /// Inference-mode loss and accuracy on `(x, y)`; parameters and
    /// batch-norm running statistics are left unchanged.
    pub fn evaluate(&mut self, x: &Array4<f32>, y: &Array2<f32>) -> Result<(f32, f32)> {
        let output = self.model.forward(x, false)?;
        let loss = self.model.compute_loss(&output, y)?;
        let accuracy = Self::compute_accuracy(&output, y)?;
        Ok((loss, accuracy))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModelConfig, SchedulePhase};
    use ndarray::array;

    fn tiny_config() -> TrainingConfig {
        TrainingConfig {
            initial_lr: 0.01,
            batch_size: 2,
            lr_schedule: vec![SchedulePhase::new(1, 1.0), SchedulePhase::new(1, 0.5)],
            log_every: 1,
            seed: Some(5),
            model: ModelConfig {
                image_size: 8,
                conv_channels: [2, 2, 2],
                hidden_units: 4,
                num_classes: 2,
                seed: Some(5),
                ..ModelConfig::default()
            },
        }
    }

    fn split(n: usize, offset: usize) -> (Array4<f32>, Array2<f32>) {
        let x = Array4::from_shape_fn((n, 3, 8, 8), |(b, c, i, j)| {
            (((b + offset) * 5 + c * 3 + i * j) % 7) as f32
        });
        let y = Array2::from_shape_fn((2, n), |(k, b)| if k == (b + offset) % 2 { 1.0 } else { 0.0 });
        (x, y)
    }

    #[test]
    fn test_compute_accuracy() {
        let outputs = array![[0.9f32, 0.2, 0.5], [0.1, 0.8, 0.5]];
        let targets = array![[1.0f32, 1.0, 0.0], [0.0, 0.0, 1.0]];
        // Third column ties and resolves to class 0
        let accuracy = Trainer::compute_accuracy(&outputs, &targets).unwrap();
        assert!((accuracy - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_compute_accuracy_shape_mismatch() {
        let outputs = Array2::<f32>::zeros((2, 3));
        let targets = Array2::<f32>::zeros((2, 2));
        assert!(Trainer::compute_accuracy(&outputs, &targets).is_err());
    }

    #[test]
    fn test_data_splits_reject_label_count_mismatch() {
        let (x, _) = split(4, 0);
        let (_, y) = split(3, 0);
        let result = DataSplits::new((x, y), split(2, 1), split(2, 2));
        assert!(matches!(result, Err(NetworkError::InvalidData(_))));
    }

    #[test]
    fn test_train_records_one_entry_per_epoch() {
        let model = Cnn::new(&tiny_config().model).unwrap();
        let mut trainer = Trainer::new(model, &tiny_config()).unwrap();
        let data = DataSplits::new(split(5, 0), split(2, 1), split(2, 2)).unwrap();

        let history = trainer.train(&data).unwrap();

        assert_eq!(history.epochs(), 2);
        assert_eq!(history.test_accuracy.len(), 2);
        assert!((history.learning_rates[0] - 0.01).abs() < 1e-8);
        assert!((history.learning_rates[1] - 0.005).abs() < 1e-8);
        assert!(history.train_loss.iter().all(|l| l.is_finite()));
        assert!(trainer.schedule().is_finished());
    }

    #[test]
    fn test_history_serializes_to_json() {
        let model = Cnn::new(&tiny_config().model).unwrap();
        let mut trainer = Trainer::new(model, &tiny_config()).unwrap();
        let data = DataSplits::new(split(4, 0), split(2, 1), split(2, 2)).unwrap();
        let history = trainer.train(&data).unwrap().clone();

        let json = serde_json::to_string(&history).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["train_loss"].as_array().unwrap().len(), 2);
        assert_eq!(value["learning_rates"].as_array().unwrap().len(), 2);

        let restored: MetricsHistory = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, history);

        let last = history.last().unwrap();
        let restored_last: EpochMetrics =
            serde_json::from_str(&serde_json::to_string(&last).unwrap()).unwrap();
        assert_eq!(restored_last, last);
    }

    #[test]
    fn test_train_epoch_needs_a_full_batch() {
        let config = TrainingConfig {
            batch_size: 8,
            ..tiny_config()
        };
        let model = Cnn::new(&config.model).unwrap();
        let mut trainer = Trainer::new(model, &config).unwrap();
        let (x, y) = split(5, 0);
        assert!(matches!(
            trainer.train_epoch(&x, &y, 0.01),
            Err(NetworkError::InvalidData(_))
        ));
    }

    #[test]
    fn test_evaluate_does_not_touch_running_stats() {
        let model = Cnn::new(&tiny_config().model).unwrap();
        let mut trainer = Trainer::new(model, &tiny_config()).unwrap();
        let before = trainer.model().blocks()[0].bn().running_mean().clone();
        let (x, y) = split(3, 0);
        trainer.evaluate(&x, &y).unwrap();
        assert_eq!(trainer.model().blocks()[0].bn().running_mean(), &before);
    }
}
