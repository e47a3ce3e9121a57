use std::time::Instant;

use log::{debug, info};
use machine_learning::{
    MlErr,
    arch::{
        Mode, Model,
        loss::{BceWithLogits, LossFn},
    },
    dataset::BatchSource,
    optimization::{LrSchedule, Optimizer},
};

use crate::Result;

/// Persists the model at the end of every epoch.
pub trait Checkpointer<M: ?Sized> {
    fn save(&mut self, model: &mut M, epoch: usize) -> Result<()>;
}

/// Scores the model at the end of every epoch.
pub trait Evaluator<M: ?Sized> {
    /// # Returns
    /// The epoch's mean IoU, `None` if it is undefined.
    fn evaluate(&mut self, model: &mut M, epoch: usize) -> Result<Option<f32>>;
}

/// The phases of a run. Each holds the zero-based index of the epoch it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    AdvanceSchedule(usize),
    TrainBatches(usize),
    Checkpoint(usize),
    Evaluate(usize),
    Done,
}

/// Fine-tunes a model epoch by epoch: advance the learning rate schedule, train on every batch,
/// snapshot the model and score it.
pub struct Trainer<M, O, L> {
    model: M,
    optimizers: Vec<O>,
    schedule: L,
    loss: BceWithLogits,
    epochs: usize,
    log_every: usize,
    phase: Phase,
    history: Vec<Option<f32>>,
}

impl<M: Model, O: Optimizer, L: LrSchedule> Trainer<M, O, L> {
    /// Creates a new `Trainer` about to start the first epoch.
    ///
    /// # Arguments
    /// * `model` - The model to fine-tune.
    /// * `make_optimizer` - Builds the optimizer of a parameter tensor given its length.
    /// * `schedule` - The learning rate schedule, advanced once per epoch.
    /// * `epochs` - The amount of epochs of a run.
    /// * `log_every` - The loss is logged every this many iterations.
    pub fn new<F>(
        mut model: M,
        make_optimizer: F,
        schedule: L,
        epochs: usize,
        log_every: usize,
    ) -> Self
    where
        F: FnMut(usize) -> O,
    {
        let optimizers = model
            .params_mut()
            .into_iter()
            .map(|(_, param)| param.len())
            .map(make_optimizer)
            .collect();

        Self {
            model,
            optimizers,
            schedule,
            loss: BceWithLogits::new(),
            epochs,
            log_every: log_every.max(1),
            phase: Phase::AdvanceSchedule(0),
            history: Vec::new(),
        }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The mean IoU of every evaluated epoch, in order.
    pub fn history(&self) -> &[Option<f32>] {
        &self.history
    }

    /// Runs the current phase and moves on to the next one.
    ///
    /// # Arguments
    /// * `train` - The training batches.
    /// * `checkpointer` - Saves the model after an epoch's batches.
    /// * `evaluator` - Scores the model after it was saved.
    /// * `epochs` - The amount of epochs after which the run is done.
    ///
    /// # Returns
    /// The phase the trainer is in after the step.
    pub fn step<S, C, E>(
        &mut self,
        train: &mut S,
        checkpointer: &mut C,
        evaluator: &mut E,
        epochs: usize,
    ) -> Result<Phase>
    where
        S: BatchSource + ?Sized,
        C: Checkpointer<M> + ?Sized,
        E: Evaluator<M> + ?Sized,
    {
        self.phase = match self.phase {
            Phase::AdvanceSchedule(epoch) if epoch >= epochs => Phase::Done,
            Phase::AdvanceSchedule(epoch) => {
                self.advance_schedule();
                Phase::TrainBatches(epoch)
            }
            Phase::TrainBatches(epoch) => {
                self.train_epoch(epoch, train)?;
                Phase::Checkpoint(epoch)
            }
            Phase::Checkpoint(epoch) => {
                checkpointer.save(&mut self.model, epoch)?;
                Phase::Evaluate(epoch)
            }
            Phase::Evaluate(epoch) => {
                let score = evaluator.evaluate(&mut self.model, epoch)?;
                self.history.push(score);
                Phase::AdvanceSchedule(epoch + 1)
            }
            Phase::Done => Phase::Done,
        };

        Ok(self.phase)
    }

    /// Runs every remaining phase until the run is done.
    ///
    /// # Arguments
    /// * `num_epochs` - Overrides the configured amount of epochs for this invocation.
    pub fn run<S, C, E>(
        &mut self,
        train: &mut S,
        checkpointer: &mut C,
        evaluator: &mut E,
        num_epochs: Option<usize>,
    ) -> Result<()>
    where
        S: BatchSource + ?Sized,
        C: Checkpointer<M> + ?Sized,
        E: Evaluator<M> + ?Sized,
    {
        let epochs = num_epochs.unwrap_or(self.epochs);

        while self.step(train, checkpointer, evaluator, epochs)? != Phase::Done {}

        Ok(())
    }

    fn advance_schedule(&mut self) {
        let lr = self.schedule.step();

        for optimizer in &mut self.optimizers {
            optimizer.set_learning_rate(lr);
        }

        debug!("learning rate: {lr}");
    }

    fn train_epoch<S: BatchSource + ?Sized>(&mut self, epoch: usize, train: &mut S) -> Result<()> {
        let start = Instant::now();

        for (iter, batch) in train.batches().enumerate() {
            let batch = batch?;

            self.model.zero_grad();
            let out = self.model.forward(batch.x.view(), Mode::Train)?;
            let loss = self.loss.loss(out.view(), batch.y.view())?;
            let d = self.loss.loss_prime(out.view(), batch.y.view())?;
            self.model.backward(d.view())?;
            self.optimize()?;

            if iter % self.log_every == 0 {
                info!("epoch{epoch}, iter{iter}, loss: {loss}");
            }
        }

        info!(
            "Finish epoch {epoch}, time elapsed {:.2}s",
            start.elapsed().as_secs_f32()
        );

        Ok(())
    }

    fn optimize(&mut self) -> Result<()> {
        let params = self.model.params_mut();

        if params.len() != self.optimizers.len() {
            return Err(MlErr::SizeMismatch {
                what: "optimizers",
                got: self.optimizers.len(),
                expected: params.len(),
            }
            .into());
        }

        for ((_, param), optimizer) in params.into_iter().zip(&mut self.optimizers) {
            let (value, grad) = param.split_mut();
            optimizer.update_params(value, grad)?;
        }

        Ok(())
    }
}
