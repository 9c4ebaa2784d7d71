//! Steps with rollback.
//!
//! An operation is organized as a pipeline of steps. See [`Step`] and [`Pipeline`].
//! When a step fails, every step that already completed is rolled back in reverse
//! order, so resources acquired by the pipeline are released on every exit path.

use log::{debug, warn};

use crate::{Error, Result};

/// Step in the pipeline.
pub trait Step<Ctx> {
    /// Short name for logs and errors.
    fn name(&self) -> &'static str;

    /// Run step.
    fn run(&mut self, ctx: &mut Ctx) -> Result<()>;

    /// Undo a successful [`Step::run`].
    fn rollback(&mut self, _ctx: &mut Ctx) -> Result<()> {
        Ok(())
    }
}

/// Steps of the pipeline.
pub type Steps<Ctx> = Vec<Box<dyn Step<Ctx>>>;

/// Failed pipeline run.
#[derive(Debug)]
pub struct PipelineFailure {
    /// Name of the failed step.
    pub step: &'static str,

    /// Error of the failed step.
    pub error: Error,

    /// Errors of rollbacks that did not succeed.
    pub rollback_errors: Vec<Error>,
}

impl PipelineFailure {
    /// Step error, or `ResidueError` if something could not be rolled back.
    pub fn into_error(self) -> Error {
        if self.rollback_errors.is_empty() {
            return self.error;
        }
        let residue = self
            .rollback_errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        Error::residue(format!(
            "{} failed ({}); rollback incomplete: {}",
            self.step, self.error, residue
        ))
    }
}

/// Direct pipeline, running step in order of appearance.
pub struct Pipeline<'ctx, Ctx> {
    ctx: &'ctx mut Ctx,
    steps: Steps<Ctx>,
}

impl<'ctx, Ctx> Pipeline<'ctx, Ctx> {
    /// Create new pipeline with given context.
    pub fn from_ctx(ctx: &'ctx mut Ctx) -> Self {
        Self {
            ctx,
            steps: Vec::new(),
        }
    }

    /// Add step to the end of pipeline.
    pub fn add_step(&mut self, step: Box<dyn Step<Ctx>>) {
        self.steps.push(step);
    }

    /// Add steps to the end of pipeline.
    pub fn add_steps<I>(&mut self, steps: I)
    where
        I: IntoIterator<Item = Box<dyn Step<Ctx>>>,
    {
        for step in steps.into_iter() {
            self.add_step(step);
        }
    }

    /// Create new pipeline with given context and steps.
    pub fn from_steps<I>(ctx: &'ctx mut Ctx, steps: I) -> Self
    where
        I: IntoIterator<Item = Box<dyn Step<Ctx>>>,
    {
        let mut pipeline = Self::from_ctx(ctx);
        pipeline.add_steps(steps);
        pipeline
    }

    /// Run pipeline. On failure completed steps are rolled back.
    pub fn run(self) -> Result<(), PipelineFailure> {
        let ctx = self.ctx;
        let mut done: Steps<Ctx> = Vec::new();
        for mut step in self.steps {
            debug!("step: {}", step.name());
            match step.run(ctx) {
                Ok(()) => done.push(step),
                Err(error) => {
                    warn!("step {} failed: {}", step.name(), error);
                    let mut rollback_errors = Vec::new();
                    for mut completed in done.into_iter().rev() {
                        debug!("rollback: {}", completed.name());
                        if let Err(e) = completed.rollback(ctx) {
                            warn!("rollback of {} failed: {}", completed.name(), e);
                            rollback_errors.push(e);
                        }
                    }
                    return Err(PipelineFailure {
                        step: step.name(),
                        error,
                        rollback_errors,
                    });
                }
            }
        }
        Ok(())
    }
}
