//! Short-circuiting reconciliation pipelines.
//!
//! A [`Pipeline`] is an ordered list of [`Step`]s over a per-pass state. The
//! driver runs steps until one returns something other than
//! [`Flow::Continue`] and hands that flow to the manager, which turns it into
//! a requeue (optionally delayed) or forgets the key.

mod load;
mod status;
mod steps;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use stratus_api::{Resource, RecordStore, Scope};
use tracing::debug;

use crate::context::ControlContext;
use crate::error::Result;

pub use load::{Loaded, load_with_fallback};
pub use status::{StatusPatch, set_error};
pub use steps::{AddFinalizer, PollOperation, RemoveFinalizer};

/// What the driver does after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Run the next step.
    Continue,
    /// Stop and requeue with the manager's backoff.
    Requeue,
    /// Stop and requeue after the given delay.
    RequeueAfter(Duration),
    /// Stop; wait for the next external change.
    Forget,
}

impl Flow {
    pub fn is_continue(&self) -> bool {
        matches!(self, Flow::Continue)
    }
}

/// Per-pass state every pipeline state exposes to the shared steps.
pub trait ReconcileState: Send + Sync {
    type Record: Resource;

    fn record(&self) -> &Self::Record;
    fn record_mut(&mut self) -> &mut Self::Record;
    fn store(&self) -> &Arc<dyn RecordStore<Self::Record>>;
    fn ctx(&self) -> &ControlContext;
    fn scope(&self) -> &Scope;

    fn is_deleting(&self) -> bool {
        self.record().meta().is_marked_for_deletion()
    }
}

/// One step of a pipeline.
#[async_trait]
pub trait Step<S: Send>: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, state: &mut S) -> Result<Flow>;
}

/// A step written as a plain function returning a boxed future.
pub type StepFn<S> = for<'a> fn(&'a mut S) -> BoxFuture<'a, Result<Flow>>;

struct FnStep<S> {
    name: &'static str,
    f: StepFn<S>,
}

#[async_trait]
impl<S: Send + 'static> Step<S> for FnStep<S> {
    fn name(&self) -> &str {
        self.name
    }

    async fn run(&self, state: &mut S) -> Result<Flow> {
        (self.f)(state).await
    }
}

/// Runs `then` when the predicate holds, `otherwise` when it does not.
struct Branch<S> {
    name: &'static str,
    predicate: fn(&S) -> bool,
    then: Pipeline<S>,
    otherwise: Pipeline<S>,
}

#[async_trait]
impl<S: Send + Sync + 'static> Step<S> for Branch<S> {
    fn name(&self) -> &str {
        self.name
    }

    async fn run(&self, state: &mut S) -> Result<Flow> {
        if (self.predicate)(state) {
            self.then.run(state).await
        } else {
            self.otherwise.run(state).await
        }
    }
}

/// Ordered steps over state `S`.
pub struct Pipeline<S> {
    name: &'static str,
    steps: Vec<Box<dyn Step<S>>>,
}

impl<S: Send + Sync + 'static> Pipeline<S> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            steps: Vec::new(),
        }
    }

    pub fn step(mut self, step: impl Step<S> + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    pub fn then(self, name: &'static str, f: StepFn<S>) -> Self {
        self.step(FnStep { name, f })
    }

    pub fn branch(
        self,
        name: &'static str,
        predicate: fn(&S) -> bool,
        then: Pipeline<S>,
        otherwise: Pipeline<S>,
    ) -> Self {
        self.step(Branch {
            name,
            predicate,
            then,
            otherwise,
        })
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run until a step stops the pass. Running off the end is [`Flow::Continue`].
    pub async fn run(&self, state: &mut S) -> Result<Flow> {
        for step in &self.steps {
            let flow = step.run(state).await?;
            if !flow.is_continue() {
                debug!("{}: stopped at {} with {:?}", self.name, step.name(), flow);
                return Ok(flow);
            }
        }
        Ok(Flow::Continue)
    }
}

#[async_trait]
impl<S: Send + Sync + 'static> Step<S> for Pipeline<S> {
    fn name(&self) -> &str {
        self.name
    }

    async fn run(&self, state: &mut S) -> Result<Flow> {
        Pipeline::run(self, state).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    #[derive(Default)]
    struct Trace {
        visited: Vec<&'static str>,
        flag: bool,
    }

    async fn first(state: &mut Trace) -> Result<Flow> {
        state.visited.push("first");
        Ok(Flow::Continue)
    }

    async fn stop(state: &mut Trace) -> Result<Flow> {
        state.visited.push("stop");
        Ok(Flow::RequeueAfter(Duration::from_millis(5)))
    }

    async fn never(state: &mut Trace) -> Result<Flow> {
        state.visited.push("never");
        Ok(Flow::Continue)
    }

    async fn yes(state: &mut Trace) -> Result<Flow> {
        state.visited.push("yes");
        Ok(Flow::Forget)
    }

    async fn no(state: &mut Trace) -> Result<Flow> {
        state.visited.push("no");
        Ok(Flow::Forget)
    }

    #[tokio::test]
    async fn test_pipeline_short_circuits() {
        let pipeline = Pipeline::<Trace>::new("test")
            .then("first", |s| first(s).boxed())
            .then("stop", |s| stop(s).boxed())
            .then("never", |s| never(s).boxed());
        let mut state = Trace::default();

        let flow = pipeline.run(&mut state).await.unwrap();
        assert_eq!(flow, Flow::RequeueAfter(Duration::from_millis(5)));
        assert_eq!(state.visited, vec!["first", "stop"]);
    }

    #[tokio::test]
    async fn test_running_off_the_end_continues() {
        let pipeline = Pipeline::<Trace>::new("test").then("first", |s| first(s).boxed());
        let mut state = Trace::default();
        assert_eq!(pipeline.run(&mut state).await.unwrap(), Flow::Continue);
        assert_eq!(pipeline.len(), 1);
    }

    #[tokio::test]
    async fn test_branch_selects_by_predicate() {
        let pipeline = Pipeline::<Trace>::new("test")
            .then("first", |s| first(s).boxed())
            .branch(
                "flag",
                |s: &Trace| s.flag,
                Pipeline::new("yes").then("yes", |s| yes(s).boxed()),
                Pipeline::new("no").then("no", |s| no(s).boxed()),
            );

        let mut state = Trace::default();
        pipeline.run(&mut state).await.unwrap();
        assert_eq!(state.visited, vec!["first", "no"]);

        let mut state = Trace {
            flag: true,
            ..Default::default()
        };
        pipeline.run(&mut state).await.unwrap();
        assert_eq!(state.visited, vec!["first", "yes"]);
    }
}
