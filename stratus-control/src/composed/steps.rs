//! Steps shared by every kind's pipeline.

use std::marker::PhantomData;

use async_trait::async_trait;
use stratus_api::{Condition, FINALIZER, Phase, Resource, ResourceStatus, reason};
use tracing::{debug, info};

use super::{Flow, ReconcileState, StatusPatch, Step, set_error};
use crate::error::Result;
use crate::poller::PollResult;

/// Adds the deletion finalizer unless the record is already being deleted.
pub struct AddFinalizer<S>(PhantomData<fn(S)>);

impl<S> Default for AddFinalizer<S> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

#[async_trait]
impl<S: ReconcileState + 'static> Step<S> for AddFinalizer<S> {
    fn name(&self) -> &str {
        "add_finalizer"
    }

    async fn run(&self, state: &mut S) -> Result<Flow> {
        if state.is_deleting() || state.record().meta().has_finalizer(FINALIZER) {
            return Ok(Flow::Continue);
        }

        let name = state.record().name().to_string();
        let updated = state.store().add_finalizer(&name, FINALIZER).await?;
        let kind = <S::Record as Resource>::KIND;
        debug!("{} {}: finalizer added", kind, name);
        *state.record_mut() = updated;
        Ok(Flow::Continue)
    }
}

/// Removes the deletion finalizer and ends the pass.
pub struct RemoveFinalizer<S>(PhantomData<fn(S)>);

impl<S> Default for RemoveFinalizer<S> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

#[async_trait]
impl<S: ReconcileState + 'static> Step<S> for RemoveFinalizer<S> {
    fn name(&self) -> &str {
        "remove_finalizer"
    }

    async fn run(&self, state: &mut S) -> Result<Flow> {
        if !state.record().meta().has_finalizer(FINALIZER) {
            return Ok(Flow::Forget);
        }

        let name = state.record().name().to_string();
        if let Some(updated) = state.store().remove_finalizer(&name, FINALIZER).await? {
            *state.record_mut() = updated;
        }
        let kind = <S::Record as Resource>::KIND;
        info!("{} {}: cleanup finished, finalizer removed", kind, name);
        Ok(Flow::Forget)
    }
}

/// Polls the outstanding operation, if any.
///
/// Running requeues after the retry wait. A failed operation clears the
/// handle and surfaces the provider message. Done clears the handle and
/// continues.
pub struct PollOperation<S>(PhantomData<fn(S)>);

impl<S> Default for PollOperation<S> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

#[async_trait]
impl<S: ReconcileState + 'static> Step<S> for PollOperation<S> {
    fn name(&self) -> &str {
        "poll_operation"
    }

    async fn run(&self, state: &mut S) -> Result<Flow> {
        let Some(handle) = state.record().status().operation().cloned() else {
            return Ok(Flow::Continue);
        };
        let retry_wait = state.ctx().config.retry_wait;

        let polled = state.ctx().poller.poll(state.scope(), &handle).await;
        match polled {
            Err(err) => {
                let message =
                    format!("Error polling {} operation {}: {}", handle.kind, handle.id, err);
                let flow = Flow::RequeueAfter(retry_wait);
                set_error(state, reason::PROVIDER_ERROR, message, flow).await
            }
            Ok(PollResult::Running) => {
                let kind = <S::Record as Resource>::KIND;
                let name = state.record().name();
                debug!("{} {}: operation {} still running", kind, name, handle.id);
                Ok(Flow::RequeueAfter(retry_wait))
            }
            Ok(PollResult::Failed(message)) => {
                StatusPatch::new(state)
                    .operation(None)
                    .phase(Phase::Error)
                    .exclusive(Condition::error(reason::PROVIDER_ERROR, message.clone()))
                    .log_error(format!("operation {} failed: {}", handle.id, message))
                    .flow(Flow::Requeue)
                    .apply()
                    .await
            }
            Ok(PollResult::Done) | Ok(PollResult::NotFound) => {
                StatusPatch::new(state)
                    .operation(None)
                    .flow(Flow::Continue)
                    .apply()
                    .await
            }
        }
    }
}
