//! Status patch builder.

use std::fmt::Display;

use stratus_api::{
    Condition, ConditionType, OperationHandle, Phase, Resource, ResourceStatus, StoreError,
};
use tracing::{debug, warn};

use super::{Flow, ReconcileState};
use crate::error::Result;

type StatusOf<S> = <<S as ReconcileState>::Record as Resource>::Status;

/// Collects status edits for one record and writes them in a single patch.
///
/// The write is skipped when the status did not change, so converged passes
/// do not produce store events.
pub struct StatusPatch<'s, S: ReconcileState> {
    state: &'s mut S,
    before: StatusOf<S>,
    flow: Flow,
    error: Option<String>,
}

impl<'s, S: ReconcileState> StatusPatch<'s, S> {
    pub fn new(state: &'s mut S) -> Self {
        let before = state.record().status().clone();
        Self {
            state,
            before,
            flow: Flow::Continue,
            error: None,
        }
    }

    fn status(&mut self) -> &mut StatusOf<S> {
        self.state.record_mut().status_mut()
    }

    pub fn phase(mut self, phase: Phase) -> Self {
        self.status().set_phase(phase);
        self
    }

    pub fn operation(mut self, operation: Option<OperationHandle>) -> Self {
        self.status().set_operation(operation);
        self
    }

    /// Replace all conditions with `condition`.
    pub fn exclusive(mut self, condition: Condition) -> Self {
        Condition::set_exclusive(self.status().conditions_mut(), condition);
        self
    }

    pub fn remove_condition(mut self, type_: ConditionType, reason: &str) -> Self {
        Condition::remove_if_reason(self.status().conditions_mut(), type_, reason);
        self
    }

    /// Edit kind-specific status fields.
    pub fn update(mut self, f: impl FnOnce(&mut StatusOf<S>)) -> Self {
        f(self.status());
        self
    }

    /// Flow returned after a successful write.
    pub fn flow(mut self, flow: Flow) -> Self {
        self.flow = flow;
        self
    }

    /// Logged at warn level when the patch is applied.
    pub fn log_error(mut self, error: impl Display) -> Self {
        self.error = Some(error.to_string());
        self
    }

    pub async fn apply(self) -> Result<Flow> {
        let name = self.state.record().name().to_string();
        let kind = <S::Record as Resource>::KIND;
        if let Some(error) = &self.error {
            warn!("{} {}: {}", kind, name, error);
        }

        let status = self.state.record().status().clone();
        if status == self.before {
            return Ok(self.flow);
        }

        match self.state.store().patch_status(&name, status).await {
            Ok(updated) => {
                debug!("{} {}: status patched, phase {}", kind, name, updated.status().phase());
                *self.state.record_mut() = updated;
                Ok(self.flow)
            }
            Err(StoreError::NotFound(_)) => {
                debug!("{} {}: gone before status patch", kind, name);
                Ok(Flow::Forget)
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Set phase Error with an exclusive Error condition and stop with `flow`.
pub async fn set_error<S: ReconcileState>(
    state: &mut S,
    reason: &str,
    message: impl Into<String>,
    flow: Flow,
) -> Result<Flow> {
    let message = message.into();
    StatusPatch::new(state)
        .phase(Phase::Error)
        .exclusive(Condition::error(reason, message.clone()))
        .log_error(format!("{}: {}", reason, message))
        .flow(flow)
        .apply()
        .await
}
