//! Lifecycle hooks: the external collaborator interface.
//!
//! Hooks observe the run and may abort it. Every callback defaults to
//! continue, so implementors override only what they watch. A
//! [`CompositeHooks`] fans out to several implementations and aborts when
//! any one does.

use async_trait::async_trait;
use serde_json::Value;

/// What a hook wants the runner to do next.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum HookAction {
    #[default]
    Continue,
    Abort,
}

impl HookAction {
    #[must_use]
    pub fn is_abort(&self) -> bool {
        matches!(self, HookAction::Abort)
    }
}

/// Observer interface for cascade execution.
#[allow(unused_variables)]
#[async_trait]
pub trait CascadeHooks: Send + Sync {
    async fn on_cascade_start(
        &self,
        cascade_id: &str,
        session_id: &str,
        input: &Value,
    ) -> HookAction {
        HookAction::Continue
    }

    async fn on_cascade_complete(
        &self,
        cascade_id: &str,
        session_id: &str,
        result: &Value,
    ) -> HookAction {
        HookAction::Continue
    }

    async fn on_cascade_error(
        &self,
        cascade_id: &str,
        session_id: &str,
        error: &str,
    ) -> HookAction {
        HookAction::Continue
    }

    async fn on_cell_start(&self, cell_name: &str, session_id: &str) -> HookAction {
        HookAction::Continue
    }

    async fn on_cell_complete(
        &self,
        cell_name: &str,
        session_id: &str,
        output: &Value,
    ) -> HookAction {
        HookAction::Continue
    }

    async fn on_turn_start(&self, cell_name: &str, session_id: &str, turn: u32) -> HookAction {
        HookAction::Continue
    }

    async fn on_tool_call(
        &self,
        tool_name: &str,
        cell_name: &str,
        session_id: &str,
        args: &Value,
    ) -> HookAction {
        HookAction::Continue
    }

    async fn on_tool_result(
        &self,
        tool_name: &str,
        cell_name: &str,
        session_id: &str,
        result: &Value,
    ) -> HookAction {
        HookAction::Continue
    }

    async fn on_checkpoint_suspended(
        &self,
        session_id: &str,
        checkpoint_id: &str,
        kind: &str,
        payload: &Value,
    ) -> HookAction {
        HookAction::Continue
    }

    async fn on_checkpoint_resumed(
        &self,
        session_id: &str,
        checkpoint_id: &str,
        cell_name: &str,
        response: &Value,
    ) -> HookAction {
        HookAction::Continue
    }
}

/// No-op hooks, the default.
pub struct NoHooks;

#[async_trait]
impl CascadeHooks for NoHooks {}

/// Fan-out over several hook implementations; first abort wins.
pub struct CompositeHooks {
    hooks: Vec<Box<dyn CascadeHooks>>,
}

impl CompositeHooks {
    #[must_use]
    pub fn new(hooks: Vec<Box<dyn CascadeHooks>>) -> Self {
        Self { hooks }
    }
}

macro_rules! fan_out {
    ($self:ident, $method:ident, $($arg:expr),*) => {{
        for hook in &$self.hooks {
            if hook.$method($($arg),*).await.is_abort() {
                return HookAction::Abort;
            }
        }
        HookAction::Continue
    }};
}

#[async_trait]
impl CascadeHooks for CompositeHooks {
    async fn on_cascade_start(
        &self,
        cascade_id: &str,
        session_id: &str,
        input: &Value,
    ) -> HookAction {
        fan_out!(self, on_cascade_start, cascade_id, session_id, input)
    }

    async fn on_cascade_complete(
        &self,
        cascade_id: &str,
        session_id: &str,
        result: &Value,
    ) -> HookAction {
        fan_out!(self, on_cascade_complete, cascade_id, session_id, result)
    }

    async fn on_cascade_error(
        &self,
        cascade_id: &str,
        session_id: &str,
        error: &str,
    ) -> HookAction {
        fan_out!(self, on_cascade_error, cascade_id, session_id, error)
    }

    async fn on_cell_start(&self, cell_name: &str, session_id: &str) -> HookAction {
        fan_out!(self, on_cell_start, cell_name, session_id)
    }

    async fn on_cell_complete(
        &self,
        cell_name: &str,
        session_id: &str,
        output: &Value,
    ) -> HookAction {
        fan_out!(self, on_cell_complete, cell_name, session_id, output)
    }

    async fn on_turn_start(&self, cell_name: &str, session_id: &str, turn: u32) -> HookAction {
        fan_out!(self, on_turn_start, cell_name, session_id, turn)
    }

    async fn on_tool_call(
        &self,
        tool_name: &str,
        cell_name: &str,
        session_id: &str,
        args: &Value,
    ) -> HookAction {
        fan_out!(self, on_tool_call, tool_name, cell_name, session_id, args)
    }

    async fn on_tool_result(
        &self,
        tool_name: &str,
        cell_name: &str,
        session_id: &str,
        result: &Value,
    ) -> HookAction {
        fan_out!(self, on_tool_result, tool_name, cell_name, session_id, result)
    }

    async fn on_checkpoint_suspended(
        &self,
        session_id: &str,
        checkpoint_id: &str,
        kind: &str,
        payload: &Value,
    ) -> HookAction {
        fan_out!(
            self,
            on_checkpoint_suspended,
            session_id,
            checkpoint_id,
            kind,
            payload
        )
    }

    async fn on_checkpoint_resumed(
        &self,
        session_id: &str,
        checkpoint_id: &str,
        cell_name: &str,
        response: &Value,
    ) -> HookAction {
        fan_out!(
            self,
            on_checkpoint_resumed,
            session_id,
            checkpoint_id,
            cell_name,
            response
        )
    }
}
