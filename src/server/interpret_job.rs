//! The job body behind every `interpret` call

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::interpreter::{InterpreterContext, InterpreterHookRegistry, InterpreterResult, ManagedInterpreter};
use crate::scheduler::JobBody;

/// Runs one paragraph: open the interpreter if needed, wrap the script in
/// its hooks, interpret, and fold buffered output into the result.
pub(crate) struct InterpretJob {
    interpreter: Arc<ManagedInterpreter>,
    hooks: Arc<InterpreterHookRegistry>,
    script: String,
    context: InterpreterContext,
}

impl InterpretJob {
    pub(crate) fn new(
        interpreter: Arc<ManagedInterpreter>,
        hooks: Arc<InterpreterHookRegistry>,
        script: impl Into<String>,
        context: InterpreterContext,
    ) -> Self {
        Self {
            interpreter,
            hooks,
            script: script.into(),
            context,
        }
    }

    async fn execute(&self, ctx: &InterpreterContext) -> Result<InterpreterResult> {
        ctx.out.clear();
        self.interpreter.open().await?;

        let script = self
            .hooks
            .apply(&ctx.note_id, self.interpreter.class_name(), &self.script);
        let mut result = self.interpreter.interpreter().interpret(&script, ctx).await?;

        let mut messages = ctx.out.messages();
        messages.append(&mut result.messages);
        messages.retain(|m| !m.is_blank());
        result.messages = messages;

        if let Some(name) = ctx.save_as() {
            let value = match result.messages.as_slice() {
                [only] => Value::String(only.data.clone()),
                many => Value::Array(many.iter().map(|m| Value::String(m.data.clone())).collect()),
            };
            tracing::debug!(paragraph = %ctx.paragraph_id, "Saving result as resource {}", name);
            ctx.resource_pool.put(None, None, name, value);
        }

        Ok(result)
    }
}

#[async_trait]
impl JobBody for InterpretJob {
    async fn run(&self, cancel: CancellationToken) -> Result<InterpreterResult> {
        let ctx = self.context.clone().with_cancellation(cancel);
        match self.execute(&ctx).await {
            Ok(result) => Ok(result),
            Err(e) => {
                tracing::warn!(paragraph = %ctx.paragraph_id, "Interpret failed: {}", e);
                Ok(InterpreterResult::error(e.to_string()))
            }
        }
    }

    async fn on_abort(&self) {
        if let Err(e) = self.interpreter.interpreter().cancel(&self.context).await {
            tracing::warn!(
                paragraph = %self.context.paragraph_id,
                "Interpreter {} failed to cancel: {}",
                self.interpreter.class_name(),
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::{
        HookEvent, InterpreterContext, RemoteContext, ResultCode, SAVE_AS_PROPERTY, ShellInterpreter,
    };
    use std::collections::HashMap;

    fn shell() -> Arc<ManagedInterpreter> {
        Arc::new(ManagedInterpreter::new(
            Arc::new(ShellInterpreter::new(&HashMap::new())),
            "note1",
            "user",
            4,
        ))
    }

    #[tokio::test]
    async fn output_is_prepended_and_blanks_dropped() {
        let interpreter = shell();
        let hooks = Arc::new(InterpreterHookRegistry::new());
        hooks.register(None, "sh", HookEvent::PreExec, "echo before");
        let ctx = InterpreterContext::standalone(RemoteContext::new("note1", "p1"));

        let job = InterpretJob::new(interpreter.clone(), hooks, "echo body", ctx);
        let result = job.run(CancellationToken::new()).await.unwrap();

        assert_eq!(result.code, ResultCode::Success);
        assert_eq!(result.messages.len(), 1);
        assert_eq!(result.messages[0].data, "before\nbody\n");
        assert!(interpreter.is_open().await);
    }

    #[tokio::test]
    async fn save_as_publishes_result_text() {
        let remote = RemoteContext::new("note1", "p1").with_property(SAVE_AS_PROPERTY, "greeting");
        let ctx = InterpreterContext::standalone(remote);
        let pool = ctx.resource_pool.clone();

        let job = InterpretJob::new(shell(), Arc::new(InterpreterHookRegistry::new()), "echo hi", ctx);
        job.run(CancellationToken::new()).await.unwrap();

        let saved = pool.get(None, None, "greeting", true).await.unwrap().unwrap();
        assert_eq!(saved.value().as_json(), Some(Value::String("hi\n".to_string())));
    }

    #[tokio::test]
    async fn failures_become_error_results() {
        let ctx = InterpreterContext::standalone(RemoteContext::new("note1", "p1"));
        let job = InterpretJob::new(shell(), Arc::new(InterpreterHookRegistry::new()), "exit 2", ctx);
        let result = job.run(CancellationToken::new()).await.unwrap();
        assert_eq!(result.code, ResultCode::Error);
        assert!(result.text().contains("ExitValue: 2"));
    }
}
