//! Embedded JavaScript sandbox for code steps
//!
//! Each evaluation gets a fresh QuickJS runtime with a memory limit, a stack
//! limit, and a wall-clock deadline enforced through the interrupt handler.
//! No host capabilities are installed: no clock beyond `Date` literals baked
//! into the source, no RNG seeding, no network, no filesystem. The only
//! extra global is a `console` stub whose lines are captured for
//! observability.
//!
//! The module source must export a default single-argument function; its
//! return value is round-tripped through JSON and becomes the step output.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use rquickjs::convert::Coerced;
use rquickjs::function::Rest;
use rquickjs::{CatchResultExt, Context, Function, Object, Runtime, Value as JsValue};
use tracing::debug;

use super::StepError;
use crate::config::EngineConfig;

const ENTRY_POINT: &str = "__durable_step_main";

/// Resource bounds for one evaluation
#[derive(Debug, Clone)]
pub struct SandboxLimits {
    pub memory_bytes: usize,
    pub stack_bytes: usize,
    pub deadline: std::time::Duration,
}

impl SandboxLimits {
    /// Bounds from the engine configuration
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            memory_bytes: config.sandbox_memory_bytes,
            stack_bytes: config.sandbox_stack_bytes,
            deadline: config.sandbox_deadline(),
        }
    }
}

/// Result of one evaluation
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxOutput {
    /// JSON value returned by the default export
    pub value: serde_json::Value,

    /// Captured `console` lines, in call order
    pub logs: Vec<String>,
}

/// Deterministic sandbox for code steps
///
/// The VM is created per invocation and torn down on return; nothing leaks
/// between steps or executions.
#[derive(Debug, Clone)]
pub struct CodeSandbox {
    limits: SandboxLimits,
}

impl CodeSandbox {
    /// Create a sandbox with the given bounds
    pub fn new(limits: SandboxLimits) -> Self {
        Self { limits }
    }

    /// Evaluate a code step
    ///
    /// Runs on the blocking pool; QuickJS evaluation is synchronous.
    pub async fn evaluate(
        &self,
        source: &str,
        input: serde_json::Value,
    ) -> Result<SandboxOutput, StepError> {
        let limits = self.limits.clone();
        let source = source.to_string();

        tokio::task::spawn_blocking(move || evaluate_blocking(&limits, &source, input))
            .await
            .map_err(|e| StepError::Sandbox(format!("sandbox task failed: {e}")))?
    }
}

/// Rewrite the module's default export into a well-known global
///
/// The sandbox evaluates plain scripts, so `export default` is turned into
/// an assignment the host can call afterwards.
fn rewrite_default_export(source: &str) -> Result<String, StepError> {
    if !source.contains("export default") {
        return Err(StepError::Sandbox(
            "code module must export a default function".to_string(),
        ));
    }
    Ok(source.replacen("export default", &format!("globalThis.{ENTRY_POINT} ="), 1))
}

fn evaluate_blocking(
    limits: &SandboxLimits,
    source: &str,
    input: serde_json::Value,
) -> Result<SandboxOutput, StepError> {
    let started = Instant::now();
    let script = rewrite_default_export(source)?;

    let runtime = Runtime::new().map_err(|e| StepError::Sandbox(e.to_string()))?;
    runtime.set_memory_limit(limits.memory_bytes);
    runtime.set_max_stack_size(limits.stack_bytes);

    let deadline = started + limits.deadline;
    runtime.set_interrupt_handler(Some(Box::new(move || Instant::now() >= deadline)));

    let context = Context::full(&runtime).map_err(|e| StepError::Sandbox(e.to_string()))?;
    let logs: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let value = context.with(|ctx| -> Result<serde_json::Value, StepError> {
        let globals = ctx.globals();

        // console stub: every level funnels into the captured log
        let console =
            Object::new(ctx.clone()).map_err(|e| StepError::Sandbox(e.to_string()))?;
        let sink = Arc::clone(&logs);
        let log_fn = Function::new(ctx.clone(), move |args: Rest<Coerced<String>>| {
            let line = args
                .iter()
                .map(|part| part.0.clone())
                .collect::<Vec<_>>()
                .join(" ");
            sink.lock().push(line);
        })
        .map_err(|e| StepError::Sandbox(e.to_string()))?;
        for level in ["log", "info", "warn", "error", "debug"] {
            console
                .set(level, log_fn.clone())
                .map_err(|e| StepError::Sandbox(e.to_string()))?;
        }
        globals
            .set("console", console)
            .map_err(|e| StepError::Sandbox(e.to_string()))?;

        ctx.eval::<(), _>(script.as_bytes())
            .catch(&ctx)
            .map_err(|e| sandbox_error(started, limits, "evaluation failed", &e.to_string()))?;

        let main: Function = globals.get(ENTRY_POINT).map_err(|_| {
            StepError::Sandbox("code module must export a default function".to_string())
        })?;

        let input_text = serde_json::to_string(&input)
            .map_err(|e| StepError::Sandbox(format!("input not serializable: {e}")))?;
        let input_js = ctx
            .json_parse(input_text)
            .map_err(|e| StepError::Sandbox(e.to_string()))?;

        let result: JsValue = main
            .call((input_js,))
            .catch(&ctx)
            .map_err(|e| sandbox_error(started, limits, "step function threw", &e.to_string()))?;

        match ctx
            .json_stringify(result)
            .map_err(|e| StepError::Sandbox(e.to_string()))?
        {
            Some(text) => {
                let text = text
                    .to_string()
                    .map_err(|e| StepError::Sandbox(e.to_string()))?;
                serde_json::from_str(&text)
                    .map_err(|e| StepError::Sandbox(format!("output not serializable: {e}")))
            }
            // `undefined` stringifies to nothing
            None => Ok(serde_json::Value::Null),
        }
    })?;

    // The console closure inside the context still holds a clone of the
    // sink, so read through the lock rather than unwrapping
    let logs = logs.lock().clone();
    debug!(elapsed_ms = started.elapsed().as_millis() as u64, "sandbox evaluation done");

    Ok(SandboxOutput { value, logs })
}

fn sandbox_error(
    started: Instant,
    limits: &SandboxLimits,
    what: &str,
    detail: &str,
) -> StepError {
    if started.elapsed() >= limits.deadline {
        return StepError::Sandbox(format!(
            "deadline of {}ms exceeded",
            limits.deadline.as_millis()
        ));
    }
    StepError::Sandbox(format!("{what}: {detail}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn sandbox() -> CodeSandbox {
        CodeSandbox::new(SandboxLimits {
            memory_bytes: 64 * 1024 * 1024,
            stack_bytes: 1024 * 1024,
            deadline: Duration::from_secs(5),
        })
    }

    #[tokio::test]
    async fn test_simple_transformation() {
        let output = sandbox()
            .evaluate("export default (x) => x.value + 1", json!({"value": 3}))
            .await
            .unwrap();

        assert_eq!(output.value, json!(4));
        assert!(output.logs.is_empty());
    }

    #[tokio::test]
    async fn test_object_output() {
        let output = sandbox()
            .evaluate(
                "export default (items) => ({ doubled: items.map((n) => n * 2) })",
                json!([1, 2, 3]),
            )
            .await
            .unwrap();

        assert_eq!(output.value, json!({"doubled": [2, 4, 6]}));
    }

    #[tokio::test]
    async fn test_console_capture() {
        let output = sandbox()
            .evaluate(
                r#"export default (x) => { console.log("got", x.n); console.warn("careful"); return x.n; }"#,
                json!({"n": 9}),
            )
            .await
            .unwrap();

        assert_eq!(output.value, json!(9));
        assert_eq!(output.logs, vec!["got 9".to_string(), "careful".to_string()]);
    }

    #[tokio::test]
    async fn test_runtime_exception() {
        let err = sandbox()
            .evaluate("export default (x) => missing.field", json!({}))
            .await
            .unwrap_err();

        assert!(matches!(err, StepError::Sandbox(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_missing_default_export() {
        let err = sandbox()
            .evaluate("const f = (x) => x;", json!({}))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("default"));
    }

    #[tokio::test]
    async fn test_deadline_interrupts_infinite_loop() {
        let sandbox = CodeSandbox::new(SandboxLimits {
            memory_bytes: 64 * 1024 * 1024,
            stack_bytes: 1024 * 1024,
            deadline: Duration::from_millis(200),
        });

        let err = sandbox
            .evaluate("export default (x) => { while (true) {} }", json!({}))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("deadline"));
    }

    #[tokio::test]
    async fn test_undefined_return_becomes_null() {
        let output = sandbox()
            .evaluate("export default (x) => {}", json!({}))
            .await
            .unwrap();

        assert_eq!(output.value, serde_json::Value::Null);
    }
}
