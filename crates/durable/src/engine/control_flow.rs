//! forEach expansion and parallel groups
//!
//! A forEach step expands into `base[i]` children, each with `@item` and
//! `@index` bound in an overlay scratchpad. Contiguous steps sharing a
//! parallel group id run as one batch whose inputs resolve against the
//! pre-group scratchpad. Both run under the same four modes: `sequential`,
//! `parallel` (optionally chunked), `race`, and `allSettled`.
//!
//! Children persist their own step results, so replay after a crash skips
//! finished iterations. Durable suspensions (sleep, wait-for-signal) are
//! only propagated from `sequential` mode; inside concurrent fan-out they
//! are a definition error.

use std::collections::HashMap;

use futures::future::{join_all, select_ok};
use futures::FutureExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::persistence::{Execution, StepResult, StepResultPatch};
use crate::step::StepError;
use crate::workflow::{
    expanded_step_name, ConcurrencyMode, ForEachConfig, ParallelGroup, Reference, Scratchpad,
    Step,
};

use super::executor::{Executor, SingleRun, StepDisposition, StepFailure};

/// Result of one iteration (or group member)
enum Settled {
    Fulfilled(Value),
    Rejected(String),
}

fn child_step(parent: &Step, index: usize) -> Step {
    Step {
        name: expanded_step_name(&parent.name, index),
        action: parent.action.clone(),
        input: parent.input.clone(),
        retry: parent.retry,
        // the expansion itself never recurses
        config: None,
    }
}

fn suspension_failure(step_name: &str, attempt: u32) -> StepFailure {
    StepFailure::new(
        step_name.to_string(),
        attempt,
        StepError::Definition(
            "durable suspension inside concurrent fan-out is not supported".to_string(),
        ),
    )
}

/// Run a forEach step
pub(crate) async fn run_for_each(
    executor: &Executor,
    execution: &Execution,
    step: &Step,
    config: &ForEachConfig,
    scratchpad: &mut Scratchpad,
    results: &mut HashMap<String, StepResult>,
) -> Result<StepDisposition, StepFailure> {
    let parent_attempt = results.get(&step.name).map(|r| r.attempt).unwrap_or(0);
    let fail = |error: StepError| StepFailure {
        step: step.name.clone(),
        attempt: parent_attempt,
        retry: step.retry,
        error,
    };

    let reference = Reference::parse(&config.items).ok_or_else(|| {
        fail(StepError::Definition(format!(
            "forEach items is not a reference: '{}'",
            config.items
        )))
    })?;
    let items = match scratchpad.resolve_reference(&reference).map_err(|e| fail(e.into()))? {
        Value::Array(items) => items,
        other => {
            return Err(fail(StepError::Definition(format!(
                "forEach items must resolve to an array, got {}",
                type_label(&other)
            ))))
        }
    };

    debug!(step = %step.name, count = items.len(), mode = %config.mode, "expanding forEach");

    executor
        .store()
        .upsert_step_result(
            execution.id,
            &step.name,
            StepResultPatch::started(chrono::Utc::now()),
        )
        .await
        .map_err(|e| fail(e.into()))?;

    // Per-iteration context: replay state and an @item/@index overlay
    let iterations: Vec<(usize, Step, Scratchpad, Option<StepResult>)> = items
        .iter()
        .enumerate()
        .map(|(index, item)| {
            let child = child_step(step, index);
            let prior = results.get(&child.name).cloned();
            let overlay = scratchpad.with_iteration(item.clone(), index);
            (index, child, overlay, prior)
        })
        .collect();

    let output = match config.mode {
        ConcurrencyMode::Sequential => {
            let mut outputs = Vec::with_capacity(iterations.len());
            for (_, child, overlay, prior) in iterations {
                if let Some(ref existing) = prior {
                    if existing.is_replayable() {
                        outputs.push(existing.output.clone().unwrap_or(Value::Null));
                        continue;
                    }
                }
                match executor.run_single(execution, &child, &overlay, prior).await? {
                    SingleRun::Completed(value) => {
                        executor
                            .record_step_output(execution.id, &child, &value, results)
                            .await
                            .map_err(|e| fail(e.into()))?;
                        outputs.push(value);
                    }
                    SingleRun::Suspended(suspension) => {
                        return Ok(StepDisposition::Suspend {
                            step: child.name,
                            suspension,
                        })
                    }
                }
            }
            Value::Array(outputs)
        }

        ConcurrencyMode::Parallel => {
            let mut outputs = vec![Value::Null; items.len()];
            let mut pending = Vec::new();
            for (index, child, overlay, prior) in iterations {
                if let Some(ref existing) = prior {
                    if existing.is_replayable() {
                        outputs[index] = existing.output.clone().unwrap_or(Value::Null);
                        continue;
                    }
                }
                pending.push((index, child, overlay, prior));
            }

            let chunk_size = config.max_concurrency.unwrap_or(pending.len()).max(1);
            let mut first_failure = None;
            'chunks: for chunk in pending.chunks(chunk_size) {
                let settled = join_all(chunk.iter().map(|(index, child, overlay, prior)| {
                    let attempt = prior.as_ref().map(|r| r.attempt).unwrap_or(0);
                    async move {
                        match executor
                            .run_single(execution, child, overlay, prior.clone())
                            .await?
                        {
                            SingleRun::Completed(value) => Ok((*index, child, value)),
                            SingleRun::Suspended(_) => {
                                Err(suspension_failure(&child.name, attempt))
                            }
                        }
                    }
                }))
                .await;

                // Record every finished iteration before surfacing the
                // failure, so healthy iterations replay after a retry
                for result in settled {
                    match result {
                        Ok((index, child, value)) => {
                            executor
                                .record_step_output(execution.id, child, &value, results)
                                .await
                                .map_err(|e| fail(e.into()))?;
                            outputs[index] = value;
                        }
                        Err(failure) if first_failure.is_none() => {
                            first_failure = Some(failure);
                        }
                        Err(_) => {}
                    }
                }
                if first_failure.is_some() {
                    break 'chunks;
                }
            }
            if let Some(failure) = first_failure {
                return Err(failure);
            }
            Value::Array(outputs)
        }

        ConcurrencyMode::Race => {
            // A child completed before a crash already won
            let replayed = iterations.iter().find_map(|(index, child, _, prior)| {
                prior
                    .as_ref()
                    .filter(|r| r.is_replayable())
                    .map(|r| (*index, child.clone(), r.output.clone().unwrap_or(Value::Null)))
            });

            let (winner, child, value) = match replayed {
                Some(won) => won,
                None => {
                    if iterations.is_empty() {
                        return Err(fail(StepError::Definition(
                            "race over an empty item list".to_string(),
                        )));
                    }
                    let racers = iterations
                        .into_iter()
                        .map(|(index, child, overlay, prior)| {
                            let attempt = prior.as_ref().map(|r| r.attempt).unwrap_or(0);
                            async move {
                                match executor
                                    .run_single(execution, &child, &overlay, prior)
                                    .await?
                                {
                                    SingleRun::Completed(value) => Ok((index, child, value)),
                                    SingleRun::Suspended(_) => {
                                        Err(suspension_failure(&child.name, attempt))
                                    }
                                }
                            }
                            .boxed()
                        })
                        .collect::<Vec<_>>();

                    // Losers are dropped at their next await point
                    let (won, _losers) = select_ok(racers).await?;
                    won
                }
            };

            executor
                .record_step_output(execution.id, &child, &value, results)
                .await
                .map_err(|e| fail(e.into()))?;
            json!({ "winner": winner, "value": value })
        }

        ConcurrencyMode::AllSettled => {
            let mut settled: Vec<Option<Settled>> = (0..items.len()).map(|_| None).collect();
            let mut pending = Vec::new();
            for (index, child, overlay, prior) in iterations {
                match prior {
                    Some(ref existing) if existing.is_replayable() => {
                        settled[index] = Some(Settled::Fulfilled(
                            existing.output.clone().unwrap_or(Value::Null),
                        ));
                    }
                    _ => pending.push((index, child, overlay, prior)),
                }
            }

            let outcomes = join_all(pending.into_iter().map(|(index, child, overlay, prior)| {
                async move {
                    let outcome = match executor
                        .run_single(execution, &child, &overlay, prior)
                        .await
                    {
                        Ok(SingleRun::Completed(value)) => Settled::Fulfilled(value),
                        Ok(SingleRun::Suspended(_)) => Settled::Rejected(
                            "durable suspension inside concurrent fan-out is not supported"
                                .to_string(),
                        ),
                        Err(failure) => Settled::Rejected(failure.error.to_string()),
                    };
                    (index, child, outcome)
                }
            }))
            .await;

            for (index, child, outcome) in outcomes {
                match &outcome {
                    Settled::Fulfilled(value) => {
                        executor
                            .record_step_output(execution.id, &child, value, results)
                            .await
                            .map_err(|e| fail(e.into()))?;
                    }
                    Settled::Rejected(reason) => {
                        executor
                            .store()
                            .upsert_step_result(
                                execution.id,
                                &child.name,
                                StepResultPatch::failed(1, reason.clone()),
                            )
                            .await
                            .map_err(|e| fail(e.into()))?;
                    }
                }
                settled[index] = Some(outcome);
            }

            Value::Array(
                settled
                    .into_iter()
                    .map(|s| match s {
                        Some(Settled::Fulfilled(value)) => {
                            json!({ "status": "fulfilled", "value": value })
                        }
                        Some(Settled::Rejected(reason)) => {
                            json!({ "status": "rejected", "reason": reason })
                        }
                        None => json!({ "status": "rejected", "reason": "iteration did not run" }),
                    })
                    .collect(),
            )
        }
    };

    executor
        .record_step_output(execution.id, step, &output, results)
        .await
        .map_err(|e| fail(e.into()))?;
    scratchpad.insert(step.name.clone(), output);
    Ok(StepDisposition::Done)
}

/// Run a contiguous parallel group
///
/// Member inputs resolve against the pre-group scratchpad, so references
/// between members of the same group see only earlier steps.
pub(crate) async fn run_group(
    executor: &Executor,
    execution: &Execution,
    group: &ParallelGroup,
    steps: &[&Step],
    scratchpad: &mut Scratchpad,
    results: &mut HashMap<String, StepResult>,
) -> Result<StepDisposition, StepFailure> {
    debug!(group = %group.group, mode = %group.mode, members = steps.len(), "running parallel group");

    let snapshot = scratchpad.clone();

    let mut members: Vec<(&Step, Option<StepResult>)> = Vec::new();
    for step in steps {
        let prior = results.get(&step.name).cloned();
        if let Some(ref existing) = prior {
            if existing.is_replayable() {
                scratchpad.insert(
                    step.name.clone(),
                    existing.output.clone().unwrap_or(Value::Null),
                );
                continue;
            }
        }
        members.push((step, prior));
    }
    if members.is_empty() {
        return Ok(StepDisposition::Done);
    }

    match group.mode {
        ConcurrencyMode::Sequential => {
            for (step, prior) in members {
                match executor
                    .run_single(execution, step, &snapshot, prior)
                    .await?
                {
                    SingleRun::Completed(value) => {
                        executor
                            .record_step_output(execution.id, step, &value, results)
                            .await
                            .map_err(|e| StepFailure::new(step.name.clone(), 0, e.into()))?;
                        scratchpad.insert(step.name.clone(), value);
                    }
                    SingleRun::Suspended(suspension) => {
                        return Ok(StepDisposition::Suspend {
                            step: step.name.clone(),
                            suspension,
                        })
                    }
                }
            }
        }

        ConcurrencyMode::Parallel => {
            let settled = join_all(members.iter().map(|(step, prior)| {
                let attempt = prior.as_ref().map(|r| r.attempt).unwrap_or(0);
                let snapshot = &snapshot;
                async move {
                    match executor
                        .run_single(execution, step, snapshot, prior.clone())
                        .await?
                    {
                        SingleRun::Completed(value) => Ok((*step, value)),
                        SingleRun::Suspended(_) => Err(suspension_failure(&step.name, attempt)),
                    }
                }
            }))
            .await;

            // Record finished members first so they replay after a retry
            let mut first_failure = None;
            for result in settled {
                match result {
                    Ok((step, value)) => {
                        executor
                            .record_step_output(execution.id, step, &value, results)
                            .await
                            .map_err(|e| StepFailure::new(step.name.clone(), 0, e.into()))?;
                        scratchpad.insert(step.name.clone(), value);
                    }
                    Err(failure) if first_failure.is_none() => first_failure = Some(failure),
                    Err(_) => {}
                }
            }
            if let Some(failure) = first_failure {
                return Err(failure);
            }
        }

        ConcurrencyMode::Race => {
            let racers = members
                .into_iter()
                .map(|(step, prior)| {
                    let attempt = prior.as_ref().map(|r| r.attempt).unwrap_or(0);
                    let snapshot = &snapshot;
                    async move {
                        match executor
                            .run_single(execution, step, snapshot, prior)
                            .await?
                        {
                            SingleRun::Completed(value) => Ok((step, value)),
                            SingleRun::Suspended(_) => {
                                Err(suspension_failure(&step.name, attempt))
                            }
                        }
                    }
                    .boxed()
                })
                .collect::<Vec<_>>();

            let ((step, value), _losers) = select_ok(racers).await?;
            executor
                .record_step_output(execution.id, step, &value, results)
                .await
                .map_err(|e| StepFailure::new(step.name.clone(), 0, e.into()))?;
            scratchpad.insert(step.name.clone(), value);
        }

        ConcurrencyMode::AllSettled => {
            let outcomes = join_all(members.into_iter().map(|(step, prior)| {
                let snapshot = &snapshot;
                async move {
                    let outcome = match executor
                        .run_single(execution, step, snapshot, prior)
                        .await
                    {
                        Ok(SingleRun::Completed(value)) => Settled::Fulfilled(value),
                        Ok(SingleRun::Suspended(_)) => Settled::Rejected(
                            "durable suspension inside concurrent fan-out is not supported"
                                .to_string(),
                        ),
                        Err(failure) => Settled::Rejected(failure.error.to_string()),
                    };
                    (step, outcome)
                }
            }))
            .await;

            for (step, outcome) in outcomes {
                match outcome {
                    Settled::Fulfilled(value) => {
                        executor
                            .record_step_output(execution.id, step, &value, results)
                            .await
                            .map_err(|e| StepFailure::new(step.name.clone(), 0, e.into()))?;
                        scratchpad.insert(step.name.clone(), value);
                    }
                    Settled::Rejected(reason) => {
                        executor
                            .store()
                            .upsert_step_result(
                                execution.id,
                                &step.name,
                                StepResultPatch::failed(1, reason),
                            )
                            .await
                            .map_err(|e| StepFailure::new(step.name.clone(), 0, e.into()))?;
                    }
                }
            }
        }
    }

    Ok(StepDisposition::Done)
}

fn type_label(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
