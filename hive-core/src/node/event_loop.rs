//! The inner multi-turn LLM + tool loop for one node invocation.
//!
//! Each iteration streams one model turn, dispatches any tool calls, and
//! gates completion on a judge verdict. The loop also watches for the two
//! pathologies long-running agents exhibit: stalling (repeating the same
//! reply verbatim) and tool doom loops (re-invoking the same tool with
//! identical arguments while nothing changes).

use std::time::Duration;

use futures_util::StreamExt;
use rustc_hash::FxHashMap;
use serde_json::{json, Value};

use crate::conversation::{SharedConversation, Turn};
use crate::event::{AgentEvent, EventType};
use crate::graph::NodeSpec;
use crate::judge::{JudgeContext, Verdict, VerdictAction};
use crate::llm::{LlmChunk, LlmError, LlmRequest, ToolCallRequest};
use crate::prompt;
use crate::tools::{ESCALATE_TO_CODER, SET_OUTPUT};

use super::{NodeContext, NodeResult};

/// Base delay for transient-LLM retry backoff; doubles per attempt.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(250);
/// Identical assistant turns (including the current one) that count as a
/// stall.
const STALL_WINDOW: usize = 3;
/// Consecutive argument-equal tool calls that count as a doom loop.
const DOOM_LOOP_WINDOW: u32 = 3;

const DOOM_LOOP_NUDGE: &str = "You have called the same tool with identical arguments several \
     times and received the same result. Change your approach: use a \
     different tool, different arguments, or record your conclusion with \
     set_output.";

/// One fully-drained model turn.
struct StreamedTurn {
    text: String,
    tool_calls: Vec<ToolCallRequest>,
}

enum TurnOutcome {
    Turn(StreamedTurn),
    Cancelled,
    Exhausted(LlmError),
}

/// Executes one node's event loop. Stateless; everything lives in the
/// conversation and the context.
pub struct EventLoopNode;

impl EventLoopNode {
    /// Run the loop to a terminal [`NodeResult`].
    ///
    /// The conversation is the caller's: seeded with whatever user input
    /// starts the node, appended to in place, and left intact for
    /// checkpointing (the executor clears it after the node completes).
    pub async fn run(
        spec: &NodeSpec,
        ctx: &NodeContext,
        conversation: &SharedConversation,
    ) -> NodeResult {
        let bus = ctx.bus.child_for_node(&spec.id);
        let mut outputs: FxHashMap<String, Value> = FxHashMap::default();
        let mut iteration: u32 = 0;
        // (name, serialized input) of the last repeated call and how many
        // consecutive iterations it repeated with a clean result.
        let mut repeat: Option<(String, String)> = None;
        let mut repeat_count: u32 = 0;
        // Signature the corrective nudge was issued for, if any.
        let mut nudged: Option<(String, String)> = None;

        loop {
            if !ctx.controls.wait_if_paused().await {
                return NodeResult::cancelled(iteration);
            }

            iteration += 1;
            if spec.max_iterations > 0 && iteration > spec.max_iterations {
                return NodeResult::failed("iteration budget exhausted", iteration - 1);
            }

            if iteration == 1 {
                bus.publish(
                    AgentEvent::new(EventType::NodeLoopStarted)
                        .with_data("max_iterations", json!(spec.max_iterations)),
                );
            }
            bus.publish(
                AgentEvent::new(EventType::NodeLoopIteration)
                    .with_data("iteration", json!(iteration)),
            );

            let request = Self::assemble_request(spec, ctx, conversation);
            let turn = match Self::stream_turn(spec, ctx, &bus, request, iteration).await {
                TurnOutcome::Turn(turn) => turn,
                TurnOutcome::Cancelled => return NodeResult::cancelled(iteration),
                TurnOutcome::Exhausted(error) => {
                    return NodeResult::failed(error.to_string(), iteration)
                }
            };

            if !turn.text.is_empty() {
                // Stall check: current text byte-identical to the previous
                // two assistant turns.
                if turn.tool_calls.is_empty() {
                    let previous = conversation.recent_assistant_contents(STALL_WINDOW - 1);
                    if previous.len() == STALL_WINDOW - 1
                        && previous.iter().all(|content| *content == turn.text)
                    {
                        bus.publish(
                            AgentEvent::new(EventType::NodeStalled).with_data(
                                "reason",
                                json!(format!(
                                    "assistant repeated the same content {STALL_WINDOW} turns in a row"
                                )),
                            ),
                        );
                        return NodeResult::failed("node stalled", iteration);
                    }
                }
                conversation.push(Turn::assistant(turn.text.clone()));
                if !spec.client_facing {
                    // Full text of the turn, for subscribers that skip the
                    // delta firehose.
                    bus.publish(
                        AgentEvent::new(EventType::NodeInternalOutput)
                            .with_data("content", json!(turn.text))
                            .with_data("iteration", json!(iteration)),
                    );
                }
            }

            let mut escalated: Option<String> = None;
            let mut real_calls = 0usize;
            let mut clean_repeat_this_iteration = false;

            for call in &turn.tool_calls {
                bus.publish(
                    AgentEvent::new(EventType::ToolCallStarted)
                        .with_data("tool_use_id", json!(call.id))
                        .with_data("tool_name", json!(call.name))
                        .with_data("tool_input", call.input.clone()),
                );

                if call.name == SET_OUTPUT {
                    let (result, is_error) = Self::apply_set_output(spec, ctx, &bus, call, &mut outputs);
                    bus.publish(
                        AgentEvent::new(EventType::ToolCallCompleted)
                            .with_data("tool_use_id", json!(call.id))
                            .with_data("tool_name", json!(call.name))
                            .with_data("result", result.clone())
                            .with_data("is_error", json!(is_error)),
                    );
                    conversation.push(
                        Turn::tool_result(result.to_string())
                            .with_metadata("tool_use_id", json!(call.id))
                            .with_metadata("tool_name", json!(call.name)),
                    );
                    continue;
                }

                if call.name == ESCALATE_TO_CODER {
                    let reason = call
                        .input
                        .get("reason")
                        .and_then(Value::as_str)
                        .unwrap_or("unspecified")
                        .to_string();
                    bus.publish(
                        AgentEvent::new(EventType::EscalationRequested)
                            .with_data("reason", json!(reason))
                            .with_data(
                                "context",
                                call.input.get("context").cloned().unwrap_or(Value::Null),
                            ),
                    );
                    bus.publish(
                        AgentEvent::new(EventType::ToolCallCompleted)
                            .with_data("tool_use_id", json!(call.id))
                            .with_data("tool_name", json!(call.name))
                            .with_data("result", json!({"escalated": true}))
                            .with_data("is_error", json!(false)),
                    );
                    escalated = Some(reason);
                    break;
                }

                real_calls += 1;
                let outcome = tokio::select! {
                    _ = ctx.controls.cancel.cancelled() => return NodeResult::cancelled(iteration),
                    outcome = ctx.tools.invoke(&call.name, call.input.clone()) => outcome,
                };

                bus.publish(
                    AgentEvent::new(EventType::ToolCallCompleted)
                        .with_data("tool_use_id", json!(call.id))
                        .with_data("tool_name", json!(call.name))
                        .with_data("result", outcome.result.clone())
                        .with_data("is_error", json!(outcome.is_error)),
                );
                conversation.push(
                    Turn::tool_result(outcome.result.to_string())
                        .with_metadata("tool_use_id", json!(call.id))
                        .with_metadata("tool_name", json!(call.name))
                        .with_metadata("is_error", json!(outcome.is_error)),
                );

                // Doom-loop accounting: the same tool with argument-equal
                // input and a clean result, iteration after iteration.
                if !outcome.is_error {
                    let signature = (call.name.clone(), call.input.to_string());
                    if repeat.as_ref() == Some(&signature) {
                        clean_repeat_this_iteration = true;
                    } else {
                        repeat = Some(signature);
                        repeat_count = 0;
                        clean_repeat_this_iteration = true;
                    }
                }
            }

            if let Some(reason) = escalated {
                return NodeResult::escalated(reason, iteration);
            }

            if clean_repeat_this_iteration {
                repeat_count += 1;
                let description = repeat
                    .as_ref()
                    .map(|(name, _)| format!("tool {name} re-invoked with identical arguments"))
                    .unwrap_or_else(|| "tool doom loop".to_string());
                if nudged.is_some() && nudged == repeat {
                    // The corrective nudge did not change anything.
                    bus.publish(
                        AgentEvent::new(EventType::NodeToolDoomLoop)
                            .with_data("description", json!(description)),
                    );
                    return NodeResult::failed("tool doom loop", iteration);
                }
                if repeat_count >= DOOM_LOOP_WINDOW {
                    bus.publish(
                        AgentEvent::new(EventType::NodeToolDoomLoop)
                            .with_data("description", json!(description)),
                    );
                    nudged = repeat.clone();
                    repeat_count = 0;
                    conversation.push(Turn::assistant(DOOM_LOOP_NUDGE));
                }
            } else {
                repeat = None;
                repeat_count = 0;
            }

            // Text-only turn from a client-facing node: surface it and
            // suspend until input arrives.
            if turn.tool_calls.is_empty() && spec.client_facing {
                // Register before announcing, so an injection racing the
                // event cannot arrive with nobody waiting.
                let receiver = ctx.controls.injections.register(&spec.id);
                bus.publish(
                    AgentEvent::new(EventType::NodeInputBlocked)
                        .with_data("iteration", json!(iteration)),
                );
                bus.publish(
                    AgentEvent::new(EventType::ClientInputRequested)
                        .with_data("prompt", json!(turn.text)),
                );
                let content = tokio::select! {
                    _ = ctx.controls.cancel.cancelled() => {
                        ctx.controls.injections.unregister(&spec.id);
                        return NodeResult::cancelled(iteration);
                    }
                    received = receiver => match received {
                        Ok(content) => content,
                        Err(_) => {
                            // Router dropped the sender; treat as teardown.
                            return NodeResult::cancelled(iteration);
                        }
                    },
                };
                conversation.push(Turn::user(content));
                continue;
            }

            // Judge stage. Real (non-synthetic) tool calls mean the model
            // is visibly working: implicit CONTINUE, no rule or LLM cost.
            let verdict = if real_calls > 0 {
                Verdict::implicit_continue()
            } else {
                let turns = conversation.snapshot();
                let judge_ctx = JudgeContext {
                    turns: &turns,
                    iteration,
                    success_criteria: spec.success_criteria.as_deref(),
                    required_outputs: spec.required_outputs(),
                    outputs: &outputs,
                };
                ctx.judge.evaluate(&judge_ctx).await
            };

            bus.publish(
                AgentEvent::new(EventType::JudgeVerdict)
                    .with_data("action", json!(verdict.action.as_str()))
                    .with_data("feedback", json!(verdict.feedback))
                    .with_data("judge_type", json!(verdict.judge.as_str()))
                    .with_data("iteration", json!(iteration)),
            );

            match verdict.action {
                VerdictAction::Accept => {
                    let missing: Vec<&str> = spec
                        .required_outputs()
                        .into_iter()
                        .filter(|key| !outputs.contains_key(*key))
                        .collect();
                    if missing.is_empty() {
                        bus.publish(
                            AgentEvent::new(EventType::NodeLoopCompleted)
                                .with_data("iterations", json!(iteration))
                                .with_data("status", json!("success")),
                        );
                        return NodeResult::success(outputs, iteration);
                    }
                    let feedback = format!("missing keys: {}", missing.join(", "));
                    bus.publish(
                        AgentEvent::new(EventType::JudgeVerdict)
                            .with_data("action", json!(VerdictAction::Retry.as_str()))
                            .with_data("feedback", json!(feedback))
                            .with_data("judge_type", json!("rule"))
                            .with_data("iteration", json!(iteration)),
                    );
                    conversation.push(
                        Turn::user(format!(
                            "Before finishing, set the remaining outputs with set_output: {}",
                            missing.join(", ")
                        ))
                        .with_metadata("judge_feedback", json!(true)),
                    );
                }
                VerdictAction::Retry => {
                    if let Some(feedback) = verdict.feedback {
                        conversation
                            .push(Turn::user(feedback).with_metadata("judge_feedback", json!(true)));
                    }
                }
                VerdictAction::Escalate => {
                    let reason = verdict
                        .feedback
                        .unwrap_or_else(|| "judge escalated".to_string());
                    bus.publish(
                        AgentEvent::new(EventType::EscalationRequested)
                            .with_data("reason", json!(reason)),
                    );
                    return NodeResult::escalated(reason, iteration);
                }
                VerdictAction::Continue => {}
            }
        }
    }

    fn assemble_request(
        spec: &NodeSpec,
        ctx: &NodeContext,
        conversation: &SharedConversation,
    ) -> LlmRequest {
        let inputs: Vec<(String, Option<Value>)> = spec
            .input_keys
            .iter()
            .map(|key| (key.clone(), ctx.state.get(key)))
            .collect();
        let rendered_inputs = prompt::render_inputs(&inputs);
        let narrative = {
            let base = prompt::build_narrative(&ctx.execution_path, &ctx.state.shared().snapshot());
            if rendered_inputs.is_empty() {
                base
            } else if base.is_empty() {
                rendered_inputs
            } else {
                format!("{base}\n\n{rendered_inputs}")
            }
        };
        let system = prompt::compose_system_prompt(
            ctx.identity_prompt.as_deref(),
            Some(&narrative),
            spec.system_prompt.as_deref(),
        );
        LlmRequest {
            system,
            turns: conversation.snapshot(),
            tools: ctx.tools.descriptors_for(&spec.tool_names),
            node_id: Some(spec.id.clone()),
        }
    }

    /// Stream one turn, publishing deltas, retrying transient provider
    /// errors with exponential backoff up to the node's budget.
    async fn stream_turn(
        spec: &NodeSpec,
        ctx: &NodeContext,
        bus: &crate::event::EventBus,
        request: LlmRequest,
        iteration: u32,
    ) -> TurnOutcome {
        let mut attempt: u32 = 0;
        loop {
            match Self::stream_turn_once(spec, ctx, bus, request.clone(), iteration).await {
                Ok(Some(turn)) => return TurnOutcome::Turn(turn),
                Ok(None) => return TurnOutcome::Cancelled,
                Err(error) if error.is_retryable() && attempt < spec.max_llm_retries => {
                    attempt += 1;
                    bus.publish(
                        AgentEvent::new(EventType::NodeRetry)
                            .with_data("retry_count", json!(attempt))
                            .with_data("max_retries", json!(spec.max_llm_retries))
                            .with_data("error", json!(error.to_string())),
                    );
                    let delay = RETRY_BASE_DELAY * 2u32.saturating_pow(attempt - 1);
                    tokio::select! {
                        _ = ctx.controls.cancel.cancelled() => return TurnOutcome::Cancelled,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(error) => return TurnOutcome::Exhausted(error),
            }
        }
    }

    /// One streaming attempt. `Ok(None)` means cancelled mid-stream.
    async fn stream_turn_once(
        spec: &NodeSpec,
        ctx: &NodeContext,
        bus: &crate::event::EventBus,
        request: LlmRequest,
        iteration: u32,
    ) -> Result<Option<StreamedTurn>, LlmError> {
        let mut stream = tokio::select! {
            _ = ctx.controls.cancel.cancelled() => return Ok(None),
            opened = ctx.llm.complete_stream(request) => opened?,
        };

        let delta_type = if spec.client_facing {
            EventType::ClientOutputDelta
        } else {
            EventType::LlmTextDelta
        };
        let mut text = String::new();
        let mut tool_calls = Vec::new();

        loop {
            let chunk = tokio::select! {
                _ = ctx.controls.cancel.cancelled() => return Ok(None),
                chunk = stream.next() => chunk,
            };
            match chunk {
                Some(Ok(LlmChunk::TextDelta(delta))) => {
                    text.push_str(&delta);
                    bus.publish(
                        AgentEvent::new(delta_type)
                            .with_data("content", json!(delta))
                            .with_data("snapshot", json!(text))
                            .with_data("iteration", json!(iteration)),
                    );
                }
                Some(Ok(LlmChunk::ReasoningDelta(delta))) => {
                    bus.publish(
                        AgentEvent::new(EventType::LlmReasoningDelta)
                            .with_data("content", json!(delta))
                            .with_data("iteration", json!(iteration)),
                    );
                }
                Some(Ok(LlmChunk::ToolCall(call))) => tool_calls.push(call),
                Some(Ok(LlmChunk::Done)) | None => break,
                Some(Err(error)) => return Err(error),
            }
        }

        Ok(Some(StreamedTurn { text, tool_calls }))
    }

    fn apply_set_output(
        spec: &NodeSpec,
        ctx: &NodeContext,
        bus: &crate::event::EventBus,
        call: &ToolCallRequest,
        outputs: &mut FxHashMap<String, Value>,
    ) -> (Value, bool) {
        let Some(key) = call.input.get("key").and_then(Value::as_str) else {
            return (json!({"error": "set_output requires a string 'key'"}), true);
        };
        let Some(value) = call.input.get("value") else {
            return (json!({"error": "set_output requires a 'value'"}), true);
        };
        if !spec.output_keys.iter().any(|output| output.key == key) {
            return (
                json!({"error": format!("{key:?} is not a declared output of this node")}),
                true,
            );
        }
        ctx.state.set(key, value.clone());
        outputs.insert(key.to_string(), value.clone());
        bus.publish(
            AgentEvent::new(EventType::OutputKeySet)
                .with_data("key", json!(key))
                .with_data("value", value.clone()),
        );
        (json!({"ok": true, "key": key}), false)
    }
}
