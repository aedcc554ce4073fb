//! Triangulated node-completion verdicts.
//!
//! Per iteration the verdict comes from the cheapest source that can
//! decide: deterministic rules first, then an LLM judge, with human
//! escalation as the low-confidence fallback. The fourth verdict,
//! `Continue`, is implicit: when the model's turn called real tools it is
//! clearly progressing, and the event loop bypasses the judge entirely.

use std::sync::Arc;

use futures_util::StreamExt;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use serde_json::Value;

use crate::conversation::Turn;
use crate::llm::{LlmChunk, LlmClient, LlmError, LlmRequest};

/// Default confidence floor for accepting the LLM judge's action.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.7;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VerdictAction {
    Accept,
    Retry,
    Escalate,
    Continue,
}

impl VerdictAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerdictAction::Accept => "accept",
            VerdictAction::Retry => "retry",
            VerdictAction::Escalate => "escalate",
            VerdictAction::Continue => "continue",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JudgeKind {
    Rule,
    Llm,
    Implicit,
}

impl JudgeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JudgeKind::Rule => "rule",
            JudgeKind::Llm => "llm",
            JudgeKind::Implicit => "implicit",
        }
    }
}

/// The judge's decision for one iteration.
#[derive(Clone, Debug)]
pub struct Verdict {
    pub action: VerdictAction,
    pub feedback: Option<String>,
    pub judge: JudgeKind,
    pub confidence: Option<f64>,
}

impl Verdict {
    pub fn implicit_continue() -> Self {
        Self {
            action: VerdictAction::Continue,
            feedback: None,
            judge: JudgeKind::Implicit,
            confidence: None,
        }
    }
}

/// What a rule predicate gets to look at.
pub struct JudgeContext<'a> {
    pub turns: &'a [Turn],
    pub iteration: u32,
    pub success_criteria: Option<&'a str>,
    /// The node's non-nullable output keys.
    pub required_outputs: Vec<&'a str>,
    /// Output keys the node has set so far.
    pub outputs: &'a FxHashMap<String, Value>,
}

pub type RulePredicate = Arc<dyn Fn(&JudgeContext<'_>) -> bool + Send + Sync>;

/// A deterministic evaluation rule. Rules run in descending priority; the
/// first match returns its action definitively, with no LLM cost.
#[derive(Clone)]
pub struct EvaluationRule {
    pub id: String,
    pub priority: i32,
    pub action: VerdictAction,
    pub predicate: RulePredicate,
}

impl EvaluationRule {
    pub fn new(
        id: impl Into<String>,
        priority: i32,
        action: VerdictAction,
        predicate: RulePredicate,
    ) -> Self {
        Self {
            id: id.into(),
            priority,
            action,
            predicate,
        }
    }

    /// Accept once every named output key is set.
    pub fn accept_when_outputs_set(keys: Vec<String>, priority: i32) -> Self {
        Self::new(
            "outputs_set",
            priority,
            VerdictAction::Accept,
            Arc::new(move |ctx| keys.iter().all(|key| ctx.outputs.contains_key(key))),
        )
    }

    /// Accept once every output key the node declares non-nullable is
    /// set. The workhorse rule for output-driven nodes; never matches a
    /// node that declares no required outputs.
    pub fn accept_when_declared_outputs_set(priority: i32) -> Self {
        Self::new(
            "declared_outputs_set",
            priority,
            VerdictAction::Accept,
            Arc::new(|ctx| {
                !ctx.required_outputs.is_empty()
                    && ctx
                        .required_outputs
                        .iter()
                        .all(|key| ctx.outputs.contains_key(*key))
            }),
        )
    }

    /// Escalate past an iteration watermark.
    pub fn escalate_after_iterations(limit: u32, priority: i32) -> Self {
        Self::new(
            "iteration_watermark",
            priority,
            VerdictAction::Escalate,
            Arc::new(move |ctx| ctx.iteration >= limit),
        )
    }
}

impl std::fmt::Debug for EvaluationRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvaluationRule")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("action", &self.action)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct LlmVerdictPayload {
    action: String,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    feedback: Option<String>,
}

/// The per-node verdict pipeline: rules, then LLM, then escalation.
pub struct JudgeProtocol {
    rules: Vec<EvaluationRule>,
    llm: Option<Arc<dyn LlmClient>>,
    confidence_threshold: f64,
}

impl JudgeProtocol {
    pub fn new(rules: Vec<EvaluationRule>, llm: Option<Arc<dyn LlmClient>>) -> Self {
        let mut rules = rules;
        rules.sort_by_key(|rule| std::cmp::Reverse(rule.priority));
        Self {
            rules,
            llm,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
        }
    }

    /// A judge with no rules and no LLM: never accepts on its own, so the
    /// node runs until its outputs-based rule or iteration budget decides.
    pub fn rules_only(rules: Vec<EvaluationRule>) -> Self {
        Self::new(rules, None)
    }

    #[must_use]
    pub fn with_confidence_threshold(mut self, threshold: f64) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    /// Evaluate the current iteration. The implicit-continue bypass is the
    /// caller's job (it knows whether real tools ran); this method covers
    /// the rule and LLM stages.
    pub async fn evaluate(&self, ctx: &JudgeContext<'_>) -> Verdict {
        for rule in &self.rules {
            if (rule.predicate)(ctx) {
                return Verdict {
                    action: rule.action,
                    feedback: Some(format!("rule {} matched", rule.id)),
                    judge: JudgeKind::Rule,
                    confidence: None,
                };
            }
        }

        let Some(llm) = &self.llm else {
            // No judge LLM configured: keep iterating.
            return Verdict {
                action: VerdictAction::Retry,
                feedback: Some("no rule matched and no judge model configured".to_string()),
                judge: JudgeKind::Rule,
                confidence: None,
            };
        };

        match self.llm_verdict(llm.as_ref(), ctx).await {
            Ok(payload) => {
                let action = match payload.action.to_ascii_lowercase().as_str() {
                    "accept" => VerdictAction::Accept,
                    "retry" => VerdictAction::Retry,
                    "escalate" => VerdictAction::Escalate,
                    other => {
                        return Verdict {
                            action: VerdictAction::Escalate,
                            feedback: Some(format!("judge returned unknown action {other:?}")),
                            judge: JudgeKind::Llm,
                            confidence: Some(payload.confidence),
                        }
                    }
                };
                if payload.confidence >= self.confidence_threshold {
                    Verdict {
                        action,
                        feedback: payload.feedback,
                        judge: JudgeKind::Llm,
                        confidence: Some(payload.confidence),
                    }
                } else {
                    Verdict {
                        action: VerdictAction::Escalate,
                        feedback: Some(format!(
                            "low confidence ({:.2} < {:.2})",
                            payload.confidence, self.confidence_threshold
                        )),
                        judge: JudgeKind::Llm,
                        confidence: Some(payload.confidence),
                    }
                }
            }
            Err(error) => Verdict {
                action: VerdictAction::Escalate,
                feedback: Some(format!("judge model unavailable: {error}")),
                judge: JudgeKind::Llm,
                confidence: None,
            },
        }
    }

    async fn llm_verdict(
        &self,
        llm: &dyn LlmClient,
        ctx: &JudgeContext<'_>,
    ) -> Result<LlmVerdictPayload, LlmError> {
        let criteria = ctx.success_criteria.unwrap_or("the task is complete");
        let transcript: Vec<String> = ctx
            .turns
            .iter()
            .map(|turn| format!("{}: {}", turn.role, turn.content))
            .collect();
        let system = format!(
            "You judge whether an agent's work satisfies its success criteria.\n\
             Criteria: {criteria}\n\
             Reply with a single JSON object: \
             {{\"action\": \"accept\"|\"retry\"|\"escalate\", \
             \"confidence\": 0.0-1.0, \"feedback\": \"...\"}}"
        );
        let request = LlmRequest {
            system,
            turns: vec![Turn::user(transcript.join("\n"))],
            tools: Vec::new(),
            node_id: None,
        };

        let mut stream = llm.complete_stream(request).await?;
        let mut text = String::new();
        while let Some(chunk) = stream.next().await {
            if let LlmChunk::TextDelta(delta) = chunk? {
                text.push_str(&delta);
            }
        }
        parse_verdict(&text)
            .ok_or_else(|| LlmError::fatal(format!("unparseable judge verdict: {text:?}")))
    }
}

/// Pull the first JSON object out of the judge reply; models wrap JSON in
/// prose often enough that strict parsing would flap.
fn parse_verdict(text: &str) -> Option<LlmVerdictPayload> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    serde_json::from_str(&text[start..=end]).ok()
}
