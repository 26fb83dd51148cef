//! **Verification gate**: RULE → MODEL → HUMAN, strictly in order.
//!
//! The first rejection short-circuits the rest. `verify()` never returns an error: every
//! failure mode becomes a `VerificationResult` with `approved: false`. Results are not
//! persisted here.

use crate::invoker::ResilientInvoker;
use crate::provider::TextRequest;
use crate::validate::{SerdeValidator, Validator};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

const HUMAN_REVIEW_REASON: &str = "Flagged for human review";

const VERIFIER_SYSTEM_PROMPT: &str = "You are a content safety reviewer for a family storytelling app. \
Decide whether the item below is appropriate to keep. Respond only with JSON of the form \
{\"approved\": boolean, \"reason\": string, \"confidence\": number between 0 and 1}.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Rule,
    Model,
    Human,
}

/// Kind tag of the item under review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    /// A user-flagged story moment about to be recorded as golden.
    GoldenMoment,
    /// An action with safety impact (sharing, publishing, contacting).
    SafetyAction,
}

impl ContentKind {
    /// Payload fields that must be present and non-empty for this kind.
    pub fn required_fields(&self) -> &'static [&'static str] {
        match self {
            Self::GoldenMoment => &["storyId"],
            Self::SafetyAction => &["action"],
        }
    }
}

/// Typed content item plus its kind tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentItem {
    pub kind: ContentKind,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub approved: bool,
    pub stage: Stage,
    pub reason: String,
    pub confidence: f64,
}

impl VerificationResult {
    fn rejected(stage: Stage, reason: impl Into<String>, confidence: f64) -> Self {
        Self {
            approved: false,
            stage,
            reason: reason.into(),
            confidence,
        }
    }
}

/// Schema-checked reply of the MODEL stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelVerdict {
    pub approved: bool,
    pub reason: String,
    pub confidence: f64,
}

/// Validator for `{approved, reason, confidence ∈ [0,1]}`.
pub fn verdict_validator() -> SerdeValidator<ModelVerdict> {
    SerdeValidator::new(json!({
        "type": "object",
        "properties": {
            "approved": { "type": "boolean" },
            "reason": { "type": "string" },
            "confidence": { "type": "number", "minimum": 0, "maximum": 1 }
        },
        "required": ["approved", "reason", "confidence"]
    }))
    .with_check(|v: &ModelVerdict| {
        if (0.0..=1.0).contains(&v.confidence) {
            Ok(())
        } else {
            Err(format!("confidence {} outside [0, 1]", v.confidence))
        }
    })
}

/// What gets handed to human reviewers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewRequest {
    pub item: ContentItem,
    pub reason: String,
    pub confidence: f64,
}

/// External human-review queue.
#[async_trait]
pub trait ReviewQueue: Send + Sync {
    async fn enqueue(&self, request: ReviewRequest) -> Result<(), String>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    pub min_description_len: usize,
    /// MODEL approvals below this go to a human.
    pub approval_confidence: f64,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            min_description_len: 10,
            approval_confidence: 0.8,
        }
    }
}

pub struct VerificationPipeline {
    invoker: Arc<ResilientInvoker>,
    queue: Arc<dyn ReviewQueue>,
    config: VerificationConfig,
    validator: SerdeValidator<ModelVerdict>,
}

impl VerificationPipeline {
    pub fn new(
        invoker: Arc<ResilientInvoker>,
        queue: Arc<dyn ReviewQueue>,
        config: VerificationConfig,
    ) -> Self {
        Self {
            invoker,
            queue,
            config,
            validator: verdict_validator(),
        }
    }

    pub async fn verify(&self, item: &ContentItem) -> VerificationResult {
        if let Err(reason) = self.rule_stage(item) {
            info!(target: "tale::verify", kind = ?item.kind, %reason, "rejected at RULE");
            return VerificationResult::rejected(Stage::Rule, reason, 1.0);
        }

        let verdict = match self.model_stage(item).await {
            Ok(v) => v,
            Err(reason) => {
                warn!(target: "tale::verify", kind = ?item.kind, %reason, "MODEL stage degraded");
                return VerificationResult::rejected(Stage::Model, reason, 0.0);
            }
        };

        if !verdict.approved {
            info!(target: "tale::verify", kind = ?item.kind, "rejected at MODEL");
            return VerificationResult::rejected(Stage::Model, verdict.reason, verdict.confidence);
        }

        if verdict.confidence < self.config.approval_confidence {
            let request = ReviewRequest {
                item: item.clone(),
                reason: verdict.reason.clone(),
                confidence: verdict.confidence,
            };
            if let Err(e) = self.queue.enqueue(request).await {
                warn!(target: "tale::verify", "human review enqueue failed: {}", e);
            }
            info!(
                target: "tale::verify",
                kind = ?item.kind,
                confidence = verdict.confidence,
                "low-confidence approval sent to HUMAN"
            );
            return VerificationResult::rejected(
                Stage::Human,
                HUMAN_REVIEW_REASON,
                verdict.confidence,
            );
        }

        VerificationResult {
            approved: true,
            stage: Stage::Model,
            reason: verdict.reason,
            confidence: verdict.confidence,
        }
    }

    fn rule_stage(&self, item: &ContentItem) -> Result<(), String> {
        let len = item.description.trim().chars().count();
        if len < self.config.min_description_len {
            return Err(format!(
                "Description too short ({} < {} characters)",
                len, self.config.min_description_len
            ));
        }
        for field in item.kind.required_fields() {
            let present = match item.payload.get(*field) {
                None | Some(Value::Null) => false,
                Some(Value::String(s)) => !s.trim().is_empty(),
                Some(_) => true,
            };
            if !present {
                return Err(format!("Missing required field: {}", field));
            }
        }
        Ok(())
    }

    async fn model_stage(&self, item: &ContentItem) -> Result<ModelVerdict, String> {
        let prompt = format!(
            "Kind: {}\nDescription: {}\nDetails: {}",
            serde_json::to_string(&item.kind).unwrap_or_default(),
            item.description.trim(),
            item.payload
        );
        let req = TextRequest::new(prompt)
            .with_system(VERIFIER_SYSTEM_PROMPT)
            .with_temperature(0.0);
        let validator: &dyn Validator<ModelVerdict> = &self.validator;
        self.invoker
            .invoke_structured("verify", req, validator)
            .await
            .map(|inv| inv.payload)
            .map_err(|e| format!("Model verification unavailable: {}", e))
    }
}
