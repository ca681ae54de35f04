//! Function worker: analyze, design, implement, validate.
//!
//! One [`FunctionWorker`] execution turns a single [`FunctionAssignment`]
//! into an implementation and emits exactly one [`CompletionMessage`] to the
//! assignment's completion queue. A stage failure short-circuits the rest
//! of the pipeline and is reported as a failed completion.
//!
//! The implementation itself travels as a [`FunctionArtifact`] on
//! `swarm.function.artifacts`; the completion only references it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::agent::Agent;
use super::quality::{assess, QualityAssessment};
use super::stage::{Stage, StageOutput, ValidationReport};
use crate::error::{AgentError, AgentResult};
use crate::llm::GenerationService;
use crate::messages::{AgentType, CompletionMessage, FunctionArtifact, FunctionAssignment};
use crate::metrics::{MetricsCollector, TokenUsage};
use crate::policy::AgentResourceLimits;
use crate::queue::{names, MessageQueue, SendReceipt};
use crate::utils::extract_implementation;

/// Outcome of one pipeline run.
#[derive(Debug, Clone)]
pub struct FunctionResult {
    pub assignment_id: Uuid,
    pub worker_id: String,
    pub function_name: String,
    pub success: bool,
    /// The implementation artifact on success.
    pub implementation: Option<String>,
    /// Queue the artifact was published to.
    pub artifact_queue: Option<String>,
    pub validation: Option<ValidationReport>,
    pub error: Option<String>,
    pub failed_stage: Option<Stage>,
    pub stages: Vec<StageOutput>,
    pub quality: QualityAssessment,
    /// Dollars across all stages.
    pub cost: f64,
    pub usage: TokenUsage,
    pub duration: Duration,
    /// Whether the completion message reached its queue.
    pub completion_sent: bool,
}

impl FunctionResult {
    fn new(assignment: &FunctionAssignment, worker_id: &str) -> Self {
        Self {
            assignment_id: assignment.assignment_id,
            worker_id: worker_id.to_string(),
            function_name: assignment.function_name.clone(),
            success: false,
            implementation: None,
            artifact_queue: None,
            validation: None,
            error: None,
            failed_stage: None,
            stages: Vec::new(),
            quality: QualityAssessment::default(),
            cost: 0.0,
            usage: TokenUsage::default(),
            duration: Duration::ZERO,
            completion_sent: false,
        }
    }

    fn fail(&mut self, stage: Stage, error: &AgentError) {
        self.success = false;
        self.failed_stage = Some(stage);
        self.error = Some(error.to_string());
    }

    fn stage_text(&self, stage: Stage) -> Option<&str> {
        self.stages
            .iter()
            .find(|s| s.stage == stage)
            .map(|s| s.text.as_str())
    }

    /// Completion message describing this result.
    pub fn to_completion(&self, assignment: &FunctionAssignment) -> CompletionMessage {
        let mut message = if self.success {
            let summary = format!(
                "Implemented {} ({} chars, validation {})",
                self.function_name,
                self.implementation.as_deref().map_or(0, str::len),
                if self.validation.as_ref().is_some_and(|v| v.passed) {
                    "passed"
                } else {
                    "flagged issues"
                }
            );
            CompletionMessage::success(
                &self.worker_id,
                AgentType::FunctionWorker,
                self.assignment_id,
                summary,
            )
        } else {
            CompletionMessage::failure(
                &self.worker_id,
                AgentType::FunctionWorker,
                self.assignment_id,
                self.error.clone().unwrap_or_else(|| "unknown error".to_string()),
            )
        }
        .with_function(&self.function_name)
        .with_code_unit_assignment(assignment.code_unit_assignment_id);

        if let Some(queue) = &self.artifact_queue {
            message.artifact_queue = Some(queue.clone());
            message.artifact_bytes = self.implementation.as_deref().map_or(0, str::len);
        }
        message.quality_score = self.quality.quality_score;
        message.confidence_score = self.quality.confidence_score;
        message.cost = self.cost;
        message.duration_ms = self.duration.as_millis() as u64;
        message.input_tokens = self.usage.input_tokens;
        message.output_tokens = self.usage.output_tokens;
        message
    }
}

/// Executes function assignments through the four-stage pipeline.
pub struct FunctionWorker {
    id: String,
    generator: Arc<dyn GenerationService>,
    queue: Arc<MessageQueue>,
    artifact_queue: String,
    limits: AgentResourceLimits,
    metrics: MetricsCollector,
}

impl FunctionWorker {
    pub fn new(
        id: impl Into<String>,
        generator: Arc<dyn GenerationService>,
        queue: Arc<MessageQueue>,
        limits: AgentResourceLimits,
    ) -> Self {
        Self {
            id: id.into(),
            generator,
            queue,
            artifact_queue: names::FUNCTION_ARTIFACTS.to_string(),
            limits,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn with_artifact_queue(mut self, queue: impl Into<String>) -> Self {
        self.artifact_queue = queue.into();
        self
    }

    pub fn limits(&self) -> &AgentResourceLimits {
        &self.limits
    }

    /// Queue the completion for `assignment` goes to.
    pub fn completion_queue(assignment: &FunctionAssignment) -> &str {
        assignment
            .completion_queue
            .as_deref()
            .filter(|q| !q.is_empty())
            .unwrap_or(names::COMPLETIONS)
    }

    /// Runs the pipeline without emitting anything.
    pub async fn run_pipeline(&self, assignment: &FunctionAssignment) -> FunctionResult {
        let start = Instant::now();
        let mut result = FunctionResult::new(assignment, &self.id);

        info!(
            worker_id = %self.id,
            assignment_id = %assignment.assignment_id,
            function = %assignment.function_name,
            complexity = assignment.complexity,
            "Starting function pipeline"
        );

        for stage in Stage::ALL {
            let previous = match stage {
                Stage::Analyze => None,
                Stage::Design => result.stage_text(Stage::Analyze),
                Stage::Implement => result.stage_text(Stage::Design),
                Stage::Validate => result.implementation.as_deref(),
            };
            let user_prompt = stage.user_prompt(assignment, previous);

            if let Err(e) = self.run_stage(stage, assignment, &user_prompt, &mut result).await {
                warn!(
                    worker_id = %self.id,
                    assignment_id = %assignment.assignment_id,
                    stage = %stage,
                    error = %e,
                    "Stage failed, skipping remaining stages"
                );
                result.fail(stage, &e);
                result.implementation = None;
                result.duration = start.elapsed();
                return result;
            }
        }

        let implementation = result.implementation.as_deref().unwrap_or_default();
        result.quality = assess(implementation, assignment.complexity, result.validation.as_ref());
        result.success = true;
        result.duration = start.elapsed();
        self.metrics.record_quality_score(result.quality.quality_score);

        info!(
            worker_id = %self.id,
            assignment_id = %assignment.assignment_id,
            quality = result.quality.quality_score,
            cost = result.cost,
            duration_ms = result.duration.as_millis() as u64,
            "Function pipeline completed"
        );
        result
    }

    async fn run_stage(
        &self,
        stage: Stage,
        assignment: &FunctionAssignment,
        user_prompt: &str,
        result: &mut FunctionResult,
    ) -> AgentResult<()> {
        let started = Instant::now();
        let generated = self
            .generator
            .generate(
                &stage.system_prompt(&assignment.language),
                user_prompt,
                stage.max_tokens(self.limits.max_tokens),
                stage.temperature(),
            )
            .await;
        let elapsed = started.elapsed();

        let output = match generated {
            Ok(output) => output,
            Err(e) => {
                self.metrics.record_stage(stage.as_str(), false, elapsed.as_secs_f64());
                return Err(AgentError::StageFailed {
                    stage: stage.to_string(),
                    reason: e.to_string(),
                });
            }
        };
        self.metrics.record_stage(stage.as_str(), true, elapsed.as_secs_f64());

        result.cost += output.cost;
        result.usage += output.usage();
        debug!(
            worker_id = %self.id,
            stage = %stage,
            input_tokens = output.input_tokens,
            output_tokens = output.output_tokens,
            total_cost = result.cost,
            "Stage completed"
        );

        match stage {
            Stage::Implement => {
                result.implementation = Some(extract_implementation(&output.text, &assignment.language));
            }
            Stage::Validate => result.validation = Some(ValidationReport::parse(&output.text)),
            Stage::Analyze | Stage::Design => {}
        }

        result.stages.push(StageOutput {
            stage,
            text: output.text,
            input_tokens: output.input_tokens,
            output_tokens: output.output_tokens,
            cost: output.cost,
            duration: output.duration,
        });

        if result.cost > self.limits.max_cost_per_execution {
            return Err(AgentError::CostCeilingExceeded {
                stage: stage.to_string(),
                spent: result.cost,
                limit: self.limits.max_cost_per_execution,
            });
        }
        Ok(())
    }

    /// Publishes the implementation whole to the artifact queue.
    ///
    /// A result whose artifact cannot be published is turned into a failure:
    /// its completion would reference nothing.
    pub async fn publish_artifact(&self, assignment: &FunctionAssignment, result: &mut FunctionResult) {
        let Some(content) = result.implementation.as_deref() else {
            return;
        };
        let artifact = FunctionArtifact::new(assignment, content);
        match self.queue.send_intact(&self.artifact_queue, &artifact, None).await {
            Ok(receipt) => {
                debug!(
                    worker_id = %self.id,
                    assignment_id = %assignment.assignment_id,
                    queue = %self.artifact_queue,
                    size_bytes = receipt.size_bytes,
                    "Implementation artifact published"
                );
                result.artifact_queue = Some(self.artifact_queue.clone());
            }
            Err(e) => {
                warn!(
                    worker_id = %self.id,
                    assignment_id = %assignment.assignment_id,
                    queue = %self.artifact_queue,
                    error = %e,
                    "Failed to publish implementation artifact"
                );
                result.success = false;
                result.error = Some(format!("Failed to publish implementation artifact: {}", e));
            }
        }
    }

    /// Sends the completion for `result`.
    pub async fn report(
        &self,
        assignment: &FunctionAssignment,
        result: &FunctionResult,
    ) -> AgentResult<SendReceipt> {
        let completion = result.to_completion(assignment);
        self.send_completion(assignment, &completion).await
    }

    /// Sends a failed completion for an assignment that never produced a
    /// result, e.g. after a timeout.
    pub async fn report_failure(
        &self,
        assignment: &FunctionAssignment,
        reason: &str,
    ) -> AgentResult<SendReceipt> {
        let completion = CompletionMessage::failure(
            &self.id,
            AgentType::FunctionWorker,
            assignment.assignment_id,
            reason,
        )
        .with_function(&assignment.function_name)
        .with_code_unit_assignment(assignment.code_unit_assignment_id);
        self.send_completion(assignment, &completion).await
    }

    async fn send_completion(
        &self,
        assignment: &FunctionAssignment,
        completion: &CompletionMessage,
    ) -> AgentResult<SendReceipt> {
        let queue = Self::completion_queue(assignment);
        let receipt = self.queue.send(queue, completion, None).await?;
        if receipt.truncated {
            warn!(
                worker_id = %self.id,
                queue = queue,
                original_bytes = receipt.original_size_bytes,
                sent_bytes = receipt.size_bytes,
                "Completion message truncated to fit queue budget"
            );
        }
        self.metrics
            .record_completion(AgentType::FunctionWorker.as_str(), completion.success);
        Ok(receipt)
    }
}

#[async_trait]
impl Agent for FunctionWorker {
    type Input = FunctionAssignment;
    type Output = FunctionResult;

    fn id(&self) -> &str {
        &self.id
    }

    fn agent_type(&self) -> AgentType {
        AgentType::FunctionWorker
    }

    /// Runs the pipeline and emits its completion.
    ///
    /// Stage failures come back as an unsuccessful `FunctionResult`; only a
    /// failure to emit the completion is an error.
    async fn execute(&self, assignment: FunctionAssignment) -> AgentResult<FunctionResult> {
        let mut result = self.run_pipeline(&assignment).await;
        if result.success {
            self.publish_artifact(&assignment, &mut result).await;
        }
        self.report(&assignment, &result).await?;
        result.completion_sent = true;
        Ok(result)
    }
}
