use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::db::database::Database;
use crate::db::models::{now_millis, Character, GeneratedImage};
use crate::db::StoreError;
use crate::jobs::resilience::{call_with_policy, normalize_error_message, CallPolicy};
use crate::llm::gateway::{GatewayError, ModelGateway};
use crate::llm::gemini::NO_DESCRIPTION_MESSAGE;
use crate::state::{JobBoard, JobEvent};
use crate::utils::timing::JobTimer;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelinePolicy {
    pub prompt: CallPolicy,
    pub image: CallPolicy,
}

impl Default for PipelinePolicy {
    fn default() -> Self {
        PipelinePolicy {
            prompt: CallPolicy::new(Duration::from_secs(60), 2, Duration::from_millis(1000)),
            image: CallPolicy::new(Duration::from_secs(110), 3, Duration::from_millis(2000)),
        }
    }
}

impl PipelinePolicy {
    pub fn from_config(config: &Config) -> Self {
        PipelinePolicy {
            prompt: CallPolicy::new(
                Duration::from_secs(config.prompt_timeout_seconds.max(1)),
                config.prompt_max_retries,
                Duration::from_millis(config.prompt_retry_delay_ms),
            ),
            image: CallPolicy::new(
                Duration::from_secs(config.image_timeout_seconds.max(1)),
                config.image_max_retries,
                Duration::from_millis(config.image_retry_delay_ms),
            ),
        }
    }
}

/// Owns job lifecycle: records a job as processing, runs its pipeline in the
/// background and writes exactly one terminal state for it.
pub struct JobOrchestrator<G> {
    db: Database,
    gateway: Arc<G>,
    board: JobBoard,
    policy: PipelinePolicy,
}

impl<G> Clone for JobOrchestrator<G> {
    fn clone(&self) -> Self {
        JobOrchestrator {
            db: self.db.clone(),
            gateway: self.gateway.clone(),
            board: self.board.clone(),
            policy: self.policy,
        }
    }
}

impl<G: ModelGateway> JobOrchestrator<G> {
    pub fn new(db: Database, gateway: Arc<G>, board: JobBoard, policy: PipelinePolicy) -> Self {
        JobOrchestrator {
            db,
            gateway,
            board,
            policy,
        }
    }

    pub fn board(&self) -> &JobBoard {
        &self.board
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    /// Startup recovery. Fails jobs orphaned by a previous process, then
    /// loads both collections onto the board. Must finish before anything
    /// reads job state.
    pub async fn recover(&self) -> Result<u64, StoreError> {
        let swept = self.db.sweep_stale_jobs().await?;
        let characters = self.db.list_characters().await?;
        let jobs = self.db.list_jobs().await?;
        info!(
            swept = swept,
            characters = characters.len(),
            jobs = jobs.len(),
            "Recovered job state"
        );
        self.board.load(characters, jobs);
        Ok(swept)
    }

    pub async fn save_character(&self, character: Character) -> Result<(), StoreError> {
        self.db.upsert_character(&character).await?;
        info!(character_id = %character.id, name = %character.name, "Character saved");
        self.board.upsert_character(character);
        Ok(())
    }

    /// Jobs keep pointing at a deleted character; they resolve to "Unknown".
    pub async fn delete_character(&self, id: &str) -> Result<(), StoreError> {
        self.db.delete_character(id).await?;
        info!(character_id = %id, "Character deleted");
        self.board.remove_character(id);
        Ok(())
    }

    /// Does not stop a pipeline still running for this job.
    pub async fn delete_job(&self, id: &str) -> Result<(), StoreError> {
        self.db.delete_job(id).await?;
        info!(job_id = %id, "Job deleted");
        self.board.remove_job(id);
        Ok(())
    }

    pub async fn clear_jobs(&self) -> Result<(), StoreError> {
        self.db.clear_jobs().await?;
        self.board.clear_jobs();
        Ok(())
    }

    pub async fn submit_for(
        &self,
        character_id: &str,
        source_image: String,
    ) -> Result<GeneratedImage, OrchestratorError> {
        let character = self
            .db
            .get_character(character_id)
            .await?
            .ok_or_else(|| {
                OrchestratorError::Validation(format!("character '{character_id}' does not exist"))
            })?;
        self.submit(&character, source_image).await
    }

    /// Returns as soon as the job is durably recorded as processing. The
    /// outcome arrives later as a `JobEvent::Finished` or a store read.
    pub async fn submit(
        &self,
        character: &Character,
        source_image: String,
    ) -> Result<GeneratedImage, OrchestratorError> {
        if source_image.trim().is_empty() {
            return Err(OrchestratorError::Validation(
                "a source image is required".to_string(),
            ));
        }

        let job = GeneratedImage::processing(
            Uuid::new_v4().to_string(),
            character.id.clone(),
            now_millis(),
        );
        self.db.upsert_job(&job).await?;
        self.board.prepend_job(job.clone());
        self.board.notify(JobEvent::Submitted(job.clone()));
        info!(job_id = %job.id, character_id = %character.id, "Job submitted");

        let orchestrator = self.clone();
        let pending = job.clone();
        let character = character.clone();
        tokio::spawn(async move {
            orchestrator
                .run_pipeline(pending, source_image, character)
                .await;
        });

        Ok(job)
    }

    /// Never fails: every error ends up in the job's `error_message`.
    pub async fn run_pipeline(
        &self,
        job: GeneratedImage,
        source_image: String,
        character: Character,
    ) -> GeneratedImage {
        let mut timer = JobTimer::start(&job.id, &job.character_id);
        let finished = match self.generate(&source_image, &character).await {
            Ok((prompt, image_data)) => {
                info!(job_id = %job.id, "Job completed");
                timer.finish("completed", None);
                job.completed(prompt, image_data, now_millis())
            }
            Err(err) => {
                let message = normalize_error_message(&err);
                warn!(
                    job_id = %job.id,
                    timed_out = err.is_timeout(),
                    retryable = err.is_retryable(),
                    "Job failed: {message}"
                );
                timer.finish("failed", Some(&message));
                job.failed(message, now_millis())
            }
        };

        self.record_terminal(&finished).await;
        finished
    }

    async fn generate(
        &self,
        source_image: &str,
        character: &Character,
    ) -> Result<(String, String), GatewayError> {
        let gateway = self.gateway.as_ref();
        let traits = character.traits();

        let prompt = call_with_policy("synthesize_prompt", self.policy.prompt, || {
            gateway.synthesize_prompt(source_image, &traits)
        })
        .await?;
        let prompt = prompt.trim().to_string();
        if prompt.is_empty() {
            return Err(GatewayError::EmptyResult(NO_DESCRIPTION_MESSAGE.to_string()));
        }

        let reference = character
            .avatar_image
            .as_deref()
            .filter(|image| !image.trim().is_empty());
        let image_data = call_with_policy("synthesize_image", self.policy.image, || {
            gateway.synthesize_image(&prompt, reference)
        })
        .await?;

        Ok((prompt, image_data))
    }

    async fn record_terminal(&self, job: &GeneratedImage) {
        if let Err(err) = self.db.upsert_job(job).await {
            error!(job_id = %job.id, "Failed to persist {} job: {err}", job.status().as_str());
        }
        if !self.board.replace_job(job.clone()) {
            debug!(job_id = %job.id, "Finished job is no longer on the board");
        }
        self.board.notify(JobEvent::Finished(job.clone()));
    }
}
