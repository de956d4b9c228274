use std::fmt::Display;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tracing::info;

pub const TIMING_TARGET: &str = "studio.timing";

/// Wall-clock bookkeeping for one generation job, written to the timing log.
#[derive(Debug)]
pub struct JobTimer {
    job_id: String,
    character_id: String,
    started_at: DateTime<Utc>,
    started_perf: Instant,
    completed: bool,
}

impl JobTimer {
    pub fn start(job_id: &str, character_id: &str) -> Self {
        let timer = JobTimer {
            job_id: job_id.to_string(),
            character_id: character_id.to_string(),
            started_at: Utc::now(),
            started_perf: Instant::now(),
            completed: false,
        };
        info!(
            target: TIMING_TARGET,
            "event=job_started job_id={} character_id={} started_at={}",
            timer.job_id,
            timer.character_id,
            timer.started_at.to_rfc3339()
        );
        timer
    }

    pub fn finish(&mut self, status: &str, detail: Option<&str>) {
        if self.completed {
            return;
        }
        self.completed = true;
        let duration = self.started_perf.elapsed().as_secs_f64();
        info!(
            target: TIMING_TARGET,
            "event=job_finished job_id={} character_id={} started_at={} finished_at={} duration_s={:.3} status={} detail={}",
            self.job_id,
            self.character_id,
            self.started_at.to_rfc3339(),
            Utc::now().to_rfc3339(),
            duration,
            status,
            detail.unwrap_or_default()
        );
    }
}

pub async fn log_llm_timing<T, E, F, Fut>(
    provider: &str,
    model: &str,
    operation: &str,
    metadata: Option<JsonValue>,
    call: F,
) -> Result<T, E>
where
    E: Display,
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    let started_at = Utc::now();
    let started_perf = Instant::now();
    let metadata_text = metadata
        .as_ref()
        .map(|value| value.to_string())
        .unwrap_or_else(|| "{}".to_string());
    info!(
        target: TIMING_TARGET,
        "event=llm_request provider={} model={} operation={} started_at={} metadata={}",
        provider,
        model,
        operation,
        started_at.to_rfc3339(),
        metadata_text
    );

    let result = call().await;
    let status = match &result {
        Ok(_) => "success".to_string(),
        Err(err) => format!("error ({err})"),
    };

    let duration = started_perf.elapsed().as_secs_f64();
    info!(
        target: TIMING_TARGET,
        "event=llm_response provider={} model={} operation={} completed_at={} duration_s={:.3} status={} metadata={}",
        provider,
        model,
        operation,
        Utc::now().to_rfc3339(),
        duration,
        status,
        metadata_text
    );

    result
}
