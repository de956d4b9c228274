use chrono::{DateTime, SubsecRound, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::db::StoreError;

pub const DEFAULT_HAIR_LENGTH: &str = "medium";
pub const DEFAULT_HAIR_TEXTURE: &str = "straight";
pub const PENDING_PROMPT: &str = "Analyzing image...";
pub const FAILED_PROMPT: &str = "Failed";
pub const INTERRUPTED_MESSAGE: &str = "Interrupted by restart";
pub const UNKNOWN_CHARACTER: &str = "Unknown";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Character {
    pub id: String,
    pub name: String,
    pub hair_color: String,
    pub eye_color: String,
    pub skin_color: String,
    pub hair_length: Option<String>,
    pub hair_texture: Option<String>,
    pub avatar_image: Option<String>,
}

impl Character {
    pub fn traits(&self) -> CharacterTraits {
        CharacterTraits {
            hair_color: self.hair_color.clone(),
            eye_color: self.eye_color.clone(),
            skin_color: self.skin_color.clone(),
            hair_length: self.hair_length.clone(),
            hair_texture: self.hair_texture.clone(),
        }
    }
}

/// Appearance attributes that replace whatever the source photo shows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacterTraits {
    pub hair_color: String,
    pub eye_color: String,
    pub skin_color: String,
    pub hair_length: Option<String>,
    pub hair_texture: Option<String>,
}

impl CharacterTraits {
    pub fn hair_length_or_default(&self) -> &str {
        non_blank(self.hair_length.as_deref()).unwrap_or(DEFAULT_HAIR_LENGTH)
    }

    pub fn hair_texture_or_default(&self) -> &str {
        non_blank(self.hair_texture.as_deref()).unwrap_or(DEFAULT_HAIR_TEXTURE)
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Processing)
    }
}

/// Status together with the payload only that status may carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Processing,
    Completed { image_data: String },
    Failed { error_message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedImage {
    pub id: String,
    pub character_id: String,
    pub prompt: String,
    pub created_at: DateTime<Utc>,
    pub state: JobState,
}

impl GeneratedImage {
    pub fn processing(id: String, character_id: String, created_at: DateTime<Utc>) -> Self {
        GeneratedImage {
            id,
            character_id,
            prompt: PENDING_PROMPT.to_string(),
            created_at,
            state: JobState::Processing,
        }
    }

    pub fn completed(self, prompt: String, image_data: String, at: DateTime<Utc>) -> Self {
        GeneratedImage {
            prompt,
            created_at: at,
            state: JobState::Completed { image_data },
            ..self
        }
    }

    pub fn failed(self, error_message: String, at: DateTime<Utc>) -> Self {
        GeneratedImage {
            prompt: FAILED_PROMPT.to_string(),
            created_at: at,
            state: JobState::Failed { error_message },
            ..self
        }
    }

    pub fn status(&self) -> JobStatus {
        match self.state {
            JobState::Processing => JobStatus::Processing,
            JobState::Completed { .. } => JobStatus::Completed,
            JobState::Failed { .. } => JobStatus::Failed,
        }
    }

    pub fn image_data(&self) -> Option<&str> {
        match &self.state {
            JobState::Completed { image_data } => Some(image_data),
            _ => None,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match &self.state {
            JobState::Failed { error_message } => Some(error_message),
            _ => None,
        }
    }
}

/// Current time at the millisecond precision the store keeps, so a job held
/// in memory compares equal to the same job read back.
pub fn now_millis() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// Resolves a job's soft character reference, tolerating deleted characters.
pub fn character_name_for<'a>(job: &GeneratedImage, characters: &'a [Character]) -> &'a str {
    characters
        .iter()
        .find(|character| character.id == job.character_id)
        .map(|character| character.name.as_str())
        .unwrap_or(UNKNOWN_CHARACTER)
}

#[derive(Debug, Clone, FromRow)]
pub struct CharacterRow {
    pub id: String,
    pub name: String,
    pub hair_color: String,
    pub eye_color: String,
    pub skin_color: String,
    pub hair_length: Option<String>,
    pub hair_texture: Option<String>,
    pub avatar_image: Option<String>,
}

impl From<CharacterRow> for Character {
    fn from(row: CharacterRow) -> Self {
        Character {
            id: row.id,
            name: row.name,
            hair_color: row.hair_color,
            eye_color: row.eye_color,
            skin_color: row.skin_color,
            hair_length: row.hair_length,
            hair_texture: row.hair_texture,
            avatar_image: row.avatar_image,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct JobRow {
    pub id: String,
    pub character_id: String,
    pub prompt: String,
    pub image_data: Option<String>,
    pub created_at: i64,
    pub status: String,
    pub error_message: Option<String>,
}

impl JobRow {
    pub fn from_job(job: &GeneratedImage) -> Self {
        JobRow {
            id: job.id.clone(),
            character_id: job.character_id.clone(),
            prompt: job.prompt.clone(),
            image_data: job.image_data().map(str::to_string),
            created_at: job.created_at.timestamp_millis(),
            status: job.status().as_str().to_string(),
            error_message: job.error_message().map(str::to_string),
        }
    }
}

impl TryFrom<JobRow> for GeneratedImage {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = JobStatus::parse(&row.status).ok_or_else(|| {
            StoreError::Corrupt(format!("job {} has unknown status '{}'", row.id, row.status))
        })?;
        let state = match status {
            JobStatus::Processing => JobState::Processing,
            JobStatus::Completed => JobState::Completed {
                image_data: row.image_data.ok_or_else(|| {
                    StoreError::Corrupt(format!("completed job {} has no image data", row.id))
                })?,
            },
            JobStatus::Failed => JobState::Failed {
                error_message: row.error_message.unwrap_or_default(),
            },
        };
        let created_at = Utc
            .timestamp_millis_opt(row.created_at)
            .single()
            .ok_or_else(|| {
                StoreError::Corrupt(format!(
                    "job {} has invalid timestamp {}",
                    row.id, row.created_at
                ))
            })?;

        Ok(GeneratedImage {
            id: row.id,
            character_id: row.character_id,
            prompt: row.prompt,
            created_at,
            state,
        })
    }
}
