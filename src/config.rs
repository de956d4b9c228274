use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use once_cell::sync::Lazy;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub logs_dir: PathBuf,
    pub database_url: String,
    pub gemini_api_key: String,
    pub gemini_base_url: String,
    pub gemini_prompt_model: String,
    pub gemini_image_model: String,
    pub gemini_temperature: f32,
    pub gemini_top_k: i32,
    pub gemini_top_p: f32,
    pub gemini_max_output_tokens: i32,
    pub gemini_safety_settings: String,
    pub http_timeout_seconds: u64,
    pub prompt_timeout_seconds: u64,
    pub prompt_max_retries: u32,
    pub prompt_retry_delay_ms: u64,
    pub image_timeout_seconds: u64,
    pub image_max_retries: u32,
    pub image_retry_delay_ms: u64,
    pub max_image_dimension: u32,
}

pub static CONFIG: Lazy<Config> =
    Lazy::new(|| Config::load().expect("Failed to load configuration"));

fn env_string(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_f32(name: &str, default: f32) -> f32 {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<f32>().ok())
        .unwrap_or(default)
}

fn env_i32(name: &str, default: i32) -> i32 {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<i32>().ok())
        .unwrap_or(default)
}

fn env_u32(name: &str, default: u32) -> u32 {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn normalize_database_url(value: String) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return "sqlite://character_studio.db".to_string();
    }
    trimmed.to_string()
}

fn normalize_gemini_safety_settings(value: String) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return "permissive".to_string();
    }

    let lowered = trimmed.to_lowercase();
    match lowered.as_str() {
        "permissive" | "off" | "none" => "permissive".to_string(),
        "standard" => "standard".to_string(),
        _ => {
            warn!(
                "Unknown GEMINI_SAFETY_SETTINGS value '{}'; defaulting to permissive.",
                value
            );
            "permissive".to_string()
        }
    }
}

fn normalize_base_url(value: String) -> String {
    value.trim().trim_end_matches('/').to_string()
}

impl Config {
    pub fn load() -> Result<Self> {
        Ok(Config {
            log_level: env_string("LOG_LEVEL", "info").to_lowercase(),
            logs_dir: PathBuf::from(env_string("LOGS_DIR", "logs")),
            database_url: normalize_database_url(env_string(
                "DATABASE_URL",
                "sqlite://character_studio.db",
            )),
            gemini_api_key: env_string("GEMINI_API_KEY", ""),
            gemini_base_url: normalize_base_url(env_string(
                "GEMINI_BASE_URL",
                "https://generativelanguage.googleapis.com/v1beta",
            )),
            gemini_prompt_model: env_string("GEMINI_PROMPT_MODEL", "gemini-2.5-flash"),
            gemini_image_model: env_string("GEMINI_IMAGE_MODEL", "gemini-2.5-flash-image"),
            gemini_temperature: env_f32("GEMINI_TEMPERATURE", 0.4),
            gemini_top_k: env_i32("GEMINI_TOP_K", 40),
            gemini_top_p: env_f32("GEMINI_TOP_P", 0.95),
            gemini_max_output_tokens: env_i32("GEMINI_MAX_OUTPUT_TOKENS", 2048),
            gemini_safety_settings: normalize_gemini_safety_settings(env_string(
                "GEMINI_SAFETY_SETTINGS",
                "permissive",
            )),
            http_timeout_seconds: env_u64("HTTP_TIMEOUT_SECONDS", 180),
            prompt_timeout_seconds: env_u64("PROMPT_TIMEOUT_SECONDS", 60),
            prompt_max_retries: env_u32("PROMPT_MAX_RETRIES", 2),
            prompt_retry_delay_ms: env_u64("PROMPT_RETRY_DELAY_MS", 1000),
            image_timeout_seconds: env_u64("IMAGE_TIMEOUT_SECONDS", 110),
            image_max_retries: env_u32("IMAGE_MAX_RETRIES", 3),
            image_retry_delay_ms: env_u64("IMAGE_RETRY_DELAY_MS", 2000),
            max_image_dimension: env_u32("MAX_IMAGE_DIMENSION", 1024).max(64),
        })
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_seconds.max(1))
    }
}

pub const PROMPT_SYSTEM_PROMPT: &str = r#"You are an expert photography director writing prompts for a photorealistic image generation model.

You will receive a SOURCE PHOTO and a block of CHARACTER TRAITS.

Describe the source photo in exhaustive detail so it can be recreated: camera angle, framing, lens feel, lighting direction and quality, background and setting, clothing, accessories, body pose, hand placement, head tilt, gaze direction and facial expression.

CRITICAL: the person in the new image must NOT keep the hair, eye or skin appearance from the source photo. Replace them with the CHARACTER TRAITS exactly as given. State the trait values explicitly and repeatedly where they are visible (hair color, hair length, hair texture, eye color, skin tone). Never mention the original hair, eye or skin appearance.

Output only the final prompt as a single paragraph of plain text. No preamble, no markdown, no lists."#;

pub const IMAGE_SYSTEM_PROMPT: &str = r#"Generate one photorealistic image that follows the prompt exactly. CRITICAL: respond with an image, NOT TEXT."#;

pub const IMAGE_REFERENCE_INSTRUCTION: &str = r#"The attached image is a reference of the character. Keep the character's face identity consistent with this reference while following the prompt for pose, expression, clothing and scene."#;
