use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cli::{CharacterArgs, Command};
use crate::db::models::{character_name_for, Character, GeneratedImage, JobState};
use crate::jobs::orchestrator::JobOrchestrator;
use crate::llm::gateway::{GatewayError, ModelGateway};
use crate::llm::media::{decode_base64_image, detect_mime_type, encode_image_file, extension_for_mime};
use crate::state::JobEvent;

/// Runs one command against a recovered orchestrator and returns the text
/// to print.
pub async fn run_command<G: ModelGateway>(
    orchestrator: &JobOrchestrator<G>,
    command: Command,
    max_image_dimension: u32,
) -> Result<String> {
    if command.needs_credential() && !orchestrator.gateway().has_credential() {
        return Err(GatewayError::MissingCredential.into());
    }

    match command {
        Command::Help => Ok(crate::cli::usage().to_string()),
        Command::Characters => Ok(characters_handler(orchestrator)),
        Command::CharacterAdd(args) => {
            character_add_handler(orchestrator, args, max_image_dimension).await
        }
        Command::CharacterDelete { id } => character_delete_handler(orchestrator, &id).await,
        Command::Generate {
            character_id,
            images,
        } => generate_handler(orchestrator, &character_id, &images, max_image_dimension).await,
        Command::Jobs => Ok(jobs_handler(orchestrator)),
        Command::JobDelete { id } => job_delete_handler(orchestrator, &id).await,
        Command::JobsClear => {
            orchestrator.clear_jobs().await?;
            Ok("All jobs cleared.".to_string())
        }
        Command::Export { dir } => export_handler(orchestrator, &dir).await,
    }
}

fn characters_handler<G: ModelGateway>(orchestrator: &JobOrchestrator<G>) -> String {
    let characters = orchestrator.board().characters();
    if characters.is_empty() {
        return "No characters yet.".to_string();
    }
    characters
        .iter()
        .map(describe_character)
        .collect::<Vec<_>>()
        .join("\n")
}

fn describe_character(character: &Character) -> String {
    let traits = character.traits();
    format!(
        "{}  {}  hair: {} ({}, {})  eyes: {}  skin: {}  avatar: {}",
        character.id,
        character.name,
        traits.hair_color,
        traits.hair_length_or_default(),
        traits.hair_texture_or_default(),
        traits.eye_color,
        traits.skin_color,
        if character.avatar_image.is_some() { "yes" } else { "no" }
    )
}

async fn character_add_handler<G: ModelGateway>(
    orchestrator: &JobOrchestrator<G>,
    args: CharacterArgs,
    max_image_dimension: u32,
) -> Result<String> {
    let avatar_image = match args.avatar.as_deref() {
        Some(path) => Some(encode_image_file(path, max_image_dimension)?),
        None => None,
    };
    let character = Character {
        id: args.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
        name: args.name,
        hair_color: args.hair_color,
        eye_color: args.eye_color,
        skin_color: args.skin_color,
        hair_length: args.hair_length,
        hair_texture: args.hair_texture,
        avatar_image,
    };
    let summary = describe_character(&character);
    orchestrator.save_character(character).await?;
    Ok(format!("Saved character:\n{summary}"))
}

async fn character_delete_handler<G: ModelGateway>(
    orchestrator: &JobOrchestrator<G>,
    id: &str,
) -> Result<String> {
    if orchestrator.db().get_character(id).await?.is_none() {
        return Err(anyhow!("Character '{id}' does not exist"));
    }
    orchestrator.delete_character(id).await?;
    Ok(format!("Deleted character {id}."))
}

async fn generate_handler<G: ModelGateway>(
    orchestrator: &JobOrchestrator<G>,
    character_id: &str,
    images: &[PathBuf],
    max_image_dimension: u32,
) -> Result<String> {
    let mut sources = Vec::with_capacity(images.len());
    for path in images {
        sources.push(encode_image_file(path, max_image_dimension)?);
    }
    generate_jobs(orchestrator, character_id, sources).await
}

/// Submits one job per source image and waits for all of them. A failed
/// submit stops further submits, but jobs already running are still waited
/// for so the process does not exit underneath them.
async fn generate_jobs<G: ModelGateway>(
    orchestrator: &JobOrchestrator<G>,
    character_id: &str,
    sources: Vec<String>,
) -> Result<String> {
    // Subscribe first so no Finished event can slip past.
    let mut events = orchestrator.board().subscribe();
    let mut submitted = Vec::with_capacity(sources.len());
    let mut submit_error = None;
    for source in sources {
        match orchestrator.submit_for(character_id, source).await {
            Ok(job) => {
                info!(job_id = %job.id, character_id = %character_id, "Waiting for job");
                submitted.push(job.id);
            }
            Err(err) => {
                submit_error = Some(err);
                break;
            }
        }
    }

    let finished = wait_for_jobs(orchestrator, &mut events, &submitted).await?;
    let report = submitted
        .iter()
        .filter_map(|id| finished.get(id))
        .map(describe_outcome)
        .collect::<Vec<_>>()
        .join("\n");

    match submit_error {
        None => Ok(report),
        Some(err) if submitted.is_empty() => Err(err.into()),
        Some(err) => Err(anyhow!(
            "{err}\nJobs submitted before the failure:\n{report}"
        )),
    }
}

async fn wait_for_jobs<G: ModelGateway>(
    orchestrator: &JobOrchestrator<G>,
    events: &mut broadcast::Receiver<JobEvent>,
    job_ids: &[String],
) -> Result<HashMap<String, GeneratedImage>> {
    let mut finished: HashMap<String, GeneratedImage> = HashMap::new();
    while finished.len() < job_ids.len() {
        match events.recv().await {
            Ok(JobEvent::Finished(job)) if job_ids.contains(&job.id) => {
                finished.insert(job.id.clone(), job);
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped = skipped, "Job events lagged; reading the board");
                for id in job_ids {
                    if let Some(job) = orchestrator.board().job(id) {
                        if job.status().is_terminal() {
                            finished.insert(id.clone(), job);
                        }
                    }
                }
            }
            Err(RecvError::Closed) => return Err(anyhow!("job event channel closed")),
        }
    }
    Ok(finished)
}

fn describe_outcome(job: &GeneratedImage) -> String {
    match &job.state {
        JobState::Completed { .. } => format!("Job {} completed: {}", job.id, job.prompt),
        JobState::Failed { error_message } => format!("Job {} failed: {}", job.id, error_message),
        JobState::Processing => format!("Job {} is still processing", job.id),
    }
}

fn jobs_handler<G: ModelGateway>(orchestrator: &JobOrchestrator<G>) -> String {
    let jobs = orchestrator.board().jobs();
    if jobs.is_empty() {
        return "No jobs yet.".to_string();
    }
    let characters = orchestrator.board().characters();
    jobs.iter()
        .map(|job| {
            let detail = job.error_message().unwrap_or(&job.prompt);
            format!(
                "{}  {}  {}  {}  {}",
                job.id,
                job.status().as_str(),
                character_name_for(job, &characters),
                job.created_at.to_rfc3339(),
                detail
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

async fn job_delete_handler<G: ModelGateway>(
    orchestrator: &JobOrchestrator<G>,
    id: &str,
) -> Result<String> {
    if orchestrator.db().get_job(id).await?.is_none() {
        return Err(anyhow!("Job '{id}' does not exist"));
    }
    orchestrator.delete_job(id).await?;
    Ok(format!("Deleted job {id}."))
}

async fn export_handler<G: ModelGateway>(
    orchestrator: &JobOrchestrator<G>,
    dir: &Path,
) -> Result<String> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let characters = orchestrator.board().characters();
    let mut exported = 0usize;
    for job in orchestrator.board().jobs().iter() {
        let Some(image_data) = job.image_data() else {
            continue;
        };
        let bytes = match decode_base64_image(image_data) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(job_id = %job.id, "Skipping export: {err}");
                continue;
            }
        };
        let mime_type = detect_mime_type(&bytes).unwrap_or_default();
        let file_name = format!(
            "{}-{}.{}",
            sanitize_file_stem(character_name_for(job, &characters)),
            job.id,
            extension_for_mime(&mime_type)
        );
        let path = dir.join(file_name);
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        exported += 1;
    }

    Ok(format!("Exported {exported} image(s) to {}", dir.display()))
}

fn sanitize_file_stem(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|ch| if ch.is_alphanumeric() || ch == '-' || ch == '_' { ch } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "character".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use base64::{engine::general_purpose, Engine as _};
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};

    use super::*;
    use crate::db::database::memory_database;
    use crate::db::models::{CharacterTraits, JobStatus};
    use crate::jobs::orchestrator::PipelinePolicy;
    use crate::jobs::resilience::CallPolicy;
    use crate::llm::gateway::testing::{ScriptedGateway, Step};
    use crate::state::JobBoard;

    fn png_bytes() -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 8, Rgb([200, 100, 50])))
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    fn policy() -> PipelinePolicy {
        let quick = CallPolicy::new(Duration::from_secs(5), 1, Duration::from_millis(1));
        PipelinePolicy {
            prompt: quick,
            image: quick,
        }
    }

    async fn studio<G: ModelGateway>(gateway: G) -> JobOrchestrator<G> {
        let orchestrator =
            JobOrchestrator::new(memory_database().await, Arc::new(gateway), JobBoard::new(), policy());
        orchestrator.recover().await.unwrap();
        orchestrator
    }

    fn add_sarah() -> Command {
        Command::CharacterAdd(CharacterArgs {
            id: Some("sarah".to_string()),
            name: "Sarah Lee".to_string(),
            hair_color: "brown".to_string(),
            eye_color: "green".to_string(),
            skin_color: "fair".to_string(),
            hair_length: None,
            hair_texture: None,
            avatar: None,
        })
    }

    struct KeylessGateway;

    #[async_trait]
    impl ModelGateway for KeylessGateway {
        async fn synthesize_prompt(
            &self,
            _source_image: &str,
            _traits: &CharacterTraits,
        ) -> Result<String, GatewayError> {
            Err(GatewayError::MissingCredential)
        }

        async fn synthesize_image(
            &self,
            _prompt: &str,
            _reference_image: Option<&str>,
        ) -> Result<String, GatewayError> {
            Err(GatewayError::MissingCredential)
        }

        fn has_credential(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn character_lifecycle_is_reflected_in_listing() {
        let orchestrator = studio(ScriptedGateway::succeeding("P", "IMG")).await;
        assert_eq!(
            run_command(&orchestrator, Command::Characters, 256).await.unwrap(),
            "No characters yet."
        );

        run_command(&orchestrator, add_sarah(), 256).await.unwrap();
        let listing = run_command(&orchestrator, Command::Characters, 256).await.unwrap();
        assert!(listing.contains("Sarah Lee"));
        assert!(listing.contains("hair: brown (medium, straight)"));

        let deleted = Command::CharacterDelete {
            id: "sarah".to_string(),
        };
        run_command(&orchestrator, deleted.clone(), 256).await.unwrap();
        assert!(run_command(&orchestrator, deleted, 256).await.is_err());
    }

    #[tokio::test]
    async fn avatar_file_is_encoded_on_add() {
        let dir = tempfile::tempdir().unwrap();
        let avatar = dir.path().join("avatar.png");
        std::fs::write(&avatar, png_bytes()).unwrap();
        let orchestrator = studio(ScriptedGateway::succeeding("P", "IMG")).await;

        let Command::CharacterAdd(mut args) = add_sarah() else {
            unreachable!()
        };
        args.avatar = Some(avatar);
        run_command(&orchestrator, Command::CharacterAdd(args), 256)
            .await
            .unwrap();

        let stored = orchestrator.db().get_character("sarah").await.unwrap().unwrap();
        let avatar = stored.avatar_image.unwrap();
        assert!(!decode_base64_image(&avatar).unwrap().is_empty());
    }

    #[tokio::test]
    async fn generate_waits_for_every_job_and_exports_results() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("one.png");
        let second = dir.path().join("two.png");
        std::fs::write(&first, png_bytes()).unwrap();
        std::fs::write(&second, png_bytes()).unwrap();

        let generated = general_purpose::STANDARD.encode(png_bytes());
        let orchestrator = studio(ScriptedGateway::succeeding("A portrait", &generated)).await;
        run_command(&orchestrator, add_sarah(), 256).await.unwrap();

        let output = run_command(
            &orchestrator,
            Command::Generate {
                character_id: "sarah".to_string(),
                images: vec![first, second],
            },
            256,
        )
        .await
        .unwrap();
        assert_eq!(output.lines().count(), 2);
        assert!(output.lines().all(|line| line.ends_with("completed: A portrait")));

        let jobs = run_command(&orchestrator, Command::Jobs, 256).await.unwrap();
        assert_eq!(jobs.lines().count(), 2);
        assert!(jobs.lines().all(|line| line.contains("completed  Sarah Lee")));

        let out_dir = dir.path().join("export");
        let summary = run_command(
            &orchestrator,
            Command::Export {
                dir: out_dir.clone(),
            },
            256,
        )
        .await
        .unwrap();
        assert!(summary.starts_with("Exported 2 image(s)"));
        let files: Vec<PathBuf> = std::fs::read_dir(&out_dir)
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect();
        assert_eq!(files.len(), 2);
        for file in files {
            let name = file.file_name().unwrap().to_string_lossy().to_string();
            assert!(name.starts_with("Sarah_Lee-"));
            assert!(name.ends_with(".png"));
        }
    }

    #[tokio::test]
    async fn generate_is_refused_without_a_key() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("one.png");
        std::fs::write(&source, png_bytes()).unwrap();
        let orchestrator = studio(KeylessGateway).await;
        run_command(&orchestrator, add_sarah(), 256).await.unwrap();

        let err = run_command(
            &orchestrator,
            Command::Generate {
                character_id: "sarah".to_string(),
                images: vec![source],
            },
            256,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("GEMINI_API_KEY"));
        assert!(orchestrator.db().list_jobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn generate_for_unknown_character_creates_no_job() {
        let orchestrator = studio(ScriptedGateway::succeeding("P", "IMG")).await;
        let result = run_command(
            &orchestrator,
            Command::Generate {
                character_id: "ghost".to_string(),
                images: vec![PathBuf::from("missing.png")],
            },
            256,
        )
        .await;
        assert!(result.is_err());
        assert!(orchestrator.board().jobs().is_empty());
    }

    #[tokio::test]
    async fn failed_and_dangling_jobs_are_listed_and_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("one.png");
        std::fs::write(&source, png_bytes()).unwrap();
        let orchestrator = studio(ScriptedGateway::succeeding("", "IMG")).await;
        run_command(&orchestrator, add_sarah(), 256).await.unwrap();

        let output = run_command(
            &orchestrator,
            Command::Generate {
                character_id: "sarah".to_string(),
                images: vec![source],
            },
            256,
        )
        .await
        .unwrap();
        assert!(output.contains("failed: No description"));

        run_command(
            &orchestrator,
            Command::CharacterDelete {
                id: "sarah".to_string(),
            },
            256,
        )
        .await
        .unwrap();
        let jobs = run_command(&orchestrator, Command::Jobs, 256).await.unwrap();
        assert!(jobs.contains("failed  Unknown"));

        let job_id = orchestrator.board().jobs()[0].id.clone();
        run_command(&orchestrator, Command::JobDelete { id: job_id }, 256)
            .await
            .unwrap();
        assert_eq!(
            run_command(&orchestrator, Command::Jobs, 256).await.unwrap(),
            "No jobs yet."
        );
        assert_eq!(
            run_command(&orchestrator, Command::JobsClear, 256).await.unwrap(),
            "All jobs cleared."
        );
    }

    #[tokio::test]
    async fn failed_submit_still_waits_for_running_jobs() {
        let gateway = ScriptedGateway::new(
            Step::Delayed(Duration::from_millis(100), "P".to_string()),
            Step::Reply("IMG".to_string()),
        );
        let orchestrator = studio(gateway).await;
        run_command(&orchestrator, add_sarah(), 256).await.unwrap();

        let err = generate_jobs(
            &orchestrator,
            "sarah",
            vec!["SRC".to_string(), "  ".to_string()],
        )
        .await
        .unwrap_err()
        .to_string();
        assert!(err.contains("a source image is required"));
        assert!(err.contains("completed: P"));

        let stored = orchestrator.db().list_jobs().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].status(), JobStatus::Completed);
    }

    #[tokio::test]
    async fn unknown_character_is_rejected_before_any_job() {
        let orchestrator = studio(ScriptedGateway::succeeding("P", "IMG")).await;
        let err = generate_jobs(&orchestrator, "ghost", vec!["SRC".to_string()])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("'ghost' does not exist"));
        assert!(orchestrator.db().list_jobs().await.unwrap().is_empty());
        assert_eq!(orchestrator.gateway().prompt_calls(), 0);
    }

    #[test]
    fn file_stems_are_sanitized() {
        assert_eq!(sanitize_file_stem("Sarah Lee"), "Sarah_Lee");
        assert_eq!(sanitize_file_stem("../etc"), "___etc");
        assert_eq!(sanitize_file_stem("  "), "character");
    }
}
