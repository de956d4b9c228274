use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::db::models::{
    Character, CharacterRow, GeneratedImage, JobRow, JobStatus, INTERRUPTED_MESSAGE,
};
use crate::db::StoreError;

pub type StoreResult<T> = Result<T, StoreError>;

const JOB_COLUMNS: &str =
    "id, character_id, prompt, image_data, created_at, status, error_message";
const CHARACTER_COLUMNS: &str =
    "id, name, hair_color, eye_color, skin_color, hair_length, hair_texture, avatar_image";

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn init(database_url: &str) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

        // Every connection to `:memory:` is a separate database.
        let in_memory = database_url.contains(":memory:");
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options.connect_with(options).await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS characters (\
                id TEXT PRIMARY KEY,\
                name TEXT NOT NULL,\
                hair_color TEXT NOT NULL,\
                eye_color TEXT NOT NULL,\
                skin_color TEXT NOT NULL,\
                hair_length TEXT,\
                hair_texture TEXT,\
                avatar_image TEXT\
            );",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS images (\
                id TEXT PRIMARY KEY,\
                character_id TEXT NOT NULL,\
                prompt TEXT NOT NULL,\
                image_data TEXT,\
                created_at INTEGER NOT NULL,\
                status TEXT NOT NULL,\
                error_message TEXT\
            );",
        )
        .execute(&pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_images_created_at ON images(created_at);")
            .execute(&pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_images_status ON images(status);")
            .execute(&pool)
            .await?;

        info!("Database tables created successfully");

        Ok(Database { pool })
    }

    pub async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn list_characters(&self) -> StoreResult<Vec<Character>> {
        let query = format!("SELECT {CHARACTER_COLUMNS} FROM characters ORDER BY name, id");
        let rows = sqlx::query_as::<_, CharacterRow>(&query)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Character::from).collect())
    }

    pub async fn get_character(&self, id: &str) -> StoreResult<Option<Character>> {
        let query = format!("SELECT {CHARACTER_COLUMNS} FROM characters WHERE id = ?");
        let row = sqlx::query_as::<_, CharacterRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Character::from))
    }

    pub async fn upsert_character(&self, character: &Character) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO characters (id, name, hair_color, eye_color, skin_color, hair_length, hair_texture, avatar_image) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET \
             name = excluded.name, \
             hair_color = excluded.hair_color, \
             eye_color = excluded.eye_color, \
             skin_color = excluded.skin_color, \
             hair_length = excluded.hair_length, \
             hair_texture = excluded.hair_texture, \
             avatar_image = excluded.avatar_image",
        )
        .bind(&character.id)
        .bind(&character.name)
        .bind(&character.hair_color)
        .bind(&character.eye_color)
        .bind(&character.skin_color)
        .bind(&character.hair_length)
        .bind(&character.hair_texture)
        .bind(&character.avatar_image)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_character(&self, id: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM characters WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Most recent first.
    pub async fn list_jobs(&self) -> StoreResult<Vec<GeneratedImage>> {
        let query = format!("SELECT {JOB_COLUMNS} FROM images ORDER BY created_at DESC, id DESC");
        let rows = sqlx::query_as::<_, JobRow>(&query)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(GeneratedImage::try_from).collect()
    }

    pub async fn get_job(&self, id: &str) -> StoreResult<Option<GeneratedImage>> {
        let query = format!("SELECT {JOB_COLUMNS} FROM images WHERE id = ?");
        let row = sqlx::query_as::<_, JobRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(GeneratedImage::try_from).transpose()
    }

    pub async fn upsert_job(&self, job: &GeneratedImage) -> StoreResult<()> {
        let row = JobRow::from_job(job);
        sqlx::query(
            "INSERT INTO images (id, character_id, prompt, image_data, created_at, status, error_message) \
             VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET \
             character_id = excluded.character_id, \
             prompt = excluded.prompt, \
             image_data = excluded.image_data, \
             created_at = excluded.created_at, \
             status = excluded.status, \
             error_message = excluded.error_message",
        )
        .bind(row.id)
        .bind(row.character_id)
        .bind(row.prompt)
        .bind(row.image_data)
        .bind(row.created_at)
        .bind(row.status)
        .bind(row.error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_job(&self, id: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM images WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn clear_jobs(&self) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM images").execute(&self.pool).await?;
        info!("Cleared {} job(s)", result.rows_affected());
        Ok(())
    }

    /// Marks every job still `processing` as failed. Only ever called at
    /// startup, when no pipeline of this process can own such a job.
    pub async fn sweep_stale_jobs(&self) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE images SET status = ?, error_message = ?, image_data = NULL WHERE status = ?",
        )
        .bind(JobStatus::Failed.as_str())
        .bind(INTERRUPTED_MESSAGE)
        .bind(JobStatus::Processing.as_str())
        .execute(&self.pool)
        .await?;

        let swept = result.rows_affected();
        if swept > 0 {
            warn!("Marked {swept} interrupted job(s) as failed");
        }
        Ok(swept)
    }
}

#[cfg(test)]
pub(crate) async fn memory_database() -> Database {
    Database::init("sqlite::memory:")
        .await
        .expect("in-memory database")
}
