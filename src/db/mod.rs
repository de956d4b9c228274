pub mod database;
pub mod models;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("corrupt record: {0}")]
    Corrupt(String),
}
