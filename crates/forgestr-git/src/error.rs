//! Error types for forgestr-git

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid repository id: {0}")]
    InvalidRepoId(String),

    #[error("Invalid announcement: {0}")]
    InvalidAnnouncement(String),

    #[error("Not a bare repository: {0}")]
    NotARepository(String),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("Task error: {0}")]
    Task(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
