pub mod connection;
pub mod entity;
pub mod job_store;
pub mod repository;

pub use connection::establish_connection;
pub use job_store::JobStore;

use crate::optimize::model::JobState;
use sea_orm::DbErr;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] DbErr),
    #[error("job not found: {0}")]
    NotFound(String),
    #[error("job {id}: illegal transition {from} -> {to}")]
    IllegalTransition {
        id: String,
        from: JobState,
        to: JobState,
    },
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error("cannot encode record: {0}")]
    Encode(String),
}
