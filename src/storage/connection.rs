use crate::storage::entity::optimization_job;
use log::info;
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbErr, Schema};
use std::time::Duration;

pub async fn establish_connection(db_url: &str) -> Result<DatabaseConnection, DbErr> {
    let mut opt = ConnectOptions::new(db_url.to_owned());
    opt.max_connections(10)
        .min_connections(1)
        .connect_timeout(Duration::from_secs(8))
        .acquire_timeout(Duration::from_secs(8))
        .sqlx_logging(true)
        .sqlx_logging_level(log::LevelFilter::Info);

    let db = Database::connect(opt).await?;

    if db.get_database_backend() == sea_orm::DatabaseBackend::Sqlite {
        db.execute(sea_orm::Statement::from_string(
            sea_orm::DatabaseBackend::Sqlite,
            "PRAGMA journal_mode=WAL;".to_string(),
        ))
        .await?;
    }

    let builder = db.get_database_backend();
    let schema = Schema::new(builder);

    let stmt = builder.build(
        schema
            .create_table_from_entity(optimization_job::Entity)
            .if_not_exists(),
    );
    db.execute(stmt).await?;

    // resume_candidates and cleanup both filter on state
    db.execute(sea_orm::Statement::from_string(
        builder,
        "CREATE INDEX IF NOT EXISTS idx_optimization_jobs_state ON optimization_jobs(state, updated_at);"
            .to_string(),
    ))
    .await?;

    info!("Database connection established, optimization_jobs ready.");

    Ok(db)
}
