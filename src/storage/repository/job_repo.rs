use crate::optimize::model::{JobFailure, JobKind, JobOutput, JobRecord, JobState, SearchOptions};
use crate::optimize::space::ParamSpace;
use crate::storage::entity::optimization_job::{
    self, ActiveModel as OptimizationJobActiveModel, Entity as OptimizationJob,
};
use crate::storage::StoreError;
use log::error;
use sea_orm::sea_query::OnConflict;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set};

pub struct JobRepository;

impl JobRepository {
    /// Insert or fully overwrite the row for `record.id`.
    pub async fn upsert(db: &DatabaseConnection, record: &JobRecord) -> Result<(), StoreError> {
        let active_model = to_active_model(record)?;
        OptimizationJob::insert(active_model)
            .on_conflict(
                OnConflict::column(optimization_job::Column::Id)
                    .update_columns([
                        optimization_job::Column::Kind,
                        optimization_job::Column::StrategyRef,
                        optimization_job::Column::ParamSpaceJson,
                        optimization_job::Column::OptionsJson,
                        optimization_job::Column::Budget,
                        optimization_job::Column::Priority,
                        optimization_job::Column::State,
                        optimization_job::Column::CreatedAt,
                        optimization_job::Column::UpdatedAt,
                        optimization_job::Column::OutputJson,
                        optimization_job::Column::ErrorMessage,
                        optimization_job::Column::ErrorStack,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(db)
            .await?;
        Ok(())
    }

    /// Every readable row, oldest first. Rows that no longer decode are
    /// logged and skipped so one bad record cannot keep the store closed.
    pub async fn load_all(db: &DatabaseConnection) -> Result<Vec<JobRecord>, StoreError> {
        let rows = OptimizationJob::find()
            .order_by_asc(optimization_job::Column::CreatedAt)
            .all(db)
            .await?;
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            match JobRecord::try_from(row) {
                Ok(record) => records.push(record),
                Err(e) => error!("✗ skipping unreadable job row: {}", e),
            }
        }
        Ok(records)
    }

    pub async fn delete_many(db: &DatabaseConnection, ids: &[String]) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let res = OptimizationJob::delete_many()
            .filter(optimization_job::Column::Id.is_in(ids.iter().cloned()))
            .exec(db)
            .await?;
        Ok(res.rows_affected)
    }
}

fn to_active_model(record: &JobRecord) -> Result<OptimizationJobActiveModel, StoreError> {
    let encode = |what: &str, e: serde_json::Error| {
        StoreError::Encode(format!("{} of {}: {}", what, record.id, e))
    };
    let param_space_json =
        serde_json::to_string(&record.param_space).map_err(|e| encode("param_space", e))?;
    let options_json = serde_json::to_string(&record.options).map_err(|e| encode("options", e))?;
    let output_json = record
        .output
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| encode("output", e))?;

    Ok(OptimizationJobActiveModel {
        id: Set(record.id.clone()),
        kind: Set(record.kind.as_str().to_string()),
        strategy_ref: Set(record.strategy_ref.clone()),
        param_space_json: Set(param_space_json),
        options_json: Set(options_json),
        budget: Set(record.budget as i64),
        priority: Set(record.priority),
        state: Set(record.state.as_str().to_string()),
        created_at: Set(record.created_at),
        updated_at: Set(record.updated_at),
        output_json: Set(output_json),
        error_message: Set(record.error.as_ref().map(|e| e.message.clone())),
        error_stack: Set(record.error.as_ref().map(|e| e.stack.clone())),
    })
}

impl TryFrom<optimization_job::Model> for JobRecord {
    type Error = StoreError;

    fn try_from(m: optimization_job::Model) -> Result<Self, Self::Error> {
        let id = m.id;
        let corrupt = |what: &str, detail: String| {
            StoreError::Corrupt(format!("row {}: bad {}: {}", id, what, detail))
        };

        let kind = m.kind.parse::<JobKind>().map_err(|e| corrupt("kind", e))?;
        let state = m.state.parse::<JobState>().map_err(|e| corrupt("state", e))?;
        let param_space: ParamSpace = serde_json::from_str(&m.param_space_json)
            .map_err(|e| corrupt("param_space", e.to_string()))?;
        let options: SearchOptions = serde_json::from_str(&m.options_json)
            .map_err(|e| corrupt("options", e.to_string()))?;
        let output: Option<JobOutput> = m
            .output_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| corrupt("output", e.to_string()))?;
        let budget = usize::try_from(m.budget).map_err(|e| corrupt("budget", e.to_string()))?;
        let error = m.error_message.map(|message| JobFailure {
            message,
            stack: m.error_stack.unwrap_or_default(),
        });

        Ok(JobRecord {
            id,
            kind,
            strategy_ref: m.strategy_ref,
            param_space,
            budget,
            priority: m.priority,
            state,
            created_at: m.created_at,
            updated_at: m.updated_at,
            options,
            output,
            error,
        })
    }
}
