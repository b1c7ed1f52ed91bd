use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Deserialize, Serialize)]
#[sea_orm(table_name = "optimization_jobs")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub kind: String, // backtest / optimize
    pub strategy_ref: String,
    #[sea_orm(column_type = "Text")]
    pub param_space_json: String,
    #[sea_orm(column_type = "Text")]
    pub options_json: String,
    pub budget: i64,
    pub priority: i32,
    pub state: String, // queued / running / done / error / canceled
    pub created_at: i64,
    pub updated_at: i64,
    #[sea_orm(column_type = "Text", nullable)]
    pub output_json: Option<String>,
    pub error_message: Option<String>,
    #[sea_orm(column_type = "Text", nullable)]
    pub error_stack: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
