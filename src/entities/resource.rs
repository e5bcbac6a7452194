use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// A protected object. `geometry` holds the canonical-projection EWKT
/// rendering produced at ingest; on a PostGIS deployment the column is a
/// `geometry(GEOMETRY, 3857)` and the compiled fragments operate on it
/// directly.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "resource")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub realm_id: i32,
    pub resource_type_id: i32,
    pub geometry: Option<String>,
    pub attributes: Json,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
