use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Application-supplied identifier for a resource, unique within
/// `(realm, resource_type)`. A resource may carry any number of them.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "external_ids")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub realm_id: i32,
    #[sea_orm(primary_key, auto_increment = false)]
    pub resource_type_id: i32,
    #[sea_orm(primary_key, auto_increment = false)]
    pub external_id: String,
    pub resource_id: i32,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
