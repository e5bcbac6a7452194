use sea_orm_migration::{prelude::*, schema::*};

/// Create a bigint primary key column with auto-increment feature.
fn big_pk_auto<T: IntoIden>(name: T) -> ColumnDef {
    big_integer(name).auto_increment().primary_key().take()
}

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Enable foreign keys for SQLite
        if manager.get_database_backend() == sea_orm::DatabaseBackend::Sqlite {
            manager
                .get_connection()
                .execute_unprepared("PRAGMA foreign_keys = ON")
                .await?;
        }

        // Create realm table
        manager
            .create_table(
                Table::create()
                    .table(Realm::Table)
                    .if_not_exists()
                    .col(pk_auto(Realm::Id))
                    .col(string_uniq(Realm::Name))
                    .col(string_null(Realm::Description))
                    .col(boolean(Realm::IsActive).default(true))
                    .to_owned(),
            )
            .await?;

        // Create resource_type table
        manager
            .create_table(
                Table::create()
                    .table(ResourceType::Table)
                    .if_not_exists()
                    .col(pk_auto(ResourceType::Id))
                    .col(integer(ResourceType::RealmId))
                    .col(string(ResourceType::Name))
                    .col(boolean(ResourceType::IsPublic).default(false))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_resource_type_realm")
                            .from(ResourceType::Table, ResourceType::RealmId)
                            .to(Realm::Table, Realm::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;
        manager
            .create_index(
                Index::create()
                    .name("uq_resource_type_realm_name")
                    .table(ResourceType::Table)
                    .col(ResourceType::RealmId)
                    .col(ResourceType::Name)
                    .unique()
                    .to_owned(),
            )
            .await?;

        // Create action table
        manager
            .create_table(
                Table::create()
                    .table(Action::Table)
                    .if_not_exists()
                    .col(pk_auto(Action::Id))
                    .col(integer(Action::RealmId))
                    .col(string(Action::Name))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_action_realm")
                            .from(Action::Table, Action::RealmId)
                            .to(Realm::Table, Realm::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;
        manager
            .create_index(
                Index::create()
                    .name("uq_action_realm_name")
                    .table(Action::Table)
                    .col(Action::RealmId)
                    .col(Action::Name)
                    .unique()
                    .to_owned(),
            )
            .await?;

        // Create auth_role table
        manager
            .create_table(
                Table::create()
                    .table(AuthRole::Table)
                    .if_not_exists()
                    .col(pk_auto(AuthRole::Id))
                    .col(integer(AuthRole::RealmId))
                    .col(string(AuthRole::Name))
                    .col(json_binary_null(AuthRole::Attributes))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_auth_role_realm")
                            .from(AuthRole::Table, AuthRole::RealmId)
                            .to(Realm::Table, Realm::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;
        manager
            .create_index(
                Index::create()
                    .name("uq_auth_role_realm_name")
                    .table(AuthRole::Table)
                    .col(AuthRole::RealmId)
                    .col(AuthRole::Name)
                    .unique()
                    .to_owned(),
            )
            .await?;

        // Create principal table
        manager
            .create_table(
                Table::create()
                    .table(Principal::Table)
                    .if_not_exists()
                    .col(pk_auto(Principal::Id))
                    .col(integer(Principal::RealmId))
                    .col(string(Principal::Username))
                    .col(json_binary(Principal::Attributes))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_principal_realm")
                            .from(Principal::Table, Principal::RealmId)
                            .to(Realm::Table, Realm::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;
        manager
            .create_index(
                Index::create()
                    .name("uq_principal_realm_username")
                    .table(Principal::Table)
                    .col(Principal::RealmId)
                    .col(Principal::Username)
                    .unique()
                    .to_owned(),
            )
            .await?;

        // Create principal_roles table
        manager
            .create_table(
                Table::create()
                    .table(PrincipalRoles::Table)
                    .if_not_exists()
                    .col(integer(PrincipalRoles::PrincipalId))
                    .col(integer(PrincipalRoles::RoleId))
                    .primary_key(
                        Index::create()
                            .col(PrincipalRoles::PrincipalId)
                            .col(PrincipalRoles::RoleId),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_principal_roles_principal")
                            .from(PrincipalRoles::Table, PrincipalRoles::PrincipalId)
                            .to(Principal::Table, Principal::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_principal_roles_role")
                            .from(PrincipalRoles::Table, PrincipalRoles::RoleId)
                            .to(AuthRole::Table, AuthRole::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // Create resource table. The geometry column holds canonical-SRID
        // EWKT text; the spatial-support migration converts it to a PostGIS
        // geometry on Postgres deployments.
        manager
            .create_table(
                Table::create()
                    .table(Resource::Table)
                    .if_not_exists()
                    .col(pk_auto(Resource::Id))
                    .col(integer(Resource::RealmId))
                    .col(integer(Resource::ResourceTypeId))
                    .col(string_null(Resource::Geometry))
                    .col(json_binary(Resource::Attributes))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_resource_realm")
                            .from(Resource::Table, Resource::RealmId)
                            .to(Realm::Table, Realm::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_resource_type")
                            .from(Resource::Table, Resource::ResourceTypeId)
                            .to(ResourceType::Table, ResourceType::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // Create external_ids table
        manager
            .create_table(
                Table::create()
                    .table(ExternalIds::Table)
                    .if_not_exists()
                    .col(integer(ExternalIds::RealmId))
                    .col(integer(ExternalIds::ResourceTypeId))
                    .col(string(ExternalIds::ExternalId))
                    .col(integer(ExternalIds::ResourceId))
                    .primary_key(
                        Index::create()
                            .col(ExternalIds::RealmId)
                            .col(ExternalIds::ResourceTypeId)
                            .col(ExternalIds::ExternalId),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_external_ids_resource")
                            .from(ExternalIds::Table, ExternalIds::ResourceId)
                            .to(Resource::Table, Resource::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // Create acl_rule table
        manager
            .create_table(
                Table::create()
                    .table(AclRule::Table)
                    .if_not_exists()
                    .col(pk_auto(AclRule::Id))
                    .col(integer(AclRule::RealmId))
                    .col(integer(AclRule::ResourceTypeId))
                    .col(integer(AclRule::ActionId))
                    .col(integer_null(AclRule::PrincipalId))
                    .col(integer_null(AclRule::RoleId))
                    .col(integer_null(AclRule::ResourceId))
                    .col(json_binary_null(AclRule::Conditions))
                    .col(text_null(AclRule::CompiledSql))
                    .col(json_binary_null(AclRule::CompiledParams))
                    .col(string_null(AclRule::CompiledHash))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_acl_rule_realm")
                            .from(AclRule::Table, AclRule::RealmId)
                            .to(Realm::Table, Realm::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_acl_rule_type")
                            .from(AclRule::Table, AclRule::ResourceTypeId)
                            .to(ResourceType::Table, ResourceType::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_acl_rule_action")
                            .from(AclRule::Table, AclRule::ActionId)
                            .to(Action::Table, Action::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // Create authorization_log table
        manager
            .create_table(
                Table::create()
                    .table(AuthorizationLog::Table)
                    .if_not_exists()
                    .col(big_pk_auto(AuthorizationLog::Id))
                    .col(timestamp_with_time_zone(AuthorizationLog::Timestamp))
                    .col(integer(AuthorizationLog::RealmId))
                    .col(integer(AuthorizationLog::PrincipalId))
                    .col(string_null(AuthorizationLog::ActionName))
                    .col(string_null(AuthorizationLog::ResourceTypeName))
                    .col(boolean(AuthorizationLog::Decision))
                    .col(json_binary_null(AuthorizationLog::ResourceIds))
                    .col(json_binary_null(AuthorizationLog::ExternalResourceIds))
                    .to_owned(),
            )
            .await?;

        // Create job_execution table
        manager
            .create_table(
                Table::create()
                    .table(JobExecution::Table)
                    .if_not_exists()
                    .col(big_pk_auto(JobExecution::Id))
                    .col(string(JobExecution::JobName))
                    .col(big_integer(JobExecution::StartedAt))
                    .col(big_integer_null(JobExecution::CompletedAt))
                    .col(big_integer_null(JobExecution::Success))
                    .col(string_null(JobExecution::ErrorMessage))
                    .col(big_integer_null(JobExecution::RecordsProcessed))
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        for table in [
            "job_execution",
            "authorization_log",
            "acl_rule",
            "external_ids",
            "resource",
            "principal_roles",
            "principal",
            "auth_role",
            "action",
            "resource_type",
            "realm",
        ] {
            manager
                .drop_table(Table::drop().table(Alias::new(table)).if_exists().to_owned())
                .await?;
        }
        Ok(())
    }
}

#[derive(DeriveIden)]
enum Realm {
    Table,
    Id,
    Name,
    Description,
    IsActive,
}

#[derive(DeriveIden)]
enum ResourceType {
    Table,
    Id,
    RealmId,
    Name,
    IsPublic,
}

#[derive(DeriveIden)]
enum Action {
    Table,
    Id,
    RealmId,
    Name,
}

#[derive(DeriveIden)]
enum AuthRole {
    Table,
    Id,
    RealmId,
    Name,
    Attributes,
}

#[derive(DeriveIden)]
enum Principal {
    Table,
    Id,
    RealmId,
    Username,
    Attributes,
}

#[derive(DeriveIden)]
enum PrincipalRoles {
    Table,
    PrincipalId,
    RoleId,
}

#[derive(DeriveIden)]
enum Resource {
    Table,
    Id,
    RealmId,
    ResourceTypeId,
    Geometry,
    Attributes,
}

#[derive(DeriveIden)]
enum ExternalIds {
    Table,
    RealmId,
    ResourceTypeId,
    ExternalId,
    ResourceId,
}

#[derive(DeriveIden)]
enum AclRule {
    Table,
    Id,
    RealmId,
    ResourceTypeId,
    ActionId,
    PrincipalId,
    RoleId,
    ResourceId,
    Conditions,
    CompiledSql,
    CompiledParams,
    CompiledHash,
}

#[derive(DeriveIden)]
enum AuthorizationLog {
    Table,
    Id,
    Timestamp,
    RealmId,
    PrincipalId,
    ActionName,
    ResourceTypeName,
    Decision,
    ResourceIds,
    ExternalResourceIds,
}

#[derive(DeriveIden)]
enum JobExecution {
    Table,
    Id,
    JobName,
    StartedAt,
    CompletedAt,
    Success,
    ErrorMessage,
    RecordsProcessed,
}
