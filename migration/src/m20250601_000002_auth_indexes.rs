use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Candidate-rule lookup: (realm, type, action) is the hot path of
        // every access check.
        manager
            .create_index(
                Index::create()
                    .name("idx_acl_rule_lookup")
                    .table(Alias::new("acl_rule"))
                    .col(Alias::new("realm_id"))
                    .col(Alias::new("resource_type_id"))
                    .col(Alias::new("action_id"))
                    .to_owned(),
            )
            .await?;

        // Subject columns are OR-matched; separate indexes let the planner
        // bitmap-or them.
        manager
            .create_index(
                Index::create()
                    .name("idx_acl_rule_principal")
                    .table(Alias::new("acl_rule"))
                    .col(Alias::new("principal_id"))
                    .to_owned(),
            )
            .await?;
        manager
            .create_index(
                Index::create()
                    .name("idx_acl_rule_role")
                    .table(Alias::new("acl_rule"))
                    .col(Alias::new("role_id"))
                    .to_owned(),
            )
            .await?;

        // Resource partition scan.
        manager
            .create_index(
                Index::create()
                    .name("idx_resource_partition")
                    .table(Alias::new("resource"))
                    .col(Alias::new("realm_id"))
                    .col(Alias::new("resource_type_id"))
                    .to_owned(),
            )
            .await?;

        // Reverse mapping internal id → external ids.
        manager
            .create_index(
                Index::create()
                    .name("idx_external_ids_resource")
                    .table(Alias::new("external_ids"))
                    .col(Alias::new("realm_id"))
                    .col(Alias::new("resource_type_id"))
                    .col(Alias::new("resource_id"))
                    .to_owned(),
            )
            .await?;

        // Retention sweep.
        manager
            .create_index(
                Index::create()
                    .name("idx_authorization_log_timestamp")
                    .table(Alias::new("authorization_log"))
                    .col(Alias::new("timestamp"))
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        for (table, name) in [
            ("authorization_log", "idx_authorization_log_timestamp"),
            ("external_ids", "idx_external_ids_resource"),
            ("resource", "idx_resource_partition"),
            ("acl_rule", "idx_acl_rule_role"),
            ("acl_rule", "idx_acl_rule_principal"),
            ("acl_rule", "idx_acl_rule_lookup"),
        ] {
            manager
                .drop_index(
                    Index::drop()
                        .name(name)
                        .table(Alias::new(table))
                        .to_owned(),
                )
                .await?;
        }
        Ok(())
    }
}
