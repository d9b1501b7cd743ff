use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // ── casbin_rule ──
        manager
            .create_table(
                Table::create()
                    .table(CasbinRule::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(CasbinRule::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(CasbinRule::Ptype).string_len(100).not_null().default(""))
                    .col(ColumnDef::new(CasbinRule::V0).string_len(100).not_null().default(""))
                    .col(ColumnDef::new(CasbinRule::V1).string_len(100).not_null().default(""))
                    .col(ColumnDef::new(CasbinRule::V2).string_len(100).not_null().default(""))
                    .col(ColumnDef::new(CasbinRule::V3).string_len(100).not_null().default(""))
                    .col(ColumnDef::new(CasbinRule::V4).string_len(100).not_null().default(""))
                    .col(ColumnDef::new(CasbinRule::V5).string_len(100).not_null().default(""))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_casbin_rule_unique")
                    .table(CasbinRule::Table)
                    .col(CasbinRule::Ptype)
                    .col(CasbinRule::V0)
                    .col(CasbinRule::V1)
                    .col(CasbinRule::V2)
                    .col(CasbinRule::V3)
                    .col(CasbinRule::V4)
                    .col(CasbinRule::V5)
                    .unique()
                    .if_not_exists()
                    .to_owned(),
            )
            .await?;

        // ── api_permission_mappings ──
        manager
            .create_table(
                Table::create()
                    .table(ApiPermissionMappings::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ApiPermissionMappings::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(ApiPermissionMappings::Method).string_len(10).not_null())
                    .col(ColumnDef::new(ApiPermissionMappings::Path).string_len(255).not_null())
                    .col(ColumnDef::new(ApiPermissionMappings::Resource).string_len(50).not_null())
                    .col(ColumnDef::new(ApiPermissionMappings::Action).string_len(50).not_null())
                    .col(ColumnDef::new(ApiPermissionMappings::Description).string_len(255).null())
                    .col(
                        ColumnDef::new(ApiPermissionMappings::IsActive)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(ColumnDef::new(ApiPermissionMappings::CreatedAt).timestamp().not_null())
                    .col(ColumnDef::new(ApiPermissionMappings::UpdatedAt).timestamp().not_null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_method_path")
                    .table(ApiPermissionMappings::Table)
                    .col(ApiPermissionMappings::Method)
                    .col(ApiPermissionMappings::Path)
                    .if_not_exists()
                    .to_owned(),
            )
            .await?;

        // ── system_configs ──
        manager
            .create_table(
                Table::create()
                    .table(SystemConfigs::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(SystemConfigs::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(SystemConfigs::Key)
                            .string_len(100)
                            .not_null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new(SystemConfigs::Value).string_len(500).not_null())
                    .col(
                        ColumnDef::new(SystemConfigs::ValueType)
                            .string_len(20)
                            .not_null()
                            .default("string"),
                    )
                    .col(ColumnDef::new(SystemConfigs::Name).string_len(100).not_null())
                    .col(ColumnDef::new(SystemConfigs::Description).string_len(500).null())
                    .col(ColumnDef::new(SystemConfigs::Group).string_len(50).null())
                    .col(
                        ColumnDef::new(SystemConfigs::Enabled)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(ColumnDef::new(SystemConfigs::CreatedAt).timestamp().not_null())
                    .col(ColumnDef::new(SystemConfigs::UpdatedAt).timestamp().not_null())
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(SystemConfigs::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(ApiPermissionMappings::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(CasbinRule::Table).to_owned())
            .await?;
        Ok(())
    }
}

#[derive(Iden)]
enum CasbinRule {
    Table,
    Id,
    Ptype,
    V0,
    V1,
    V2,
    V3,
    V4,
    V5,
}

#[derive(Iden)]
enum ApiPermissionMappings {
    Table,
    Id,
    Method,
    Path,
    Resource,
    Action,
    Description,
    IsActive,
    CreatedAt,
    UpdatedAt,
}

#[derive(Iden)]
enum SystemConfigs {
    Table,
    Id,
    Key,
    Value,
    ValueType,
    Name,
    Description,
    Group,
    Enabled,
    CreatedAt,
    UpdatedAt,
}
