use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Create devices table for the device authorization flow
        manager
            .create_table(
                Table::create()
                    .table(Devices::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Devices::Id).string().not_null().primary_key())
                    .col(
                        ColumnDef::new(Devices::DeviceCode)
                            .string()
                            .not_null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new(Devices::UserCode).string().not_null())
                    .col(ColumnDef::new(Devices::DeviceName).string().not_null())
                    .col(ColumnDef::new(Devices::DeviceType).string().not_null())
                    .col(ColumnDef::new(Devices::DeviceId).string().not_null())
                    .col(ColumnDef::new(Devices::OwnerId).string())
                    .col(ColumnDef::new(Devices::OwnerEmail).string())
                    .col(
                        ColumnDef::new(Devices::Status)
                            .string()
                            .not_null()
                            .default("pending"),
                    )
                    .col(
                        ColumnDef::new(Devices::SessionIssued)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(Devices::ExpiresAt).big_integer().not_null())
                    .col(ColumnDef::new(Devices::LastSeenAt).big_integer())
                    .col(
                        ColumnDef::new(Devices::Active)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(Devices::CreatedAt).big_integer().not_null())
                    .col(ColumnDef::new(Devices::UpdatedAt).big_integer().not_null())
                    .to_owned(),
            )
            .await?;

        // Index on owner_id for the active-device listing
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_devices_owner_id")
                    .table(Devices::Table)
                    .col(Devices::OwnerId)
                    .to_owned(),
            )
            .await?;

        // Index on expires_at for the retention sweep
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_devices_expires_at")
                    .table(Devices::Table)
                    .col(Devices::ExpiresAt)
                    .to_owned(),
            )
            .await?;

        // Index on status for filtering pending/approved records
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_devices_status")
                    .table(Devices::Table)
                    .col(Devices::Status)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Devices::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Devices {
    Table,
    Id,
    DeviceCode,
    UserCode,
    DeviceName,
    DeviceType,
    DeviceId,
    OwnerId,
    OwnerEmail,
    Status,
    SessionIssued,
    ExpiresAt,
    LastSeenAt,
    Active,
    CreatedAt,
    UpdatedAt,
}
