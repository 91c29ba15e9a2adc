//! Creates the network_logs table

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(NetworkLog::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(NetworkLog::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(NetworkLog::RequestUrl)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(NetworkLog::RequestMethod)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(NetworkLog::RequestHeaders)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(NetworkLog::RequestBodyType)
                            .string()
                            .not_null()
                            .default(""),
                    )
                    .col(
                        ColumnDef::new(NetworkLog::RequestBodyLength)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(NetworkLog::RequestBody)
                            .text()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(NetworkLog::RequestTimestamp)
                            .big_integer()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(NetworkLog::ResponseTimestamp)
                            .big_integer()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(NetworkLog::ResponseStatusCode)
                            .integer()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(NetworkLog::ResponseHeaders)
                            .text()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(NetworkLog::ResponseBodyType)
                            .string()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(NetworkLog::ResponseBodyLength)
                            .big_integer()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(NetworkLog::ResponseBody)
                            .text()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(NetworkLog::Protocol)
                            .string()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(NetworkLog::ErrorDetails)
                            .text()
                            .null(),
                    )
                    .to_owned(),
            )
            .await?;

        // List views sort by recency
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_network_logs_request_timestamp")
                    .table(NetworkLog::Table)
                    .col(NetworkLog::RequestTimestamp)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_network_logs_request_url")
                    .table(NetworkLog::Table)
                    .col(NetworkLog::RequestUrl)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(NetworkLog::Table).to_owned())
            .await?;

        Ok(())
    }
}

#[derive(DeriveIden)]
enum NetworkLog {
    #[sea_orm(iden = "network_logs")]
    Table,
    Id,
    RequestUrl,
    RequestMethod,
    RequestHeaders,
    RequestBodyType,
    RequestBodyLength,
    RequestBody,
    RequestTimestamp,
    ResponseTimestamp,
    ResponseStatusCode,
    ResponseHeaders,
    ResponseBodyType,
    ResponseBodyLength,
    ResponseBody,
    Protocol,
    ErrorDetails,
}
