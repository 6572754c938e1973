/// 数据库访问层

pub mod models;

use common::Error;
use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbErr, EntityTrait, Schema,
    SqlErr,
};
use tracing::info;

use models::{disk, nic, request, switch, vm, vm_config};

/// 同一目标最多一条未完成请求的数据库级兜底
const PENDING_REQUEST_INDEX: &str =
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_requests_pending ON requests(target_id) WHERE complete = 0";

/// 建立数据库连接 (SeaORM) 并初始化表结构
///
/// 连接池固定为一个连接，所有写操作天然串行
pub async fn establish_connection(database_url: &str) -> Result<DatabaseConnection, anyhow::Error> {
    info!("正在连接数据库: {}", database_url);

    let mut options = ConnectOptions::new(database_url.to_string());
    options
        .max_connections(1)
        .min_connections(1)
        .sqlx_logging(false);

    let db = Database::connect(options).await?;
    init_schema(&db).await?;
    info!("数据库连接成功");

    Ok(db)
}

async fn create_table<E: EntityTrait>(db: &DatabaseConnection, schema: &Schema, entity: E) -> Result<(), DbErr> {
    let backend = db.get_database_backend();
    let mut stmt = schema.create_table_from_entity(entity);
    stmt.if_not_exists();
    db.execute(backend.build(&stmt)).await?;
    Ok(())
}

/// 按实体定义建表（已存在则跳过）
pub async fn init_schema(db: &DatabaseConnection) -> Result<(), DbErr> {
    let schema = Schema::new(db.get_database_backend());

    create_table(db, &schema, request::Entity).await?;
    create_table(db, &schema, vm::Entity).await?;
    create_table(db, &schema, vm_config::Entity).await?;
    create_table(db, &schema, switch::Entity).await?;
    create_table(db, &schema, nic::Entity).await?;
    create_table(db, &schema, disk::Entity).await?;

    db.execute_unprepared(PENDING_REQUEST_INDEX).await?;
    Ok(())
}

/// 数据库错误转换为统一错误类型
pub fn db_err(err: DbErr) -> Error {
    match err.sql_err() {
        Some(SqlErr::UniqueConstraintViolation(msg)) => Error::Conflict(format!("唯一约束冲突: {}", msg)),
        _ => Error::Database(err.to_string()),
    }
}

#[cfg(test)]
pub async fn memory_connection() -> DatabaseConnection {
    establish_connection("sqlite::memory:")
        .await
        .expect("内存数据库初始化失败")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_schema_is_idempotent() {
        let db = memory_connection().await;
        init_schema(&db).await.unwrap();
    }
}
