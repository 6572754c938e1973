/// 异步请求队列服务
///
/// 受理：同一目标只能有一条未完成请求，检查和插入在同一个事务中完成
/// 领取：按创建时间取最早一条未开始的请求并写入开始时间，每条请求只会被领取一次

use chrono::Utc;
use common::utils::{generate_id, validate_id};
use common::{Error, RequestKind, Result};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use crate::app_state::AppState;
use crate::db::db_err;
use crate::db::models::request::{
    ActiveModel as RequestActiveModel, Column as RequestColumn, Entity as RequestEntity,
    Model as RequestModel, RequestResponse, RequestStatusResponse,
};

pub struct RequestService {
    state: AppState,
}

impl RequestService {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// 受理一条请求，返回请求 ID
    pub async fn enqueue(&self, kind: RequestKind, target_id: &str, payload: JsonValue) -> Result<String> {
        validate_id(target_id)?;

        let txn = self.state.sea_db.begin().await.map_err(db_err)?;

        let pending = RequestEntity::find()
            .filter(RequestColumn::TargetId.eq(target_id))
            .filter(RequestColumn::Complete.eq(false))
            .one(&txn)
            .await
            .map_err(db_err)?;
        if let Some(pending) = pending {
            return Err(Error::Conflict(format!(
                "目标 {} 已有未完成的请求 {} ({})",
                target_id, pending.id, pending.kind
            )));
        }

        let request_id = generate_id();
        let request = RequestActiveModel {
            id: Set(request_id.clone()),
            target_id: Set(target_id.to_string()),
            kind: Set(kind.as_str().to_string()),
            payload: Set(payload),
            complete: Set(false),
            successful: Set(false),
            error_message: Set(None),
            created_at: Set(Utc::now().into()),
            started_at: Set(None),
            completed_at: Set(None),
        };
        request.insert(&txn).await.map_err(db_err)?;
        txn.commit().await.map_err(db_err)?;

        info!("受理请求 {}: {} -> {}", request_id, kind, target_id);
        Ok(request_id)
    }

    pub async fn get(&self, request_id: &str) -> Result<RequestModel> {
        RequestEntity::find_by_id(request_id)
            .one(&self.state.sea_db)
            .await
            .map_err(db_err)?
            .ok_or_else(|| Error::NotFound(format!("请求 {} 不存在", request_id)))
    }

    /// 查询请求状态
    pub async fn get_status(&self, request_id: &str) -> Result<RequestStatusResponse> {
        let request = self.get(request_id).await?;
        Ok(RequestStatusResponse {
            id: request.id,
            complete: request.complete,
            successful: request.successful,
        })
    }

    pub async fn get_request(&self, request_id: &str) -> Result<RequestResponse> {
        Ok(RequestResponse::from(self.get(request_id).await?))
    }

    /// 列出某个目标的全部请求（新的在前）
    pub async fn list_for_target(&self, target_id: &str) -> Result<Vec<RequestResponse>> {
        let requests = RequestEntity::find()
            .filter(RequestColumn::TargetId.eq(target_id))
            .order_by_desc(RequestColumn::CreatedAt)
            .all(&self.state.sea_db)
            .await
            .map_err(db_err)?;
        Ok(requests.into_iter().map(RequestResponse::from).collect())
    }

    /// 目标是否还有未完成的请求；`exclude` 用于排除正在执行的请求本身
    pub async fn has_pending(&self, target_id: &str, exclude: Option<&str>) -> Result<bool> {
        let mut query = RequestEntity::find()
            .filter(RequestColumn::TargetId.eq(target_id))
            .filter(RequestColumn::Complete.eq(false));
        if let Some(exclude) = exclude {
            query = query.filter(RequestColumn::Id.ne(exclude));
        }
        Ok(query.one(&self.state.sea_db).await.map_err(db_err)?.is_some())
    }

    /// 领取最早一条未开始的请求
    pub async fn claim_next(&self) -> Result<Option<RequestModel>> {
        let txn = self.state.sea_db.begin().await.map_err(db_err)?;

        let next = RequestEntity::find()
            .filter(RequestColumn::StartedAt.is_null())
            .filter(RequestColumn::Complete.eq(false))
            .order_by_asc(RequestColumn::CreatedAt)
            .one(&txn)
            .await
            .map_err(db_err)?;

        let Some(next) = next else {
            return Ok(None);
        };

        let mut active: RequestActiveModel = next.into();
        active.started_at = Set(Some(Utc::now().into()));
        let claimed = active.update(&txn).await.map_err(db_err)?;
        txn.commit().await.map_err(db_err)?;

        Ok(Some(claimed))
    }

    /// 标记请求完成
    pub async fn finish(&self, request_id: &str, outcome: &Result<()>) -> Result<()> {
        let request = self.get(request_id).await?;
        let mut active: RequestActiveModel = request.into();
        active.complete = Set(true);
        active.successful = Set(outcome.is_ok());
        active.error_message = Set(outcome.as_ref().err().map(|e| e.to_string()));
        active.completed_at = Set(Some(Utc::now().into()));
        active.update(&self.state.sea_db).await.map_err(db_err)?;

        match outcome {
            Ok(()) => info!("请求 {} 执行成功", request_id),
            // 执行时才发现的校验/冲突错误，没有产生副作用
            Err(e) if e.is_rejection() => info!("请求 {} 被拒绝: {}", request_id, e),
            Err(e) => warn!("请求 {} 执行失败: {}", request_id, e),
        }
        Ok(())
    }

    /// 将所有未完成请求标记为失败，返回受影响条数
    pub async fn fail_incomplete(&self, reason: &str) -> Result<u64> {
        let result = RequestEntity::update_many()
            .col_expr(RequestColumn::Complete, true.into())
            .col_expr(RequestColumn::Successful, false.into())
            .col_expr(RequestColumn::ErrorMessage, Some(reason.to_string()).into())
            .col_expr(
                RequestColumn::CompletedAt,
                Some(sea_orm::prelude::DateTimeWithTimeZone::from(Utc::now())).into(),
            )
            .filter(RequestColumn::Complete.eq(false))
            .exec(&self.state.sea_db)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected)
    }

    /// 管理操作：清理所有已完成的请求
    pub async fn clear_completed(&self) -> Result<u64> {
        let result = RequestEntity::delete_many()
            .filter(RequestColumn::Complete.eq(true))
            .exec(&self.state.sea_db)
            .await
            .map_err(db_err)?;
        info!("清理了 {} 条已完成请求", result.rows_affected);
        Ok(result.rows_affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_state::test_state;
    use serde_json::json;

    #[tokio::test]
    async fn test_enqueue_rejects_second_pending_request() {
        let (state, _kernel) = test_state().await;
        let service = RequestService::new(state);
        let target = generate_id();

        let first = service.enqueue(RequestKind::VmStart, &target, json!({})).await.unwrap();
        let err = service
            .enqueue(RequestKind::VmStop, &target, json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        // 其他目标不受影响
        service
            .enqueue(RequestKind::VmStart, &generate_id(), json!({}))
            .await
            .unwrap();

        service.finish(&first, &Ok(())).await.unwrap();
        service.enqueue(RequestKind::VmStop, &target, json!({})).await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_enqueue_admits_exactly_one() {
        let (state, _kernel) = test_state().await;
        let target = generate_id();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let state = state.clone();
            let target = target.clone();
            tasks.push(tokio::spawn(async move {
                RequestService::new(state)
                    .enqueue(RequestKind::VmStart, &target, json!({}))
                    .await
            }));
        }

        let mut admitted = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => admitted += 1,
                Err(e) => assert!(matches!(e, Error::Conflict(_))),
            }
        }
        assert_eq!(admitted, 1);
    }

    #[tokio::test]
    async fn test_enqueue_validates_target_id() {
        let (state, _kernel) = test_state().await;
        let err = RequestService::new(state)
            .enqueue(RequestKind::VmStart, "not-a-uuid", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_claim_is_oldest_first_and_once() {
        let (state, _kernel) = test_state().await;
        let service = RequestService::new(state);
        let first = service.enqueue(RequestKind::DiskWipe, &generate_id(), json!({})).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = service.enqueue(RequestKind::DiskWipe, &generate_id(), json!({})).await.unwrap();

        assert_eq!(service.claim_next().await.unwrap().unwrap().id, first);
        assert_eq!(service.claim_next().await.unwrap().unwrap().id, second);
        assert!(service.claim_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_status_and_cleanup() {
        let (state, _kernel) = test_state().await;
        let service = RequestService::new(state);
        let target = generate_id();
        let id = service.enqueue(RequestKind::VmDelete, &target, json!({})).await.unwrap();

        let status = service.get_status(&id).await.unwrap();
        assert!(!status.complete);

        service
            .finish(&id, &Err(Error::Hypervisor("boom".to_string())))
            .await
            .unwrap();
        let status = service.get_status(&id).await.unwrap();
        assert!(status.complete);
        assert!(!status.successful);

        assert_eq!(service.list_for_target(&target).await.unwrap().len(), 1);
        assert_eq!(service.clear_completed().await.unwrap(), 1);
        assert!(matches!(service.get_status(&id).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_fail_incomplete() {
        let (state, _kernel) = test_state().await;
        let service = RequestService::new(state);
        let id = service.enqueue(RequestKind::VmStop, &generate_id(), json!({})).await.unwrap();
        service.claim_next().await.unwrap();

        assert_eq!(service.fail_incomplete("中断").await.unwrap(), 1);
        let request = service.get(&id).await.unwrap();
        assert!(request.complete);
        assert!(!request.successful);
        assert_eq!(service.fail_incomplete("中断").await.unwrap(), 0);
    }
}
