use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

/// Audit trail of queue mutations. Failures are logged by the caller and
/// never fail the operation being audited.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AuditLogService: Send + Sync {
    async fn log(&self, actor_user_id: Option<Uuid>, action: &str) -> anyhow::Result<()>;
}

#[derive(Clone)]
pub struct PgAuditLog {
    db: PgPool,
}

impl PgAuditLog {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl AuditLogService for PgAuditLog {
    async fn log(&self, actor_user_id: Option<Uuid>, action: &str) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_log (audit_log_id, actor_user_id, action, logged_at)
            VALUES ($1, $2, $3, now())
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(actor_user_id)
        .bind(action)
        .execute(&self.db)
        .await?;
        Ok(())
    }
}
