use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keeper_core::{
    ExecutionStatus, ExecutionTiming, ExecutionUpdate, JobExecution, JobExecutionRepository,
    KeeperError, KeeperResult,
};
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument};

const SELECT_COLUMNS: &str = "SELECT id, project_id, job_instance_id, agent_run_id, created_at, \
     start_time, end_time, running_status, running_on, inferred_completion, updated_at \
     FROM job_executions";

pub struct SqliteJobExecutionRepository {
    pool: SqlitePool,
}

impl SqliteJobExecutionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_job_execution(row: &sqlx::sqlite::SqliteRow) -> KeeperResult<JobExecution> {
        Ok(JobExecution {
            id: row.try_get("id")?,
            project_id: row.try_get("project_id")?,
            job_instance_id: row.try_get("job_instance_id")?,
            agent_run_id: row.try_get("agent_run_id")?,
            created_at: row.try_get("created_at")?,
            start_time: row.try_get("start_time")?,
            end_time: row.try_get("end_time")?,
            running_status: row.try_get("running_status")?,
            running_on: row.try_get("running_on")?,
            inferred_completion: row.try_get("inferred_completion")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    /// 生成 `$start, $start+1, ...` 形式的占位符列表
    fn placeholders(start: usize, count: usize) -> String {
        (start..start + count)
            .map(|i| format!("${i}"))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[async_trait]
impl JobExecutionRepository for SqliteJobExecutionRepository {
    #[instrument(skip(self, execution), fields(
        job_instance_id = execution.job_instance_id,
        agent_run_id = %execution.agent_run_id,
    ))]
    async fn create(&self, execution: &JobExecution) -> KeeperResult<JobExecution> {
        let mut tx = self.pool.begin().await.map_err(KeeperError::Database)?;

        let result = sqlx::query(
            r#"
            INSERT INTO job_executions (project_id, job_instance_id, agent_run_id, created_at,
                                        start_time, end_time, running_status, running_on,
                                        inferred_completion, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(execution.project_id)
        .bind(execution.job_instance_id)
        .bind(&execution.agent_run_id)
        .bind(execution.created_at)
        .bind(execution.start_time)
        .bind(execution.end_time)
        .bind(execution.running_status)
        .bind(&execution.running_on)
        .bind(execution.inferred_completion)
        .bind(execution.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(KeeperError::Database)?;

        tx.commit().await.map_err(KeeperError::Database)?;

        let mut created = execution.clone();
        created.id = result.last_insert_rowid();
        debug!(
            "创建执行记录成功: ID {}, 运行标识 {}",
            created.id, created.agent_run_id
        );
        Ok(created)
    }

    async fn get_by_id(&self, id: i64) -> KeeperResult<Option<JobExecution>> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(KeeperError::Database)?;

        row.as_ref().map(Self::row_to_job_execution).transpose()
    }

    async fn list_incomplete(&self) -> KeeperResult<Vec<JobExecution>> {
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE running_status IN ('PENDING', 'RUNNING') ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(KeeperError::Database)?;

        rows.iter().map(Self::row_to_job_execution).collect()
    }

    async fn list_incomplete_by_instance(
        &self,
        job_instance_id: i64,
    ) -> KeeperResult<Vec<JobExecution>> {
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE job_instance_id = $1 AND running_status IN ('PENDING', 'RUNNING') ORDER BY id"
        ))
        .bind(job_instance_id)
        .fetch_all(&self.pool)
        .await
        .map_err(KeeperError::Database)?;

        rows.iter().map(Self::row_to_job_execution).collect()
    }

    /// 条件更新：`WHERE running_status IN (<允许的前驱状态>)`
    ///
    /// 开始时间只在为空时写入；结束时间、运行主机只在更新中给出时覆盖；
    /// 推断完成标记一旦置位不会清除。
    #[instrument(skip(self, update), fields(status = %update.status))]
    async fn apply_update(&self, id: i64, update: &ExecutionUpdate) -> KeeperResult<bool> {
        if update.status == ExecutionStatus::Pending {
            return Err(KeeperError::IllegalTransition {
                from: ExecutionStatus::Pending,
                to: ExecutionStatus::Pending,
            });
        }

        let mut allowed: Vec<ExecutionStatus> = update.status.predecessors().to_vec();
        if !update.status.is_terminal() {
            allowed.push(update.status);
        }

        let sql = format!(
            r#"
            UPDATE job_executions
            SET running_status = $1,
                start_time = COALESCE(start_time, $2),
                end_time = COALESCE($3, end_time),
                running_on = COALESCE($4, running_on),
                inferred_completion = MAX(inferred_completion, $5),
                updated_at = $6
            WHERE id = $7 AND running_status IN ({})
            "#,
            Self::placeholders(8, allowed.len())
        );

        let mut query = sqlx::query(&sql)
            .bind(update.status)
            .bind(update.start_time)
            .bind(update.end_time)
            .bind(&update.running_on)
            .bind(update.inferred_completion)
            .bind(Utc::now())
            .bind(id);
        for status in &allowed {
            query = query.bind(*status);
        }

        let result = query
            .execute(&self.pool)
            .await
            .map_err(KeeperError::Database)?;

        if result.rows_affected() == 0 {
            if self.get_by_id(id).await?.is_none() {
                return Err(KeeperError::JobExecutionNotFound { id });
            }
            debug!("执行记录 {} 当前状态不允许转换到 {}，忽略", id, update.status);
            return Ok(false);
        }
        Ok(true)
    }

    async fn list_by_status(
        &self,
        project_id: i64,
        statuses: &[ExecutionStatus],
        limit: i64,
    ) -> KeeperResult<Vec<JobExecution>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "{SELECT_COLUMNS} WHERE project_id = $1 AND running_status IN ({}) \
             ORDER BY updated_at DESC, id DESC LIMIT ${}",
            Self::placeholders(2, statuses.len()),
            statuses.len() + 2
        );

        let mut query = sqlx::query(&sql).bind(project_id);
        for status in statuses {
            query = query.bind(*status);
        }
        let rows = query
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(KeeperError::Database)?;

        rows.iter().map(Self::row_to_job_execution).collect()
    }

    async fn list_created_since(
        &self,
        project_id: i64,
        since: DateTime<Utc>,
    ) -> KeeperResult<Vec<JobExecution>> {
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE project_id = $1 AND created_at >= $2 ORDER BY created_at"
        ))
        .bind(project_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(KeeperError::Database)?;

        rows.iter().map(Self::row_to_job_execution).collect()
    }

    async fn list_timings(&self, project_id: i64) -> KeeperResult<Vec<ExecutionTiming>> {
        let rows = sqlx::query(
            r#"
            SELECT i.spider_name, e.created_at, e.start_time, e.end_time, e.inferred_completion
            FROM job_executions e
            JOIN job_instances i ON i.id = e.job_instance_id
            WHERE e.project_id = $1
            ORDER BY e.created_at
            "#,
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await
        .map_err(KeeperError::Database)?;

        rows.iter()
            .map(|row| -> KeeperResult<ExecutionTiming> {
                Ok(ExecutionTiming {
                    spider_name: row.try_get("spider_name")?,
                    created_at: row.try_get("created_at")?,
                    start_time: row.try_get("start_time")?,
                    end_time: row.try_get("end_time")?,
                    inferred_completion: row.try_get("inferred_completion")?,
                })
            })
            .collect()
    }
}
