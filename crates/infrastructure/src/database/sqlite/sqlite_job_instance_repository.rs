use async_trait::async_trait;
use chrono::Utc;
use keeper_core::{
    CronFields, JobInstance, JobInstanceRepository, JobPriority, JobRunType, KeeperError,
    KeeperResult,
};
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument};

const SELECT_COLUMNS: &str = "SELECT id, project_id, spider_name, spider_arguments, priority, run_type, \
     cron_minutes, cron_hour, cron_day_of_month, cron_day_of_week, cron_month, \
     enabled, tags, description, created_at, updated_at FROM job_instances";

pub struct SqliteJobInstanceRepository {
    pool: SqlitePool,
}

impl SqliteJobInstanceRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_job_instance(row: &sqlx::sqlite::SqliteRow) -> KeeperResult<JobInstance> {
        let priority: i32 = row.try_get("priority")?;
        let run_type: String = row.try_get("run_type")?;
        let enabled: i32 = row.try_get("enabled")?;

        Ok(JobInstance {
            id: row.try_get("id")?,
            project_id: row.try_get("project_id")?,
            spider_name: row.try_get("spider_name")?,
            spider_arguments: row.try_get("spider_arguments")?,
            priority: JobPriority::from_i32(priority)?,
            run_type: run_type.parse::<JobRunType>()?,
            cron: CronFields {
                minute: row.try_get("cron_minutes")?,
                hour: row.try_get("cron_hour")?,
                day_of_month: row.try_get("cron_day_of_month")?,
                day_of_week: row.try_get("cron_day_of_week")?,
                month: row.try_get("cron_month")?,
            },
            enabled: JobInstance::enabled_from_sentinel(enabled),
            tags: row.try_get("tags")?,
            description: row.try_get("description")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    async fn fetch_many(&self, sql: &str, bind: Option<i64>) -> KeeperResult<Vec<JobInstance>> {
        let mut query = sqlx::query(sql);
        if let Some(value) = bind {
            query = query.bind(value);
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(KeeperError::Database)?;
        rows.iter().map(Self::row_to_job_instance).collect()
    }
}

#[async_trait]
impl JobInstanceRepository for SqliteJobInstanceRepository {
    #[instrument(skip(self, instance), fields(
        project_id = instance.project_id,
        spider_name = %instance.spider_name,
        run_type = %instance.run_type,
    ))]
    async fn create(&self, instance: &JobInstance) -> KeeperResult<JobInstance> {
        let result = sqlx::query(
            r#"
            INSERT INTO job_instances (project_id, spider_name, spider_arguments, priority, run_type,
                                       cron_minutes, cron_hour, cron_day_of_month, cron_day_of_week, cron_month,
                                       enabled, tags, description, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(instance.project_id)
        .bind(&instance.spider_name)
        .bind(&instance.spider_arguments)
        .bind(instance.priority.as_i32())
        .bind(instance.run_type.as_str())
        .bind(&instance.cron.minute)
        .bind(&instance.cron.hour)
        .bind(&instance.cron.day_of_month)
        .bind(&instance.cron.day_of_week)
        .bind(&instance.cron.month)
        .bind(instance.enabled_sentinel())
        .bind(&instance.tags)
        .bind(&instance.description)
        .bind(instance.created_at)
        .bind(instance.updated_at)
        .execute(&self.pool)
        .await
        .map_err(KeeperError::Database)?;

        let mut created = instance.clone();
        created.id = result.last_insert_rowid();
        debug!("创建任务实例成功: {} (ID: {})", created.spider_name, created.id);
        Ok(created)
    }

    async fn get_by_id(&self, id: i64) -> KeeperResult<Option<JobInstance>> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(KeeperError::Database)?;

        row.as_ref().map(Self::row_to_job_instance).transpose()
    }

    async fn update(&self, instance: &JobInstance) -> KeeperResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE job_instances
            SET spider_name = $1, spider_arguments = $2, priority = $3, run_type = $4,
                cron_minutes = $5, cron_hour = $6, cron_day_of_month = $7, cron_day_of_week = $8,
                cron_month = $9, enabled = $10, tags = $11, description = $12, updated_at = $13
            WHERE id = $14
            "#,
        )
        .bind(&instance.spider_name)
        .bind(&instance.spider_arguments)
        .bind(instance.priority.as_i32())
        .bind(instance.run_type.as_str())
        .bind(&instance.cron.minute)
        .bind(&instance.cron.hour)
        .bind(&instance.cron.day_of_month)
        .bind(&instance.cron.day_of_week)
        .bind(&instance.cron.month)
        .bind(instance.enabled_sentinel())
        .bind(&instance.tags)
        .bind(&instance.description)
        .bind(Utc::now())
        .bind(instance.id)
        .execute(&self.pool)
        .await
        .map_err(KeeperError::Database)?;

        if result.rows_affected() == 0 {
            return Err(KeeperError::JobInstanceNotFound { id: instance.id });
        }
        debug!("更新任务实例成功: ID {}", instance.id);
        Ok(())
    }

    async fn set_enabled(&self, id: i64, enabled: bool) -> KeeperResult<()> {
        let sentinel = if enabled { 0 } else { -1 };
        let result =
            sqlx::query("UPDATE job_instances SET enabled = $1, updated_at = $2 WHERE id = $3")
                .bind(sentinel)
                .bind(Utc::now())
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(KeeperError::Database)?;

        if result.rows_affected() == 0 {
            return Err(KeeperError::JobInstanceNotFound { id });
        }
        debug!("任务实例 {} 启用状态: {}", id, enabled);
        Ok(())
    }

    async fn delete(&self, id: i64) -> KeeperResult<()> {
        let result = sqlx::query("DELETE FROM job_instances WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(KeeperError::Database)?;

        if result.rows_affected() == 0 {
            return Err(KeeperError::JobInstanceNotFound { id });
        }
        debug!("删除任务实例成功: ID {}", id);
        Ok(())
    }

    async fn list_by_project(&self, project_id: i64) -> KeeperResult<Vec<JobInstance>> {
        self.fetch_many(
            &format!("{SELECT_COLUMNS} WHERE project_id = $1 ORDER BY id"),
            Some(project_id),
        )
        .await
    }

    async fn list_periodic(&self, project_id: i64) -> KeeperResult<Vec<JobInstance>> {
        self.fetch_many(
            &format!("{SELECT_COLUMNS} WHERE project_id = $1 AND run_type = 'periodic' ORDER BY id"),
            Some(project_id),
        )
        .await
    }

    async fn list_enabled_periodic(&self) -> KeeperResult<Vec<JobInstance>> {
        self.fetch_many(
            &format!("{SELECT_COLUMNS} WHERE run_type = 'periodic' AND enabled = 0 ORDER BY id"),
            None,
        )
        .await
    }
}
