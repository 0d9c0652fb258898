use async_trait::async_trait;
use keeper_core::{KeeperError, KeeperResult, Project, ProjectRepository};
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument};

pub struct SqliteProjectRepository {
    pool: SqlitePool,
}

impl SqliteProjectRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_project(row: &sqlx::sqlite::SqliteRow) -> KeeperResult<Project> {
        Ok(Project {
            id: row.try_get("id")?,
            project_name: row.try_get("project_name")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl ProjectRepository for SqliteProjectRepository {
    #[instrument(skip(self, project), fields(project_name = %project.project_name))]
    async fn create(&self, project: &Project) -> KeeperResult<Project> {
        let row = sqlx::query(
            r#"
            INSERT INTO projects (project_name, created_at, updated_at)
            VALUES ($1, $2, $3)
            RETURNING id, project_name, created_at, updated_at
            "#,
        )
        .bind(&project.project_name)
        .bind(project.created_at)
        .bind(project.updated_at)
        .fetch_one(&self.pool)
        .await
        .map_err(KeeperError::Database)?;

        let created = Self::row_to_project(&row)?;
        debug!("创建项目成功: {} (ID: {})", created.project_name, created.id);
        Ok(created)
    }

    async fn get_by_id(&self, id: i64) -> KeeperResult<Option<Project>> {
        let row = sqlx::query(
            "SELECT id, project_name, created_at, updated_at FROM projects WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(KeeperError::Database)?;

        row.as_ref().map(Self::row_to_project).transpose()
    }

    async fn get_by_name(&self, name: &str) -> KeeperResult<Option<Project>> {
        let row = sqlx::query(
            "SELECT id, project_name, created_at, updated_at FROM projects WHERE project_name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(KeeperError::Database)?;

        row.as_ref().map(Self::row_to_project).transpose()
    }

    async fn list(&self) -> KeeperResult<Vec<Project>> {
        let rows = sqlx::query(
            "SELECT id, project_name, created_at, updated_at FROM projects ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(KeeperError::Database)?;

        rows.iter().map(Self::row_to_project).collect()
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: i64) -> KeeperResult<()> {
        let mut tx = self.pool.begin().await.map_err(KeeperError::Database)?;

        let result = sqlx::query("DELETE FROM projects WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(KeeperError::Database)?;
        if result.rows_affected() == 0 {
            return Err(KeeperError::ProjectNotFound { id });
        }

        for table in ["job_executions", "job_instances", "spiders"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE project_id = $1"))
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(KeeperError::Database)?;
        }

        tx.commit().await.map_err(KeeperError::Database)?;
        debug!("删除项目及其任务实例、执行记录、爬虫目录成功: ID {}", id);
        Ok(())
    }
}
