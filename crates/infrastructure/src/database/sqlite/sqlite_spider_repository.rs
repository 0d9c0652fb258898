use async_trait::async_trait;
use keeper_core::{KeeperError, KeeperResult, SpiderInstance, SpiderRepository};
use sqlx::{Row, SqlitePool};
use tracing::debug;

pub struct SqliteSpiderRepository {
    pool: SqlitePool,
}

impl SqliteSpiderRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_spider(row: &sqlx::sqlite::SqliteRow) -> KeeperResult<SpiderInstance> {
        Ok(SpiderInstance {
            id: row.try_get("id")?,
            project_id: row.try_get("project_id")?,
            spider_name: row.try_get("spider_name")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl SpiderRepository for SqliteSpiderRepository {
    async fn create(&self, spider: &SpiderInstance) -> KeeperResult<SpiderInstance> {
        let result = sqlx::query(
            "INSERT INTO spiders (project_id, spider_name, created_at, updated_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(spider.project_id)
        .bind(&spider.spider_name)
        .bind(spider.created_at)
        .bind(spider.updated_at)
        .execute(&self.pool)
        .await
        .map_err(KeeperError::Database)?;

        let mut created = spider.clone();
        created.id = result.last_insert_rowid();
        debug!("新增爬虫: {} (项目 {})", created.spider_name, created.project_id);
        Ok(created)
    }

    async fn delete(&self, id: i64) -> KeeperResult<()> {
        sqlx::query("DELETE FROM spiders WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(KeeperError::Database)?;
        Ok(())
    }

    async fn list_by_project(&self, project_id: i64) -> KeeperResult<Vec<SpiderInstance>> {
        let rows = sqlx::query(
            "SELECT id, project_id, spider_name, created_at, updated_at FROM spiders \
             WHERE project_id = $1 ORDER BY spider_name",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await
        .map_err(KeeperError::Database)?;

        rows.iter().map(Self::row_to_spider).collect()
    }
}
