//! Graph (job) repository implementation.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use linkage_core::{
    Edge, Error, Graph, GraphRepository, GridParams, JobFailure, JobStep, Result,
    TermDocumentMatrix,
};

const GRAPH_COLUMNS: &str = "id, user_id, name, directed, labels, edges, tdm, \
     clusters_min, clusters_max, topics_min, topics_max, current_step, progress, \
     log, error_log, time_taken, lost_results, created_at, updated_at";

/// PostgreSQL implementation of GraphRepository.
#[derive(Clone)]
pub struct PgGraphRepository {
    pool: Pool<Postgres>,
}

impl PgGraphRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Parse a graph row into a Graph.
    fn parse_graph_row(row: sqlx::postgres::PgRow) -> Result<Graph> {
        let labels: serde_json::Value = row.get("labels");
        let edges: serde_json::Value = row.get("edges");
        let tdm: serde_json::Value = row.get("tdm");
        let current_step: String = row.get("current_step");
        let error_log: String = row.get("error_log");
        let lost_results: i32 = row.get("lost_results");

        let error = match error_log.as_str() {
            "" => None,
            text => Some(text.parse::<JobFailure>()?),
        };
        let matrix: TermDocumentMatrix = if tdm.as_object().is_some_and(|o| o.is_empty()) {
            TermDocumentMatrix::default()
        } else {
            serde_json::from_value(tdm)?
        };

        Ok(Graph {
            id: row.get("id"),
            user_id: row.get("user_id"),
            name: row.get("name"),
            directed: row.get("directed"),
            labels: serde_json::from_value(labels)?,
            edges: serde_json::from_value::<Vec<Edge>>(edges)?,
            matrix,
            grid: GridParams::new(
                row.get("clusters_min"),
                row.get("clusters_max"),
                row.get("topics_min"),
                row.get("topics_max"),
            )?,
            current_step: current_step.parse::<JobStep>()?,
            progress: row.get("progress"),
            log: row.get("log"),
            error,
            time_taken: row.get("time_taken"),
            lost_results: lost_results.max(0) as u32,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }
}

#[async_trait]
impl GraphRepository for PgGraphRepository {
    async fn insert(&self, graph: &Graph) -> Result<()> {
        sqlx::query(
            "INSERT INTO graph (id, user_id, name, directed, labels, edges, tdm,
                                clusters_min, clusters_max, topics_min, topics_max,
                                current_step, progress, log, error_log, time_taken,
                                lost_results, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)",
        )
        .bind(graph.id)
        .bind(graph.user_id)
        .bind(&graph.name)
        .bind(graph.directed)
        .bind(serde_json::to_value(&graph.labels)?)
        .bind(serde_json::to_value(&graph.edges)?)
        .bind(serde_json::to_value(&graph.matrix)?)
        .bind(graph.grid.clusters_min())
        .bind(graph.grid.clusters_max())
        .bind(graph.grid.topics_min())
        .bind(graph.grid.topics_max())
        .bind(graph.current_step.to_string())
        .bind(graph.progress)
        .bind(&graph.log)
        .bind(graph.error_log())
        .bind(graph.time_taken)
        .bind(graph.lost_results as i32)
        .bind(graph.created_at)
        .bind(graph.updated_at)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Graph> {
        let row = sqlx::query(&format!("SELECT {GRAPH_COLUMNS} FROM graph WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        match row {
            Some(row) => Self::parse_graph_row(row),
            None => Err(Error::GraphNotFound(id)),
        }
    }

    async fn save(&self, graph: &Graph) -> Result<()> {
        let result = sqlx::query(
            "UPDATE graph
             SET name = $2, directed = $3, labels = $4, edges = $5, tdm = $6,
                 clusters_min = $7, clusters_max = $8, topics_min = $9, topics_max = $10,
                 current_step = $11, progress = $12, log = $13, error_log = $14,
                 time_taken = $15, lost_results = $16, updated_at = $17
             WHERE id = $1",
        )
        .bind(graph.id)
        .bind(&graph.name)
        .bind(graph.directed)
        .bind(serde_json::to_value(&graph.labels)?)
        .bind(serde_json::to_value(&graph.edges)?)
        .bind(serde_json::to_value(&graph.matrix)?)
        .bind(graph.grid.clusters_min())
        .bind(graph.grid.clusters_max())
        .bind(graph.grid.topics_min())
        .bind(graph.grid.topics_max())
        .bind(graph.current_step.to_string())
        .bind(graph.progress)
        .bind(&graph.log)
        .bind(graph.error_log())
        .bind(graph.time_taken)
        .bind(graph.lost_results as i32)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(Error::GraphNotFound(graph.id));
        }
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        // processing_result rows go with it (ON DELETE CASCADE)
        let result = sqlx::query("DELETE FROM graph WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<Graph>> {
        let rows = sqlx::query(&format!(
            "SELECT {GRAPH_COLUMNS} FROM graph WHERE user_id = $1 ORDER BY created_at DESC"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.into_iter().map(Self::parse_graph_row).collect()
    }
}
