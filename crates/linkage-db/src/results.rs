//! Processing result repository implementation.

use async_trait::async_trait;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use linkage_core::{
    Error, GridCell, Matrix, ProcessingResult, Result, ResultPayload, ResultRepository,
};

const RESULT_COLUMNS: &str = "id, graph_id, param_clusters, param_topics, clusters_mat, \
     topics_mat, topics_per_edges_mat, rho_mat, pi_mat, theta_qr_mat, crit, created_at";

/// PostgreSQL implementation of ResultRepository.
#[derive(Clone)]
pub struct PgResultRepository {
    pool: Pool<Postgres>,
}

impl PgResultRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn matrix(row: &sqlx::postgres::PgRow, column: &str) -> Result<Matrix> {
        let value: serde_json::Value = row.get(column);
        Ok(serde_json::from_value(value)?)
    }

    fn parse_result_row(row: sqlx::postgres::PgRow) -> Result<ProcessingResult> {
        let cell = GridCell::new(row.get("param_clusters"), row.get("param_topics"));
        let payload = ResultPayload {
            n_clusters: cell.clusters,
            n_topics: cell.topics,
            clusters: Self::matrix(&row, "clusters_mat")?,
            topics: Self::matrix(&row, "topics_mat")?,
            topics_per_edges: Self::matrix(&row, "topics_per_edges_mat")?,
            rho: Self::matrix(&row, "rho_mat")?,
            pi: Self::matrix(&row, "pi_mat")?,
            theta: Self::matrix(&row, "theta_qr_mat")?,
            crit: row.get("crit"),
        };
        Ok(ProcessingResult {
            id: row.get("id"),
            graph_id: row.get("graph_id"),
            cell,
            payload,
            created_at: row.get("created_at"),
        })
    }
}

#[async_trait]
impl ResultRepository for PgResultRepository {
    async fn insert(&self, result: &ProcessingResult) -> Result<bool> {
        let p = &result.payload;
        let outcome = sqlx::query(
            "INSERT INTO processing_result (id, graph_id, param_clusters, param_topics,
                 clusters_mat, topics_mat, topics_per_edges_mat, rho_mat, pi_mat, theta_qr_mat,
                 crit, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
             ON CONFLICT (graph_id, param_clusters, param_topics) DO NOTHING",
        )
        .bind(result.id)
        .bind(result.graph_id)
        .bind(result.cell.clusters)
        .bind(result.cell.topics)
        .bind(serde_json::to_value(&p.clusters)?)
        .bind(serde_json::to_value(&p.topics)?)
        .bind(serde_json::to_value(&p.topics_per_edges)?)
        .bind(serde_json::to_value(&p.rho)?)
        .bind(serde_json::to_value(&p.pi)?)
        .bind(serde_json::to_value(&p.theta)?)
        .bind(p.crit)
        .bind(result.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            let orphaned = e
                .as_database_error()
                .is_some_and(|db| db.is_foreign_key_violation());
            if orphaned {
                Error::GraphNotFound(result.graph_id)
            } else {
                Error::Database(e)
            }
        })?;

        Ok(outcome.rows_affected() > 0)
    }

    async fn get_cell(&self, graph_id: Uuid, cell: GridCell) -> Result<Option<ProcessingResult>> {
        let row = sqlx::query(&format!(
            "SELECT {RESULT_COLUMNS} FROM processing_result
             WHERE graph_id = $1 AND param_clusters = $2 AND param_topics = $3"
        ))
        .bind(graph_id)
        .bind(cell.clusters)
        .bind(cell.topics)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.map(Self::parse_result_row).transpose()
    }

    async fn best_for_graph(&self, graph_id: Uuid) -> Result<Option<ProcessingResult>> {
        let row = sqlx::query(&format!(
            "SELECT {RESULT_COLUMNS} FROM processing_result
             WHERE graph_id = $1
             ORDER BY crit DESC, param_clusters ASC, param_topics ASC
             LIMIT 1"
        ))
        .bind(graph_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.map(Self::parse_result_row).transpose()
    }

    async fn list_for_graph(&self, graph_id: Uuid) -> Result<Vec<ProcessingResult>> {
        let rows = sqlx::query(&format!(
            "SELECT {RESULT_COLUMNS} FROM processing_result
             WHERE graph_id = $1
             ORDER BY param_clusters ASC, param_topics ASC"
        ))
        .bind(graph_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.into_iter().map(Self::parse_result_row).collect()
    }

    async fn count_for_graph(&self, graph_id: Uuid) -> Result<i64> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM processing_result WHERE graph_id = $1")
                .bind(graph_id)
                .fetch_one(&self.pool)
                .await
                .map_err(Error::Database)?;
        Ok(count.0)
    }
}
