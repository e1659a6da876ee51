//! The `sql_data` tool: queries against the engine's scratch database.
//!
//! Cascades use it for SQL-mapping cells, `sql:` file tools, and inline SQL
//! validators. Rows come back as JSON objects keyed by column name.

use serde_json::{json, Map, Value};
use sqlx::{Column, Row, SqlitePool, TypeInfo};
use std::sync::Arc;

use super::registry::{ToolError, ToolKind, ToolRegistry};

/// Run a query and return `{data: [...], row_count, _route: "success"}`.
pub async fn run_query(pool: &SqlitePool, query: &str) -> Result<Value, ToolError> {
    let trimmed = query.trim();
    let is_select = trimmed.to_ascii_lowercase().starts_with("select")
        || trimmed.to_ascii_lowercase().starts_with("with");

    if is_select {
        let rows = sqlx::query(trimmed)
            .fetch_all(pool)
            .await
            .map_err(sql_error)?;
        let mut data = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut object = Map::new();
            for column in row.columns() {
                object.insert(column.name().to_string(), decode_column(row, column));
            }
            data.push(Value::Object(object));
        }
        let row_count = data.len();
        Ok(json!({"data": data, "row_count": row_count, "_route": "success"}))
    } else {
        let result = sqlx::query(trimmed).execute(pool).await.map_err(sql_error)?;
        Ok(json!({
            "rows_affected": result.rows_affected(),
            "_route": "success",
        }))
    }
}

fn decode_column(row: &sqlx::sqlite::SqliteRow, column: &sqlx::sqlite::SqliteColumn) -> Value {
    let index = column.ordinal();
    match column.type_info().name() {
        "INTEGER" => row
            .try_get::<Option<i64>, _>(index)
            .ok()
            .flatten()
            .map(Value::from)
            .unwrap_or(Value::Null),
        "REAL" => row
            .try_get::<Option<f64>, _>(index)
            .ok()
            .flatten()
            .map(Value::from)
            .unwrap_or(Value::Null),
        _ => row
            .try_get::<Option<String>, _>(index)
            .ok()
            .flatten()
            .map(Value::from)
            .unwrap_or(Value::Null),
    }
}

fn sql_error(err: sqlx::Error) -> ToolError {
    ToolError::Execution {
        name: "sql_data".to_string(),
        message: err.to_string(),
    }
}

/// Register `sql_data` against a pool.
pub fn register_sql_tool(registry: &ToolRegistry, pool: Arc<SqlitePool>) {
    registry.register_fn(
        "sql_data",
        "Run a SQL query against the session data store",
        json!({
            "type": "object",
            "properties": {
                "query": {"type": "string"}
            },
            "required": ["query"]
        }),
        ToolKind::Function,
        move |args: Value| {
            let pool = Arc::clone(&pool);
            async move {
                let query = args
                    .get("query")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ToolError::InvalidArgs {
                        name: "sql_data".to_string(),
                        message: "missing 'query' input".to_string(),
                    })?
                    .to_string();
                run_query(pool.as_ref(), &query).await
            }
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn pool() -> SqlitePool {
        SqlitePool::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn select_returns_typed_rows() {
        let pool = pool().await;
        sqlx::raw_sql("CREATE TABLE t (id INTEGER, name TEXT, score REAL)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::raw_sql("INSERT INTO t VALUES (1, 'a', 0.5), (2, 'b', 1.5)")
            .execute(&pool)
            .await
            .unwrap();

        let result = run_query(&pool, "SELECT * FROM t ORDER BY id").await.unwrap();
        assert_eq!(result["row_count"], json!(2));
        assert_eq!(result["data"][0]["id"], json!(1));
        assert_eq!(result["data"][1]["score"], json!(1.5));
        assert_eq!(result["_route"], json!("success"));
    }

    #[tokio::test]
    async fn non_select_reports_rows_affected() {
        let pool = pool().await;
        sqlx::raw_sql("CREATE TABLE t (id INTEGER)")
            .execute(&pool)
            .await
            .unwrap();
        let result = run_query(&pool, "INSERT INTO t VALUES (1), (2)").await.unwrap();
        assert_eq!(result["rows_affected"], json!(2));
    }
}
