//! Route optimization record queries

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::types::{RouteOptimizationRecord, Waypoint};

#[derive(Debug, Clone, sqlx::FromRow)]
struct RouteOptimizationRow {
    technician_id: Uuid,
    route_date: NaiveDate,
    waypoints_order: Json<Vec<Waypoint>>,
    ticket_ids: Vec<Uuid>,
    geometry: Json<Vec<[f64; 2]>>,
    distance_km: f64,
    duration_minutes: i32,
    optimization_method: String,
    updated_at: DateTime<Utc>,
}

impl TryFrom<RouteOptimizationRow> for RouteOptimizationRecord {
    type Error = anyhow::Error;

    fn try_from(row: RouteOptimizationRow) -> Result<Self> {
        Ok(Self {
            technician_id: row.technician_id,
            route_date: row.route_date,
            waypoints_order: row.waypoints_order.0,
            ticket_ids: row.ticket_ids,
            geometry: row.geometry.0,
            distance_km: row.distance_km,
            duration_minutes: row.duration_minutes,
            optimization_method: row.optimization_method.parse()?,
            updated_at: row.updated_at,
        })
    }
}

const UPSERT_SQL: &str = r#"
        INSERT INTO route_optimizations (
            id, technician_id, route_date, waypoints_order, ticket_ids,
            geometry, distance_km, duration_minutes,
            optimization_method, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW(), $10)
        ON CONFLICT (technician_id, route_date)
        DO UPDATE SET
            waypoints_order = $4,
            ticket_ids = $5,
            geometry = $6,
            distance_km = $7,
            duration_minutes = $8,
            optimization_method = $9,
            updated_at = $10
        "#;

// Keys are passed as two parallel arrays and zipped server side
const SELECT_BY_KEYS_SQL: &str = r#"
        SELECT
            r.technician_id, r.route_date, r.waypoints_order, r.ticket_ids,
            r.geometry, r.distance_km, r.duration_minutes,
            r.optimization_method, r.updated_at
        FROM route_optimizations r
        JOIN UNNEST($1::uuid[], $2::date[]) AS k(technician_id, route_date)
          ON r.technician_id = k.technician_id AND r.route_date = k.route_date
        "#;

/// Insert or replace the record for (technician, date)
pub async fn upsert_route_optimization(
    pool: &PgPool,
    record: &RouteOptimizationRecord,
) -> Result<()> {
    sqlx::query(UPSERT_SQL)
        .bind(Uuid::new_v4())
        .bind(record.technician_id)
        .bind(record.route_date)
        .bind(Json(&record.waypoints_order))
        .bind(&record.ticket_ids)
        .bind(Json(&record.geometry))
        .bind(record.distance_km)
        .bind(record.duration_minutes)
        .bind(record.optimization_method.as_str())
        .bind(record.updated_at)
        .execute(pool)
        .await?;

    Ok(())
}

/// Records for the given (technician, date) keys
pub async fn list_route_optimizations(
    pool: &PgPool,
    technician_ids: &[Uuid],
    route_dates: &[NaiveDate],
) -> Result<Vec<RouteOptimizationRecord>> {
    let rows = sqlx::query_as::<_, RouteOptimizationRow>(SELECT_BY_KEYS_SQL)
        .bind(technician_ids)
        .bind(route_dates)
        .fetch_all(pool)
        .await?;

    rows.into_iter().map(RouteOptimizationRecord::try_from).collect()
}
