//! Tenant and connection persistence shared by the pipeline and the API
//! surface. Every query here carries a tenant or connection predicate.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use pulso_core::model::{Connection, PlanTier, SyncStatus, Tenant};
use pulso_core::{CoreError, CoreResult};
use pulso_storage::map_db_err;

/// Signature failures tolerated before a connection is marked `error`.
const SIGNATURE_STRIKE_LIMIT: i32 = 3;

pub fn tenant_from_row(row: &PgRow) -> CoreResult<Tenant> {
    let plan_raw: String = row.try_get("plan").map_err(map_db_err)?;
    Ok(Tenant {
        id: row.try_get("id").map_err(map_db_err)?,
        email: row.try_get("email").map_err(map_db_err)?,
        name: row.try_get("name").map_err(map_db_err)?,
        picture: row.try_get("picture").map_err(map_db_err)?,
        plan: PlanTier::parse(&plan_raw)
            .ok_or_else(|| CoreError::schema(format!("unknown plan {plan_raw}")))?,
        solve_count: row.try_get("solve_count").map_err(map_db_err)?,
        created_at: row.try_get("created_at").map_err(map_db_err)?,
    })
}

pub fn connection_from_row(row: &PgRow) -> CoreResult<Connection> {
    let status_raw: String = row.try_get("sync_status").map_err(map_db_err)?;
    Ok(Connection {
        id: row.try_get("id").map_err(map_db_err)?,
        tenant_id: row.try_get("tenant_id").map_err(map_db_err)?,
        shop_domain: row.try_get("shop_domain").map_err(map_db_err)?,
        access_token: row.try_get("access_token").map_err(map_db_err)?,
        scopes: row.try_get("scopes").map_err(map_db_err)?,
        last_sync: row.try_get("last_sync").map_err(map_db_err)?,
        sync_status: SyncStatus::parse(&status_raw)
            .ok_or_else(|| CoreError::schema(format!("unknown sync status {status_raw}")))?,
        products_count: row.try_get("products_count").map_err(map_db_err)?,
        orders_count: row.try_get("orders_count").map_err(map_db_err)?,
        signature_failures: row.try_get("signature_failures").map_err(map_db_err)?,
        created_at: row.try_get("created_at").map_err(map_db_err)?,
        updated_at: row.try_get("updated_at").map_err(map_db_err)?,
    })
}

const TENANT_COLUMNS: &str = "id, email, name, picture, plan, solve_count, created_at";
const CONNECTION_COLUMNS: &str = "id, tenant_id, shop_domain, access_token, scopes, last_sync, \
     sync_status, products_count, orders_count, signature_failures, created_at, updated_at";

/// Tenants are created on the first successful identity handshake and
/// never hard-deleted.
pub async fn upsert_tenant(
    pool: &PgPool,
    email: &str,
    name: Option<&str>,
    picture: Option<&str>,
) -> CoreResult<Tenant> {
    let row = sqlx::query(&format!(
        r#"
        INSERT INTO tenants (id, email, name, picture, plan, solve_count, created_at)
        VALUES ($1, $2, $3, $4, 'free', 0, NOW())
        ON CONFLICT (email) DO UPDATE SET
               name = COALESCE(EXCLUDED.name, tenants.name),
               picture = COALESCE(EXCLUDED.picture, tenants.picture)
        RETURNING {TENANT_COLUMNS}
        "#
    ))
    .bind(Uuid::new_v4())
    .bind(email)
    .bind(name)
    .bind(picture)
    .fetch_one(pool)
    .await
    .map_err(map_db_err)?;
    tenant_from_row(&row)
}

pub async fn tenant_by_email(pool: &PgPool, email: &str) -> CoreResult<Option<Tenant>> {
    let row = sqlx::query(&format!(
        "SELECT {TENANT_COLUMNS} FROM tenants WHERE email = $1"
    ))
    .bind(email)
    .fetch_optional(pool)
    .await
    .map_err(map_db_err)?;
    row.map(|r| tenant_from_row(&r)).transpose()
}

pub async fn tenant_by_id(pool: &PgPool, id: Uuid) -> CoreResult<Tenant> {
    let row = sqlx::query(&format!(
        "SELECT {TENANT_COLUMNS} FROM tenants WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
    .map_err(map_db_err)?
    .ok_or_else(|| CoreError::NotFound(format!("tenant {id}")))?;
    tenant_from_row(&row)
}

/// Soft-match fallback for an unresolvable OAuth carry value: the most
/// recently created tenant on the highest plan. Callers audit every use.
pub async fn most_recent_highest_plan_tenant(pool: &PgPool) -> CoreResult<Option<Tenant>> {
    let row = sqlx::query(&format!(
        r#"
        SELECT {TENANT_COLUMNS}
          FROM tenants
         WHERE id <> $1
         ORDER BY (plan = 'pro') DESC, created_at DESC
         LIMIT 1
        "#
    ))
    .bind(pulso_core::model::PUBLIC_TENANT_ID)
    .fetch_optional(pool)
    .await
    .map_err(map_db_err)?;
    row.map(|r| tenant_from_row(&r)).transpose()
}

pub async fn increment_solve_count(pool: &PgPool, tenant_id: Uuid) -> CoreResult<i32> {
    let row = sqlx::query(
        "UPDATE tenants SET solve_count = solve_count + 1 WHERE id = $1 RETURNING solve_count",
    )
    .bind(tenant_id)
    .fetch_one(pool)
    .await
    .map_err(map_db_err)?;
    row.try_get("solve_count").map_err(map_db_err)
}

/// Upsert unique by shop domain: one tenant has at most one connection per
/// external source identity.
pub async fn upsert_connection(
    pool: &PgPool,
    tenant_id: Uuid,
    shop_domain: &str,
    access_token: &str,
    scopes: &[String],
) -> CoreResult<Connection> {
    let row = sqlx::query(&format!(
        r#"
        INSERT INTO connections (id, tenant_id, shop_domain, access_token, scopes,
                                 sync_status, products_count, orders_count,
                                 signature_failures, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, 'pending', 0, 0, 0, NOW(), NOW())
        ON CONFLICT (shop_domain) DO UPDATE SET
               tenant_id = EXCLUDED.tenant_id,
               access_token = EXCLUDED.access_token,
               scopes = EXCLUDED.scopes,
               updated_at = NOW()
        RETURNING {CONNECTION_COLUMNS}
        "#
    ))
    .bind(Uuid::new_v4())
    .bind(tenant_id)
    .bind(shop_domain)
    .bind(access_token)
    .bind(scopes)
    .fetch_one(pool)
    .await
    .map_err(map_db_err)?;
    connection_from_row(&row)
}

pub async fn connection_by_shop(pool: &PgPool, shop_domain: &str) -> CoreResult<Option<Connection>> {
    let row = sqlx::query(&format!(
        "SELECT {CONNECTION_COLUMNS} FROM connections WHERE shop_domain = $1"
    ))
    .bind(shop_domain)
    .fetch_optional(pool)
    .await
    .map_err(map_db_err)?;
    row.map(|r| connection_from_row(&r)).transpose()
}

pub async fn connection_by_id(pool: &PgPool, id: Uuid) -> CoreResult<Connection> {
    let row = sqlx::query(&format!(
        "SELECT {CONNECTION_COLUMNS} FROM connections WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
    .map_err(map_db_err)?
    .ok_or_else(|| CoreError::NotFound(format!("connection {id}")))?;
    connection_from_row(&row)
}

pub async fn all_connections(pool: &PgPool) -> CoreResult<Vec<Connection>> {
    let rows = sqlx::query(&format!(
        "SELECT {CONNECTION_COLUMNS} FROM connections ORDER BY created_at"
    ))
    .fetch_all(pool)
    .await
    .map_err(map_db_err)?;
    rows.iter().map(connection_from_row).collect()
}

pub async fn set_sync_status(
    pool: &PgPool,
    connection_id: Uuid,
    status: SyncStatus,
) -> CoreResult<()> {
    sqlx::query(
        "UPDATE connections SET sync_status = $2, updated_at = NOW() WHERE id = $1",
    )
    .bind(connection_id)
    .bind(status.as_str())
    .execute(pool)
    .await
    .map_err(map_db_err)?;
    Ok(())
}

/// Record a successful sync: counts, timestamp, status `synced`, and the
/// signature strike counter cleared.
pub async fn record_sync_success(
    pool: &PgPool,
    connection_id: Uuid,
    products_count: i32,
    orders_count: i32,
    at: DateTime<Utc>,
) -> CoreResult<()> {
    sqlx::query(
        r#"
        UPDATE connections
           SET sync_status = 'synced', last_sync = $2,
               products_count = $3, orders_count = $4,
               signature_failures = 0, updated_at = NOW()
         WHERE id = $1
        "#,
    )
    .bind(connection_id)
    .bind(at)
    .bind(products_count)
    .bind(orders_count)
    .execute(pool)
    .await
    .map_err(map_db_err)?;
    Ok(())
}

/// One signature strike; the third marks the connection `error` until a
/// successful fetch clears it.
pub async fn record_signature_failure(pool: &PgPool, connection_id: Uuid) -> CoreResult<i32> {
    let row = sqlx::query(
        r#"
        UPDATE connections
           SET signature_failures = signature_failures + 1,
               sync_status = CASE WHEN signature_failures + 1 >= $2
                                  THEN 'error' ELSE sync_status END,
               updated_at = NOW()
         WHERE id = $1
        RETURNING signature_failures
        "#,
    )
    .bind(connection_id)
    .bind(SIGNATURE_STRIKE_LIMIT)
    .fetch_one(pool)
    .await
    .map_err(map_db_err)?;
    row.try_get("signature_failures").map_err(map_db_err)
}

/// Resolve legislator external ids to row ids within the tenant scope.
pub async fn legislator_id_by_external(
    pool: &PgPool,
    tenant_id: Uuid,
    external_id: &str,
) -> CoreResult<Option<Uuid>> {
    let row = sqlx::query(
        "SELECT id FROM legislators WHERE tenant_id = $1 AND external_id = $2",
    )
    .bind(tenant_id)
    .bind(external_id)
    .fetch_optional(pool)
    .await
    .map_err(map_db_err)?;
    row.map(|r| r.try_get("id").map_err(map_db_err)).transpose()
}
