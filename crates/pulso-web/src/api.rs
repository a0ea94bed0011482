//! `/api/v1` JSON surface. Every read carries a tenant predicate (the
//! legislative vertical is scoped to the seeded public tenant); writes are
//! synchronous but bounded, deferring longer work to the queues.

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::postgres::PgRow;
use sqlx::Row;
use uuid::Uuid;

use pulso_core::model::{AnalysisModule, PlanTier, PUBLIC_TENANT_ID};
use pulso_core::{CoreError, CoreResult};
use pulso_metrics::analysis::{self, UserCosts};
use pulso_queue::{enqueue_unique, JobOptions, QueueName};
use pulso_storage::map_db_err;
use pulso_sync::{repo, run_initial_sync};

use crate::error::ApiResult;
use crate::pagination::{PageQuery, Paginated};
use crate::AppState;

/// Solves included in the free tier before `/analyze` requires a plan.
const FREE_SOLVE_LIMIT: i32 = 25;

/// User-triggered syncs are refused inside this window.
pub const SYNC_COOLDOWN_SECS: i64 = 5 * 60;

/// Seconds a caller must still wait, if any.
pub fn sync_wait_remaining(last_sync: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<i64> {
    let last = last_sync?;
    let elapsed = (now - last).num_seconds();
    if elapsed < SYNC_COOLDOWN_SECS {
        Some(SYNC_COOLDOWN_SECS - elapsed)
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct IdentityRequest {
    pub credential: Option<String>,
    pub email: Option<String>,
    pub name: Option<String>,
    pub picture: Option<String>,
}

/// Claims carried by the identity provider's JWT. Verification happens at
/// the provider edge; this surface only reads the profile fields.
fn decode_jwt_claims(credential: &str) -> CoreResult<Value> {
    let payload = credential
        .split('.')
        .nth(1)
        .ok_or_else(|| CoreError::Auth("credential is not a JWT".into()))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| CoreError::Auth("credential payload is not base64url".into()))?;
    serde_json::from_slice(&bytes).map_err(|_| CoreError::Auth("credential payload is not JSON".into()))
}

pub async fn auth_identity(
    State(state): State<AppState>,
    Json(body): Json<IdentityRequest>,
) -> ApiResult<Json<Value>> {
    let (email, name, picture) = match &body.credential {
        Some(credential) => {
            let claims = decode_jwt_claims(credential)?;
            let email = claims
                .get("email")
                .and_then(|v| v.as_str())
                .ok_or_else(|| CoreError::Auth("credential carries no email".into()))?
                .to_string();
            (
                email,
                claims.get("name").and_then(|v| v.as_str()).map(String::from),
                claims.get("picture").and_then(|v| v.as_str()).map(String::from),
            )
        }
        None => {
            let email = body
                .email
                .clone()
                .ok_or_else(|| CoreError::Auth("email or credential required".into()))?;
            (email, body.name.clone(), body.picture.clone())
        }
    };

    let tenant = repo::upsert_tenant(
        &state.ctx.db,
        &email,
        name.as_deref(),
        picture.as_deref(),
    )
    .await?;
    Ok(Json(serde_json::to_value(&tenant).map_err(CoreError::schema)?))
}

// ---------------------------------------------------------------------------
// Legislators
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct LegislatorFilters {
    pub page: Option<i64>,
    pub limit: Option<i64>,
    pub block_id: Option<String>,
    pub province_id: Option<String>,
    pub search: Option<String>,
    pub is_active: Option<bool>,
}

impl LegislatorFilters {
    fn page_query(&self) -> PageQuery {
        PageQuery {
            page: self.page,
            limit: self.limit,
        }
    }
}

fn legislator_json(row: &PgRow) -> CoreResult<Value> {
    Ok(json!({
        "id": row.try_get::<Uuid, _>("id").map_err(map_db_err)?,
        "externalId": row.try_get::<String, _>("external_id").map_err(map_db_err)?,
        "firstName": row.try_get::<String, _>("first_name").map_err(map_db_err)?,
        "lastName": row.try_get::<String, _>("last_name").map_err(map_db_err)?,
        "block": row.try_get::<Option<String>, _>("block").map_err(map_db_err)?,
        "province": row.try_get::<Option<String>, _>("province").map_err(map_db_err)?,
        "active": row.try_get::<bool, _>("active").map_err(map_db_err)?,
        "chamber": row.try_get::<String, _>("chamber").map_err(map_db_err)?,
        "termStart": row.try_get::<Option<chrono::NaiveDate>, _>("term_start").map_err(map_db_err)?,
        "termEnd": row.try_get::<Option<chrono::NaiveDate>, _>("term_end").map_err(map_db_err)?,
    }))
}

pub async fn list_legislators(
    State(state): State<AppState>,
    Query(filters): Query<LegislatorFilters>,
) -> ApiResult<Json<Paginated<Value>>> {
    let page = filters.page_query();
    let search = filters.search.as_ref().map(|s| format!("%{s}%"));
    let where_clause = r#"
         WHERE tenant_id = $1
           AND ($2::text IS NULL OR block = $2)
           AND ($3::text IS NULL OR province = $3)
           AND ($4::text IS NULL OR first_name ILIKE $4 OR last_name ILIKE $4)
           AND ($5::bool IS NULL OR active = $5)
    "#;

    let total: i64 = sqlx::query(&format!(
        "SELECT COUNT(*) AS n FROM legislators {where_clause}"
    ))
    .bind(PUBLIC_TENANT_ID)
    .bind(&filters.block_id)
    .bind(&filters.province_id)
    .bind(&search)
    .bind(filters.is_active)
    .fetch_one(&state.ctx.db)
    .await
    .map_err(map_db_err)?
    .try_get("n")
    .map_err(map_db_err)?;

    let rows = sqlx::query(&format!(
        r#"
        SELECT id, external_id, first_name, last_name, block, province, active,
               chamber, term_start, term_end
          FROM legislators {where_clause}
         ORDER BY last_name, first_name
         LIMIT $6 OFFSET $7
        "#
    ))
    .bind(PUBLIC_TENANT_ID)
    .bind(&filters.block_id)
    .bind(&filters.province_id)
    .bind(&search)
    .bind(filters.is_active)
    .bind(page.limit())
    .bind(page.offset())
    .fetch_all(&state.ctx.db)
    .await
    .map_err(map_db_err)?;

    let data = rows
        .iter()
        .map(legislator_json)
        .collect::<CoreResult<Vec<_>>>()?;
    Ok(Json(Paginated {
        data,
        page: page.page(),
        limit: page.limit(),
        total,
    }))
}

pub async fn get_legislator(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let row = sqlx::query(
        r#"
        SELECT id, external_id, first_name, last_name, block, province, active,
               chamber, term_start, term_end
          FROM legislators
         WHERE tenant_id = $1 AND id = $2
        "#,
    )
    .bind(PUBLIC_TENANT_ID)
    .bind(id)
    .fetch_optional(&state.ctx.db)
    .await
    .map_err(map_db_err)?
    .ok_or_else(|| CoreError::NotFound(format!("legislator {id}")))?;
    Ok(Json(legislator_json(&row)?))
}

#[derive(Debug, Deserialize, Default)]
pub struct MetricsQuery {
    pub period: Option<i32>,
}

pub async fn legislator_metrics(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<MetricsQuery>,
) -> ApiResult<Json<Vec<Value>>> {
    let rows = sqlx::query(
        r#"
        SELECT m.legislator_id, m.period, m.bills_authored, m.bills_cosigned,
               m.bills_with_advancement, m.advancement_rate, m.attendance_rate,
               m.vote_participation_rate, m.commissions_count, m.months_in_office,
               m.normalised_productivity, m.computed_at
          FROM legislator_metrics m
          JOIN legislators l ON l.id = m.legislator_id
         WHERE l.tenant_id = $1 AND m.legislator_id = $2
           AND ($3::int IS NULL OR m.period = $3)
         ORDER BY m.period DESC
        "#,
    )
    .bind(PUBLIC_TENANT_ID)
    .bind(id)
    .bind(query.period)
    .fetch_all(&state.ctx.db)
    .await
    .map_err(map_db_err)?;

    let data = rows
        .iter()
        .map(|row| {
            Ok(json!({
                "legislatorId": row.try_get::<Uuid, _>("legislator_id").map_err(map_db_err)?,
                "period": row.try_get::<i32, _>("period").map_err(map_db_err)?,
                "billsAuthored": row.try_get::<i32, _>("bills_authored").map_err(map_db_err)?,
                "billsCosigned": row.try_get::<i32, _>("bills_cosigned").map_err(map_db_err)?,
                "billsWithAdvancement": row.try_get::<i32, _>("bills_with_advancement").map_err(map_db_err)?,
                "advancementRate": row.try_get::<f64, _>("advancement_rate").map_err(map_db_err)?,
                "attendanceRate": row.try_get::<f64, _>("attendance_rate").map_err(map_db_err)?,
                "voteParticipationRate": row.try_get::<f64, _>("vote_participation_rate").map_err(map_db_err)?,
                "commissionsCount": row.try_get::<i32, _>("commissions_count").map_err(map_db_err)?,
                "monthsInOffice": row.try_get::<i32, _>("months_in_office").map_err(map_db_err)?,
                "normalisedProductivity": row.try_get::<f64, _>("normalised_productivity").map_err(map_db_err)?,
                "computedAt": row.try_get::<DateTime<Utc>, _>("computed_at").map_err(map_db_err)?,
            }))
        })
        .collect::<CoreResult<Vec<_>>>()?;
    Ok(Json(data))
}

pub async fn legislator_activity(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(page): Query<PageQuery>,
) -> ApiResult<Json<Paginated<Value>>> {
    let rows = sqlx::query(
        r#"
        SELECT f.id, f.post_type, f.title, f.body, f.tags, f.created_at
          FROM feed_posts f
         WHERE f.tenant_id IS NULL
           AND (
               (f.entity_kind = 'bill' AND f.entity_id IN (
                    SELECT bill_id FROM bill_authors WHERE legislator_id = $1))
            OR (f.entity_kind = 'vote_event' AND f.entity_id IN (
                    SELECT vote_event_id FROM vote_results WHERE legislator_id = $1))
           )
         ORDER BY f.created_at DESC
         LIMIT $2 OFFSET $3
        "#,
    )
    .bind(id)
    .bind(page.limit())
    .bind(page.offset())
    .fetch_all(&state.ctx.db)
    .await
    .map_err(map_db_err)?;

    let data = rows
        .iter()
        .map(feed_post_json)
        .collect::<CoreResult<Vec<_>>>()?;
    let total = data.len() as i64;
    Ok(Json(Paginated {
        data,
        page: page.page(),
        limit: page.limit(),
        total,
    }))
}

// ---------------------------------------------------------------------------
// Bills
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct BillFilters {
    pub page: Option<i64>,
    pub limit: Option<i64>,
    pub status: Option<String>,
    #[serde(rename = "type")]
    pub bill_type: Option<String>,
    pub search: Option<String>,
    pub author_id: Option<Uuid>,
    pub period: Option<i32>,
}

impl BillFilters {
    fn page_query(&self) -> PageQuery {
        PageQuery {
            page: self.page,
            limit: self.limit,
        }
    }
}

fn bill_json(row: &PgRow) -> CoreResult<Value> {
    Ok(json!({
        "id": row.try_get::<Uuid, _>("id").map_err(map_db_err)?,
        "externalId": row.try_get::<String, _>("external_id").map_err(map_db_err)?,
        "title": row.try_get::<String, _>("title").map_err(map_db_err)?,
        "status": row.try_get::<String, _>("status").map_err(map_db_err)?,
        "type": row.try_get::<Option<String>, _>("bill_type").map_err(map_db_err)?,
        "presentedDate": row.try_get::<Option<chrono::NaiveDate>, _>("presented_date").map_err(map_db_err)?,
        "period": row.try_get::<i32, _>("period").map_err(map_db_err)?,
    }))
}

pub async fn list_bills(
    State(state): State<AppState>,
    Query(filters): Query<BillFilters>,
) -> ApiResult<Json<Paginated<Value>>> {
    let page = filters.page_query();
    let search = filters.search.as_ref().map(|s| format!("%{s}%"));
    let where_clause = r#"
         WHERE b.tenant_id = $1
           AND ($2::text IS NULL OR b.status = $2)
           AND ($3::text IS NULL OR b.bill_type = $3)
           AND ($4::text IS NULL OR b.title ILIKE $4)
           AND ($5::uuid IS NULL OR EXISTS (
                SELECT 1 FROM bill_authors ba
                 WHERE ba.bill_id = b.id AND ba.legislator_id = $5))
           AND ($6::int IS NULL OR b.period = $6)
    "#;

    let total: i64 = sqlx::query(&format!("SELECT COUNT(*) AS n FROM bills b {where_clause}"))
        .bind(PUBLIC_TENANT_ID)
        .bind(&filters.status)
        .bind(&filters.bill_type)
        .bind(&search)
        .bind(filters.author_id)
        .bind(filters.period)
        .fetch_one(&state.ctx.db)
        .await
        .map_err(map_db_err)?
        .try_get("n")
        .map_err(map_db_err)?;

    let rows = sqlx::query(&format!(
        r#"
        SELECT b.id, b.external_id, b.title, b.status, b.bill_type,
               b.presented_date, b.period
          FROM bills b {where_clause}
         ORDER BY b.presented_date DESC NULLS LAST, b.external_id
         LIMIT $7 OFFSET $8
        "#
    ))
    .bind(PUBLIC_TENANT_ID)
    .bind(&filters.status)
    .bind(&filters.bill_type)
    .bind(&search)
    .bind(filters.author_id)
    .bind(filters.period)
    .bind(page.limit())
    .bind(page.offset())
    .fetch_all(&state.ctx.db)
    .await
    .map_err(map_db_err)?;

    let data = rows.iter().map(bill_json).collect::<CoreResult<Vec<_>>>()?;
    Ok(Json(Paginated {
        data,
        page: page.page(),
        limit: page.limit(),
        total,
    }))
}

pub async fn get_bill(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let row = sqlx::query(
        r#"
        SELECT id, external_id, title, status, bill_type, presented_date, period
          FROM bills b
         WHERE b.tenant_id = $1 AND b.id = $2
        "#,
    )
    .bind(PUBLIC_TENANT_ID)
    .bind(id)
    .fetch_optional(&state.ctx.db)
    .await
    .map_err(map_db_err)?
    .ok_or_else(|| CoreError::NotFound(format!("bill {id}")))?;
    let mut bill = bill_json(&row)?;

    let movements = sqlx::query(
        r#"
        SELECT order_index, description, from_status, to_status, movement_date
          FROM bill_movements
         WHERE bill_id = $1
         ORDER BY order_index
        "#,
    )
    .bind(id)
    .fetch_all(&state.ctx.db)
    .await
    .map_err(map_db_err)?;
    bill["movements"] = movements
        .iter()
        .map(|row| {
            Ok(json!({
                "orderIndex": row.try_get::<i32, _>("order_index").map_err(map_db_err)?,
                "description": row.try_get::<String, _>("description").map_err(map_db_err)?,
                "fromStatus": row.try_get::<Option<String>, _>("from_status").map_err(map_db_err)?,
                "toStatus": row.try_get::<Option<String>, _>("to_status").map_err(map_db_err)?,
                "date": row.try_get::<chrono::NaiveDate, _>("movement_date").map_err(map_db_err)?,
            }))
        })
        .collect::<CoreResult<Vec<_>>>()?
        .into();

    let authors = sqlx::query(
        r#"
        SELECT l.id, l.first_name, l.last_name, ba.role
          FROM bill_authors ba
          JOIN legislators l ON l.id = ba.legislator_id
         WHERE ba.bill_id = $1
         ORDER BY ba.role, l.last_name
        "#,
    )
    .bind(id)
    .fetch_all(&state.ctx.db)
    .await
    .map_err(map_db_err)?;
    bill["authors"] = authors
        .iter()
        .map(|row| {
            Ok(json!({
                "legislatorId": row.try_get::<Uuid, _>("id").map_err(map_db_err)?,
                "firstName": row.try_get::<String, _>("first_name").map_err(map_db_err)?,
                "lastName": row.try_get::<String, _>("last_name").map_err(map_db_err)?,
                "role": row.try_get::<String, _>("role").map_err(map_db_err)?,
            }))
        })
        .collect::<CoreResult<Vec<_>>>()?
        .into();

    Ok(Json(bill))
}

// ---------------------------------------------------------------------------
// Feed
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct FeedFilters {
    pub page: Option<i64>,
    pub limit: Option<i64>,
    #[serde(rename = "type")]
    pub post_type: Option<String>,
    pub block_id: Option<String>,
    pub province_id: Option<String>,
    /// Comma-separated tag list; posts match when any tag overlaps.
    pub tags: Option<String>,
    pub tenant_id: Option<Uuid>,
}

impl FeedFilters {
    fn page_query(&self) -> PageQuery {
        PageQuery {
            page: self.page,
            limit: self.limit,
        }
    }
}

fn feed_post_json(row: &PgRow) -> CoreResult<Value> {
    Ok(json!({
        "id": row.try_get::<Uuid, _>("id").map_err(map_db_err)?,
        "type": row.try_get::<String, _>("post_type").map_err(map_db_err)?,
        "title": row.try_get::<String, _>("title").map_err(map_db_err)?,
        "body": row.try_get::<String, _>("body").map_err(map_db_err)?,
        "tags": row.try_get::<Vec<String>, _>("tags").map_err(map_db_err)?,
        "createdAt": row.try_get::<DateTime<Utc>, _>("created_at").map_err(map_db_err)?,
    }))
}

pub async fn list_feed(
    State(state): State<AppState>,
    Query(filters): Query<FeedFilters>,
) -> ApiResult<Json<Paginated<Value>>> {
    let page = filters.page_query();
    let mut tag_filter: Vec<String> = filters
        .tags
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    if let Some(block) = &filters.block_id {
        tag_filter.push(block.clone());
    }
    if let Some(province) = &filters.province_id {
        tag_filter.push(province.clone());
    }
    let tag_filter = if tag_filter.is_empty() {
        None
    } else {
        Some(tag_filter)
    };

    let where_clause = r#"
         WHERE (($1::uuid IS NULL AND tenant_id IS NULL) OR tenant_id = $1)
           AND ($2::text IS NULL OR post_type = $2)
           AND ($3::text[] IS NULL OR tags && $3)
    "#;

    let total: i64 = sqlx::query(&format!(
        "SELECT COUNT(*) AS n FROM feed_posts {where_clause}"
    ))
    .bind(filters.tenant_id)
    .bind(&filters.post_type)
    .bind(&tag_filter)
    .fetch_one(&state.ctx.db)
    .await
    .map_err(map_db_err)?
    .try_get("n")
    .map_err(map_db_err)?;

    let rows = sqlx::query(&format!(
        r#"
        SELECT id, post_type, title, body, tags, created_at
          FROM feed_posts {where_clause}
         ORDER BY created_at DESC
         LIMIT $4 OFFSET $5
        "#
    ))
    .bind(filters.tenant_id)
    .bind(&filters.post_type)
    .bind(&tag_filter)
    .bind(page.limit())
    .bind(page.offset())
    .fetch_all(&state.ctx.db)
    .await
    .map_err(map_db_err)?;

    let data = rows
        .iter()
        .map(feed_post_json)
        .collect::<CoreResult<Vec<_>>>()?;
    Ok(Json(Paginated {
        data,
        page: page.page(),
        limit: page.limit(),
        total,
    }))
}

pub async fn get_feed_post(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let row = sqlx::query(
        "SELECT id, post_type, title, body, tags, created_at FROM feed_posts WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(&state.ctx.db)
    .await
    .map_err(map_db_err)?
    .ok_or_else(|| CoreError::NotFound(format!("feed post {id}")))?;
    Ok(Json(feed_post_json(&row)?))
}

// ---------------------------------------------------------------------------
// Sync / analyze / reindex
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct SyncRequest {
    pub shop: String,
    pub email: String,
}

pub async fn post_sync(
    State(state): State<AppState>,
    Json(body): Json<SyncRequest>,
) -> ApiResult<axum::response::Response> {
    use axum::http::StatusCode;
    use axum::response::IntoResponse;

    let tenant = repo::tenant_by_email(&state.ctx.db, &body.email)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("tenant {}", body.email)))?;
    let connection = repo::connection_by_shop(&state.ctx.db, &body.shop)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("connection {}", body.shop)))?;
    if connection.tenant_id != tenant.id {
        return Err(CoreError::Forbidden("connection belongs to another tenant".into()).into());
    }

    // User-triggered syncs are rate-limited; scheduler syncs bypass this
    // path entirely.
    if let Some(wait) = sync_wait_remaining(connection.last_sync, Utc::now()) {
        return Ok((
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "error": "rate_limited",
                "last_sync": connection.last_sync,
                "message": format!("sync available again in {wait} seconds"),
            })),
        )
            .into_response());
    }

    let counts = run_initial_sync(&state.ctx, &connection).await?;
    let refreshed = repo::connection_by_id(&state.ctx.db, connection.id).await?;
    Ok(Json(json!({
        "last_sync": refreshed.last_sync,
        "synced": {
            "products": counts.products,
            "orders": counts.orders,
            "inventory": counts.inventory,
        }
    }))
    .into_response())
}

#[derive(Debug, Deserialize)]
pub struct AnalyzeRequest {
    pub store_id: Option<String>,
    pub user_id: Option<Uuid>,
    pub email: Option<String>,
    pub modules: Option<Vec<String>>,
    pub user_costs: Option<UserCosts>,
}

pub async fn post_analyze(
    State(state): State<AppState>,
    Json(body): Json<AnalyzeRequest>,
) -> ApiResult<Json<Value>> {
    let tenant = match (body.user_id, &body.email, &body.store_id) {
        (Some(id), _, _) => repo::tenant_by_id(&state.ctx.db, id).await?,
        (None, Some(email), _) => repo::tenant_by_email(&state.ctx.db, email)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("tenant {email}")))?,
        (None, None, Some(shop)) => {
            let connection = repo::connection_by_shop(&state.ctx.db, shop)
                .await?
                .ok_or_else(|| CoreError::NotFound(format!("connection {shop}")))?;
            repo::tenant_by_id(&state.ctx.db, connection.tenant_id).await?
        }
        (None, None, None) => {
            return Err(CoreError::Auth("user_id, email or store_id required".into()).into());
        }
    };

    if tenant.plan == PlanTier::Free && tenant.solve_count >= FREE_SOLVE_LIMIT {
        return Err(CoreError::Forbidden(
            "free plan analysis allowance exhausted; upgrade to continue".into(),
        )
        .into());
    }

    let modules: Option<Vec<AnalysisModule>> = body
        .modules
        .as_ref()
        .map(|names| {
            names
                .iter()
                .map(|name| {
                    AnalysisModule::parse(name)
                        .ok_or_else(|| CoreError::schema(format!("unknown module {name:?}")))
                })
                .collect::<CoreResult<Vec<_>>>()
        })
        .transpose()?;

    let costs = body.user_costs.clone().unwrap_or_default();
    let inputs = analysis::gather_inputs(&state.ctx.db, tenant.id, costs).await?;
    let bundle = analysis::build_bundle(&inputs, modules.as_deref());
    analysis::persist_bundle(&state.ctx.db, tenant.id, &bundle).await?;
    repo::increment_solve_count(&state.ctx.db, tenant.id).await?;

    Ok(Json(serde_json::to_value(&bundle).map_err(CoreError::schema)?))
}

pub async fn post_reindex(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let legislators: i64 = sqlx::query("SELECT COUNT(*) AS n FROM legislators WHERE tenant_id = $1")
        .bind(PUBLIC_TENANT_ID)
        .fetch_one(&state.ctx.db)
        .await
        .map_err(map_db_err)?
        .try_get("n")
        .map_err(map_db_err)?;
    let bills: i64 = sqlx::query("SELECT COUNT(*) AS n FROM bills WHERE tenant_id = $1")
        .bind(PUBLIC_TENANT_ID)
        .fetch_one(&state.ctx.db)
        .await
        .map_err(map_db_err)?
        .try_get("n")
        .map_err(map_db_err)?;

    Ok(Json(json!({ "legislators": legislators, "bills": bills })))
}

// ---------------------------------------------------------------------------
// Authenticated cron invocations
// ---------------------------------------------------------------------------

fn require_cron_secret(state: &AppState, headers: &HeaderMap) -> CoreResult<()> {
    let presented = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or_default();
    if presented.is_empty() || presented != state.ctx.config.cron_secret {
        return Err(CoreError::Auth("invalid scheduler secret".into()));
    }
    Ok(())
}

pub async fn cron_ingest(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    require_cron_secret(&state, &headers)?;
    let job_id = enqueue_unique(
        &state.ctx.queue,
        QueueName::Ingest,
        "ingest:all",
        json!({}),
        JobOptions::default(),
    )
    .await?;
    Ok(Json(json!({ "ok": true, "job_id": job_id })))
}

pub async fn cron_metrics(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    require_cron_secret(&state, &headers)?;
    let job_id = enqueue_unique(
        &state.ctx.queue,
        QueueName::Metrics,
        "metrics:recompute-all",
        json!({}),
        JobOptions::default(),
    )
    .await?;
    Ok(Json(json!({ "ok": true, "job_id": job_id })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn sync_rate_limit_window() {
        let now = Utc::now();
        // Never synced: no wait.
        assert_eq!(sync_wait_remaining(None, now), None);
        // 30 seconds after a sync: 270 seconds left.
        assert_eq!(
            sync_wait_remaining(Some(now - Duration::seconds(30)), now),
            Some(270)
        );
        // Just past the window: allowed.
        assert_eq!(
            sync_wait_remaining(Some(now - Duration::seconds(SYNC_COOLDOWN_SECS + 1)), now),
            None
        );
        // Thirty minutes later: allowed.
        assert_eq!(
            sync_wait_remaining(Some(now - Duration::minutes(30)), now),
            None
        );
    }

    #[test]
    fn jwt_claims_decode_without_verification() {
        // header.payload.signature with payload {"email":"u@t.io","name":"U"}
        let payload = URL_SAFE_NO_PAD.encode(br#"{"email":"u@t.io","name":"U"}"#);
        let token = format!("eyJhbGciOiJub25lIn0.{payload}.sig");
        let claims = decode_jwt_claims(&token).unwrap();
        assert_eq!(claims["email"], "u@t.io");
        assert_eq!(claims["name"], "U");
    }

    #[test]
    fn malformed_credentials_are_auth_errors() {
        assert_eq!(decode_jwt_claims("not-a-jwt").unwrap_err().code(), "auth_failed");
        assert_eq!(
            decode_jwt_claims("a.!!!.c").unwrap_err().code(),
            "auth_failed"
        );
    }
}
