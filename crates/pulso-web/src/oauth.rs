//! OAuth handshake endpoints. The callback runs the inline initial sync as
//! an explicit critical section: its failure marks the connection `error`,
//! and only queue jobs run after the redirect.

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::Response;
use pulso_adapters::SourceAdapter;
use serde::Deserialize;
use tracing::{info, warn};

use pulso_adapters::shopify::{decode_state, ShopifyAdapter};
use pulso_core::model::Tenant;
use pulso_sync::{repo, run_initial_sync};

use crate::AppState;

const APP_LANDING: &str = "/legacy/app.html";

/// Plain `302 Found`, the redirect the provider and the SPA both expect.
pub fn found(location: &str) -> Response {
    Response::builder()
        .status(StatusCode::FOUND)
        .header(header::LOCATION, location)
        .body(axum::body::Body::empty())
        .expect("static redirect response")
}

fn app_error_redirect(state: &AppState, code: &str) -> Response {
    found(&format!(
        "{}{APP_LANDING}?error={code}",
        state.ctx.config.app_base_url
    ))
}

#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    pub shop: Option<String>,
    pub email: Option<String>,
}

pub async fn connect(
    State(state): State<AppState>,
    Query(params): Query<ConnectParams>,
) -> Response {
    let (Some(shop), Some(email)) = (params.shop, params.email) else {
        return app_error_redirect(&state, "missing_params");
    };

    let adapter = ShopifyAdapter::new(state.shopify_credentials());
    let (auth_url, _state_token) = adapter.build_auth_url(&shop, &email);
    found(&auth_url)
}

#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub shop: Option<String>,
    pub state: Option<String>,
}

pub async fn callback(
    State(state): State<AppState>,
    Query(params): Query<CallbackParams>,
) -> Response {
    let (Some(code), Some(shop), Some(oauth_state)) = (params.code, params.shop, params.state)
    else {
        return app_error_redirect(&state, "missing_params");
    };

    let Some(tenant) = resolve_tenant(&state, &oauth_state).await else {
        return app_error_redirect(&state, "no_user");
    };

    let adapter = ShopifyAdapter::new(state.shopify_credentials());
    let token = match adapter.exchange_code_for_token(&shop, &code).await {
        Ok(token) => token,
        Err(err) => {
            warn!(%shop, %err, "token exchange failed");
            return app_error_redirect(&state, "auth_failed");
        }
    };

    let scopes: Vec<String> = token
        .scope
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    let connection = match repo::upsert_connection(
        &state.ctx.db,
        tenant.id,
        &shop,
        &token.access_token,
        &scopes,
    )
    .await
    {
        Ok(connection) => connection,
        Err(err) => {
            warn!(%shop, %err, "connection upsert failed");
            return app_error_redirect(&state, "auth_failed");
        }
    };

    let auth = pulso_adapters::ConnectionAuth {
        shop_domain: connection.shop_domain.clone(),
        access_token: connection.access_token.clone(),
    };
    let fetch_ctx = pulso_adapters::FetchContext {
        run_id: connection.id,
        http: &state.ctx.http,
        auth: Some(&auth),
    };
    match adapter
        .register_change_notifications(&fetch_ctx, &state.ctx.config.app_base_url)
        .await
    {
        Ok(outcomes) => {
            for outcome in outcomes.iter().filter(|o| !o.ok) {
                warn!(topic = %outcome.topic, detail = ?outcome.detail, "webhook registration failed");
            }
        }
        Err(err) => warn!(%shop, %err, "webhook registration errored"),
    }

    // Inline critical section: the user returns with data already present.
    let (products, orders) = match run_initial_sync(&state.ctx, &connection).await {
        Ok(counts) => (counts.products, counts.orders),
        Err(err) => {
            warn!(%shop, %err, "inline sync failed; connection marked error");
            (0, 0)
        }
    };

    info!(%shop, tenant = %tenant.email, products, orders, "shopify connected");
    found(&format!(
        "{}{APP_LANDING}?shopify_connected=true&shop={shop}&products={products}&orders={orders}",
        state.ctx.config.app_base_url
    ))
}

/// Resolve the carry value back to a tenant. The soft-match fallback picks
/// the most recently created highest-plan tenant; it is audited and gated
/// behind configuration.
async fn resolve_tenant(state: &AppState, oauth_state: &str) -> Option<Tenant> {
    let carry = decode_state(oauth_state);
    if let Some(email) = &carry {
        match repo::tenant_by_email(&state.ctx.db, email).await {
            Ok(Some(tenant)) => return Some(tenant),
            Ok(None) => {}
            Err(err) => {
                warn!(%err, "tenant lookup failed");
                return None;
            }
        }
    }

    if !state.ctx.config.allow_callback_soft_match {
        return None;
    }

    match repo::most_recent_highest_plan_tenant(&state.ctx.db).await {
        Ok(Some(tenant)) => {
            warn!(
                carry = ?carry,
                substituted = %tenant.email,
                "oauth carry value did not resolve; soft-matched tenant"
            );
            Some(tenant)
        }
        _ => None,
    }
}
