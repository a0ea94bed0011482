//! Shopify adapter: OAuth token lifecycle, Admin REST fetches for the
//! commerce data types, webhook registration and signature verification.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::Sha256;
use uuid::Uuid;

use pulso_core::model::DataType;
use pulso_core::{CoreError, CoreResult};

use crate::{
    source_key, AdapterError, FetchContext, RawPayload, RegistrationOutcome, SourceAdapter,
};

type HmacSha256 = Hmac<Sha256>;

const API_VERSION: &str = "2024-01";

/// Webhook topics registered after a successful connect.
const WEBHOOK_TOPICS: [&str; 3] = ["products/update", "orders/create", "app/uninstalled"];

#[derive(Debug, Clone)]
pub struct ShopifyCredentials {
    pub api_key: String,
    pub api_secret: String,
    pub scopes: Vec<String>,
    pub app_base_url: String,
}

pub struct ShopifyAdapter {
    credentials: ShopifyCredentials,
    client: reqwest::Client,
}

impl ShopifyAdapter {
    pub fn new(credentials: ShopifyCredentials) -> Self {
        Self {
            credentials,
            client: reqwest::Client::new(),
        }
    }

    pub fn credentials(&self) -> &ShopifyCredentials {
        &self.credentials
    }

    /// Authorisation URL for step 1 of the OAuth handshake. The returned
    /// state is `<nonce>:<base64(carry)>` and must round-trip through the
    /// provider untouched.
    pub fn build_auth_url(&self, shop: &str, carry: &str) -> (String, String) {
        let state = encode_state(carry);
        let url = format!(
            "https://{shop}/admin/oauth/authorize?client_id={}&scope={}&redirect_uri={}/callback&state={state}",
            self.credentials.api_key,
            self.credentials.scopes.join(","),
            self.credentials.app_base_url,
        );
        (url, state)
    }

    /// Step 3: exchange the callback code for a long-lived access token.
    pub async fn exchange_code_for_token(
        &self,
        shop: &str,
        code: &str,
    ) -> CoreResult<AccessTokenResponse> {
        let url = format!("https://{shop}/admin/oauth/access_token");
        let resp = self
            .client
            .post(&url)
            .json(&json!({
                "client_id": self.credentials.api_key,
                "client_secret": self.credentials.api_secret,
                "code": code,
            }))
            .send()
            .await
            .map_err(CoreError::transient)?;

        if !resp.status().is_success() {
            return Err(CoreError::Auth(format!(
                "token exchange returned {}",
                resp.status()
            )));
        }
        resp.json::<AccessTokenResponse>()
            .await
            .map_err(|err| CoreError::Auth(format!("malformed token response: {err}")))
    }

    fn resource_path(data_type: DataType) -> Option<&'static str> {
        match data_type {
            DataType::Products => Some("products.json"),
            DataType::Orders => Some("orders.json?status=any"),
            DataType::Inventory => Some("inventory_levels.json"),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccessTokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub scope: String,
}

#[async_trait]
impl SourceAdapter for ShopifyAdapter {
    fn source_name(&self) -> &'static str {
        "shopify"
    }

    fn data_types(&self) -> Vec<DataType> {
        DataType::commerce_types().to_vec()
    }

    async fn fetch(
        &self,
        ctx: &FetchContext<'_>,
        data_type: DataType,
    ) -> Result<RawPayload, AdapterError> {
        let auth = ctx
            .auth
            .ok_or_else(|| AdapterError::Auth("shopify fetch requires a connection".into()))?;
        let path = Self::resource_path(data_type).ok_or_else(|| {
            AdapterError::Schema(format!(
                "shopify does not serve data type {}",
                data_type.as_str()
            ))
        })?;

        let url = format!("https://{}/admin/api/{API_VERSION}/{path}", auth.shop_domain);
        let key = source_key("shopify", &auth.shop_domain, data_type);
        let response = ctx
            .http
            .fetch_bytes(
                ctx.run_id,
                &key,
                &url,
                Some(("X-Shopify-Access-Token", &auth.access_token)),
            )
            .await?;

        Ok(RawPayload {
            source_key: key,
            data_type,
            content_type: "application/json".to_string(),
            body: response.body,
            fetched_at: Utc::now(),
        })
    }

    async fn register_change_notifications(
        &self,
        ctx: &FetchContext<'_>,
        callback_base: &str,
    ) -> Result<Vec<RegistrationOutcome>, AdapterError> {
        let auth = ctx
            .auth
            .ok_or_else(|| AdapterError::Auth("webhook registration requires a connection".into()))?;
        let url = format!(
            "https://{}/admin/api/{API_VERSION}/webhooks.json",
            auth.shop_domain
        );

        let mut outcomes = Vec::with_capacity(WEBHOOK_TOPICS.len());
        for topic in WEBHOOK_TOPICS {
            let result = self
                .client
                .post(&url)
                .header("X-Shopify-Access-Token", &auth.access_token)
                .json(&json!({
                    "webhook": {
                        "topic": topic,
                        "address": format!("{callback_base}/webhooks/shopify"),
                        "format": "json",
                    }
                }))
                .send()
                .await;

            let outcome = match result {
                Ok(resp) if resp.status().is_success() => RegistrationOutcome {
                    topic: topic.to_string(),
                    ok: true,
                    detail: None,
                },
                Ok(resp) => RegistrationOutcome {
                    topic: topic.to_string(),
                    ok: false,
                    detail: Some(format!("status {}", resp.status())),
                },
                Err(err) => RegistrationOutcome {
                    topic: topic.to_string(),
                    ok: false,
                    detail: Some(err.to_string()),
                },
            };
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }
}

// ---------------------------------------------------------------------------
// OAuth carry state
// ---------------------------------------------------------------------------

/// `state = <nonce>:<base64(carry)>`.
pub fn encode_state(carry: &str) -> String {
    let nonce = Uuid::new_v4().simple().to_string();
    format!("{nonce}:{}", BASE64.encode(carry.as_bytes()))
}

/// Recover the carry value from a round-tripped state token.
pub fn decode_state(state: &str) -> Option<String> {
    let (_nonce, carry_b64) = state.split_once(':')?;
    let bytes = BASE64.decode(carry_b64).ok()?;
    String::from_utf8(bytes).ok()
}

// ---------------------------------------------------------------------------
// Change-notification signatures
// ---------------------------------------------------------------------------

/// HMAC-SHA-256 of the raw request body under the shared secret,
/// base64-encoded the way the provider sends it.
pub fn sign_webhook(secret: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(body);
    BASE64.encode(mac.finalize().into_bytes())
}

/// Constant-time verification of an incoming notification signature.
pub fn verify_webhook(secret: &str, body: &[u8], signature: &str) -> bool {
    let expected = sign_webhook(secret, body);
    constant_time_eq(expected.as_bytes(), signature.as_bytes())
}

/// Constant-time comparison to prevent timing attacks.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter()
        .zip(b.iter())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

// ---------------------------------------------------------------------------
// Wire payloads (declared schemas; unknown shapes are rejected up-front)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProductsPayload {
    pub products: Vec<ShopifyProduct>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShopifyProduct {
    pub id: i64,
    pub title: String,
    pub vendor: Option<String>,
    /// Comma-separated, the way the provider serialises them.
    pub tags: Option<String>,
    pub variants: Vec<ShopifyVariant>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShopifyVariant {
    pub id: i64,
    pub title: Option<String>,
    pub sku: Option<String>,
    /// Decimal string, e.g. `"19.90"`.
    pub price: Option<String>,
    pub cost_per_item: Option<String>,
    #[serde(default)]
    pub inventory_quantity: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OrdersPayload {
    pub orders: Vec<ShopifyOrder>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShopifyOrder {
    pub id: i64,
    pub order_number: i64,
    pub total_price: String,
    pub currency: Option<String>,
    pub financial_status: Option<String>,
    pub created_at: String,
    pub email: Option<String>,
    pub line_items: Vec<ShopifyLineItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShopifyLineItem {
    pub product_id: Option<i64>,
    pub variant_id: Option<i64>,
    pub title: String,
    pub quantity: i64,
    pub price: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InventoryPayload {
    pub inventory_levels: Vec<ShopifyInventoryLevel>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShopifyInventoryLevel {
    pub variant_id: i64,
    pub location_id: i64,
    pub available: i64,
}

pub fn parse_products(bytes: &[u8]) -> CoreResult<ProductsPayload> {
    serde_json::from_slice(bytes).map_err(CoreError::schema)
}

pub fn parse_orders(bytes: &[u8]) -> CoreResult<OrdersPayload> {
    serde_json::from_slice(bytes).map_err(CoreError::schema)
}

pub fn parse_inventory(bytes: &[u8]) -> CoreResult<InventoryPayload> {
    serde_json::from_slice(bytes).map_err(CoreError::schema)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> ShopifyAdapter {
        ShopifyAdapter::new(ShopifyCredentials {
            api_key: "key123".into(),
            api_secret: "supersecret".into(),
            scopes: vec!["read_products".into(), "read_orders".into()],
            app_base_url: "https://app.example".into(),
        })
    }

    #[test]
    fn auth_url_carries_client_id_scopes_and_state() {
        let (url, state) = adapter().build_auth_url("s.myshopify.com", "u@t.io");
        assert!(url.starts_with("https://s.myshopify.com/admin/oauth/authorize?"));
        assert!(url.contains("client_id=key123"));
        assert!(url.contains("scope=read_products,read_orders"));
        assert!(url.contains("redirect_uri=https://app.example/callback"));
        assert!(url.contains(&format!("state={state}")));
    }

    #[test]
    fn carry_state_round_trips() {
        let state = encode_state("u@t.io");
        assert_eq!(decode_state(&state).as_deref(), Some("u@t.io"));
    }

    #[test]
    fn carry_state_rejects_garbage() {
        assert_eq!(decode_state("no-separator"), None);
        assert_eq!(decode_state("nonce:!!!not-base64!!!"), None);
    }

    #[test]
    fn webhook_signature_round_trips() {
        let body = br#"{"id":42,"title":"Mate Imperial"}"#;
        let sig = sign_webhook("shhh", body);
        assert!(verify_webhook("shhh", body, &sig));
    }

    #[test]
    fn webhook_signature_fails_on_one_bit_perturbation() {
        let body = br#"{"id":42,"title":"Mate Imperial"}"#.to_vec();
        let sig = sign_webhook("shhh", &body);

        let mut tampered = body.clone();
        tampered[0] ^= 0x01;
        assert!(!verify_webhook("shhh", &tampered, &sig));

        let mut sig_bytes = sig.clone().into_bytes();
        sig_bytes[0] ^= 0x01;
        let tampered_sig = String::from_utf8(sig_bytes).unwrap();
        assert!(!verify_webhook("shhh", &body, &tampered_sig));
    }

    #[test]
    fn webhook_signature_fails_on_wrong_secret() {
        let body = b"payload";
        let sig = sign_webhook("secret-a", body);
        assert!(!verify_webhook("secret-b", body, &sig));
    }

    #[test]
    fn products_payload_parses_declared_schema() {
        let raw = r#"{
            "products": [{
                "id": 1001,
                "title": "Yerba 1kg",
                "vendor": "La Merced",
                "tags": "yerba, organico",
                "variants": [
                    {"id": 2001, "title": "Default", "sku": "Y-1", "price": "12.50",
                     "cost_per_item": "7.00", "inventory_quantity": 30}
                ]
            }]
        }"#;
        let parsed = parse_products(raw.as_bytes()).expect("parse");
        assert_eq!(parsed.products.len(), 1);
        assert_eq!(parsed.products[0].variants[0].inventory_quantity, 30);
    }

    #[test]
    fn unknown_fields_are_rejected_up_front() {
        let raw = r#"{"products": [], "surprise": true}"#;
        let err = parse_products(raw.as_bytes()).unwrap_err();
        assert_eq!(err.code(), "source_schema");
    }

    #[test]
    fn missing_required_fields_are_rejected() {
        let raw = r#"{"orders": [{"id": 5}]}"#;
        let err = parse_orders(raw.as_bytes()).unwrap_err();
        assert_eq!(err.code(), "source_schema");
    }
}
