//! Commerce normalizers: parse the declared Shopify payload schemas and
//! upsert by `(tenant, external_id)`. Planning is pure; only the apply
//! step touches the database.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use pulso_adapters::shopify::{
    self, InventoryPayload, OrdersPayload, ProductsPayload, ShopifyProduct,
};
use pulso_core::feed::FeedEvent;
use pulso_core::model::{OrderLineItem, ProductVariant};
use pulso_core::{CoreError, CoreResult};
use pulso_storage::map_db_err;

use crate::normalize::NormalizeOutcome;

#[derive(Debug, Clone, PartialEq)]
pub struct ProductUpsert {
    pub external_id: String,
    pub title: String,
    pub vendor: Option<String>,
    pub variants: Vec<ProductVariant>,
    pub unit_cost: Option<f64>,
    pub price: Option<f64>,
    pub inventory_quantity: i64,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderUpsert {
    pub external_id: String,
    pub ordinal: i64,
    pub total: f64,
    pub currency: Option<String>,
    pub status: String,
    pub line_items: Vec<OrderLineItem>,
    pub customer_email: Option<String>,
    pub order_date: DateTime<Utc>,
}

fn parse_money(raw: &Option<String>, field: &str) -> CoreResult<Option<f64>> {
    match raw {
        None => Ok(None),
        Some(s) => s
            .parse::<f64>()
            .map(Some)
            .map_err(|_| CoreError::schema(format!("{field} is not a decimal: {s:?}"))),
    }
}

fn split_tags(raw: &Option<String>) -> Vec<String> {
    raw.as_deref()
        .unwrap_or_default()
        .split(',')
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

pub fn plan_product(product: &ShopifyProduct) -> CoreResult<ProductUpsert> {
    let mut variants = Vec::with_capacity(product.variants.len());
    for variant in &product.variants {
        variants.push(ProductVariant {
            external_id: variant.id.to_string(),
            title: variant.title.clone(),
            sku: variant.sku.clone(),
            price: parse_money(&variant.price, "variant price")?,
            unit_cost: parse_money(&variant.cost_per_item, "variant cost")?,
            inventory_quantity: variant.inventory_quantity,
        });
    }

    // Product-level quantity is the sum of the variants' quantities at
    // upsert time; price and cost fall back to the first variant.
    let inventory_quantity = variants.iter().map(|v| v.inventory_quantity).sum();
    let price = variants.iter().find_map(|v| v.price);
    let unit_cost = variants.iter().find_map(|v| v.unit_cost);

    Ok(ProductUpsert {
        external_id: product.id.to_string(),
        title: product.title.clone(),
        vendor: product.vendor.clone(),
        variants,
        unit_cost,
        price,
        inventory_quantity,
        tags: split_tags(&product.tags),
    })
}

pub fn plan_products(payload: &ProductsPayload) -> CoreResult<Vec<ProductUpsert>> {
    payload.products.iter().map(plan_product).collect()
}

pub fn plan_orders(payload: &OrdersPayload) -> CoreResult<Vec<OrderUpsert>> {
    payload
        .orders
        .iter()
        .map(|order| {
            let order_date = DateTime::parse_from_rfc3339(&order.created_at)
                .map_err(|_| {
                    CoreError::schema(format!("order created_at is not RFC3339: {:?}", order.created_at))
                })?
                .with_timezone(&Utc);
            let total = order
                .total_price
                .parse::<f64>()
                .map_err(|_| CoreError::schema(format!("order total is not a decimal: {:?}", order.total_price)))?;

            Ok(OrderUpsert {
                external_id: order.id.to_string(),
                ordinal: order.order_number,
                total,
                currency: order.currency.clone(),
                status: order
                    .financial_status
                    .clone()
                    .unwrap_or_else(|| "pending".to_string()),
                line_items: order
                    .line_items
                    .iter()
                    .map(|item| {
                        Ok(OrderLineItem {
                            product_external_id: item.product_id.map(|id| id.to_string()),
                            variant_external_id: item.variant_id.map(|id| id.to_string()),
                            title: item.title.clone(),
                            quantity: item.quantity,
                            price: item.price.parse::<f64>().map_err(|_| {
                                CoreError::schema(format!(
                                    "line item price is not a decimal: {:?}",
                                    item.price
                                ))
                            })?,
                        })
                    })
                    .collect::<CoreResult<Vec<_>>>()?,
                customer_email: order.email.clone(),
                order_date,
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Apply
// ---------------------------------------------------------------------------

pub async fn normalize_products(
    pool: &PgPool,
    tenant_id: Uuid,
    source_ref_id: Uuid,
    bytes: &[u8],
) -> CoreResult<NormalizeOutcome> {
    // Parse the whole batch before the first write: a structural mismatch
    // rejects the payload with no partial upsert.
    let payload = shopify::parse_products(bytes)?;
    let plans = plan_products(&payload)?;

    let mut outcome = NormalizeOutcome::default();
    for plan in &plans {
        let variants = serde_json::to_value(&plan.variants).map_err(CoreError::schema)?;
        sqlx::query(
            r#"
            INSERT INTO products (id, tenant_id, external_id, title, vendor, variants,
                                  unit_cost, price, inventory_quantity, tags,
                                  source_ref_id, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, NOW(), NOW())
            ON CONFLICT (tenant_id, external_id) DO UPDATE SET
                   title = EXCLUDED.title,
                   vendor = EXCLUDED.vendor,
                   variants = EXCLUDED.variants,
                   unit_cost = EXCLUDED.unit_cost,
                   price = EXCLUDED.price,
                   inventory_quantity = EXCLUDED.inventory_quantity,
                   tags = EXCLUDED.tags,
                   source_ref_id = EXCLUDED.source_ref_id,
                   updated_at = NOW()
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(tenant_id)
        .bind(&plan.external_id)
        .bind(&plan.title)
        .bind(&plan.vendor)
        .bind(variants)
        .bind(plan.unit_cost)
        .bind(plan.price)
        .bind(plan.inventory_quantity)
        .bind(&plan.tags)
        .bind(source_ref_id)
        .execute(pool)
        .await
        .map_err(map_db_err)?;
        outcome.processed += 1;
    }

    outcome.affected_tenants.push(tenant_id);
    Ok(outcome)
}

pub async fn normalize_orders(
    pool: &PgPool,
    tenant_id: Uuid,
    source_ref_id: Uuid,
    bytes: &[u8],
) -> CoreResult<NormalizeOutcome> {
    let payload = shopify::parse_orders(bytes)?;
    let plans = plan_orders(&payload)?;

    let mut outcome = NormalizeOutcome::default();
    for plan in &plans {
        let existing = sqlx::query(
            "SELECT id FROM orders WHERE tenant_id = $1 AND external_id = $2",
        )
        .bind(tenant_id)
        .bind(&plan.external_id)
        .fetch_optional(pool)
        .await
        .map_err(map_db_err)?;
        let is_new = existing.is_none();
        let order_id = existing
            .map(|row| row.try_get::<Uuid, _>("id").map_err(map_db_err))
            .transpose()?
            .unwrap_or_else(Uuid::new_v4);

        let line_items: Value = serde_json::to_value(&plan.line_items).map_err(CoreError::schema)?;
        sqlx::query(
            r#"
            INSERT INTO orders (id, tenant_id, external_id, ordinal, total, currency,
                                status, line_items, customer_email, order_date, source_ref_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (tenant_id, external_id) DO UPDATE SET
                   ordinal = EXCLUDED.ordinal,
                   total = EXCLUDED.total,
                   currency = EXCLUDED.currency,
                   status = EXCLUDED.status,
                   line_items = EXCLUDED.line_items,
                   customer_email = EXCLUDED.customer_email,
                   order_date = EXCLUDED.order_date,
                   source_ref_id = EXCLUDED.source_ref_id
            "#,
        )
        .bind(order_id)
        .bind(tenant_id)
        .bind(&plan.external_id)
        .bind(plan.ordinal)
        .bind(plan.total)
        .bind(&plan.currency)
        .bind(&plan.status)
        .bind(line_items)
        .bind(&plan.customer_email)
        .bind(plan.order_date)
        .bind(source_ref_id)
        .execute(pool)
        .await
        .map_err(map_db_err)?;
        outcome.processed += 1;

        if is_new {
            outcome.events.push(FeedEvent::OrderCreated {
                tenant_id,
                order_id,
                ordinal: plan.ordinal,
                total: plan.total,
                source_ref_id,
            });
        }
    }

    outcome.affected_tenants.push(tenant_id);
    Ok(outcome)
}

pub async fn normalize_inventory(
    pool: &PgPool,
    tenant_id: Uuid,
    source_ref_id: Uuid,
    bytes: &[u8],
) -> CoreResult<NormalizeOutcome> {
    let payload: InventoryPayload = shopify::parse_inventory(bytes)?;

    let mut outcome = NormalizeOutcome::default();
    for level in &payload.inventory_levels {
        sqlx::query(
            r#"
            INSERT INTO inventory_levels (id, tenant_id, variant_external_id,
                                          location_external_id, quantity, source_ref_id)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (tenant_id, variant_external_id, location_external_id) DO UPDATE SET
                   quantity = EXCLUDED.quantity,
                   source_ref_id = EXCLUDED.source_ref_id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(tenant_id)
        .bind(level.variant_id.to_string())
        .bind(level.location_id.to_string())
        .bind(level.available)
        .bind(source_ref_id)
        .execute(pool)
        .await
        .map_err(map_db_err)?;
        outcome.processed += 1;
    }

    outcome.affected_tenants.push(tenant_id);
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulso_adapters::shopify::{parse_orders, parse_products};

    const PRODUCTS_FIXTURE: &str = r#"{
        "products": [{
            "id": 1001,
            "title": "Yerba 1kg",
            "vendor": "La Merced",
            "tags": "yerba, organico",
            "variants": [
                {"id": 2001, "title": "Suave", "sku": "Y-1", "price": "12.50",
                 "cost_per_item": "7.00", "inventory_quantity": 30},
                {"id": 2002, "title": "Intensa", "sku": "Y-2", "price": "13.00",
                 "cost_per_item": null, "inventory_quantity": 12}
            ]
        }]
    }"#;

    #[test]
    fn product_quantity_is_sum_of_variants() {
        let payload = parse_products(PRODUCTS_FIXTURE.as_bytes()).unwrap();
        let plan = plan_product(&payload.products[0]).unwrap();
        assert_eq!(plan.inventory_quantity, 42);
        assert_eq!(plan.price, Some(12.50));
        assert_eq!(plan.unit_cost, Some(7.00));
        assert_eq!(plan.tags, vec!["yerba", "organico"]);
    }

    #[test]
    fn planning_is_deterministic() {
        let payload = parse_products(PRODUCTS_FIXTURE.as_bytes()).unwrap();
        assert_eq!(
            plan_products(&payload).unwrap(),
            plan_products(&payload).unwrap()
        );
    }

    #[test]
    fn order_plan_parses_totals_and_line_items() {
        let raw = r#"{
            "orders": [{
                "id": 9001,
                "order_number": 1044,
                "total_price": "55.40",
                "currency": "ARS",
                "financial_status": "paid",
                "created_at": "2026-05-02T13:45:00Z",
                "email": "cliente@example.com",
                "line_items": [
                    {"product_id": 1001, "variant_id": 2001, "title": "Yerba 1kg",
                     "quantity": 2, "price": "12.50"}
                ]
            }]
        }"#;
        let plans = plan_orders(&parse_orders(raw.as_bytes()).unwrap()).unwrap();
        assert_eq!(plans[0].ordinal, 1044);
        assert_eq!(plans[0].total, 55.40);
        assert_eq!(
            plans[0].line_items[0].product_external_id.as_deref(),
            Some("1001")
        );
    }

    #[test]
    fn malformed_money_is_a_schema_error() {
        let raw = r#"{
            "orders": [{
                "id": 1, "order_number": 2, "total_price": "not-money",
                "currency": null, "financial_status": null,
                "created_at": "2026-05-02T13:45:00Z", "email": null, "line_items": []
            }]
        }"#;
        let err = plan_orders(&parse_orders(raw.as_bytes()).unwrap()).unwrap_err();
        assert_eq!(err.code(), "source_schema");
    }

    #[test]
    fn malformed_timestamp_is_a_schema_error() {
        let raw = r#"{
            "orders": [{
                "id": 1, "order_number": 2, "total_price": "9.99",
                "currency": null, "financial_status": null,
                "created_at": "yesterday", "email": null, "line_items": []
            }]
        }"#;
        let err = plan_orders(&parse_orders(raw.as_bytes()).unwrap()).unwrap_err();
        assert_eq!(err.code(), "source_schema");
    }
}
