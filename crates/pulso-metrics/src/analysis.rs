//! Commerce analysis: a pure function of the tenant's current raw state
//! plus tenant-supplied cost parameters, producing one recommendation per
//! module. The OR solvers that consume the prepared inputs live in the
//! frontend and are treated as black boxes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use pulso_core::model::{AnalysisModule, AnalysisSource, OrderLineItem};
use pulso_core::CoreResult;
use pulso_storage::map_db_err;

use crate::round4;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserCosts {
    pub ordering_cost: Option<f64>,
    pub holding_cost_pct: Option<f64>,
    pub fixed_costs: Option<f64>,
    pub opening_balance: Option<f64>,
    pub lead_time: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProductStat {
    pub name: String,
    pub price: Option<f64>,
    pub cost: Option<f64>,
    pub inventory_quantity: i64,
    pub units_sold: i64,
    pub revenue: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MonthlySales {
    pub year: i32,
    pub month: u32,
    pub total: f64,
}

#[derive(Debug, Clone, Default)]
pub struct AnalysisInputs {
    pub products: Vec<ProductStat>,
    pub monthly_sales: Vec<MonthlySales>,
    pub costs: UserCosts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModuleRecommendation {
    pub applicable: bool,
    pub priority: Priority,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub needs: Vec<String>,
    pub inputs: Option<Value>,
    pub insights: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MissingDatum {
    pub field: String,
    pub unblocks: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisBundle {
    pub modules: BTreeMap<String, ModuleRecommendation>,
    pub general_insights: String,
    pub recommendations: Vec<String>,
    pub missing_data: Vec<MissingDatum>,
}

/// Annual demand for the stock module's top-inventory product: prefer
/// observed sales annualised, fall back to `current_inventory × 4` as a
/// lower bound.
pub fn estimate_annual_demand(product: &ProductStat) -> f64 {
    if product.units_sold > 0 {
        (product.units_sold * 12) as f64
    } else {
        (product.inventory_quantity * 4) as f64
    }
}

pub fn build_bundle(
    inputs: &AnalysisInputs,
    requested: Option<&[AnalysisModule]>,
) -> AnalysisBundle {
    let wanted: Vec<AnalysisModule> = match requested {
        Some(modules) if !modules.is_empty() => modules.to_vec(),
        _ => AnalysisModule::all().to_vec(),
    };

    let mut modules = BTreeMap::new();
    for module in wanted {
        let rec = match module {
            AnalysisModule::Margin => margin_module(inputs),
            AnalysisModule::Stock => stock_module(inputs),
            AnalysisModule::Forecast => forecast_module(inputs),
            AnalysisModule::Cashflow => cashflow_module(inputs),
        };
        modules.insert(module.as_str().to_string(), rec);
    }

    AnalysisBundle {
        modules,
        general_insights: general_insights(inputs),
        recommendations: recommendations(inputs),
        missing_data: missing_data(inputs),
    }
}

fn margin_module(inputs: &AnalysisInputs) -> ModuleRecommendation {
    let priced: Vec<&ProductStat> = inputs.products.iter().filter(|p| p.price.is_some()).collect();
    if priced.is_empty() {
        return not_applicable(vec!["price".to_string()]);
    }

    let any_cost = priced.iter().any(|p| p.cost.is_some());
    let rows: Vec<Value> = priced
        .iter()
        .map(|p| {
            json!({
                "name": p.name,
                "price": p.price,
                "cost": p.cost,
                "volume": p.units_sold,
            })
        })
        .collect();

    let mut insights = Vec::new();
    if let Some(best) = priced
        .iter()
        .filter_map(|p| {
            let margin = p.price? - p.cost?;
            Some((p, margin))
        })
        .max_by(|a, b| a.1.total_cmp(&b.1))
    {
        insights.push(format!(
            "{} carries the widest unit margin at {:.2}",
            best.0.name, best.1
        ));
    } else {
        insights.push("Unit costs are unknown; margins assume price only".to_string());
    }

    ModuleRecommendation {
        applicable: true,
        priority: if any_cost { Priority::High } else { Priority::Medium },
        confidence: if any_cost { 0.9 } else { 0.5 },
        needs: if any_cost {
            Vec::new()
        } else {
            vec!["cost_per_item".to_string()]
        },
        inputs: Some(json!({
            "products": rows,
            "fixed_costs": inputs.costs.fixed_costs,
        })),
        insights,
    }
}

fn stock_module(inputs: &AnalysisInputs) -> ModuleRecommendation {
    if inputs.products.is_empty() {
        return not_applicable(vec!["products".to_string()]);
    }

    let mut needs = Vec::new();
    if inputs.costs.ordering_cost.is_none() {
        needs.push("ordering_cost".to_string());
    }
    if inputs.costs.holding_cost_pct.is_none() {
        needs.push("holding_cost_pct".to_string());
    }

    if !needs.is_empty() {
        return ModuleRecommendation {
            applicable: true,
            priority: Priority::Medium,
            confidence: 0.4,
            needs,
            inputs: None,
            insights: vec![
                "Provide ordering and holding costs to size optimal lots".to_string(),
            ],
        };
    }

    let top = inputs
        .products
        .iter()
        .max_by_key(|p| p.inventory_quantity)
        .expect("non-empty product list");
    let demand = estimate_annual_demand(top);
    let unit_cost = top.cost.or(top.price).unwrap_or(0.0);
    let holding = inputs.costs.holding_cost_pct.unwrap_or(0.0) * unit_cost;

    ModuleRecommendation {
        applicable: true,
        priority: Priority::High,
        confidence: if top.units_sold > 0 { 0.85 } else { 0.6 },
        needs: Vec::new(),
        inputs: Some(json!({
            "D": demand,
            "K": inputs.costs.ordering_cost,
            "h": round4(holding),
            "L": inputs.costs.lead_time,
            "product_name": top.name,
        })),
        insights: vec![format!(
            "Sizing replenishment for {} on an estimated annual demand of {}",
            top.name, demand
        )],
    }
}

fn forecast_module(inputs: &AnalysisInputs) -> ModuleRecommendation {
    let months = inputs.monthly_sales.len();
    if months < 3 {
        return ModuleRecommendation {
            applicable: false,
            priority: Priority::Low,
            confidence: 0.2,
            needs: vec!["order_history".to_string()],
            inputs: None,
            insights: vec![format!(
                "Only {months} calendar months of order data; three are needed to project demand"
            )],
        };
    }

    let series: Vec<Value> = inputs
        .monthly_sales
        .iter()
        .map(|m| json!({"year": m.year, "month": m.month, "total": m.total}))
        .collect();

    ModuleRecommendation {
        applicable: true,
        priority: if months >= 6 { Priority::High } else { Priority::Medium },
        confidence: (0.4 + 0.1 * months as f64).min(0.9),
        needs: Vec::new(),
        inputs: Some(json!({"monthly": series, "method": "auto"})),
        insights: vec![format!("{months} months of sales available for projection")],
    }
}

fn cashflow_module(inputs: &AnalysisInputs) -> ModuleRecommendation {
    if inputs.products.is_empty() {
        return not_applicable(vec!["products".to_string()]);
    }

    let months = inputs.monthly_sales.len().max(1);
    let total: f64 = inputs.monthly_sales.iter().map(|m| m.total).sum();
    let avg_inflow = round4(total / months as f64);

    ModuleRecommendation {
        applicable: true,
        priority: Priority::Medium,
        confidence: 0.6,
        needs: Vec::new(),
        inputs: Some(json!({
            "opening_balance": inputs.costs.opening_balance.unwrap_or(0.0),
            "periods": 6,
            "inflows": [avg_inflow],
            "outflows": [inputs.costs.fixed_costs.unwrap_or(0.0)],
        })),
        insights: vec![format!(
            "Projected monthly inflow of {avg_inflow:.2} from observed sales"
        )],
    }
}

fn not_applicable(needs: Vec<String>) -> ModuleRecommendation {
    ModuleRecommendation {
        applicable: false,
        priority: Priority::Low,
        confidence: 0.0,
        needs,
        inputs: None,
        insights: Vec::new(),
    }
}

fn general_insights(inputs: &AnalysisInputs) -> String {
    let catalog = inputs.products.len();
    let inventory_value: f64 = inputs
        .products
        .iter()
        .map(|p| p.inventory_quantity as f64 * p.price.unwrap_or(0.0))
        .sum();
    let units_sold: i64 = inputs.products.iter().map(|p| p.units_sold).sum();
    format!(
        "Catalogue of {catalog} products holding {:.2} in inventory value; {units_sold} units sold across the observed order history.",
        inventory_value
    )
}

fn recommendations(inputs: &AnalysisInputs) -> Vec<String> {
    let mut out = Vec::new();

    let out_of_stock: Vec<&str> = inputs
        .products
        .iter()
        .filter(|p| p.inventory_quantity == 0)
        .map(|p| p.name.as_str())
        .collect();
    if !out_of_stock.is_empty() {
        let named: Vec<&str> = out_of_stock.iter().take(3).copied().collect();
        out.push(format!(
            "{} products out of stock: {}",
            out_of_stock.len(),
            named.join(", ")
        ));
    }

    if inputs.products.iter().any(|p| p.cost.is_none()) {
        out.push("Add cost_per_item to your products to unlock margin analysis".to_string());
    }
    if inputs.costs.ordering_cost.is_none() {
        out.push("Provide your ordering cost to size optimal replenishment lots".to_string());
    }
    out
}

fn missing_data(inputs: &AnalysisInputs) -> Vec<MissingDatum> {
    let mut out = Vec::new();
    if inputs.products.iter().any(|p| p.cost.is_none()) {
        out.push(MissingDatum {
            field: "cost_per_item".to_string(),
            unblocks: vec!["MARGIN".to_string(), "STOCK".to_string()],
        });
    }
    if inputs.costs.ordering_cost.is_none() {
        out.push(MissingDatum {
            field: "ordering_cost".to_string(),
            unblocks: vec!["STOCK".to_string()],
        });
    }
    if inputs.costs.holding_cost_pct.is_none() {
        out.push(MissingDatum {
            field: "holding_cost_pct".to_string(),
            unblocks: vec!["STOCK".to_string()],
        });
    }
    if inputs.costs.fixed_costs.is_none() {
        out.push(MissingDatum {
            field: "fixed_costs".to_string(),
            unblocks: vec!["MARGIN".to_string(), "CASHFLOW".to_string()],
        });
    }
    out
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

/// Gather the current raw state for one tenant. Line items match products
/// by `product_id` external id only; variant ids are not consulted.
pub async fn gather_inputs(
    pool: &PgPool,
    tenant_id: Uuid,
    costs: UserCosts,
) -> CoreResult<AnalysisInputs> {
    let product_rows = sqlx::query(
        r#"
        SELECT external_id, title, price, unit_cost, inventory_quantity
          FROM products
         WHERE tenant_id = $1
         ORDER BY title
        "#,
    )
    .bind(tenant_id)
    .fetch_all(pool)
    .await
    .map_err(map_db_err)?;

    let mut products: Vec<(String, ProductStat)> = Vec::with_capacity(product_rows.len());
    for row in product_rows {
        let external_id: String = row.try_get("external_id").map_err(map_db_err)?;
        products.push((
            external_id,
            ProductStat {
                name: row.try_get("title").map_err(map_db_err)?,
                price: row.try_get("price").map_err(map_db_err)?,
                cost: row.try_get("unit_cost").map_err(map_db_err)?,
                inventory_quantity: row.try_get("inventory_quantity").map_err(map_db_err)?,
                units_sold: 0,
                revenue: 0.0,
            },
        ));
    }

    let order_rows = sqlx::query(
        r#"
        SELECT line_items, order_date, total
          FROM orders
         WHERE tenant_id = $1
         ORDER BY order_date
        "#,
    )
    .bind(tenant_id)
    .fetch_all(pool)
    .await
    .map_err(map_db_err)?;

    let mut monthly: BTreeMap<(i32, u32), f64> = BTreeMap::new();
    for row in order_rows {
        let line_items: Value = row.try_get("line_items").map_err(map_db_err)?;
        let order_date: chrono::DateTime<chrono::Utc> =
            row.try_get("order_date").map_err(map_db_err)?;
        let total: f64 = row.try_get("total").map_err(map_db_err)?;

        use chrono::Datelike;
        *monthly
            .entry((order_date.year(), order_date.month()))
            .or_default() += total;

        let items: Vec<OrderLineItem> =
            serde_json::from_value(line_items).unwrap_or_default();
        for item in items {
            let Some(product_external_id) = item.product_external_id else {
                continue;
            };
            if let Some((_, stat)) = products
                .iter_mut()
                .find(|(ext, _)| *ext == product_external_id)
            {
                stat.units_sold += item.quantity;
                stat.revenue += item.price * item.quantity as f64;
            }
        }
    }

    Ok(AnalysisInputs {
        products: products.into_iter().map(|(_, stat)| stat).collect(),
        monthly_sales: monthly
            .into_iter()
            .map(|((year, month), total)| MonthlySales {
                year,
                month,
                total: round4(total),
            })
            .collect(),
        costs,
    })
}

/// One `Analysis` row per applicable module, tagged `shopify_auto` so the
/// frontend can replay a recent run.
pub async fn persist_bundle(
    pool: &PgPool,
    tenant_id: Uuid,
    bundle: &AnalysisBundle,
) -> CoreResult<usize> {
    let mut inserted = 0usize;
    for (module, rec) in &bundle.modules {
        if !rec.applicable {
            continue;
        }
        sqlx::query(
            r#"
            INSERT INTO analyses (id, tenant_id, module, input_snapshot, output_snapshot,
                                  insight, source, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(tenant_id)
        .bind(module)
        .bind(rec.inputs.clone().unwrap_or(Value::Null))
        .bind(serde_json::to_value(rec).unwrap_or(Value::Null))
        .bind(rec.insights.first().cloned())
        .bind(AnalysisSource::ShopifyAuto.as_str())
        .execute(pool)
        .await
        .map_err(map_db_err)?;
        inserted += 1;
    }
    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn product(name: &str, price: Option<f64>, cost: Option<f64>, qty: i64, sold: i64) -> ProductStat {
        ProductStat {
            name: name.to_string(),
            price,
            cost,
            inventory_quantity: qty,
            units_sold: sold,
            revenue: sold as f64 * price.unwrap_or(0.0),
        }
    }

    fn months(n: usize) -> Vec<MonthlySales> {
        (0..n)
            .map(|i| MonthlySales {
                year: 2026,
                month: (i + 1) as u32,
                total: 100.0 + i as f64,
            })
            .collect()
    }

    #[test]
    fn demand_prefers_observed_sales() {
        let sold = product("Mate", Some(10.0), None, 40, 7);
        assert_eq!(estimate_annual_demand(&sold), 84.0);
        let unsold = product("Bombilla", Some(5.0), None, 25, 0);
        assert_eq!(estimate_annual_demand(&unsold), 100.0);
    }

    #[test]
    fn missing_cost_scenario_downgrades_margin_and_stock() {
        // Three priced products, none with a unit cost, no ordering cost.
        let inputs = AnalysisInputs {
            products: vec![
                product("A", Some(10.0), None, 5, 2),
                product("B", Some(20.0), None, 3, 0),
                product("C", Some(30.0), None, 0, 1),
            ],
            monthly_sales: months(1),
            costs: UserCosts::default(),
        };
        let bundle = build_bundle(&inputs, None);

        let margin = &bundle.modules["MARGIN"];
        assert!(margin.applicable);
        assert_eq!(margin.priority, Priority::Medium);

        let stock = &bundle.modules["STOCK"];
        assert!(stock.applicable);
        assert_eq!(stock.priority, Priority::Medium);
        assert_eq!(stock.needs, vec!["ordering_cost", "holding_cost_pct"]);
        assert!(stock.inputs.is_none());

        let fields: Vec<&str> = bundle.missing_data.iter().map(|m| m.field.as_str()).collect();
        assert!(fields.contains(&"cost_per_item"));
        assert!(fields.contains(&"ordering_cost"));
    }

    #[test]
    fn stock_inputs_use_top_inventory_product() {
        let inputs = AnalysisInputs {
            products: vec![
                product("Small", Some(10.0), Some(6.0), 5, 3),
                product("Big", Some(8.0), Some(4.0), 50, 10),
            ],
            monthly_sales: months(4),
            costs: UserCosts {
                ordering_cost: Some(120.0),
                holding_cost_pct: Some(0.25),
                lead_time: Some(0.05),
                ..Default::default()
            },
        };
        let bundle = build_bundle(&inputs, None);
        let stock = &bundle.modules["STOCK"];
        assert_eq!(stock.priority, Priority::High);
        let prepared = stock.inputs.as_ref().unwrap();
        assert_eq!(prepared["product_name"], "Big");
        assert_eq!(prepared["D"], 120.0);
        assert_eq!(prepared["h"], 1.0);
    }

    #[test]
    fn forecast_needs_three_months() {
        let base = AnalysisInputs {
            products: vec![product("A", Some(10.0), None, 5, 2)],
            monthly_sales: months(2),
            costs: UserCosts::default(),
        };
        let bundle = build_bundle(&base, None);
        assert!(!bundle.modules["FORECAST"].applicable);
        assert_eq!(bundle.modules["FORECAST"].priority, Priority::Low);

        let enough = AnalysisInputs {
            monthly_sales: months(3),
            ..base
        };
        let bundle = build_bundle(&enough, None);
        assert!(bundle.modules["FORECAST"].applicable);
    }

    #[test]
    fn cashflow_projects_average_inflow() {
        let inputs = AnalysisInputs {
            products: vec![product("A", Some(10.0), None, 5, 2)],
            monthly_sales: vec![
                MonthlySales { year: 2026, month: 1, total: 100.0 },
                MonthlySales { year: 2026, month: 2, total: 300.0 },
            ],
            costs: UserCosts {
                opening_balance: Some(1000.0),
                fixed_costs: Some(50.0),
                ..Default::default()
            },
        };
        let bundle = build_bundle(&inputs, None);
        let cashflow = bundle.modules["CASHFLOW"].inputs.as_ref().unwrap();
        assert_eq!(cashflow["opening_balance"], 1000.0);
        assert_eq!(cashflow["periods"], 6);
        assert_eq!(cashflow["inflows"][0], 200.0);
        assert_eq!(cashflow["outflows"][0], 50.0);
    }

    #[test]
    fn out_of_stock_products_are_named() {
        let inputs = AnalysisInputs {
            products: vec![
                product("A", Some(10.0), Some(5.0), 0, 2),
                product("B", Some(20.0), Some(9.0), 0, 0),
                product("C", Some(30.0), Some(12.0), 4, 1),
            ],
            monthly_sales: months(3),
            costs: UserCosts::default(),
        };
        let recs = recommendations(&inputs);
        assert!(recs.iter().any(|r| r == "2 products out of stock: A, B"));
    }

    #[test]
    fn requested_module_subset_is_honoured() {
        let inputs = AnalysisInputs {
            products: vec![product("A", Some(10.0), None, 5, 2)],
            monthly_sales: months(3),
            costs: UserCosts::default(),
        };
        let bundle = build_bundle(&inputs, Some(&[AnalysisModule::Margin]));
        assert_eq!(bundle.modules.len(), 1);
        assert!(bundle.modules.contains_key("MARGIN"));
    }

    #[test]
    fn empty_catalogue_disables_commerce_modules() {
        let bundle = build_bundle(&AnalysisInputs::default(), None);
        assert!(!bundle.modules["MARGIN"].applicable);
        assert!(!bundle.modules["STOCK"].applicable);
        assert!(!bundle.modules["CASHFLOW"].applicable);
    }
}
