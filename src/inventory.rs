//! Inventory deduction engine.
//!
//! Resolves the ingredient/recipe graph for an order's lines into a demand
//! map of base-unit quantities, then walks the map against the stock ledger:
//! decrement (negative stock allowed, warned) and append an audit row.
//! Unresolvable products, recipes or inventory rows are skipped with a
//! warning — partial deduction is always preferred over blocking an order.
//!
//! Runs at most once per order (`stock_deducted`): after a direct
//! insert-as-completed, and as the sync engine's fallback for offline orders
//! inserted post-completion. Ordinary update-to-completed transitions are
//! deducted by the remote store's own trigger and not repeated here.

use chrono::Utc;
use std::collections::HashMap;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::{CatalogProduct, Order, OrderLine, RecipeLine, StockLedgerEntry};
use crate::units::to_base_unit;
use crate::CacheContext;

// ---------------------------------------------------------------------------
// Demand resolution
// ---------------------------------------------------------------------------

/// Build `inventory_item_id -> quantity in base unit` for an order's lines.
///
/// Per line: the variant recipe when a variant is referenced (base recipe as
/// fallback), the base recipe otherwise. Deal lines resolve each embedded
/// component by catalog name/variant-name match, multiplied by component
/// quantity and line quantity.
pub fn build_demand_map(
    catalog: &[CatalogProduct],
    lines: &[OrderLine],
) -> HashMap<String, f64> {
    let mut demand: HashMap<String, f64> = HashMap::new();

    for line in lines {
        if let Some(bundle) = &line.bundle {
            for component in &bundle.components {
                let Some(product) = catalog
                    .iter()
                    .find(|p| p.name.eq_ignore_ascii_case(&component.name))
                else {
                    warn!(
                        component = %component.name,
                        "Deal component not in catalog; skipping deduction"
                    );
                    continue;
                };

                let recipe = match component.variant.as_deref() {
                    Some(variant_name) => product
                        .variants
                        .iter()
                        .find(|v| v.name.eq_ignore_ascii_case(variant_name))
                        .map(|v| v.recipe.as_slice())
                        .filter(|r| !r.is_empty())
                        .or_else(|| non_empty(&product.recipe)),
                    None => non_empty(&product.recipe),
                };
                let Some(recipe) = recipe else {
                    warn!(
                        component = %component.name,
                        "No recipe for deal component; skipping deduction"
                    );
                    continue;
                };

                accumulate(&mut demand, recipe, component.quantity * line.quantity);
            }
            continue;
        }

        let Some(product_id) = line.product_id.as_deref() else {
            warn!(line = %line.name, "Order line has no product reference; skipping deduction");
            continue;
        };
        let Some(product) = catalog.iter().find(|p| p.id == product_id) else {
            warn!(product_id, "Product not in catalog; skipping deduction");
            continue;
        };

        let recipe = line
            .variant_id
            .as_deref()
            .and_then(|variant_id| product.variants.iter().find(|v| v.id == variant_id))
            .map(|v| v.recipe.as_slice())
            .filter(|r| !r.is_empty())
            .or_else(|| non_empty(&product.recipe));
        let Some(recipe) = recipe else {
            warn!(product_id, "No recipe for product; skipping deduction");
            continue;
        };

        accumulate(&mut demand, recipe, line.quantity);
    }

    demand
}

fn non_empty(recipe: &[RecipeLine]) -> Option<&[RecipeLine]> {
    if recipe.is_empty() {
        None
    } else {
        Some(recipe)
    }
}

fn accumulate(demand: &mut HashMap<String, f64>, recipe: &[RecipeLine], multiplier: f64) {
    for ingredient in recipe {
        let base_quantity = to_base_unit(ingredient.quantity, &ingredient.unit);
        *demand
            .entry(ingredient.inventory_item_id.clone())
            .or_insert(0.0) += base_quantity * multiplier;
    }
}

// ---------------------------------------------------------------------------
// Deduction
// ---------------------------------------------------------------------------

/// Deduct stock for a completed order. Idempotent per order; returns the
/// number of inventory items actually deducted.
pub async fn deduct_for_order(ctx: &CacheContext, order: &Order) -> Result<usize, String> {
    if order.stock_deducted {
        return Ok(0);
    }

    let catalog = ctx.store.catalog();
    let demand = build_demand_map(&catalog, &order.lines);
    let mut applied = 0usize;

    for (item_id, quantity) in demand {
        let cached = ctx.store.get_inventory_item(&item_id);
        let item = match cached {
            Some(item) => Some(item),
            None => match ctx.remote.fetch_inventory_item(&item_id).await {
                Ok(item) => item,
                Err(e) => {
                    warn!(item_id = %item_id, error = %e, "Inventory fetch failed; skipping deduction");
                    None
                }
            },
        };
        let Some(mut item) = item else {
            warn!(item_id = %item_id, "Inventory row missing; skipping deduction");
            continue;
        };

        let stock_before = item.current_stock;
        let stock_after = stock_before - quantity;
        if stock_after < 0.0 {
            warn!(
                item = %item.name,
                stock_after,
                "Stock went negative after deduction"
            );
        }

        if let Err(e) = ctx.remote.update_inventory_stock(&item_id, stock_after).await {
            warn!(item_id = %item_id, error = %e, "Stock update failed; skipping item");
            continue;
        }

        let ledger_entry = StockLedgerEntry {
            id: Uuid::new_v4().to_string(),
            inventory_item_id: item_id.clone(),
            order_number: Some(order.order_number.clone()),
            delta: -quantity,
            stock_before,
            stock_after,
            reason: "order_deduction".to_string(),
            created_at: Utc::now(),
        };
        if let Err(e) = ctx.remote.insert_stock_ledger(&ledger_entry).await {
            warn!(item_id = %item_id, error = %e, "Stock ledger append failed");
        }

        item.current_stock = stock_after;
        item.updated_at = Utc::now();
        ctx.store.upsert_inventory_item(item);
        applied += 1;
    }

    ctx.store.set_stock_deducted(&order.local_id);
    info!(
        order_number = %order.order_number,
        applied,
        "Inventory deduction applied"
    );
    Ok(applied)
}

// ---------------------------------------------------------------------------
// Cache refresh
// ---------------------------------------------------------------------------

/// Pull the product catalog into the local cache.
pub async fn refresh_catalog(ctx: &CacheContext) -> Result<usize, String> {
    let products = ctx.remote.fetch_catalog().await?;
    let count = products.len();
    ctx.store.replace_catalog(products);
    info!(count, "Catalog cache refreshed");
    Ok(count)
}

/// Pull the inventory snapshot into the local cache.
pub async fn refresh_inventory(ctx: &CacheContext) -> Result<usize, String> {
    let items = ctx.remote.fetch_inventory().await?;
    let count = items.len();
    ctx.store.replace_inventory(items);
    info!(count, "Inventory cache refreshed");
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        DealBundle, DealComponent, InventoryItem, OrderStatus, ProductVariant,
    };
    use crate::orders::{create_order, NewOrderData};
    use crate::testutil::test_context;

    fn catalog_fixture() -> Vec<CatalogProduct> {
        vec![
            CatalogProduct {
                id: "prod-espresso".into(),
                name: "Espresso".into(),
                recipe: vec![RecipeLine {
                    inventory_item_id: "inv-beans".into(),
                    quantity: 18.0,
                    unit: "g".into(),
                }],
                variants: vec![ProductVariant {
                    id: "var-double".into(),
                    name: "Double".into(),
                    recipe: vec![RecipeLine {
                        inventory_item_id: "inv-beans".into(),
                        quantity: 36.0,
                        unit: "g".into(),
                    }],
                }],
            },
            CatalogProduct {
                id: "prod-latte".into(),
                name: "Latte".into(),
                recipe: vec![
                    RecipeLine {
                        inventory_item_id: "inv-beans".into(),
                        quantity: 18.0,
                        unit: "g".into(),
                    },
                    RecipeLine {
                        inventory_item_id: "inv-milk".into(),
                        quantity: 200.0,
                        unit: "ml".into(),
                    },
                ],
                variants: vec![],
            },
        ]
    }

    fn inventory_fixture() -> Vec<InventoryItem> {
        vec![
            InventoryItem {
                id: "inv-beans".into(),
                name: "Coffee beans".into(),
                unit: "kg".into(),
                current_stock: 2.0,
                avg_unit_cost: 14.0,
                updated_at: Utc::now(),
            },
            InventoryItem {
                id: "inv-milk".into(),
                name: "Milk".into(),
                unit: "l".into(),
                current_stock: 0.1,
                avg_unit_cost: 1.2,
                updated_at: Utc::now(),
            },
        ]
    }

    fn product_line(product_id: &str, variant_id: Option<&str>, quantity: f64) -> OrderLine {
        OrderLine {
            product_id: Some(product_id.to_string()),
            variant_id: variant_id.map(|v| v.to_string()),
            name: product_id.to_string(),
            quantity,
            unit_price: 3.0,
            total_price: 3.0 * quantity,
            bundle: None,
            notes: None,
        }
    }

    #[test]
    fn test_demand_map_uses_variant_then_base_recipe() {
        let catalog = catalog_fixture();
        let lines = vec![
            product_line("prod-espresso", Some("var-double"), 2.0),
            product_line("prod-latte", None, 1.0),
        ];

        let demand = build_demand_map(&catalog, &lines);
        // 2 double espressos at 36g + 1 latte at 18g = 90g = 0.09kg
        assert!((demand["inv-beans"] - 0.09).abs() < 1e-9);
        // 200ml milk = 0.2l
        assert!((demand["inv-milk"] - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_demand_map_resolves_deal_components_by_name() {
        let catalog = catalog_fixture();
        let lines = vec![OrderLine {
            product_id: None,
            variant_id: None,
            name: "Breakfast deal".into(),
            quantity: 2.0,
            unit_price: 7.5,
            total_price: 15.0,
            bundle: Some(DealBundle {
                components: vec![
                    DealComponent {
                        name: "espresso".into(),
                        variant: Some("double".into()),
                        quantity: 1.0,
                    },
                    DealComponent {
                        name: "Latte".into(),
                        variant: None,
                        quantity: 2.0,
                    },
                ],
            }),
            notes: None,
        }];

        let demand = build_demand_map(&catalog, &lines);
        // deal x2: (1 double espresso 36g + 2 lattes 18g each) x2 = 144g
        assert!((demand["inv-beans"] - 0.144).abs() < 1e-9);
        // 2 lattes x 200ml x 2 deals = 0.8l
        assert!((demand["inv-milk"] - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_demand_map_skips_unresolvable_entries() {
        let catalog = catalog_fixture();
        let lines = vec![
            product_line("prod-unknown", None, 1.0),
            product_line("prod-espresso", None, 1.0),
        ];

        let demand = build_demand_map(&catalog, &lines);
        assert_eq!(demand.len(), 1);
        assert!((demand["inv-beans"] - 0.018).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_deduct_for_order_updates_stock_and_ledger() {
        let (ctx, remote) = test_context(true);
        ctx.store.replace_catalog(catalog_fixture());
        ctx.store.replace_inventory(inventory_fixture());
        {
            let mut state = remote.state.lock().unwrap();
            for item in inventory_fixture() {
                state.inventory.insert(item.id.clone(), item);
            }
        }

        let order = create_order(
            &ctx,
            NewOrderData {
                status: Some(OrderStatus::Completed),
                lines: vec![product_line("prod-latte", None, 1.0)],
                total_amount: 3.0,
                subtotal: 3.0,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        // Direct insert-as-completed runs the deduction once.
        let cached = ctx.store.get_order(&order.local_id).unwrap();
        assert!(cached.stock_deducted);

        let state = remote.state.lock().unwrap();
        assert!((state.inventory["inv-beans"].current_stock - 1.982).abs() < 1e-9);
        // Milk goes negative (0.1 - 0.2) and is still applied.
        assert!((state.inventory["inv-milk"].current_stock + 0.1).abs() < 1e-9);
        assert_eq!(state.stock_ledger.len(), 2);
        let beans_row = state
            .stock_ledger
            .iter()
            .find(|r| r.inventory_item_id == "inv-beans")
            .unwrap();
        assert!((beans_row.stock_before - 2.0).abs() < 1e-9);
        assert!((beans_row.stock_after - 1.982).abs() < 1e-9);
        assert_eq!(beans_row.order_number.as_deref(), Some(&order.order_number[..]));
    }

    #[tokio::test]
    async fn test_deduct_for_order_is_idempotent() {
        let (ctx, remote) = test_context(true);
        ctx.store.replace_catalog(catalog_fixture());
        ctx.store.replace_inventory(inventory_fixture());
        {
            let mut state = remote.state.lock().unwrap();
            for item in inventory_fixture() {
                state.inventory.insert(item.id.clone(), item);
            }
        }

        let order = create_order(
            &ctx,
            NewOrderData {
                status: Some(OrderStatus::Completed),
                lines: vec![product_line("prod-espresso", None, 1.0)],
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let ledger_rows = remote.state.lock().unwrap().stock_ledger.len();
        let cached = ctx.store.get_order(&order.local_id).unwrap();
        let applied = deduct_for_order(&ctx, &cached).await.unwrap();
        assert_eq!(applied, 0);
        assert_eq!(remote.state.lock().unwrap().stock_ledger.len(), ledger_rows);
    }

    #[tokio::test]
    async fn test_refresh_catalog_and_inventory() {
        let (ctx, remote) = test_context(true);
        {
            let mut state = remote.state.lock().unwrap();
            state.catalog = catalog_fixture();
            for item in inventory_fixture() {
                state.inventory.insert(item.id.clone(), item);
            }
        }

        assert_eq!(refresh_catalog(&ctx).await.unwrap(), 2);
        assert_eq!(refresh_inventory(&ctx).await.unwrap(), 2);
        assert_eq!(ctx.store.catalog().len(), 2);
        assert!(ctx.store.get_inventory_item("inv-milk").is_some());
    }
}
