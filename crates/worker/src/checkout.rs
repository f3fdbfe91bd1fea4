//! Checkout workflow hosted by the worker binary.
//!
//! `create-cart` -> `validate-sales-channel` -> `authorize-payment` -> `create-order`
//!
//! `authorize-payment` parks the transaction until the payment provider
//! reports back through the step signal endpoints.

use orchestrator::{
    Result, RetryPolicy, StepDefinition, StepError, StepInput, StepResponse, WorkflowRegistry,
};
use serde::Deserialize;
use serde_json::json;

pub const CHECKOUT_WORKFLOW: &str = "checkout";

#[derive(Debug, Deserialize)]
struct SalesChannel {
    sales_channel_id: Option<String>,
}

fn create_cart() -> StepDefinition {
    StepDefinition::new("create-cart", |input, ctx| async move {
        let cart_id = format!("cart_{}", ctx.transaction_id);
        tracing::info!(%cart_id, "cart created");
        Ok(StepResponse::new(json!({
            "cart_id": cart_id,
            "items": input.get("items").cloned().unwrap_or_else(|| json!([])),
        }))
        .with_compensation(json!({ "cart_id": cart_id })))
    })
    .with_compensation(|input, _ctx| async move {
        tracing::info!(cart_id = %input["cart_id"], "cart released");
        Ok(())
    })
}

fn validate_sales_channel() -> StepDefinition {
    StepDefinition::typed("validate-sales-channel", |input: SalesChannel, _ctx| async move {
        match input.sales_channel_id {
            Some(id) if !id.trim().is_empty() => Ok(StepResponse::new(json!({ "sales_channel_id": id }))),
            _ => Err(StepError::permanent("sales channel is required")),
        }
    })
}

fn authorize_payment() -> StepDefinition {
    StepDefinition::new("authorize-payment", |_input, ctx| async move {
        tracing::info!(transaction_id = %ctx.transaction_id, "awaiting payment authorization");
        Ok(StepResponse::pending())
    })
    .with_compensation(|input, _ctx| async move {
        tracing::info!(authorization = %input, "payment authorization voided");
        Ok(())
    })
}

fn create_order() -> StepDefinition {
    StepDefinition::new("create-order", |input, ctx| async move {
        let order_id = format!("order_{}", ctx.transaction_id);
        Ok(StepResponse::new(json!({
            "order_id": order_id,
            "cart_id": input["cart"]["cart_id"],
            "sales_channel_id": input["channel"]["sales_channel_id"],
            "authorization": input["payment"],
        })))
    })
    .with_retry(RetryPolicy::attempts(3))
}

/// Registers the checkout workflow; a no-op if it is already registered.
pub async fn register(registry: &WorkflowRegistry) -> Result<bool> {
    registry
        .register_workflow(CHECKOUT_WORKFLOW, |b| {
            let cart = b.step(create_cart(), b.input())?;
            let channel = b.step(validate_sales_channel(), b.input())?;
            let payment = b.step(authorize_payment(), cart.field("cart_id"))?;
            let order = b.step(
                create_order(),
                StepInput::object([
                    ("cart", StepInput::from(cart)),
                    ("channel", StepInput::from(channel)),
                    ("payment", StepInput::from(payment)),
                ]),
            )?;
            b.response(order)
        })
        .await
}
