//! Order creation for commerce bindings

use std::sync::Arc;

use hookrelay_shared::{
    batch_validate, sanitize_string, validate_email, validate_items, validate_string_length,
    ValidationError,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::error::ReconcileError;
use crate::model::{NewOrder, OrderItem};
use crate::status::{OrderStatus, PaymentStatus};
use crate::store::CommerceStore;

pub const MAX_ITEMS: usize = 100;
pub const MAX_QUANTITY: i32 = 1_000;
/// R$ 1.000.000,00 per unit
pub const MAX_UNIT_PRICE_CENTS: i64 = 100_000_000;

#[derive(Debug, Error)]
pub enum OrderError {
    #[error("Validation failed")]
    Validation(Vec<ValidationError>),

    #[error(transparent)]
    Store(#[from] ReconcileError),
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateOrderRequest {
    pub customer_name: String,
    pub customer_email: String,
    #[serde(default)]
    pub customer_phone: Option<String>,
    pub items: Vec<CreateOrderItem>,
    #[serde(default)]
    pub discount_cents: i64,
    #[serde(default = "default_payment_method")]
    pub payment_method: String,
}

fn default_payment_method() -> String {
    "pix".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateOrderItem {
    pub name: String,
    pub quantity: i32,
    pub unit_price_cents: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreatedOrder {
    pub order_id: Uuid,
    pub payment_id: Uuid,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    pub subtotal_cents: i64,
    pub discount_cents: i64,
    pub total_cents: i64,
}

impl CreateOrderRequest {
    /// Check every bound and build the sanitized order
    pub fn validate(&self, binding_id: Uuid) -> Result<NewOrder, Vec<ValidationError>> {
        let mut checks = vec![
            validate_string_length("customer_name", &self.customer_name, 2, 120),
            validate_email("customer_email", self.customer_email.trim()),
            validate_items("items", &self.items, MAX_ITEMS),
            validate_string_length("payment_method", &self.payment_method, 1, 32),
        ];

        if let Some(phone) = &self.customer_phone {
            let digits = phone.chars().filter(|c| c.is_ascii_digit()).count();
            if !(8..=15).contains(&digits) {
                checks.push(Some(ValidationError::new(
                    "customer_phone",
                    "must have between 8 and 15 digits",
                )));
            }
        }

        for (index, item) in self.items.iter().enumerate() {
            checks.push(validate_string_length(
                &format!("items[{}].name", index),
                &item.name,
                1,
                200,
            ));
            if !(1..=MAX_QUANTITY).contains(&item.quantity) {
                checks.push(Some(ValidationError::new(
                    format!("items[{}].quantity", index),
                    format!("must be between 1 and {}", MAX_QUANTITY),
                )));
            }
            if !(0..=MAX_UNIT_PRICE_CENTS).contains(&item.unit_price_cents) {
                checks.push(Some(ValidationError::new(
                    format!("items[{}].unit_price_cents", index),
                    format!("must be between 0 and {}", MAX_UNIT_PRICE_CENTS),
                )));
            }
        }

        let subtotal: i64 = self
            .items
            .iter()
            .map(|i| {
                i.unit_price_cents.clamp(0, MAX_UNIT_PRICE_CENTS)
                    * i64::from(i.quantity.clamp(0, MAX_QUANTITY))
            })
            .sum();
        if self.discount_cents < 0 {
            checks.push(Some(ValidationError::new("discount_cents", "must not be negative")));
        } else if self.discount_cents > subtotal {
            checks.push(Some(ValidationError::new(
                "discount_cents",
                "must not exceed the subtotal",
            )));
        }

        batch_validate(checks)?;

        Ok(NewOrder {
            binding_id,
            customer_name: sanitize_string(&self.customer_name, 120),
            customer_email: self.customer_email.trim().to_lowercase(),
            customer_phone: self.customer_phone.as_ref().map(|p| sanitize_string(p, 32)),
            items: self
                .items
                .iter()
                .map(|i| OrderItem {
                    name: sanitize_string(&i.name, 200),
                    quantity: i.quantity,
                    unit_price_cents: i.unit_price_cents,
                })
                .collect(),
            discount_cents: self.discount_cents,
            payment_method: sanitize_string(&self.payment_method, 32),
        })
    }
}

#[derive(Clone)]
pub struct OrderService {
    commerce: Arc<dyn CommerceStore>,
}

impl OrderService {
    pub fn new(commerce: Arc<dyn CommerceStore>) -> Self {
        Self { commerce }
    }

    /// Create the order, its items and a pending payment in one transaction
    pub async fn create(
        &self,
        binding_id: Uuid,
        request: &CreateOrderRequest,
    ) -> Result<CreatedOrder, OrderError> {
        let new_order = request.validate(binding_id).map_err(OrderError::Validation)?;
        let (order, payment) = self.commerce.create_order(&new_order).await?;

        tracing::info!(
            binding_id = %binding_id,
            order_id = %order.id,
            total_cents = order.total_cents,
            "Order created"
        );

        Ok(CreatedOrder {
            order_id: order.id,
            payment_id: payment.id,
            status: order.status,
            payment_status: payment.status,
            subtotal_cents: order.subtotal_cents,
            discount_cents: order.discount_cents,
            total_cents: order.total_cents,
        })
    }
}
