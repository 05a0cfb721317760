//! Domain types shared by the stores and the reconciliation services

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::status::{OrderStatus, PaymentStatus};

/// Product tags a binding can carry
pub mod product {
    pub const COMMERCE: &str = "commerce";
    pub const FINANCE: &str = "finance";
    pub const CRM: &str = "crm";
    pub const MESSAGING: &str = "messaging";
}

/// Source tags for inbound events
pub mod source {
    pub const GATEWAY: &str = "gateway";
    pub const MESSAGING_PROVIDER: &str = "messaging-provider";
    pub const RECORDS: &str = "records";
}

/// Opaque webhook credential. Never printed by `Debug`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WebhookSecret(String);

impl WebhookSecret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl std::fmt::Debug for WebhookSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("WebhookSecret(***)")
    }
}

/// One tenant's integration instance for one product
#[derive(Debug, Clone, Serialize)]
pub struct TenantBinding {
    pub id: Uuid,
    pub user_id: Uuid,
    pub product: String,
    pub is_active: bool,
    #[serde(skip_serializing)]
    pub webhook_secret: Option<WebhookSecret>,
    pub deactivated_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl TenantBinding {
    /// Active and not soft-deactivated
    pub fn is_usable(&self) -> bool {
        self.is_active && self.deactivated_at.is_none()
    }
}

/// Where the dispatch router forwards a binding's events
#[derive(Clone)]
pub struct DownstreamTarget {
    pub binding_id: Uuid,
    pub base_url: String,
    pub shared_secret: String,
    pub is_active: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl std::fmt::Debug for DownstreamTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownstreamTarget")
            .field("binding_id", &self.binding_id)
            .field("base_url", &self.base_url)
            .field("shared_secret", &"***")
            .field("is_active", &self.is_active)
            .finish()
    }
}

/// Durable copy of a received payload
#[derive(Debug, Clone, Serialize)]
pub struct InboundEvent {
    pub id: Uuid,
    pub binding_id: Uuid,
    pub source: String,
    pub payload: serde_json::Value,
    pub received_at: OffsetDateTime,
    pub processed_at: Option<OffsetDateTime>,
    pub processing_error: Option<String>,
}

impl InboundEvent {
    pub fn outcome(&self) -> EventOutcome {
        match (&self.processed_at, &self.processing_error) {
            (None, _) => EventOutcome::Pending,
            (Some(_), None) => EventOutcome::Succeeded,
            (Some(_), Some(_)) => EventOutcome::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOutcome {
    Pending,
    Succeeded,
    Failed,
}

impl std::str::FromStr for EventOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EventOutcome::Pending),
            "succeeded" => Ok(EventOutcome::Succeeded),
            "failed" => Ok(EventOutcome::Failed),
            other => Err(format!("unknown event status: {}", other)),
        }
    }
}

/// Filter for the admin event listing
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub binding_id: Option<Uuid>,
    pub outcome: Option<EventOutcome>,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Order {
    pub id: Uuid,
    pub binding_id: Uuid,
    pub customer_name: String,
    pub customer_email: String,
    pub customer_phone: Option<String>,
    pub subtotal_cents: i64,
    pub discount_cents: i64,
    pub total_cents: i64,
    pub status: OrderStatus,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderItem {
    pub name: String,
    pub quantity: i32,
    pub unit_price_cents: i64,
}

/// Input for creating an order together with its pending payment
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub binding_id: Uuid,
    pub customer_name: String,
    pub customer_email: String,
    pub customer_phone: Option<String>,
    pub items: Vec<OrderItem>,
    pub discount_cents: i64,
    pub payment_method: String,
}

impl NewOrder {
    pub fn subtotal_cents(&self) -> i64 {
        self.items
            .iter()
            .map(|item| item.unit_price_cents * i64::from(item.quantity))
            .sum()
    }

    pub fn total_cents(&self) -> i64 {
        self.subtotal_cents() - self.discount_cents
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Payment {
    pub id: Uuid,
    pub binding_id: Uuid,
    pub order_id: Option<Uuid>,
    pub external_id: Option<String>,
    pub method: String,
    pub status: PaymentStatus,
    pub amount_cents: i64,
    pub payer_email: Option<String>,
    pub payer_name: Option<String>,
    pub approved_at: Option<OffsetDateTime>,
    pub metadata: serde_json::Value,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// A payment first seen through a gateway notification
#[derive(Debug, Clone)]
pub struct NewPayment {
    pub binding_id: Uuid,
    pub order_id: Uuid,
    pub external_id: String,
    pub method: String,
    pub amount_cents: i64,
    pub payer_email: Option<String>,
    pub payer_name: Option<String>,
    pub metadata: serde_json::Value,
}

/// Result of inserting a payment keyed by external id
#[derive(Debug, Clone)]
pub enum PaymentInsert {
    Inserted(Payment),
    /// Another writer stored the external id first
    ExternalIdTaken,
}

/// Compare-and-set status change on one payment
#[derive(Debug, Clone)]
pub struct PaymentTransition {
    pub payment_id: Uuid,
    pub from: PaymentStatus,
    pub to: PaymentStatus,
    /// Only written when the payment has none yet
    pub approved_at: Option<OffsetDateTime>,
    pub metadata: serde_json::Value,
}

/// Collections handled by the generic record operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordCollection {
    FinancialEntries,
    Contacts,
}

impl RecordCollection {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordCollection::FinancialEntries => "financial_entries",
            RecordCollection::Contacts => "contacts",
        }
    }

    /// Product a binding must carry to write into this collection
    pub fn product(&self) -> &'static str {
        match self {
            RecordCollection::FinancialEntries => product::FINANCE,
            RecordCollection::Contacts => product::CRM,
        }
    }
}

impl std::str::FromStr for RecordCollection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "financial_entries" => Ok(RecordCollection::FinancialEntries),
            "contacts" => Ok(RecordCollection::Contacts),
            other => Err(format!("unknown collection: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TenantRecord {
    pub id: Uuid,
    pub binding_id: Uuid,
    pub collection: RecordCollection,
    pub record_type: Option<String>,
    pub category: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub payload: serde_json::Value,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct NewTenantRecord {
    pub record_type: Option<String>,
    pub category: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub payload: serde_json::Value,
}

/// Which existing records a mutation removes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordScope {
    /// Exact type + category match
    TypeCategory { record_type: String, category: String },
    /// Every record in the category, any type
    Category(String),
    /// Every record matching the phone or the email
    Contact {
        phone: Option<String>,
        email: Option<String>,
    },
}

impl RecordScope {
    pub fn matches(&self, record: &TenantRecord) -> bool {
        match self {
            RecordScope::TypeCategory {
                record_type,
                category,
            } => {
                record.record_type.as_deref() == Some(record_type.as_str())
                    && record.category.as_deref() == Some(category.as_str())
            }
            RecordScope::Category(category) => {
                record.category.as_deref() == Some(category.as_str())
            }
            RecordScope::Contact { phone, email } => {
                let phone_hit = phone.is_some() && record.phone == *phone;
                let email_hit = email.is_some() && record.email == *email;
                phone_hit || email_hit
            }
        }
    }
}

/// Delete-then-insert applied atomically to one collection of one binding
#[derive(Debug, Clone)]
pub struct RecordMutation {
    pub collection: RecordCollection,
    pub delete: Option<RecordScope>,
    pub insert: Option<NewTenantRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MutationCounts {
    pub deleted: u64,
    pub inserted: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub binding_id: Uuid,
    pub inbound_event_id: Option<Uuid>,
    pub order_id: Option<Uuid>,
    pub payment_id: Option<Uuid>,
    pub external_payment_id: Option<String>,
    pub stage: String,
    pub detail: serde_json::Value,
    pub created_at: OffsetDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(phone: Option<&str>, email: Option<&str>) -> TenantRecord {
        TenantRecord {
            id: Uuid::new_v4(),
            binding_id: Uuid::new_v4(),
            collection: RecordCollection::Contacts,
            record_type: None,
            category: None,
            phone: phone.map(String::from),
            email: email.map(String::from),
            payload: serde_json::json!({}),
            created_at: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let secret = WebhookSecret::new("super-secret-token");
        assert_eq!(format!("{:?}", secret), "WebhookSecret(***)");
        assert_eq!(secret.expose(), "super-secret-token");
    }

    #[test]
    fn test_binding_debug_never_shows_secret() {
        let binding = TenantBinding {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            product: product::COMMERCE.to_string(),
            is_active: true,
            webhook_secret: Some(WebhookSecret::new("abc123")),
            deactivated_at: None,
            created_at: OffsetDateTime::now_utc(),
            updated_at: OffsetDateTime::now_utc(),
        };
        assert!(!format!("{:?}", binding).contains("abc123"));
        assert!(binding.is_usable());
    }

    #[test]
    fn test_event_outcome() {
        let mut event = InboundEvent {
            id: Uuid::new_v4(),
            binding_id: Uuid::new_v4(),
            source: source::GATEWAY.to_string(),
            payload: serde_json::json!({}),
            received_at: OffsetDateTime::now_utc(),
            processed_at: None,
            processing_error: None,
        };
        assert_eq!(event.outcome(), EventOutcome::Pending);
        event.processed_at = Some(OffsetDateTime::now_utc());
        assert_eq!(event.outcome(), EventOutcome::Succeeded);
        event.processing_error = Some("gateway timeout".to_string());
        assert_eq!(event.outcome(), EventOutcome::Failed);
    }

    #[test]
    fn test_order_totals() {
        let order = NewOrder {
            binding_id: Uuid::new_v4(),
            customer_name: "Ana".to_string(),
            customer_email: "ana@example.com".to_string(),
            customer_phone: None,
            items: vec![
                OrderItem {
                    name: "Camiseta".to_string(),
                    quantity: 2,
                    unit_price_cents: 4_990,
                },
                OrderItem {
                    name: "Boné".to_string(),
                    quantity: 1,
                    unit_price_cents: 2_500,
                },
            ],
            discount_cents: 480,
            payment_method: "pix".to_string(),
        };
        assert_eq!(order.subtotal_cents(), 12_480);
        assert_eq!(order.total_cents(), 12_000);
    }

    #[test]
    fn test_contact_scope_matches_phone_or_email() {
        let scope = RecordScope::Contact {
            phone: Some("+5511999990000".to_string()),
            email: Some("ana@example.com".to_string()),
        };
        assert!(scope.matches(&record(Some("+5511999990000"), None)));
        assert!(scope.matches(&record(None, Some("ana@example.com"))));
        assert!(!scope.matches(&record(Some("+5511000000000"), Some("bia@example.com"))));

        let phone_only = RecordScope::Contact {
            phone: Some("+5511999990000".to_string()),
            email: None,
        };
        assert!(!phone_only.matches(&record(None, None)));
    }

    #[test]
    fn test_category_scope_ignores_type() {
        let mut entry = record(None, None);
        entry.collection = RecordCollection::FinancialEntries;
        entry.record_type = Some("despesa".to_string());
        entry.category = Some("aluguel".to_string());

        assert!(RecordScope::Category("aluguel".to_string()).matches(&entry));
        assert!(!RecordScope::TypeCategory {
            record_type: "receita".to_string(),
            category: "aluguel".to_string(),
        }
        .matches(&entry));
    }
}
