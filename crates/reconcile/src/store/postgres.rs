//! Postgres implementation of the store traits

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{AuditStore, BindingStore, CommerceStore, EventStore, NewAuditEntry, RecordStore};
use crate::error::{ReconcileError, ReconcileResult};
use crate::model::{
    AuditEntry, DownstreamTarget, EventFilter, EventOutcome, InboundEvent, MutationCounts,
    NewOrder, NewPayment, Order, OrderItem, Payment, PaymentInsert, PaymentTransition,
    RecordCollection, RecordMutation, RecordScope, TenantBinding, TenantRecord, WebhookSecret,
};
use crate::status::OrderStatus;

const BINDING_COLUMNS: &str =
    "id, user_id, product, is_active, webhook_secret, deactivated_at, created_at, updated_at";

const EVENT_COLUMNS: &str =
    "id, binding_id, source, payload, received_at, processed_at, processing_error";

const ORDER_COLUMNS: &str = "id, binding_id, customer_name, customer_email, customer_phone, \
     subtotal_cents, discount_cents, total_cents, status, created_at, updated_at";

const PAYMENT_COLUMNS: &str = "id, binding_id, order_id, external_id, method, status, \
     amount_cents, payer_email, payer_name, approved_at, metadata, created_at, updated_at";

#[derive(Debug, sqlx::FromRow)]
struct BindingRow {
    id: Uuid,
    user_id: Uuid,
    product: String,
    is_active: bool,
    webhook_secret: Option<String>,
    deactivated_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl From<BindingRow> for TenantBinding {
    fn from(row: BindingRow) -> Self {
        TenantBinding {
            id: row.id,
            user_id: row.user_id,
            product: row.product,
            is_active: row.is_active,
            webhook_secret: row.webhook_secret.map(WebhookSecret::new),
            deactivated_at: row.deactivated_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct TargetRow {
    binding_id: Uuid,
    base_url: String,
    shared_secret: String,
    is_active: bool,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    id: Uuid,
    binding_id: Uuid,
    source: String,
    payload: serde_json::Value,
    received_at: OffsetDateTime,
    processed_at: Option<OffsetDateTime>,
    processing_error: Option<String>,
}

impl From<EventRow> for InboundEvent {
    fn from(row: EventRow) -> Self {
        InboundEvent {
            id: row.id,
            binding_id: row.binding_id,
            source: row.source,
            payload: row.payload,
            received_at: row.received_at,
            processed_at: row.processed_at,
            processing_error: row.processing_error,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct OrderRow {
    id: Uuid,
    binding_id: Uuid,
    customer_name: String,
    customer_email: String,
    customer_phone: Option<String>,
    subtotal_cents: i64,
    discount_cents: i64,
    total_cents: i64,
    status: String,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<OrderRow> for Order {
    type Error = ReconcileError;

    fn try_from(row: OrderRow) -> Result<Self, Self::Error> {
        Ok(Order {
            id: row.id,
            binding_id: row.binding_id,
            customer_name: row.customer_name,
            customer_email: row.customer_email,
            customer_phone: row.customer_phone,
            subtotal_cents: row.subtotal_cents,
            discount_cents: row.discount_cents,
            total_cents: row.total_cents,
            status: row.status.parse().map_err(ReconcileError::Database)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PaymentRow {
    id: Uuid,
    binding_id: Uuid,
    order_id: Option<Uuid>,
    external_id: Option<String>,
    method: String,
    status: String,
    amount_cents: i64,
    payer_email: Option<String>,
    payer_name: Option<String>,
    approved_at: Option<OffsetDateTime>,
    metadata: serde_json::Value,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<PaymentRow> for Payment {
    type Error = ReconcileError;

    fn try_from(row: PaymentRow) -> Result<Self, Self::Error> {
        Ok(Payment {
            id: row.id,
            binding_id: row.binding_id,
            order_id: row.order_id,
            external_id: row.external_id,
            method: row.method,
            status: row.status.parse().map_err(ReconcileError::Database)?,
            amount_cents: row.amount_cents,
            payer_email: row.payer_email,
            payer_name: row.payer_name,
            approved_at: row.approved_at,
            metadata: row.metadata,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RecordRow {
    id: Uuid,
    binding_id: Uuid,
    collection: String,
    record_type: Option<String>,
    category: Option<String>,
    phone: Option<String>,
    email: Option<String>,
    payload: serde_json::Value,
    created_at: OffsetDateTime,
}

impl TryFrom<RecordRow> for TenantRecord {
    type Error = ReconcileError;

    fn try_from(row: RecordRow) -> Result<Self, Self::Error> {
        Ok(TenantRecord {
            id: row.id,
            binding_id: row.binding_id,
            collection: row.collection.parse().map_err(ReconcileError::Database)?,
            record_type: row.record_type,
            category: row.category,
            phone: row.phone,
            email: row.email,
            payload: row.payload,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct AuditRow {
    id: Uuid,
    binding_id: Uuid,
    inbound_event_id: Option<Uuid>,
    order_id: Option<Uuid>,
    payment_id: Option<Uuid>,
    external_payment_id: Option<String>,
    stage: String,
    detail: serde_json::Value,
    created_at: OffsetDateTime,
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// Every store trait over one connection pool
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BindingStore for PgStore {
    async fn get_binding(&self, binding_id: Uuid) -> ReconcileResult<Option<TenantBinding>> {
        let row: Option<BindingRow> = sqlx::query_as(&format!(
            "SELECT {} FROM integration_bindings WHERE id = $1",
            BINDING_COLUMNS
        ))
        .bind(binding_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(TenantBinding::from))
    }

    async fn set_secret_if_absent(
        &self,
        binding_id: Uuid,
        secret: &WebhookSecret,
    ) -> ReconcileResult<Option<WebhookSecret>> {
        // COALESCE keeps an existing secret; RETURNING yields whichever is stored
        let stored: Option<(Option<String>,)> = sqlx::query_as(
            r#"
            UPDATE integration_bindings
            SET webhook_secret = COALESCE(webhook_secret, $2),
                updated_at = CASE WHEN webhook_secret IS NULL THEN NOW() ELSE updated_at END
            WHERE id = $1
            RETURNING webhook_secret
            "#,
        )
        .bind(binding_id)
        .bind(secret.expose())
        .fetch_optional(&self.pool)
        .await?;

        Ok(stored.and_then(|(value,)| value).map(WebhookSecret::new))
    }

    async fn replace_secret(
        &self,
        binding_id: Uuid,
        secret: &WebhookSecret,
    ) -> ReconcileResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE integration_bindings
            SET webhook_secret = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(binding_id)
        .bind(secret.expose())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                ReconcileError::Conflict("webhook secret already in use".to_string())
            } else {
                ReconcileError::from(e)
            }
        })?;

        Ok(result.rows_affected() == 1)
    }

    async fn find_by_secret(&self, secret: &str) -> ReconcileResult<Option<TenantBinding>> {
        let row: Option<BindingRow> = sqlx::query_as(&format!(
            "SELECT {} FROM integration_bindings WHERE webhook_secret = $1",
            BINDING_COLUMNS
        ))
        .bind(secret)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(TenantBinding::from))
    }

    async fn downstream_target(
        &self,
        binding_id: Uuid,
    ) -> ReconcileResult<Option<DownstreamTarget>> {
        let row: Option<TargetRow> = sqlx::query_as(
            r#"
            SELECT binding_id, base_url, shared_secret, is_active, created_at, updated_at
            FROM downstream_targets
            WHERE binding_id = $1
            "#,
        )
        .bind(binding_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| DownstreamTarget {
            binding_id: r.binding_id,
            base_url: r.base_url,
            shared_secret: r.shared_secret,
            is_active: r.is_active,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }))
    }
}

#[async_trait]
impl EventStore for PgStore {
    async fn insert_event(
        &self,
        binding_id: Uuid,
        source: &str,
        payload: &serde_json::Value,
    ) -> ReconcileResult<Uuid> {
        let (id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO inbound_events (binding_id, source, payload)
            VALUES ($1, $2, $3)
            RETURNING id
            "#,
        )
        .bind(binding_id)
        .bind(source)
        .bind(payload)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn complete_event(&self, event_id: Uuid, error: Option<&str>) -> ReconcileResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE inbound_events
            SET processed_at = NOW(), processing_error = $2
            WHERE id = $1 AND processed_at IS NULL
            "#,
        )
        .bind(event_id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_event(&self, event_id: Uuid) -> ReconcileResult<Option<InboundEvent>> {
        let row: Option<EventRow> = sqlx::query_as(&format!(
            "SELECT {} FROM inbound_events WHERE id = $1",
            EVENT_COLUMNS
        ))
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(InboundEvent::from))
    }

    async fn list_pending(
        &self,
        source: &str,
        received_before: OffsetDateTime,
        limit: i64,
    ) -> ReconcileResult<Vec<InboundEvent>> {
        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            r#"
            SELECT {}
            FROM inbound_events
            WHERE processed_at IS NULL AND source = $1 AND received_at < $2
            ORDER BY received_at ASC
            LIMIT $3
            "#,
            EVENT_COLUMNS
        ))
        .bind(source)
        .bind(received_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(InboundEvent::from).collect())
    }

    async fn list_events(&self, filter: &EventFilter) -> ReconcileResult<Vec<InboundEvent>> {
        let outcome_clause = match filter.outcome {
            None => "TRUE",
            Some(EventOutcome::Pending) => "processed_at IS NULL",
            Some(EventOutcome::Succeeded) => "processed_at IS NOT NULL AND processing_error IS NULL",
            Some(EventOutcome::Failed) => {
                "processed_at IS NOT NULL AND processing_error IS NOT NULL"
            }
        };

        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            r#"
            SELECT {}
            FROM inbound_events
            WHERE ($1::UUID IS NULL OR binding_id = $1) AND {}
            ORDER BY received_at DESC
            LIMIT $2 OFFSET $3
            "#,
            EVENT_COLUMNS, outcome_clause
        ))
        .bind(filter.binding_id)
        .bind(filter.limit)
        .bind(filter.offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(InboundEvent::from).collect())
    }
}

#[async_trait]
impl CommerceStore for PgStore {
    async fn create_order(&self, order: &NewOrder) -> ReconcileResult<(Order, Payment)> {
        let mut tx = self.pool.begin().await?;

        let order_row: OrderRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO orders
                (binding_id, customer_name, customer_email, customer_phone,
                 subtotal_cents, discount_cents, total_cents, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending')
            RETURNING {}
            "#,
            ORDER_COLUMNS
        ))
        .bind(order.binding_id)
        .bind(&order.customer_name)
        .bind(&order.customer_email)
        .bind(&order.customer_phone)
        .bind(order.subtotal_cents())
        .bind(order.discount_cents)
        .bind(order.total_cents())
        .fetch_one(&mut *tx)
        .await?;

        for item in &order.items {
            sqlx::query(
                r#"
                INSERT INTO order_items (order_id, name, quantity, unit_price_cents)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(order_row.id)
            .bind(&item.name)
            .bind(item.quantity)
            .bind(item.unit_price_cents)
            .execute(&mut *tx)
            .await?;
        }

        let payment_row: PaymentRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO payments
                (binding_id, order_id, method, status, amount_cents, payer_email, payer_name)
            VALUES ($1, $2, $3, 'pending', $4, $5, $6)
            RETURNING {}
            "#,
            PAYMENT_COLUMNS
        ))
        .bind(order.binding_id)
        .bind(order_row.id)
        .bind(&order.payment_method)
        .bind(order_row.total_cents)
        .bind(&order.customer_email)
        .bind(&order.customer_name)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok((Order::try_from(order_row)?, Payment::try_from(payment_row)?))
    }

    async fn get_order(&self, binding_id: Uuid, order_id: Uuid) -> ReconcileResult<Option<Order>> {
        let row: Option<OrderRow> = sqlx::query_as(&format!(
            "SELECT {} FROM orders WHERE id = $1 AND binding_id = $2",
            ORDER_COLUMNS
        ))
        .bind(order_id)
        .bind(binding_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Order::try_from).transpose()
    }

    async fn order_items(&self, order_id: Uuid) -> ReconcileResult<Vec<OrderItem>> {
        let rows: Vec<(String, i32, i64)> = sqlx::query_as(
            r#"
            SELECT name, quantity, unit_price_cents
            FROM order_items
            WHERE order_id = $1
            "#,
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(name, quantity, unit_price_cents)| OrderItem {
                name,
                quantity,
                unit_price_cents,
            })
            .collect())
    }

    async fn find_payment_by_external_id(
        &self,
        binding_id: Uuid,
        external_id: &str,
    ) -> ReconcileResult<Option<Payment>> {
        let row: Option<PaymentRow> = sqlx::query_as(&format!(
            "SELECT {} FROM payments WHERE external_id = $1 AND binding_id = $2",
            PAYMENT_COLUMNS
        ))
        .bind(external_id)
        .bind(binding_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Payment::try_from).transpose()
    }

    async fn find_unlinked_payment(
        &self,
        binding_id: Uuid,
        order_id: Uuid,
    ) -> ReconcileResult<Option<Payment>> {
        let row: Option<PaymentRow> = sqlx::query_as(&format!(
            r#"
            SELECT {}
            FROM payments
            WHERE order_id = $1 AND binding_id = $2 AND external_id IS NULL
            ORDER BY created_at ASC
            LIMIT 1
            "#,
            PAYMENT_COLUMNS
        ))
        .bind(order_id)
        .bind(binding_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Payment::try_from).transpose()
    }

    async fn attach_external_id(
        &self,
        payment_id: Uuid,
        external_id: &str,
    ) -> ReconcileResult<Option<Payment>> {
        let result: Result<Option<PaymentRow>, sqlx::Error> = sqlx::query_as(&format!(
            r#"
            UPDATE payments
            SET external_id = $2, updated_at = NOW()
            WHERE id = $1 AND external_id IS NULL
            RETURNING {}
            "#,
            PAYMENT_COLUMNS
        ))
        .bind(payment_id)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await;

        match result {
            Ok(row) => row.map(Payment::try_from).transpose(),
            Err(e) if is_unique_violation(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn insert_payment(&self, payment: &NewPayment) -> ReconcileResult<PaymentInsert> {
        let row: Option<PaymentRow> = sqlx::query_as(&format!(
            r#"
            INSERT INTO payments
                (binding_id, order_id, external_id, method, status, amount_cents,
                 payer_email, payer_name, metadata)
            VALUES ($1, $2, $3, $4, 'pending', $5, $6, $7, $8)
            ON CONFLICT (external_id) DO NOTHING
            RETURNING {}
            "#,
            PAYMENT_COLUMNS
        ))
        .bind(payment.binding_id)
        .bind(payment.order_id)
        .bind(&payment.external_id)
        .bind(&payment.method)
        .bind(payment.amount_cents)
        .bind(&payment.payer_email)
        .bind(&payment.payer_name)
        .bind(&payment.metadata)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(PaymentInsert::Inserted(Payment::try_from(row)?)),
            None => Ok(PaymentInsert::ExternalIdTaken),
        }
    }

    async fn transition_payment(
        &self,
        transition: &PaymentTransition,
    ) -> ReconcileResult<Option<Payment>> {
        let row: Option<PaymentRow> = sqlx::query_as(&format!(
            r#"
            UPDATE payments
            SET status = $3,
                approved_at = COALESCE(approved_at, $4),
                metadata = $5,
                updated_at = NOW()
            WHERE id = $1 AND status = $2
            RETURNING {}
            "#,
            PAYMENT_COLUMNS
        ))
        .bind(transition.payment_id)
        .bind(transition.from.as_str())
        .bind(transition.to.as_str())
        .bind(transition.approved_at)
        .bind(&transition.metadata)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Payment::try_from).transpose()
    }

    async fn update_order_status(
        &self,
        order_id: Uuid,
        from: OrderStatus,
        to: OrderStatus,
    ) -> ReconcileResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE orders
            SET status = $3, updated_at = NOW()
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(order_id)
        .bind(from.as_str())
        .bind(to.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl RecordStore for PgStore {
    async fn apply_mutation(
        &self,
        binding_id: Uuid,
        mutation: &RecordMutation,
    ) -> ReconcileResult<MutationCounts> {
        let collection = mutation.collection.as_str();
        let mut tx = self.pool.begin().await?;

        // Serialize writers per binding + collection so replace stays last-write-wins
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(format!("{}:{}", binding_id, collection))
            .execute(&mut *tx)
            .await?;

        let deleted = match &mutation.delete {
            None => 0,
            Some(RecordScope::TypeCategory {
                record_type,
                category,
            }) => sqlx::query(
                r#"
                DELETE FROM tenant_records
                WHERE binding_id = $1 AND collection = $2 AND record_type = $3 AND category = $4
                "#,
            )
            .bind(binding_id)
            .bind(collection)
            .bind(record_type)
            .bind(category)
            .execute(&mut *tx)
            .await?
            .rows_affected(),
            Some(RecordScope::Category(category)) => sqlx::query(
                r#"
                DELETE FROM tenant_records
                WHERE binding_id = $1 AND collection = $2 AND category = $3
                "#,
            )
            .bind(binding_id)
            .bind(collection)
            .bind(category)
            .execute(&mut *tx)
            .await?
            .rows_affected(),
            Some(RecordScope::Contact { phone, email }) => sqlx::query(
                r#"
                DELETE FROM tenant_records
                WHERE binding_id = $1 AND collection = $2 AND (phone = $3 OR email = $4)
                "#,
            )
            .bind(binding_id)
            .bind(collection)
            .bind(phone)
            .bind(email)
            .execute(&mut *tx)
            .await?
            .rows_affected(),
        };

        let inserted = match &mutation.insert {
            None => 0,
            Some(record) => sqlx::query(
                r#"
                INSERT INTO tenant_records
                    (binding_id, collection, record_type, category, phone, email, payload)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(binding_id)
            .bind(collection)
            .bind(&record.record_type)
            .bind(&record.category)
            .bind(&record.phone)
            .bind(&record.email)
            .bind(&record.payload)
            .execute(&mut *tx)
            .await?
            .rows_affected(),
        };

        tx.commit().await?;
        Ok(MutationCounts { deleted, inserted })
    }

    async fn list_records(
        &self,
        binding_id: Uuid,
        collection: RecordCollection,
    ) -> ReconcileResult<Vec<TenantRecord>> {
        let rows: Vec<RecordRow> = sqlx::query_as(
            r#"
            SELECT id, binding_id, collection, record_type, category, phone, email, payload, created_at
            FROM tenant_records
            WHERE binding_id = $1 AND collection = $2
            ORDER BY created_at ASC
            "#,
        )
        .bind(binding_id)
        .bind(collection.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TenantRecord::try_from).collect()
    }
}

#[async_trait]
impl AuditStore for PgStore {
    async fn append_audit(&self, entry: &NewAuditEntry) -> ReconcileResult<()> {
        sqlx::query(
            r#"
            INSERT INTO reconciliation_audit
                (binding_id, inbound_event_id, order_id, payment_id, external_payment_id, stage, detail)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(entry.binding_id)
        .bind(entry.inbound_event_id)
        .bind(entry.order_id)
        .bind(entry.payment_id)
        .bind(&entry.external_payment_id)
        .bind(&entry.stage)
        .bind(&entry.detail)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_audit(
        &self,
        binding_id: Uuid,
        external_payment_id: Option<&str>,
    ) -> ReconcileResult<Vec<AuditEntry>> {
        let rows: Vec<AuditRow> = sqlx::query_as(
            r#"
            SELECT id, binding_id, inbound_event_id, order_id, payment_id,
                   external_payment_id, stage, detail, created_at
            FROM reconciliation_audit
            WHERE binding_id = $1 AND ($2::TEXT IS NULL OR external_payment_id = $2)
            ORDER BY created_at ASC
            "#,
        )
        .bind(binding_id)
        .bind(external_payment_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| AuditEntry {
                id: r.id,
                binding_id: r.binding_id,
                inbound_event_id: r.inbound_event_id,
                order_id: r.order_id,
                payment_id: r.payment_id,
                external_payment_id: r.external_payment_id,
                stage: r.stage,
                detail: r.detail,
                created_at: r.created_at,
            })
            .collect())
    }
}
