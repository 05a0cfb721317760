//! Add / replace / zero reconciliation for simple tenant records
//!
//! Financial entries are keyed by type + category, contacts by phone and/or
//! email. Field names are accepted in Portuguese or English since both come
//! from the same automation tools.

use std::sync::Arc;

use hookrelay_shared::{
    sanitize_json, sanitize_string, validate_amount, validate_email, validate_string_length,
    ValidationError,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ReconcileResult;
use crate::model::{NewTenantRecord, RecordCollection, RecordMutation, RecordScope};
use crate::store::RecordStore;

const MAX_KEY_LENGTH: usize = 100;
const MAX_FIELD_LENGTH: usize = 2_000;
const MAX_AMOUNT: f64 = 1_000_000_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOperation {
    /// Insert unconditionally
    Add,
    /// Delete the natural key's matches, then insert
    Replace,
    /// Delete everything in the key's scope, insert nothing
    Zero,
}

impl RecordOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordOperation::Add => "add",
            RecordOperation::Replace => "replace",
            RecordOperation::Zero => "zero",
        }
    }
}

impl std::str::FromStr for RecordOperation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "add" | "adicionar" => Ok(RecordOperation::Add),
            "replace" | "substituir" => Ok(RecordOperation::Replace),
            "zero" | "zerar" => Ok(RecordOperation::Zero),
            other => Err(format!(
                "unknown operation '{}', expected add, replace or zero",
                other
            )),
        }
    }
}

/// A validated record request
#[derive(Debug, Clone)]
pub struct RecordRequest {
    pub collection: RecordCollection,
    pub operation: RecordOperation,
    pub mutation: RecordMutation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordOutcome {
    pub operation: RecordOperation,
    pub collection: RecordCollection,
    pub deleted: u64,
    pub inserted: u64,
}

/// First non-empty string among the aliases, sanitized.
///
/// Bounded by the field ceiling, not the key limit, so over-long keys reach
/// the length check instead of being cut into a different key.
fn text_field(body: &serde_json::Value, aliases: &[&str]) -> Option<String> {
    aliases
        .iter()
        .filter_map(|key| body.get(*key))
        .find_map(|v| match v {
            serde_json::Value::String(s) => Some(sanitize_string(s, MAX_FIELD_LENGTH)),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .filter(|s| !s.is_empty())
}

fn normalize_phone(raw: &str) -> String {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if raw.trim_start().starts_with('+') {
        format!("+{}", digits)
    } else {
        digits
    }
}

impl RecordRequest {
    /// Validate a webhook body for `collection`. Every problem is reported at once.
    pub fn parse(
        collection: RecordCollection,
        body: &serde_json::Value,
    ) -> Result<Self, Vec<ValidationError>> {
        let Some(object) = body.as_object() else {
            return Err(vec![ValidationError::new("body", "must be a JSON object")]);
        };

        let mut errors = Vec::new();

        let operation = match text_field(body, &["operacao", "operation"]) {
            None => RecordOperation::Add,
            Some(tag) => match tag.parse() {
                Ok(op) => op,
                Err(message) => {
                    errors.push(ValidationError::new("operation", message));
                    RecordOperation::Add
                }
            },
        };

        let mut payload = serde_json::Map::new();
        for (key, value) in object {
            if key != "operacao" && key != "operation" {
                payload.insert(key.clone(), value.clone());
            }
        }
        let payload = sanitize_json(&serde_json::Value::Object(payload), MAX_FIELD_LENGTH);

        let mutation = match collection {
            RecordCollection::FinancialEntries => {
                Self::financial(operation, body, payload, &mut errors)
            }
            RecordCollection::Contacts => Self::contact(operation, body, payload, &mut errors),
        };

        if errors.is_empty() {
            Ok(Self {
                collection,
                operation,
                mutation,
            })
        } else {
            Err(errors)
        }
    }

    fn financial(
        operation: RecordOperation,
        body: &serde_json::Value,
        payload: serde_json::Value,
        errors: &mut Vec<ValidationError>,
    ) -> RecordMutation {
        let record_type = text_field(body, &["tipo", "type"]);
        let category = text_field(body, &["categoria", "category"]);

        if let Some(value) = ["valor", "amount"].iter().find_map(|k| body.get(*k)) {
            match value.as_f64() {
                Some(amount) => errors.extend(validate_amount("amount", amount.abs(), MAX_AMOUNT)),
                None => errors.push(ValidationError::new("amount", "must be a number")),
            }
        }

        let needs_type = operation != RecordOperation::Zero;
        if needs_type && record_type.is_none() {
            errors.push(ValidationError::new("type", "is required"));
        }
        if category.is_none() {
            errors.push(ValidationError::new("category", "is required"));
        }
        for (field, value) in [("type", &record_type), ("category", &category)] {
            if let Some(value) = value {
                errors.extend(validate_string_length(field, value, 1, MAX_KEY_LENGTH));
            }
        }

        let record_type = record_type.unwrap_or_default();
        let category = category.unwrap_or_default();

        let delete = match operation {
            RecordOperation::Add => None,
            RecordOperation::Replace => Some(RecordScope::TypeCategory {
                record_type: record_type.clone(),
                category: category.clone(),
            }),
            RecordOperation::Zero => Some(RecordScope::Category(category.clone())),
        };
        let insert = (operation != RecordOperation::Zero).then(|| NewTenantRecord {
            record_type: Some(record_type),
            category: Some(category),
            phone: None,
            email: None,
            payload,
        });

        RecordMutation {
            collection: RecordCollection::FinancialEntries,
            delete,
            insert,
        }
    }

    fn contact(
        operation: RecordOperation,
        body: &serde_json::Value,
        payload: serde_json::Value,
        errors: &mut Vec<ValidationError>,
    ) -> RecordMutation {
        let phone = text_field(body, &["telefone", "phone"]).map(|p| normalize_phone(&p));
        let email = text_field(body, &["email", "e-mail"]).map(|e| e.to_lowercase());

        if phone.is_none() && email.is_none() {
            errors.push(ValidationError::new("phone", "phone or email is required"));
        }
        if let Some(phone) = &phone {
            let digits = phone.trim_start_matches('+').len();
            if !(8..=15).contains(&digits) {
                errors.push(ValidationError::new("phone", "must have between 8 and 15 digits"));
            }
        }
        if let Some(email) = &email {
            errors.extend(validate_email("email", email));
        }

        let delete = match operation {
            RecordOperation::Add => None,
            RecordOperation::Replace | RecordOperation::Zero => Some(RecordScope::Contact {
                phone: phone.clone(),
                email: email.clone(),
            }),
        };
        let insert = (operation != RecordOperation::Zero).then(|| NewTenantRecord {
            record_type: None,
            category: None,
            phone,
            email,
            payload,
        });

        RecordMutation {
            collection: RecordCollection::Contacts,
            delete,
            insert,
        }
    }
}

/// Applies validated record requests, always scoped to the authenticated binding
#[derive(Clone)]
pub struct RecordOperator {
    records: Arc<dyn RecordStore>,
}

impl RecordOperator {
    pub fn new(records: Arc<dyn RecordStore>) -> Self {
        Self { records }
    }

    pub async fn apply(
        &self,
        binding_id: Uuid,
        request: &RecordRequest,
    ) -> ReconcileResult<RecordOutcome> {
        let counts = self
            .records
            .apply_mutation(binding_id, &request.mutation)
            .await?;

        tracing::info!(
            binding_id = %binding_id,
            collection = request.collection.as_str(),
            operation = request.operation.as_str(),
            deleted = counts.deleted,
            inserted = counts.inserted,
            "Record operation applied"
        );

        Ok(RecordOutcome {
            operation: request.operation,
            collection: request.collection,
            deleted: counts.deleted,
            inserted: counts.inserted,
        })
    }
}
