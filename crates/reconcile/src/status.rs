//! Canonical payment/order statuses, the gateway status table and the
//! forward-only transition graph.
//!
//! The gateway table is the only place gateway vocabulary is translated.
//! Everything downstream of [`map_gateway_status`] speaks [`PaymentStatus`].

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    PendingReview,
    Approved,
    Rejected,
    Cancelled,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::PendingReview => "pending_review",
            PaymentStatus::Approved => "approved",
            PaymentStatus::Rejected => "rejected",
            PaymentStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Approved | PaymentStatus::Rejected | PaymentStatus::Cancelled
        )
    }

    /// Whether the graph allows moving from `self` to `next`.
    ///
    /// pending -> {approved, rejected, cancelled, pending_review}
    /// pending_review -> {approved, rejected, cancelled}
    /// terminal states accept nothing.
    pub fn can_transition_to(&self, next: PaymentStatus) -> bool {
        match self {
            PaymentStatus::Pending => next != PaymentStatus::Pending,
            PaymentStatus::PendingReview => next.is_terminal(),
            PaymentStatus::Approved | PaymentStatus::Rejected | PaymentStatus::Cancelled => false,
        }
    }

    /// Order status a payment entering this status pushes onto its order
    pub fn cascade_target(&self) -> Option<OrderStatus> {
        match self {
            PaymentStatus::Approved => Some(OrderStatus::Approved),
            PaymentStatus::Rejected => Some(OrderStatus::Rejected),
            PaymentStatus::Cancelled => Some(OrderStatus::Cancelled),
            PaymentStatus::Pending | PaymentStatus::PendingReview => None,
        }
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PaymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PaymentStatus::Pending),
            "pending_review" => Ok(PaymentStatus::PendingReview),
            "approved" => Ok(PaymentStatus::Approved),
            "rejected" => Ok(PaymentStatus::Rejected),
            "cancelled" => Ok(PaymentStatus::Cancelled),
            other => Err(format!("unknown payment status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Approved,
    Rejected,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Approved => "approved",
            OrderStatus::Rejected => "rejected",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    /// An approved order never moves again; other orders follow their payment
    pub fn accepts_cascade(&self, next: OrderStatus) -> bool {
        *self != OrderStatus::Approved && *self != next
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OrderStatus::Pending),
            "approved" => Ok(OrderStatus::Approved),
            "rejected" => Ok(OrderStatus::Rejected),
            "cancelled" => Ok(OrderStatus::Cancelled),
            other => Err(format!("unknown order status: {}", other)),
        }
    }
}

/// Outcome of translating a gateway status string
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedStatus {
    pub status: PaymentStatus,
    /// False when the gateway value was not in the table
    pub known: bool,
}

const GATEWAY_STATUS_TABLE: &[(&str, PaymentStatus)] = &[
    ("approved", PaymentStatus::Approved),
    ("rejected", PaymentStatus::Rejected),
    ("cancelled", PaymentStatus::Cancelled),
    ("pending", PaymentStatus::Pending),
    ("authorized", PaymentStatus::Pending),
    ("in_process", PaymentStatus::PendingReview),
    ("in_mediation", PaymentStatus::PendingReview),
    ("pending_review", PaymentStatus::PendingReview),
];

/// Translate a gateway status. Unknown values fall back to pending.
pub fn map_gateway_status(gateway_status: &str) -> MappedStatus {
    let normalized = gateway_status.trim().to_ascii_lowercase();
    GATEWAY_STATUS_TABLE
        .iter()
        .find(|(name, _)| *name == normalized)
        .map(|(_, status)| MappedStatus {
            status: *status,
            known: true,
        })
        .unwrap_or(MappedStatus {
            status: PaymentStatus::Pending,
            known: false,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_table() {
        let cases = [
            ("approved", PaymentStatus::Approved),
            ("rejected", PaymentStatus::Rejected),
            ("cancelled", PaymentStatus::Cancelled),
            ("pending", PaymentStatus::Pending),
            ("authorized", PaymentStatus::Pending),
            ("in_process", PaymentStatus::PendingReview),
            ("in_mediation", PaymentStatus::PendingReview),
            ("pending_review", PaymentStatus::PendingReview),
        ];
        for (gateway, expected) in cases {
            let mapped = map_gateway_status(gateway);
            assert_eq!(mapped.status, expected, "gateway status {}", gateway);
            assert!(mapped.known);
        }
    }

    #[test]
    fn test_unknown_gateway_status_maps_to_pending() {
        let mapped = map_gateway_status("charged_back");
        assert_eq!(mapped.status, PaymentStatus::Pending);
        assert!(!mapped.known);
        assert!(map_gateway_status(" Approved ").known);
    }

    #[test]
    fn test_forward_only_graph() {
        use PaymentStatus::*;

        assert!(Pending.can_transition_to(Approved));
        assert!(Pending.can_transition_to(PendingReview));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(!Pending.can_transition_to(Pending));

        assert!(PendingReview.can_transition_to(Rejected));
        assert!(!PendingReview.can_transition_to(Pending));
        assert!(!PendingReview.can_transition_to(PendingReview));

        for terminal in [Approved, Rejected, Cancelled] {
            for next in [Pending, PendingReview, Approved, Rejected, Cancelled] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_cascade_targets() {
        assert_eq!(
            PaymentStatus::Approved.cascade_target(),
            Some(OrderStatus::Approved)
        );
        assert_eq!(
            PaymentStatus::Cancelled.cascade_target(),
            Some(OrderStatus::Cancelled)
        );
        assert_eq!(PaymentStatus::PendingReview.cascade_target(), None);
    }

    #[test]
    fn test_approved_order_is_terminal_for_cascade() {
        assert!(!OrderStatus::Approved.accepts_cascade(OrderStatus::Rejected));
        assert!(OrderStatus::Rejected.accepts_cascade(OrderStatus::Approved));
        assert!(OrderStatus::Pending.accepts_cascade(OrderStatus::Cancelled));
        assert!(!OrderStatus::Pending.accepts_cascade(OrderStatus::Pending));
    }

    #[test]
    fn test_status_strings_round_trip() {
        for status in [
            PaymentStatus::Pending,
            PaymentStatus::PendingReview,
            PaymentStatus::Approved,
            PaymentStatus::Rejected,
            PaymentStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<PaymentStatus>().unwrap(), status);
        }
        assert!("refunded".parse::<OrderStatus>().is_err());
    }
}
