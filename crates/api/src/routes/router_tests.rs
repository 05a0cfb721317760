//! Router tests against the in-memory store
//!
//! Tests cover:
//! - Acknowledge-before-process on the gateway webhook
//! - Credential, body and rate-limit rejections
//! - Admin secret lifecycle, event listing and invariants
//! - Record, order and dispatch endpoints

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::{
        body::Body,
        http::{header, HeaderMap, Request, StatusCode},
        middleware::from_fn,
        Router,
    };
    use hookrelay_reconcile::{
        model::{product, EventOutcome, NewOrder, OrderItem},
        store::CommerceStore,
        GatewayPayment, InMemoryStore, OrderStatus, PaymentGateway, PaymentStatus, ReconcileError,
        ReconcileResult, ReconcileServices, Stores, TenantBinding,
    };
    use hookrelay_shared::RateLimiter;
    use tokio::sync::Notify;
    use tower::ServiceExt;
    use uuid::Uuid;

    use crate::{
        config::{Config, StoreBackend, DEFAULT_WEBHOOK_BODY_LIMIT},
        routes::create_router,
        security::security_headers_middleware,
        state::AppState,
    };

    const JWT_SECRET: &str = "router-test-secret";

    /// Answers from a map of payments
    #[derive(Default)]
    struct MapGateway {
        payments: Mutex<HashMap<String, GatewayPayment>>,
    }

    impl MapGateway {
        fn with(id: &str, status: &str, reference: &str) -> Self {
            let payment: GatewayPayment = serde_json::from_value(serde_json::json!({
                "id": id,
                "status": status,
                "external_reference": reference,
                "date_approved": "2024-01-01T10:00:00Z",
                "transaction_amount": 99.9,
            }))
            .unwrap();
            let gateway = Self::default();
            gateway
                .payments
                .lock()
                .unwrap()
                .insert(id.to_string(), payment);
            gateway
        }
    }

    #[async_trait]
    impl PaymentGateway for MapGateway {
        async fn fetch_payment(&self, external_id: &str) -> ReconcileResult<GatewayPayment> {
            self.payments
                .lock()
                .unwrap()
                .get(external_id)
                .cloned()
                .ok_or_else(|| ReconcileError::GatewayRejected {
                    status: 404,
                    message: "not found".to_string(),
                })
        }
    }

    /// Never answers until released
    #[derive(Default)]
    struct BlockedGateway {
        release: Notify,
    }

    #[async_trait]
    impl PaymentGateway for BlockedGateway {
        async fn fetch_payment(&self, _external_id: &str) -> ReconcileResult<GatewayPayment> {
            self.release.notified().await;
            Err(ReconcileError::GatewayUnavailable("released".to_string()))
        }
    }

    struct TestApp {
        router: Router,
        state: AppState,
        store: Arc<InMemoryStore>,
    }

    impl TestApp {
        fn new(gateway: Arc<dyn PaymentGateway>) -> Self {
            Self::with_store(Arc::new(InMemoryStore::new()), gateway)
        }

        fn with_store(store: Arc<InMemoryStore>, gateway: Arc<dyn PaymentGateway>) -> Self {
            let config = Config {
                store: StoreBackend::Memory,
                bind_address: "127.0.0.1:0".to_string(),
                jwt_secret: JWT_SECRET.to_string(),
                gateway_base_url: "http://127.0.0.1:9".to_string(),
                gateway_access_token: "test".to_string(),
                redis_url: None,
                allowed_origins: vec![],
                webhook_body_limit_bytes: DEFAULT_WEBHOOK_BODY_LIMIT,
                run_migrations: false,
            };
            let services =
                ReconcileServices::new(Stores::in_memory(store.clone()), gateway).unwrap();
            let state = AppState::new(config, services, RateLimiter::new_in_memory(), None);
            let router = create_router(state.clone()).layer(from_fn(security_headers_middleware));
            Self {
                router,
                state,
                store,
            }
        }

        async fn binding(&self, product: &str) -> (TenantBinding, String) {
            let binding = self.store.add_binding(Uuid::new_v4(), product).await;
            let token = self
                .state
                .services
                .credentials
                .issue(binding.id)
                .await
                .unwrap()
                .into_inner();
            (binding, token)
        }

        fn admin_token(&self, role: &str) -> String {
            self.state
                .jwt_manager
                .issue("ops@example.com", role, time::Duration::hours(1))
                .unwrap()
        }

        async fn send(&self, request: Request<Body>) -> (StatusCode, HeaderMap, serde_json::Value) {
            let response = self.router.clone().oneshot(request).await.unwrap();
            let status = response.status();
            let headers = response.headers().clone();
            let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
                .await
                .unwrap();
            let body = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
            (status, headers, body)
        }

        async fn post(&self, uri: &str, body: &str) -> (StatusCode, HeaderMap, serde_json::Value) {
            self.send(
                Request::post(uri)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
        }

        async fn admin(
            &self,
            method: &str,
            uri: &str,
            body: Option<serde_json::Value>,
        ) -> (StatusCode, HeaderMap, serde_json::Value) {
            let request = Request::builder()
                .method(method)
                .uri(uri)
                .header(
                    header::AUTHORIZATION,
                    format!("Bearer {}", self.admin_token("admin")),
                )
                .header(header::CONTENT_TYPE, "application/json")
                .body(match body {
                    Some(body) => Body::from(body.to_string()),
                    None => Body::empty(),
                })
                .unwrap();
            self.send(request).await
        }
    }

    async fn wait_for<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..100 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_gateway_webhook_acknowledges_before_reconciling() {
        let gateway = Arc::new(BlockedGateway::default());
        let app = TestApp::new(gateway.clone());
        let (binding, token) = app.binding(product::COMMERCE).await;

        let (status, _, body) = tokio::time::timeout(
            Duration::from_secs(2),
            app.post(
                &format!("/api/v1/webhooks/gateway?token={}", token),
                r#"{"type":"payment","data":{"id":"X123"}}"#,
            ),
        )
        .await
        .expect("acknowledgment must not wait for the gateway");

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["received"], true);

        let events = app.store.events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].binding_id, binding.id);
        assert_eq!(events[0].outcome(), EventOutcome::Pending);

        gateway.release.notify_one();
        let store = app.store.clone();
        wait_for(|| {
            let store = store.clone();
            async move { store.events().await[0].outcome() == EventOutcome::Failed }
        })
        .await;
    }

    #[tokio::test]
    async fn test_gateway_webhook_reconciles_in_background() {
        let app_store = Arc::new(InMemoryStore::new());
        let binding = app_store.add_binding(Uuid::new_v4(), product::COMMERCE).await;
        let (order, payment) = app_store
            .create_order(&NewOrder {
                binding_id: binding.id,
                customer_name: "Ana Souza".to_string(),
                customer_email: "ana@example.com".to_string(),
                customer_phone: None,
                items: vec![OrderItem {
                    name: "Camiseta".to_string(),
                    quantity: 1,
                    unit_price_cents: 9_990,
                }],
                discount_cents: 0,
                payment_method: "pix".to_string(),
            })
            .await
            .unwrap();

        let payment_id = payment.id;
        let gateway = Arc::new(MapGateway::with("X123", "approved", &order.id.to_string()));
        let app = TestApp::with_store(app_store.clone(), gateway);
        let token = app
            .state
            .services
            .credentials
            .issue(binding.id)
            .await
            .unwrap()
            .into_inner();

        let (status, _, _) = app
            .post(
                &format!("/api/v1/webhooks/gateway?token={}", token),
                r#"{"action":"payment.updated","data":{"id":"X123"}}"#,
            )
            .await;
        assert_eq!(status, StatusCode::OK);

        let store = app_store.clone();
        wait_for(|| {
            let store = store.clone();
            async move {
                store
                    .payments()
                    .await
                    .iter()
                    .any(|p| p.id == payment_id && p.status == PaymentStatus::Approved)
            }
        })
        .await;
        wait_for(|| {
            let store = app_store.clone();
            async move { store.events().await[0].outcome() == EventOutcome::Succeeded }
        })
        .await;
        assert_eq!(app_store.events().await.len(), 1);
        assert_eq!(app_store.orders().await[0].status, OrderStatus::Approved);
    }

    #[tokio::test]
    async fn test_gateway_webhook_rejects_bad_credentials() {
        let app = TestApp::new(Arc::new(MapGateway::default()));
        let (_, finance_token) = app.binding(product::FINANCE).await;
        let body = r#"{"data":{"id":"1"}}"#;

        for uri in [
            "/api/v1/webhooks/gateway".to_string(),
            "/api/v1/webhooks/gateway?token=".to_string(),
            "/api/v1/webhooks/gateway?token=not-a-real-token".to_string(),
            format!("/api/v1/webhooks/gateway?token={}", finance_token),
        ] {
            let (status, _, body) = app.post(&uri, body).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED, "{}", uri);
            assert_eq!(body["code"], 401);
        }
        assert!(app.store.events().await.is_empty());
    }

    #[tokio::test]
    async fn test_deactivated_binding_is_unauthorized() {
        let app = TestApp::new(Arc::new(MapGateway::default()));
        let (binding, token) = app.binding(product::COMMERCE).await;
        app.store.deactivate_binding(binding.id).await;

        let (status, _, _) = app
            .post(&format!("/api/v1/webhooks/gateway?token={}", token), "{}")
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_malformed_body_is_bad_request() {
        let app = TestApp::new(Arc::new(MapGateway::default()));
        let (_, token) = app.binding(product::COMMERCE).await;

        let (status, _, body) = app
            .post(&format!("/api/v1/webhooks/gateway?token={}", token), "{not json")
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], 400);
        assert!(app.store.events().await.is_empty());
    }

    #[tokio::test]
    async fn test_notification_without_payment_id_is_ignored() {
        let app = TestApp::new(Arc::new(MapGateway::default()));
        let (_, token) = app.binding(product::COMMERCE).await;

        let (status, _, _) = app
            .post(
                &format!("/api/v1/webhooks/gateway?token={}", token),
                r#"{"topic":"merchant_order","resource":"https://example.com/orders/1"}"#,
            )
            .await;
        assert_eq!(status, StatusCode::OK);

        let events = app.store.events().await;
        assert_eq!(events[0].outcome(), EventOutcome::Failed);
        assert_eq!(
            events[0].processing_error.as_deref(),
            Some("ignored: no payment id")
        );
    }

    #[tokio::test]
    async fn test_oversized_body_is_rejected() {
        let app = TestApp::new(Arc::new(MapGateway::default()));
        let (_, token) = app.binding(product::COMMERCE).await;

        let padding = "x".repeat(DEFAULT_WEBHOOK_BODY_LIMIT + 1);
        let (status, _, _) = app
            .post(
                &format!("/api/v1/webhooks/gateway?token={}", token),
                &format!(r#"{{"data":{{"id":"1"}},"pad":"{}"}}"#, padding),
            )
            .await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert!(app.store.events().await.is_empty());
    }

    #[tokio::test]
    async fn test_rotation_invalidates_old_token() {
        let app = TestApp::new(Arc::new(MapGateway::default()));
        let (binding, old_token) = app.binding(product::COMMERCE).await;

        let (status, _, body) = app
            .admin(
                "POST",
                &format!("/api/v1/admin/bindings/{}/webhook-secret", binding.id),
                Some(serde_json::json!({"action": "rotate"})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        let new_token = body["webhook_secret"].as_str().unwrap().to_string();
        assert_ne!(new_token, old_token);
        assert_eq!(new_token.len(), 43);

        let (status, _, _) = app
            .post(&format!("/api/v1/webhooks/gateway?token={}", old_token), "{}")
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _, _) = app
            .post(&format!("/api/v1/webhooks/gateway?token={}", new_token), "{}")
            .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_admin_secret_get_and_ensure() {
        let app = TestApp::new(Arc::new(MapGateway::default()));
        let binding = app.store.add_binding(Uuid::new_v4(), product::CRM).await;
        let uri = format!("/api/v1/admin/bindings/{}/webhook-secret", binding.id);

        let (status, _, body) = app
            .admin("POST", &uri, Some(serde_json::json!({"action": "get"})))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["webhook_secret"].is_null());

        let (_, _, ensured) = app
            .admin("POST", &uri, Some(serde_json::json!({"action": "ensure"})))
            .await;
        let (_, _, again) = app
            .admin("POST", &uri, Some(serde_json::json!({"action": "ensure"})))
            .await;
        assert!(ensured["webhook_secret"].is_string());
        assert_eq!(ensured["webhook_secret"], again["webhook_secret"]);

        let (status, _, _) = app
            .admin("POST", &uri, Some(serde_json::json!({"action": "delete"})))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_admin_unknown_binding_is_not_found() {
        let app = TestApp::new(Arc::new(MapGateway::default()));
        let (status, _, _) = app
            .admin(
                "POST",
                &format!("/api/v1/admin/bindings/{}/webhook-secret", Uuid::new_v4()),
                Some(serde_json::json!({"action": "ensure"})),
            )
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_admin_requires_admin_role() {
        let app = TestApp::new(Arc::new(MapGateway::default()));

        let (status, _, _) = app
            .send(
                Request::get("/api/v1/admin/events")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _, _) = app
            .send(
                Request::get("/api/v1/admin/events")
                    .header(
                        header::AUTHORIZATION,
                        format!("Bearer {}", app.admin_token("support")),
                    )
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_admin_rate_limit_applies_before_auth() {
        let app = TestApp::new(Arc::new(MapGateway::default()));
        let request = || {
            Request::get("/api/v1/admin/events")
                .header("x-forwarded-for", "198.51.100.9")
                .body(Body::empty())
                .unwrap()
        };

        for _ in 0..10 {
            let (status, _, _) = app.send(request()).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED);
        }

        let (status, headers, body) = app.send(request()).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        let retry_after: u64 = headers[header::RETRY_AFTER]
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!((1..=60).contains(&retry_after));
        assert_eq!(body["retryAfter"], retry_after);

        // Other clients are unaffected
        let (status, _, _) = app
            .send(
                Request::get("/api/v1/admin/events")
                    .header("x-forwarded-for", "198.51.100.10")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_admin_lists_events_by_status() {
        let app = TestApp::new(Arc::new(MapGateway::default()));
        let (binding, token) = app.binding(product::COMMERCE).await;
        app.post(
            &format!("/api/v1/webhooks/gateway?token={}", token),
            r#"{"topic":"merchant_order"}"#,
        )
        .await;

        let (status, _, body) = app
            .admin(
                "GET",
                &format!("/api/v1/admin/events?binding_id={}&status=failed", binding.id),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);

        let (status, _, _) = app
            .admin("GET", "/api/v1/admin/events?status=exploded", None)
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_invariants_need_postgres() {
        let app = TestApp::new(Arc::new(MapGateway::default()));
        let (status, _, body) = app.admin("GET", "/api/v1/admin/invariants", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["code"], 503);
    }

    #[tokio::test]
    async fn test_financial_records_webhook() {
        let app = TestApp::new(Arc::new(MapGateway::default()));
        let (binding, token) = app.binding(product::FINANCE).await;
        let uri = format!("/api/v1/webhooks/records/financial?token={}", token);

        let (status, _, body) = app
            .post(&uri, r#"{"tipo":"despesa","categoria":"luz","valor":120}"#)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["operation"], "add");
        assert_eq!(body["inserted"], 1);

        let (_, _, body) = app
            .post(
                &uri,
                r#"{"operacao":"substituir","tipo":"despesa","categoria":"luz","valor":90}"#,
            )
            .await;
        assert_eq!(body["deleted"], 1);
        assert_eq!(body["inserted"], 1);

        let (status, _, body) = app
            .post(&uri, r#"{"operacao":"explodir","valor":"muito"}"#)
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let fields: Vec<&str> = body["details"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|d| d["field"].as_str())
            .collect();
        assert!(fields.contains(&"operation"));
        assert!(fields.contains(&"amount"));

        let events = app.store.events().await;
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|e| e.binding_id == binding.id));
        assert_eq!(
            events
                .iter()
                .filter(|e| e.outcome() == EventOutcome::Failed)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_contact_route_requires_crm_binding() {
        let app = TestApp::new(Arc::new(MapGateway::default()));
        let (_, finance_token) = app.binding(product::FINANCE).await;

        let (status, _, _) = app
            .post(
                &format!("/api/v1/webhooks/records/contacts?token={}", finance_token),
                r#"{"telefone":"+5511999990000"}"#,
            )
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_create_order() {
        let app = TestApp::new(Arc::new(MapGateway::default()));
        let (_, token) = app.binding(product::COMMERCE).await;
        let uri = format!("/api/v1/orders?token={}", token);

        let (status, _, body) = app
            .post(
                &uri,
                r#"{
                    "customer_name": "Ana Souza",
                    "customer_email": "ana@example.com",
                    "items": [{"name": "Camiseta", "quantity": 2, "unit_price_cents": 5000}],
                    "discount_cents": 1000
                }"#,
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["total_cents"], 9_000);
        assert_eq!(body["payment_status"], "pending");

        let (status, _, body) = app
            .post(
                &uri,
                r#"{"customer_name": "A", "customer_email": "nope", "items": []}"#,
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["details"].as_array().unwrap().len() >= 3);
    }

    #[tokio::test]
    async fn test_dispatch_passes_downstream_response_through() {
        let mut server = mockito::Server::new_async().await;
        let app = TestApp::new(Arc::new(MapGateway::default()));
        let (binding, token) = app.binding(product::MESSAGING).await;
        app.store
            .set_downstream_target(binding.id, &server.url(), "worker-secret")
            .await;
        let mock = server
            .mock("POST", "/webhooks/whatsapp")
            .match_header("authorization", "Bearer worker-secret")
            .with_status(202)
            .with_header("content-type", "application/json")
            .with_body(r#"{"queued":true}"#)
            .create_async()
            .await;

        let (status, headers, body) = app
            .post(
                &format!("/api/v1/webhooks/dispatch/whatsapp?token={}", token),
                r#"{"message":"oi"}"#,
            )
            .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(headers[header::CONTENT_TYPE], "application/json");
        assert_eq!(body["queued"], true);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_dispatch_without_target_is_not_found() {
        let app = TestApp::new(Arc::new(MapGateway::default()));
        let (_, token) = app.binding(product::MESSAGING).await;

        let (status, _, _) = app
            .post(
                &format!("/api/v1/webhooks/dispatch/whatsapp?token={}", token),
                "{}",
            )
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(
            app.store.events().await[0].outcome(),
            EventOutcome::Failed
        );
    }

    #[tokio::test]
    async fn test_health_carries_security_headers() {
        let app = TestApp::new(Arc::new(MapGateway::default()));
        let (status, headers, body) = app
            .send(Request::get("/health").body(Body::empty()).unwrap())
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(headers[header::X_CONTENT_TYPE_OPTIONS], "nosniff");
        assert_eq!(headers[header::X_FRAME_OPTIONS], "DENY");
    }
}
