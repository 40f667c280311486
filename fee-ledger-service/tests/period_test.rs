//! Period query, deletion and health integration tests.
//!
//! Run with: TEST_DATABASE_URL=postgres://... cargo test -p fee-ledger-service -- --ignored

mod common;

use common::{money, TestApp};
use rust_decimal_macros::dec;
use serde_json::{json, Value};

#[tokio::test]
#[ignore] // Requires database
async fn health_and_metrics_endpoints() {
    let app = TestApp::spawn().await;

    let response = app.client.get(app.url("/health")).send().await.unwrap();
    assert_eq!(response.status(), 200);
    assert!(response.headers().contains_key("x-request-id"));
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["service"], "fee-ledger-service");

    let response = app.client.get(app.url("/ready")).send().await.unwrap();
    assert_eq!(response.status(), 200);

    app.open_period(2026, 1).await;
    let metrics = app
        .client
        .get(app.url("/metrics"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(metrics.contains("fee_ledger_rollovers_total"));

    app.cleanup().await;
}

#[tokio::test]
#[ignore]
async fn request_id_is_echoed() {
    let app = TestApp::spawn().await;

    let response = app
        .client
        .get(app.url("/health"))
        .header("x-request-id", "req-1234")
        .send()
        .await
        .unwrap();
    assert_eq!(response.headers()["x-request-id"], "req-1234");

    app.cleanup().await;
}

#[tokio::test]
#[ignore]
async fn delete_period_guards() {
    let app = TestApp::spawn().await;
    let payer = app.create_payer("student", "Ada Obi", "100.00").await;

    let p1 = app.open_period(2026, 1).await;
    app.pay(json!({
        "payer_id": payer,
        "period_id": p1,
        "amount": "10.00",
        "kind": "partial"
    }))
    .await;

    // Active period cannot be deleted.
    let response = app
        .client
        .delete(app.url(&format!("/periods/{}", p1)))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 409);

    app.open_period(2026, 2).await;

    // Payment history requires confirmation.
    let response = app
        .client
        .delete(app.url(&format!("/periods/{}", p1)))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 409);

    let response = app
        .client
        .delete(app.url(&format!(
            "/periods/{}?confirm_payment_history=true",
            p1
        )))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["payments_deleted"], 1);

    let response = app
        .client
        .get(app.url(&format!("/periods/{}/summary", p1)))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    let history: Vec<Value> = app
        .client
        .get(app.url(&format!("/payers/{}/payments", payer)))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(history.is_empty());

    let response = app
        .client
        .delete(app.url(&format!("/periods/{}", uuid::Uuid::new_v4())))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    app.cleanup().await;
}

#[tokio::test]
#[ignore]
async fn period_summary_totals_by_kind() {
    let app = TestApp::spawn().await;
    let a = app.create_payer("student", "Ada Obi", "100.00").await;
    app.create_payer("student", "Tom Eze", "100.00").await;
    app.create_payer("staff", "Lin Ho", "2000.00").await;

    let period = app.open_period(2026, 1).await;
    app.pay(json!({
        "payer_id": a,
        "period_id": period,
        "amount": "100.00",
        "kind": "normal"
    }))
    .await;

    let summary: Value = app
        .client
        .get(app.url(&format!("/periods/{}/summary", period)))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(summary["tuition"]["obligations"], 2);
    assert_eq!(money(&summary["tuition"]["total_due"]), dec!(200));
    assert_eq!(money(&summary["tuition"]["amount_paid"]), dec!(100));
    assert_eq!(money(&summary["tuition"]["outstanding"]), dec!(100));
    assert_eq!(summary["tuition"]["settled_count"], 1);
    assert_eq!(summary["tuition"]["unpaid_count"], 1);
    assert_eq!(summary["salary"]["obligations"], 1);

    app.cleanup().await;
}

#[tokio::test]
#[ignore]
async fn obligation_listing_filters() {
    let app = TestApp::spawn().await;
    let a = app.create_payer("student", "Ada Obi", "100.00").await;
    app.create_payer("student", "Tom Eze", "100.00").await;

    let period = app.open_period(2026, 1).await;
    app.pay(json!({
        "payer_id": a,
        "period_id": period,
        "amount": "100.00",
        "kind": "normal"
    }))
    .await;

    let outstanding: Vec<Value> = app
        .client
        .get(app.url(&format!(
            "/periods/{}/obligations?kind=student&only_outstanding=true",
            period
        )))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(outstanding.len(), 1);
    assert_eq!(outstanding[0]["full_name"], "Tom Eze");

    let searched: Vec<Value> = app
        .client
        .get(app.url(&format!(
            "/periods/{}/obligations?kind=student&search=ada",
            period
        )))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(searched.len(), 1);
    assert_eq!(searched[0]["status"], "paid");

    let paid: Vec<Value> = app
        .client
        .get(app.url(&format!(
            "/periods/{}/obligations?kind=student&status=paid",
            period
        )))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(paid.len(), 1);

    app.cleanup().await;
}
