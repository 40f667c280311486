//! Period rollover integration tests.
//!
//! Run with: TEST_DATABASE_URL=postgres://... cargo test -p fee-ledger-service -- --ignored

mod common;

use common::{hold_rollover_lock, money, TestApp};
use fee_ledger_service::config::LedgerPolicyConfig;
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use sqlx::Connection;

#[tokio::test]
#[ignore] // Requires database
async fn first_rollover_bills_base_amount() {
    let app = TestApp::spawn().await;
    let payer = app.create_payer("student", "Ada Obi", "100.00").await;

    let response = app.post_period(2026, 1).await;
    assert_eq!(response.status(), 201);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["period"]["is_active"], true);
    assert_eq!(body["summary"]["tuition"]["obligations_generated"], 1);
    assert!(body["message"].as_str().unwrap().contains("2026-01"));

    let period_id = body["period"]["period_id"].as_str().unwrap().parse().unwrap();
    let obligation = app.obligation(period_id, "student", payer).await;
    assert_eq!(obligation["status"], "unpaid");
    assert_eq!(money(&obligation["total_due"]), dec!(100));
    assert_eq!(money(&obligation["outstanding"]), dec!(100));
    assert_eq!(money(&obligation["carried_forward_amount"]), dec!(0));

    app.cleanup().await;
}

#[tokio::test]
#[ignore]
async fn unpaid_balance_carries_forward() {
    let app = TestApp::spawn().await;
    let payer = app.create_payer("student", "Ada Obi", "100.00").await;

    let p1 = app.open_period(2026, 1).await;
    let response = app
        .pay(json!({
            "payer_id": payer,
            "period_id": p1,
            "amount": "60.00",
            "kind": "partial"
        }))
        .await;
    assert_eq!(response.status(), 201);

    let p2 = app.open_period(2026, 2).await;
    let obligation = app.obligation(p2, "student", payer).await;
    assert_eq!(money(&obligation["carried_forward_amount"]), dec!(40));
    assert_eq!(money(&obligation["total_due"]), dec!(140));
    assert_eq!(money(&obligation["outstanding"]), dec!(140));
    assert_eq!(obligation["status"], "unpaid");

    let prior = app.obligation(p1, "student", payer).await;
    assert_eq!(prior["carried_forward_to"], obligation["obligation_id"]);

    app.cleanup().await;
}

#[tokio::test]
#[ignore]
async fn advance_credit_covers_three_periods_then_lapses() {
    let app = TestApp::spawn().await;
    let payer = app.create_payer("student", "Yara Bello", "100.00").await;

    let p0 = app.open_period(2026, 1).await;
    let response = app
        .pay(json!({
            "payer_id": payer,
            "period_id": p0,
            "amount": "300.00",
            "kind": "advance",
            "advance_periods": 3
        }))
        .await;
    assert_eq!(response.status(), 201);
    let receipt: Value = response.json().await.unwrap();
    assert_eq!(money(&receipt["remaining_balance"]), dec!(0));
    assert_eq!(receipt["obligation"]["status"], "advanced");
    assert_eq!(receipt["obligation"]["advance_periods_remaining"], 3);

    let mut remaining = Vec::new();
    for month in 2..=4 {
        let period = app.open_period(2026, month).await;
        let obligation = app.obligation(period, "student", payer).await;
        assert_eq!(obligation["status"], "paid");
        assert_eq!(money(&obligation["total_due"]), dec!(0));
        assert_eq!(money(&obligation["outstanding"]), dec!(0));
        remaining.push(obligation["advance_periods_remaining"].as_i64().unwrap());
    }
    assert_eq!(remaining, vec![2, 1, 0]);

    let credit: Value = app.advance_credit(payer).await.json().await.unwrap();
    assert_eq!(credit["periods_paid"], 3);
    assert_eq!(credit["periods_remaining"], 0);

    let p5 = app.open_period(2026, 5).await;
    let obligation = app.obligation(p5, "student", payer).await;
    assert_eq!(obligation["status"], "unpaid");
    assert_eq!(money(&obligation["total_due"]), dec!(100));

    app.cleanup().await;
}

#[tokio::test]
#[ignore]
async fn duplicate_period_is_conflict_without_writes() {
    let app = TestApp::spawn().await;
    app.create_payer("student", "Ada Obi", "100.00").await;

    let p1 = app.open_period(2026, 3).await;
    let response = app.post_period(2026, 3).await;
    assert_eq!(response.status(), 409);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["kind"], "conflict");
    assert_eq!(body["retryable"], false);

    let periods: Vec<Value> = app
        .client
        .get(app.url("/periods"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(periods.len(), 1);

    let active: Value = app
        .client
        .get(app.url("/periods/active"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(active["period_id"], json!(p1.to_string()));

    app.cleanup().await;
}

#[tokio::test]
#[ignore]
async fn invalid_month_is_validation_error() {
    let app = TestApp::spawn().await;

    let response = app.post_period(2026, 13).await;
    assert_eq!(response.status(), 422);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["kind"], "validation");

    app.cleanup().await;
}

#[tokio::test]
#[ignore]
async fn rollover_keeps_exactly_one_active_period() {
    let app = TestApp::spawn().await;

    for month in 1..=3 {
        app.open_period(2026, month).await;
    }

    let periods: Vec<Value> = app
        .client
        .get(app.url("/periods"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let active: Vec<&Value> = periods.iter().filter(|p| p["is_active"] == true).collect();
    assert_eq!(periods.len(), 3);
    assert_eq!(active.len(), 1);
    assert_eq!(active[0]["month"], 3);

    app.cleanup().await;
}

#[tokio::test]
#[ignore]
async fn concurrent_rollovers_serialize() {
    let app = TestApp::spawn().await;
    app.create_payer("student", "Ada Obi", "100.00").await;
    app.create_payer("staff", "Lin Ho", "2000.00").await;

    let (a, b, c) = tokio::join!(
        app.post_period(2026, 6),
        app.post_period(2026, 7),
        app.post_period(2026, 7),
    );
    let mut statuses = vec![a.status().as_u16(), b.status().as_u16(), c.status().as_u16()];
    statuses.sort();
    assert_eq!(statuses, vec![201, 201, 409]);

    let periods: Vec<Value> = app
        .client
        .get(app.url("/periods"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(periods.len(), 2);
    assert_eq!(periods.iter().filter(|p| p["is_active"] == true).count(), 1);

    app.cleanup().await;
}

#[tokio::test]
#[ignore]
async fn suspended_payers_are_not_billed() {
    let app = TestApp::spawn().await;
    let active = app.create_payer("student", "Ada Obi", "100.00").await;
    let suspended = app.create_payer("student", "Tom Eze", "100.00").await;
    app.suspend_payer(suspended).await;

    let response = app.post_period(2026, 1).await;
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["summary"]["tuition"]["obligations_generated"], 1);

    let period_id = body["period"]["period_id"].as_str().unwrap().parse().unwrap();
    let obligation = app.obligation(period_id, "student", active).await;
    assert_eq!(obligation["status"], "unpaid");

    app.cleanup().await;
}

#[tokio::test]
#[ignore]
async fn staff_salary_partial_advance_reduces_due() {
    let app = TestApp::spawn().await;
    let staff = app.create_payer("staff", "Lin Ho", "2000.00").await;

    let p1 = app.open_period(2026, 1).await;
    let obligation = app.obligation(p1, "staff", staff).await;
    assert_eq!(obligation["status"], "unpaid");

    let response = app
        .pay(json!({
            "payer_id": staff,
            "period_id": p1,
            "amount": "2000.00",
            "kind": "normal"
        }))
        .await;
    assert_eq!(response.status(), 201);

    // Advance bought at the current salary, then salary raised.
    let response = app
        .pay(json!({
            "payer_id": staff,
            "period_id": p1,
            "amount": "2000.00",
            "kind": "advance",
            "advance_periods": 1
        }))
        .await;
    assert_eq!(response.status(), 201);

    let response = app
        .client
        .patch(app.url(&format!("/payers/{}", staff)))
        .json(&json!({ "base_amount": "2500.00" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let p2 = app.open_period(2026, 2).await;
    let obligation = app.obligation(p2, "staff", staff).await;
    assert_eq!(money(&obligation["advance_applied_amount"]), dec!(2000));
    assert_eq!(money(&obligation["total_due"]), dec!(500));
    assert_eq!(obligation["status"], "advance_applied");

    app.cleanup().await;
}

#[tokio::test]
#[ignore]
async fn backfilled_period_does_not_carry_the_same_debt_twice() {
    let app = TestApp::spawn().await;
    let payer = app.create_payer("student", "Ada Obi", "100.00").await;

    let jan = app.open_period(2026, 1).await;
    let mar = app.open_period(2026, 3).await;
    let feb = app.open_period(2026, 2).await;

    let jan_row = app.obligation(jan, "student", payer).await;
    let mar_row = app.obligation(mar, "student", payer).await;
    let feb_row = app.obligation(feb, "student", payer).await;

    // January's debt went to March and stays linked there.
    assert_eq!(jan_row["carried_forward_to"], mar_row["obligation_id"]);
    assert_eq!(money(&mar_row["carried_forward_amount"]), dec!(100));
    assert_eq!(money(&feb_row["carried_forward_amount"]), dec!(0));
    assert_eq!(money(&feb_row["total_due"]), dec!(100));

    let billed = money(&feb_row["total_due"]) + money(&mar_row["total_due"]);
    assert_eq!(billed, dec!(300));

    app.cleanup().await;
}

#[tokio::test]
#[ignore]
async fn lock_timeout_is_transient() {
    let app = TestApp::spawn_with_policy(LedgerPolicyConfig {
        lock_timeout_ms: 200,
        ..LedgerPolicyConfig::default()
    })
    .await;

    let lock = hold_rollover_lock().await;
    let response = app.post_period(2026, 1).await;
    lock.close().await.ok();

    assert_eq!(response.status(), 503);
    assert_eq!(response.headers()["retry-after"], "1");
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["kind"], "transient");
    assert_eq!(body["retryable"], true);

    // Nothing was written; the same request succeeds once the lock is free.
    assert_eq!(app.post_period(2026, 1).await.status(), 201);

    app.cleanup().await;
}

#[tokio::test]
#[ignore]
async fn transaction_deadline_is_transient() {
    let app = TestApp::spawn_with_policy(LedgerPolicyConfig {
        transaction_timeout_ms: 300,
        lock_timeout_ms: 5_000,
        ..LedgerPolicyConfig::default()
    })
    .await;

    let lock = hold_rollover_lock().await;
    let response = app.post_period(2026, 1).await;
    lock.close().await.ok();

    assert_eq!(response.status(), 503);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["kind"], "transient");
    assert_eq!(body["retryable"], true);

    let periods: Vec<Value> = app
        .client
        .get(app.url("/periods"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(periods.is_empty());

    app.cleanup().await;
}
