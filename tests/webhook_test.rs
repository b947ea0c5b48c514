mod common;

use axum::http::StatusCode;
use serde_json::json;
use storefront_payments::entities::{OrderStatus, PaymentLogStatus, PaymentStatus};
use storefront_payments::gateway::signature::webhook_signature;

use common::{payment_event, read_json, sign_payment, TestApp, WEBHOOK_SECRET};

#[tokio::test]
async fn unsigned_or_forged_webhooks_are_rejected() {
    let app = TestApp::new().await;
    let checkout = app.checkout().await;
    let raw = serde_json::to_vec(&payment_event(
        "payment.captured",
        &checkout.gateway_order_id,
        "pay_forged",
    ))
    .unwrap();

    let missing = app.post_webhook_raw(raw.clone(), None).await;
    assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(read_json(missing).await["code"], "INVALID_WEBHOOK_SIGNATURE");

    let forged = webhook_signature("not_the_webhook_secret", &raw);
    let response = app.post_webhook_raw(raw, Some(&forged)).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let order = app.order(checkout.order_id).await;
    assert_eq!(order.payment_status, PaymentStatus::Pending);
    let rejections = app
        .security_actions()
        .await
        .into_iter()
        .filter(|action| action == "INVALID_WEBHOOK_SIGNATURE")
        .count();
    assert_eq!(rejections, 2);
}

#[tokio::test]
async fn signature_covers_the_exact_bytes() {
    let app = TestApp::new().await;
    let checkout = app.checkout().await;
    let raw = serde_json::to_vec(&payment_event(
        "payment.captured",
        &checkout.gateway_order_id,
        "pay_reencoded",
    ))
    .unwrap();
    let signature = webhook_signature(WEBHOOK_SECRET, &raw);

    let mut altered = raw.clone();
    altered.push(b'\n');
    let response = app.post_webhook_raw(altered, Some(&signature)).await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn signed_but_malformed_payload_is_a_bad_request() {
    let app = TestApp::new().await;

    let raw = br#"{"event":"payment.captured","payload":{}}"#.to_vec();
    let signature = webhook_signature(WEBHOOK_SECRET, &raw);
    let response = app.post_webhook_raw(raw, Some(&signature)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(read_json(response).await["code"], "MALFORMED_PAYLOAD");

    let raw = b"not json at all".to_vec();
    let signature = webhook_signature(WEBHOOK_SECRET, &raw);
    let response = app.post_webhook_raw(raw, Some(&signature)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn captured_webhook_settles_a_pending_order() {
    let app = TestApp::new().await;
    let checkout = app.checkout().await;

    let response = app
        .post_webhook(&payment_event(
            "payment.captured",
            &checkout.gateway_order_id,
            "pay_from_webhook",
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let ack = read_json(response).await;
    assert_eq!(ack["status"], "processed");
    assert_eq!(ack["event"], "payment.captured");

    let order = app.order(checkout.order_id).await;
    assert_eq!(order.status, OrderStatus::Confirmed);
    assert_eq!(order.payment_status, PaymentStatus::Paid);
    let logs = app.payment_logs(checkout.order_id).await;
    assert_eq!(logs[0].status, PaymentLogStatus::Paid);
    assert_eq!(logs[0].razorpay_payment_id.as_deref(), Some("pay_from_webhook"));
    assert_eq!(
        logs[0].gateway_response.as_ref().unwrap()["id"],
        "pay_from_webhook"
    );

    // The browser arriving second sees the settled payment.
    let signature = sign_payment(&checkout.gateway_order_id, "pay_from_webhook");
    let verified = app
        .verify(&checkout.token, &checkout.gateway_order_id, "pay_from_webhook", &signature)
        .await;
    assert_eq!(verified.status(), StatusCode::OK);
    assert_eq!(read_json(verified).await["data"]["already_processed"], true);
}

#[tokio::test]
async fn webhook_after_verification_changes_nothing() {
    let app = TestApp::new().await;
    let checkout = app.checkout().await;
    let signature = sign_payment(&checkout.gateway_order_id, "pay_browser_first");
    let verified = app
        .verify(&checkout.token, &checkout.gateway_order_id, "pay_browser_first", &signature)
        .await;
    assert_eq!(verified.status(), StatusCode::OK);
    let before = app.payment_logs(checkout.order_id).await;

    let response = app
        .post_webhook(&payment_event(
            "payment.captured",
            &checkout.gateway_order_id,
            "pay_browser_first",
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(read_json(response).await["status"], "already_processed");

    assert_eq!(app.payment_logs(checkout.order_id).await, before);
}

#[tokio::test]
async fn order_paid_event_settles_by_gateway_order() {
    let app = TestApp::new().await;
    let checkout = app.checkout().await;
    let mut event = payment_event("order.paid", &checkout.gateway_order_id, "pay_order_paid");
    event["payload"]["order"] = json!({
        "entity": {
            "id": checkout.gateway_order_id,
            "amount": 123000,
            "status": "paid",
        }
    });

    let response = app.post_webhook(&event).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(read_json(response).await["status"], "processed");
    assert_eq!(
        app.order(checkout.order_id).await.payment_status,
        PaymentStatus::Paid
    );
}

#[tokio::test]
async fn concurrent_verification_and_webhook_settle_once() {
    let app = TestApp::new().await;
    let checkout = app.checkout().await;
    let signature = sign_payment(&checkout.gateway_order_id, "pay_race");
    let event = payment_event("payment.captured", &checkout.gateway_order_id, "pay_race");

    let (verified, webhook) = tokio::join!(
        app.verify(&checkout.token, &checkout.gateway_order_id, "pay_race", &signature),
        app.post_webhook(&event),
    );

    assert_eq!(verified.status(), StatusCode::OK);
    assert_eq!(webhook.status(), StatusCode::OK);
    let outcome = read_json(verified).await;
    let ack = read_json(webhook).await;
    let settled_by_verify = outcome["data"]["already_processed"] == false;
    let settled_by_webhook = ack["status"] == "processed";
    assert!(settled_by_verify ^ settled_by_webhook);

    let order = app.order(checkout.order_id).await;
    assert_eq!(order.status, OrderStatus::Confirmed);
    assert_eq!(order.payment_status, PaymentStatus::Paid);
    let paid: Vec<_> = app
        .payment_logs(checkout.order_id)
        .await
        .into_iter()
        .filter(|log| log.status == PaymentLogStatus::Paid)
        .collect();
    assert_eq!(paid.len(), 1);
    assert_eq!(app.product(checkout.product.id).await.stock, 4);
}

#[tokio::test]
async fn failed_payment_cancels_the_order_and_restocks() {
    let app = TestApp::new().await;
    let checkout = app.checkout().await;
    let event = payment_event("payment.failed", &checkout.gateway_order_id, "pay_declined");

    let response = app.post_webhook(&event).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(read_json(response).await["status"], "processed");

    let logs = app.payment_logs(checkout.order_id).await;
    assert_eq!(logs[0].status, PaymentLogStatus::Failed);
    assert_eq!(
        logs[0].failure_reason.as_deref(),
        Some("BAD_REQUEST_ERROR: Payment declined by bank")
    );
    let order = app.order(checkout.order_id).await;
    assert_eq!(order.status, OrderStatus::Cancelled);
    assert_eq!(order.payment_status, PaymentStatus::Failed);
    assert_eq!(app.product(checkout.product.id).await.stock, 5);

    let replay = app.post_webhook(&event).await;
    assert_eq!(replay.status(), StatusCode::OK);
    assert_eq!(read_json(replay).await["status"], "already_processed");
    assert_eq!(app.product(checkout.product.id).await.stock, 5);
}

#[tokio::test]
async fn failure_report_never_undoes_a_settled_payment() {
    let app = TestApp::new().await;
    let checkout = app.checkout().await;
    let signature = sign_payment(&checkout.gateway_order_id, "pay_settled");
    let verified = app
        .verify(&checkout.token, &checkout.gateway_order_id, "pay_settled", &signature)
        .await;
    assert_eq!(verified.status(), StatusCode::OK);

    let response = app
        .post_webhook(&payment_event(
            "payment.failed",
            &checkout.gateway_order_id,
            "pay_settled",
        ))
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(read_json(response).await["status"], "already_processed");
    let order = app.order(checkout.order_id).await;
    assert_eq!(order.payment_status, PaymentStatus::Paid);
    assert_eq!(order.status, OrderStatus::Confirmed);
}

#[tokio::test]
async fn capture_after_cancellation_is_flagged_not_applied() {
    let app = TestApp::new().await;
    let checkout = app.checkout().await;
    app.post_webhook(&payment_event(
        "payment.failed",
        &checkout.gateway_order_id,
        "pay_late",
    ))
    .await;

    let response = app
        .post_webhook(&payment_event(
            "payment.captured",
            &checkout.gateway_order_id,
            "pay_late",
        ))
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(read_json(response).await["status"], "rejected");
    let order = app.order(checkout.order_id).await;
    assert_eq!(order.status, OrderStatus::Cancelled);
    assert_ne!(order.payment_status, PaymentStatus::Paid);
    assert!(app
        .security_actions()
        .await
        .contains(&"CAPTURE_ON_CLOSED_ORDER".to_string()));
}

#[tokio::test]
async fn unknown_events_and_orders_are_acknowledged() {
    let app = TestApp::new().await;

    let response = app
        .post_webhook(&json!({ "event": "refund.processed", "payload": {} }))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(read_json(response).await["status"], "ignored");

    let response = app
        .post_webhook(&payment_event("payment.captured", "order_unknown", "pay_unknown"))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(read_json(response).await["status"], "ignored");
}

#[tokio::test]
async fn captured_payment_reused_on_another_order_is_rejected() {
    let app = TestApp::new().await;
    let first = app.checkout().await;
    let second = app.checkout().await;
    let signature = sign_payment(&first.gateway_order_id, "pay_reused");
    let verified = app
        .verify(&first.token, &first.gateway_order_id, "pay_reused", &signature)
        .await;
    assert_eq!(verified.status(), StatusCode::OK);

    let response = app
        .post_webhook(&payment_event(
            "payment.captured",
            &second.gateway_order_id,
            "pay_reused",
        ))
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(read_json(response).await["status"], "rejected");
    assert!(app
        .security_actions()
        .await
        .contains(&"DUPLICATE_PAYMENT_ATTEMPT".to_string()));

    let second_order = app.order(second.order_id).await;
    assert_eq!(second_order.status, OrderStatus::Cancelled);
    assert_ne!(second_order.payment_status, PaymentStatus::Paid);
    let second_logs = app.payment_logs(second.order_id).await;
    assert_eq!(second_logs[0].status, PaymentLogStatus::Failed);
    assert_eq!(
        app.order(first.order_id).await.payment_intent_id.as_deref(),
        Some("pay_reused")
    );
}
