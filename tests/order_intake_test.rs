mod common;

use axum::http::{Method, StatusCode};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sea_orm::{EntityTrait, PaginatorTrait};
use serde_json::json;
use storefront_payments::entities::{cart_item, order};
use uuid::Uuid;

use common::{dec_field, read_json, TestApp};

#[tokio::test]
async fn order_totals_include_tax_and_shipping() {
    let app = TestApp::new().await;
    let (user_id, token) = app.new_user();
    let product = app
        .seed_product("Noise Cancelling Headphones", "electronics", dec!(1000), 5)
        .await;
    let address = app.seed_address(user_id, "Maharashtra").await;

    let order = app.place_order(&token, product.id, 1, address.id).await;

    assert_eq!(dec_field(&order["subtotal_amount"]), dec!(1000));
    assert_eq!(dec_field(&order["tax_amount"]), dec!(180));
    assert_eq!(dec_field(&order["shipping_fee"]), dec!(50));
    assert_eq!(dec_field(&order["total_amount"]), dec!(1230));
    assert_eq!(order["status"], "PENDING");
    assert_eq!(order["payment_status"], "PENDING");
    assert_eq!(order["tax_breakdown"]["supply_type"], "INTER_STATE");
    assert_eq!(dec_field(&order["tax_breakdown"]["igst"]), dec!(180));

    let items = order["items"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    let line_sum: Decimal = items.iter().map(|i| dec_field(&i["line_total"])).sum();
    assert_eq!(line_sum, dec_field(&order["subtotal_amount"]));

    assert_eq!(app.product(product.id).await.stock, 4);
}

#[tokio::test]
async fn intra_state_order_splits_tax() {
    let app = TestApp::new().await;
    let (user_id, token) = app.new_user();
    let product = app.seed_product("Desk Lamp", "electronics", dec!(1000), 5).await;
    let address = app.seed_address(user_id, "Karnataka").await;

    let order = app.place_order(&token, product.id, 1, address.id).await;

    assert_eq!(order["tax_breakdown"]["supply_type"], "INTRA_STATE");
    assert_eq!(dec_field(&order["tax_breakdown"]["cgst"]), dec!(90));
    assert_eq!(dec_field(&order["tax_breakdown"]["sgst"]), dec!(90));
    assert_eq!(dec_field(&order["total_amount"]), dec!(1230));
}

#[tokio::test]
async fn duplicate_lines_are_merged() {
    let app = TestApp::new().await;
    let (user_id, token) = app.new_user();
    let product = app.seed_product("Notebook", "stationery", dec!(100), 10).await;
    let address = app.seed_address(user_id, "Maharashtra").await;

    let response = app
        .post(
            "/api/v1/orders",
            json!({
                "items": [
                    { "product_id": product.id, "quantity": 2 },
                    { "product_id": product.id, "quantity": 3 },
                ],
                "address_id": address.id,
            }),
            &token,
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let order = read_json(response).await["data"].clone();

    let items = order["items"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["quantity"], 5);
    assert_eq!(app.product(product.id).await.stock, 5);
}

#[tokio::test]
async fn failing_line_leaves_no_order_and_no_stock_change() {
    let app = TestApp::new().await;
    let (user_id, token) = app.new_user();
    let plenty = app.seed_product("Pen", "stationery", dec!(20), 10).await;
    let scarce = app.seed_product("Fountain Pen", "stationery", dec!(900), 1).await;
    let address = app.seed_address(user_id, "Maharashtra").await;

    let response = app
        .post(
            "/api/v1/orders",
            json!({
                "items": [
                    { "product_id": plenty.id, "quantity": 2 },
                    { "product_id": scarce.id, "quantity": 3 },
                ],
                "address_id": address.id,
            }),
            &token,
        )
        .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(read_json(response).await["code"], "INSUFFICIENT_STOCK");
    assert_eq!(order::Entity::find().count(app.db()).await.unwrap(), 0);
    assert_eq!(app.product(plenty.id).await.stock, 10);
    assert_eq!(app.product(scarce.id).await.stock, 1);
}

#[tokio::test]
async fn unknown_product_is_unavailable() {
    let app = TestApp::new().await;
    let (user_id, token) = app.new_user();
    let address = app.seed_address(user_id, "Maharashtra").await;

    let response = app
        .post(
            "/api/v1/orders",
            json!({
                "items": [{ "product_id": Uuid::new_v4(), "quantity": 1 }],
                "address_id": address.id,
            }),
            &token,
        )
        .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(read_json(response).await["code"], "PRODUCT_UNAVAILABLE");
}

#[tokio::test]
async fn empty_order_with_empty_cart_is_rejected() {
    let app = TestApp::new().await;
    let (user_id, token) = app.new_user();
    let address = app.seed_address(user_id, "Maharashtra").await;

    let response = app
        .post(
            "/api/v1/orders",
            json!({ "items": [], "address_id": address.id }),
            &token,
        )
        .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(read_json(response).await["code"], "EMPTY_ORDER");
}

#[tokio::test]
async fn empty_items_place_the_server_side_cart() {
    let app = TestApp::new().await;
    let (user_id, token) = app.new_user();
    let product = app.seed_product("Mug", "kitchen", dec!(250), 4).await;
    let address = app.seed_address(user_id, "Maharashtra").await;
    app.state
        .services
        .cart
        .add_item(user_id, product.id, 2)
        .await
        .unwrap();

    let response = app
        .post(
            "/api/v1/orders",
            json!({ "items": [], "address_id": address.id }),
            &token,
        )
        .await;

    assert_eq!(response.status(), StatusCode::CREATED);
    let order = read_json(response).await["data"].clone();
    assert_eq!(dec_field(&order["subtotal_amount"]), dec!(500));
    assert_eq!(app.product(product.id).await.stock, 2);
    assert_eq!(cart_item::Entity::find().count(app.db()).await.unwrap(), 0);
}

#[tokio::test]
async fn blank_shipping_state_is_rejected() {
    let app = TestApp::new().await;
    let (_, token) = app.new_user();
    let product = app.seed_product("Kettle", "kitchen", dec!(1200), 3).await;

    let response = app
        .post(
            "/api/v1/orders",
            json!({
                "items": [{ "product_id": product.id, "quantity": 1 }],
                "shipping_address": {
                    "full_name": "Asha Rao",
                    "line1": "12 MG Road",
                    "city": "Pune",
                    "state": "   ",
                    "postal_code": "411001",
                },
            }),
            &token,
        )
        .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(read_json(response).await["code"], "MISSING_SHIPPING_STATE");
    assert_eq!(app.product(product.id).await.stock, 3);
}

#[tokio::test]
async fn inline_address_is_stored_with_the_order() {
    let app = TestApp::new().await;
    let (_, token) = app.new_user();
    let product = app.seed_product("Kettle", "kitchen", dec!(1200), 3).await;

    let response = app
        .post(
            "/api/v1/orders",
            json!({
                "items": [{ "product_id": product.id, "quantity": 1 }],
                "shipping_address": {
                    "full_name": "Asha Rao",
                    "line1": "12 MG Road",
                    "city": "Bengaluru",
                    "state": "Karnataka",
                    "postal_code": "560001",
                },
            }),
            &token,
        )
        .await;

    assert_eq!(response.status(), StatusCode::CREATED);
    let order = read_json(response).await["data"].clone();
    assert!(order["address_id"].as_str().is_some());
    assert_eq!(order["tax_breakdown"]["supply_type"], "INTRA_STATE");
}

#[tokio::test]
async fn concurrent_orders_never_oversell() {
    let app = TestApp::new().await;
    let product = app.seed_product("Limited Print", "art", dec!(500), 2).await;

    let (first_user, first_token) = app.new_user();
    let (second_user, second_token) = app.new_user();
    let first_address = app.seed_address(first_user, "Maharashtra").await;
    let second_address = app.seed_address(second_user, "Maharashtra").await;

    let body = |address_id: Uuid| {
        json!({
            "items": [{ "product_id": product.id, "quantity": 2 }],
            "address_id": address_id,
        })
    };

    let (first, second) = tokio::join!(
        app.post("/api/v1/orders", body(first_address.id), &first_token),
        app.post("/api/v1/orders", body(second_address.id), &second_token),
    );

    let mut statuses = vec![first.status(), second.status()];
    statuses.sort();
    assert_eq!(statuses, vec![StatusCode::CREATED, StatusCode::BAD_REQUEST]);
    assert_eq!(app.product(product.id).await.stock, 0);
    assert_eq!(order::Entity::find().count(app.db()).await.unwrap(), 1);
}

#[tokio::test]
async fn orders_are_visible_only_to_their_owner() {
    let app = TestApp::new().await;
    let checkout = app.checkout().await;
    let uri = format!("/api/v1/orders/{}", checkout.order_id);

    let own = app
        .request(Method::GET, &uri, None, Some(&checkout.token))
        .await;
    assert_eq!(own.status(), StatusCode::OK);
    assert_eq!(read_json(own).await["data"]["id"], checkout.order["id"]);

    let (_, stranger) = app.new_user();
    let other = app.request(Method::GET, &uri, None, Some(&stranger)).await;
    assert_eq!(other.status(), StatusCode::FORBIDDEN);
    assert!(app
        .security_actions()
        .await
        .contains(&"UNAUTHORIZED_ORDER_ACCESS".to_string()));

    let missing = app
        .request(
            Method::GET,
            &format!("/api/v1/orders/{}", Uuid::new_v4()),
            None,
            Some(&checkout.token),
        )
        .await;
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn order_intake_requires_a_bearer_token() {
    let app = TestApp::new().await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/orders",
            Some(json!({ "items": [] })),
            None,
        )
        .await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(read_json(response).await["code"], "UNAUTHENTICATED");
    assert_eq!(app.security_actions().await, vec!["UNAUTHENTICATED_REQUEST".to_string()]);
}
