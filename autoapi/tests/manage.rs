use std::sync::Arc;

use autoapi::testing::{StaticConnector, sample_catalog};
use autoapi::{Gateway, GatewayConf};
use axum_test::TestServer;
use serde_json::{Value, json};

async fn server() -> (Arc<StaticConnector>, TestServer) {
    let connector = Arc::new(StaticConnector::new().with_catalog(1, sample_catalog()));
    let gateway = Gateway::builder(GatewayConf::default())
        .with_connector(connector.clone())
        .build()
        .await
        .expect("Failed to build gateway");
    let server = TestServer::new(gateway.router()).expect("Failed to start test server");
    (connector, server)
}

#[tokio::test]
async fn lists_datasources() {
    let (_, server) = server().await;
    let body: Value = server.get("/manage/datasources").await.json();
    assert_eq!(body["data"][0]["id"], json!(1));
    assert_eq!(body["data"][0]["dialect"], json!("postgres"));
}

#[tokio::test]
async fn pool_lifecycle_endpoints() {
    let (_, server) = server().await;
    let response = server.get("/manage/datasources/1/status").await;
    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    assert_eq!(body["data"]["id"], json!(1));
    assert_eq!(body["data"]["connected"], json!(false));

    let body: Value = server.post("/manage/datasources/1/test").await.json();
    assert_eq!(body["data"]["connected"], json!(true));
    assert_eq!(server.post("/manage/datasources/1/refresh").await.status_code(), 200);
    let body: Value = server.post("/manage/datasources/1/close").await.json();
    assert_eq!(body["data"]["closed"], json!(false));

    for path in ["/manage/datasources/9/test", "/manage/datasources/9/refresh", "/manage/datasources/9/close"] {
        assert_eq!(server.post(path).await.status_code(), 404, "{path}");
    }
    assert_eq!(server.get("/manage/datasources/9/status").await.status_code(), 404);
}

#[tokio::test]
async fn unreachable_datasource_fails_its_test() {
    let (connector, server) = server().await;
    connector.set_catalog(1, sample_catalog().unreachable());
    let response = server.post("/manage/datasources/1/test").await;
    assert_eq!(response.status_code(), 502);
    let body: Value = response.json();
    assert_eq!(body["success"], json!(false));
    assert_eq!(server.post("/manage/datasources/1/refresh").await.status_code(), 502);
}

#[tokio::test]
async fn datasource_configs_can_be_managed() {
    let (_, server) = server().await;
    let body: Value = server
        .get("/manage/datasources/check-name?name=static-1")
        .await
        .json();
    assert_eq!(body["data"]["available"], json!(false));
    let body: Value = server
        .get("/manage/datasources/check-name?name=reporting")
        .await
        .json();
    assert_eq!(body["data"]["available"], json!(true));

    let response = server
        .post("/manage/datasources")
        .json(&json!({"name": "reporting", "url": "mysql://app@db.local/shop"}))
        .await;
    assert_eq!(response.status_code(), 201);
    let body: Value = response.json();
    assert_eq!(body["data"]["id"], json!(2));
    assert_eq!(body["data"]["dialect"], json!("mysql"));

    let duplicate = server
        .post("/manage/datasources")
        .json(&json!({"name": "Reporting", "url": "mysql://app@db.local/shop"}))
        .await;
    assert_eq!(duplicate.status_code(), 409);
    let broken = server
        .post("/manage/datasources")
        .json(&json!({"name": "broken", "host": "unreachable", "database": "x"}))
        .await;
    assert_eq!(broken.status_code(), 502);

    let response = server
        .put("/manage/datasources/2")
        .json(&json!({"name": "reports", "url": "mysql://app@db.local/shop"}))
        .await;
    assert_eq!(response.status_code(), 200);
    let body: Value = server.get("/manage/datasources/2").await.json();
    assert_eq!(body["data"]["name"], json!("reports"));
    let body: Value = server.get("/manage/tables/2/scan").await.json();
    assert_eq!(body["data"]["total"], json!(0));

    assert_eq!(server.delete("/manage/datasources/2").await.status_code(), 200);
    assert_eq!(server.get("/manage/datasources/2").await.status_code(), 404);
    let body: Value = server.get("/manage/datasources").await.json();
    assert_eq!(body["data"].as_array().map(Vec::len), Some(1));
}

#[tokio::test]
async fn unsaved_configs_can_be_tested() {
    let (_, server) = server().await;
    let response = server
        .post("/manage/datasources/test")
        .json(&json!({"name": "draft", "url": "postgres://app@db.local/app"}))
        .await;
    assert_eq!(response.status_code(), 200);
    let missing_target = server
        .post("/manage/datasources/test")
        .json(&json!({"name": "draft"}))
        .await;
    assert_eq!(missing_target.status_code(), 400);
}

#[tokio::test]
async fn serving_datasource_cannot_be_removed() {
    let (_, server) = server().await;
    server.post("/manage/apis/1/user_info/generate").await;
    assert_eq!(server.delete("/manage/datasources/1").await.status_code(), 409);

    server.delete("/manage/apis/1/user_info").await;
    assert_eq!(server.delete("/manage/datasources/1").await.status_code(), 200);
    assert_eq!(server.get("/manage/tables/1/scan").await.status_code(), 404);
}

#[tokio::test]
async fn scan_reports_every_table() {
    let (_, server) = server().await;
    let response = server.get("/manage/tables/1/scan").await;
    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    assert_eq!(body["data"]["total"], json!(4));
    assert_eq!(body["data"]["selected"], json!(0));
    assert_eq!(body["data"]["tables"][0]["name"], json!("user_info"));
    assert_eq!(body["data"]["tables"][0]["comment"], json!("registered users"));
}

#[tokio::test]
async fn unknown_datasource_is_not_found() {
    let (_, server) = server().await;
    let response = server.get("/manage/tables/9/scan").await;
    assert_eq!(response.status_code(), 404);
    let body: Value = response.json();
    assert_eq!(body["success"], json!(false));
}

#[tokio::test]
async fn select_and_list_selected() {
    let (_, server) = server().await;
    let response = server
        .post("/manage/tables/1/select")
        .json(&json!({"tableNames": ["user_info", "orders"]}))
        .await;
    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    assert_eq!(body["data"]["changed"], json!(2));

    let body: Value = server.get("/manage/tables/1/selected").await.json();
    let names: Vec<&str> = body["data"]
        .as_array()
        .expect("array")
        .iter()
        .filter_map(|s| s["tableName"].as_str())
        .collect();
    assert_eq!(names.len(), 2);
    assert!(names.contains(&"orders"));

    let body: Value = server.get("/manage/tables/1/pending").await.json();
    assert_eq!(body["data"].as_array().map(Vec::len), Some(2));

    assert_eq!(
        server
            .post("/manage/tables/1/select")
            .json(&json!({"tableNames": []}))
            .await
            .status_code(),
        400
    );
    assert_eq!(
        server
            .post("/manage/tables/1/select")
            .json(&json!({"tableNames": ["ghost"]}))
            .await
            .status_code(),
        404
    );
}

#[tokio::test]
async fn select_all_then_clear() {
    let (_, server) = server().await;
    let body: Value = server.post("/manage/tables/1/select-all").await.json();
    assert_eq!(body["data"]["changed"], json!(4));
    let body: Value = server.post("/manage/tables/1/select-all").await.json();
    assert_eq!(body["data"]["changed"], json!(0));

    let body: Value = server.delete("/manage/tables/1/selections").await.json();
    assert_eq!(body["data"]["cleared"], json!(4));
    let body: Value = server.get("/manage/tables/1/selected").await.json();
    assert_eq!(body["data"], json!([]));
}

#[tokio::test]
async fn generate_then_conflict() {
    let (_, server) = server().await;
    let response = server.post("/manage/apis/1/user_info/generate").await;
    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    assert_eq!(body["data"]["status"], json!("generated"));
    assert_eq!(body["data"]["restPath"], json!("/api/user-info"));
    assert_eq!(body["data"]["graphqlType"], json!("UserInfo"));
    assert_eq!(body["data"]["available"], json!(true));
    assert_eq!(body["data"]["conflict"], json!(true));

    let response = server.post("/manage/apis/1/user_info/generate").await;
    assert_eq!(response.status_code(), 409);

    let body: Value = server.get("/manage/tables/1/user_info/conflict").await.json();
    assert_eq!(body["data"]["conflict"], json!(true));
    let body: Value = server.get("/manage/tables/1/orders/conflict").await.json();
    assert_eq!(body["data"]["conflict"], json!(false));

    let body: Value = server.get("/manage/apis/routes").await.json();
    assert_eq!(body["data"][0]["path"], json!("/api/user-info"));
    assert_eq!(body["data"][0]["metadataVersion"], json!(1));
}

#[tokio::test]
async fn keyless_table_fails_generation() {
    let (_, server) = server().await;
    let response = server.post("/manage/apis/1/audit_log/generate").await;
    assert_eq!(response.status_code(), 422);
    let body: Value = response.json();
    assert_eq!(body["success"], json!(false));
    assert_eq!(body["data"]["status"], json!("error"));
    assert!(body["message"].as_str().unwrap_or_default().contains("no primary key"));
    assert_eq!(body["data"]["available"], json!(false));

    let body: Value = server.get("/manage/apis/routes").await.json();
    assert_eq!(body["data"], json!([]));
}

#[tokio::test]
async fn regenerate_and_remove() {
    let (_, server) = server().await;
    assert_eq!(server.post("/manage/apis/1/orders/regenerate").await.status_code(), 404);
    server.post("/manage/apis/1/orders/generate").await;

    let response = server.post("/manage/apis/1/orders/regenerate").await;
    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    assert_eq!(body["data"]["metadataVersion"], json!(1));
    assert!(body["data"]["lastRefreshedAt"].is_string());

    let response = server.delete("/manage/apis/1/orders").await;
    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    assert_eq!(body["data"]["status"], json!("removed"));
    assert_eq!(body["data"]["available"], json!(false));

    let body: Value = server.get("/manage/apis/1/orders").await.json();
    assert_eq!(body["data"]["status"], json!("removed"));
    assert_eq!(server.get("/api/orders").await.status_code(), 404);
}

#[tokio::test]
async fn status_of_unknown_table_is_not_found() {
    let (_, server) = server().await;
    assert_eq!(server.get("/manage/apis/1/user_info").await.status_code(), 404);
}

#[tokio::test]
async fn scan_and_generate_selected_names() {
    let (_, server) = server().await;
    let response = server
        .post("/manage/apis/1/scan-and-generate")
        .json(&json!({"tableNames": ["user_info", "audit_log"]}))
        .await;
    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    assert_eq!(body["data"]["scan"]["total"], json!(4));
    assert_eq!(body["data"]["generation"]["generated"], json!(1));
    assert_eq!(body["data"]["generation"]["failed"], json!(1));

    let body: Value = server.get("/manage/apis/status?datasourceId=1").await.json();
    assert_eq!(body["data"].as_array().map(Vec::len), Some(2));
}

#[tokio::test]
async fn generate_pending_and_statistics() {
    let (_, server) = server().await;
    server.post("/manage/tables/1/select-all").await;
    let body: Value = server.post("/manage/apis/1/generate-pending").await.json();
    assert_eq!(body["data"]["generated"], json!(3));
    assert_eq!(body["data"]["failed"], json!(1));

    let body: Value = server.get("/manage/tables/1/statistics").await.json();
    assert_eq!(body["data"]["total"], json!(4));
    assert_eq!(body["data"]["selected"], json!(4));
    assert_eq!(body["data"]["generated"], json!(3));
    assert_eq!(body["data"]["error"], json!(1));
    assert_eq!(body["data"]["pending"], json!(0));
}

#[tokio::test]
async fn refresh_picks_up_drift() {
    let (connector, server) = server().await;
    server.post("/manage/apis/1/user_info/generate").await;

    let body: Value = server
        .post("/manage/apis/refresh")
        .json(&json!({"onlyChanged": true}))
        .await
        .json();
    assert_eq!(body["data"]["unchanged"], json!(1));

    connector.set_catalog(
        1,
        sample_catalog().column("user_info", "email", "text", true, 4, None, None),
    );
    let body: Value = server
        .post("/manage/apis/refresh")
        .json(&json!({"onlyChanged": true}))
        .await
        .json();
    assert_eq!(body["data"]["generated"], json!(1));

    let body: Value = server.get("/manage/apis/1/user_info").await.json();
    assert_eq!(body["data"]["metadataVersion"], json!(2));
    let body: Value = server.get("/api/user-info/schema").await.json();
    assert_eq!(body["data"]["columns"].as_array().map(Vec::len), Some(4));
}

#[tokio::test]
async fn configured_columns_are_projected() {
    let (_, server) = server().await;
    server
        .post("/manage/tables/1/select")
        .json(&json!({"tableNames": ["user_info"]}))
        .await;
    let response = server
        .put("/manage/tables/1/user_info/selection")
        .json(&json!({"excludeColumns": ["created_at"], "priority": 5}))
        .await;
    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    assert_eq!(body["data"]["priority"], json!(5));

    let response = server
        .put("/manage/tables/1/user_info/selection")
        .json(&json!({"excludeColumns": ["created at"]}))
        .await;
    assert_eq!(response.status_code(), 403);

    let response = server
        .put("/manage/tables/1/user_info/selection")
        .json(&json!({"excludeColumns": ["user_name"]}))
        .await;
    assert_eq!(response.status_code(), 400);

    server.post("/manage/apis/1/user_info/generate").await;
    let body: Value = server.get("/api/user-info/schema").await.json();
    assert_eq!(body["data"]["columns"].as_array().map(Vec::len), Some(2));
}

#[tokio::test]
async fn describes_live_tables() {
    let (_, server) = server().await;
    let response = server.get("/manage/tables/1/orders").await;
    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    assert_eq!(body["data"]["primaryKeys"], json!(["id"]));
    assert_eq!(body["data"]["foreignKeys"][0]["targetTable"], json!("user_info"));

    assert_eq!(server.get("/manage/tables/1/ghost").await.status_code(), 404);
}
