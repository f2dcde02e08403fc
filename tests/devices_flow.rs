//! Integration tests for device lookup and the name resolver.
//!
//! - GET wmi/SMS_R_System?$filter=...   — name lookups and prefix narrowing
//! - GET wmi/SMS_R_System({id})         — numeric keys render unquoted

use std::time::Duration;

use mecm_admin::client::{AdminServiceClient, ClientConfig};
use mecm_admin::devices::*;
use mecm_admin::error::AdminError;
use mecm_admin::odata::Key;
use mecm_admin::resolver::{DEVICE, EntityRef, resolve_by_name_or_key};
use mecm_admin::session::{ConnectOptions, connect};
use serde_json::json;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn mock_client(server: &MockServer) -> AdminServiceClient {
    Mock::given(method("GET"))
        .and(path("/wmi/SMS_Site"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "value": [{ "SiteCode": "PS1" }] })),
        )
        .mount(server)
        .await;
    connect(
        ConnectOptions::new(server.address().to_string())
            .base_url(format!("{}/", server.uri()))
            .config(ClientConfig {
                propagation_delay: Duration::ZERO,
                ..Default::default()
            }),
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn get_device_by_key_uses_unquoted_path() {
    let server = MockServer::start().await;
    let client = mock_client(&server).await;

    Mock::given(method("GET"))
        .and(path("/wmi/SMS_R_System(16777220)"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "@odata.context": "https://cm01/AdminService/wmi/$metadata#SMS_R_System/$entity",
            "value": [{ "ResourceId": 16777220, "Name": "PC-001", "Client": 1 }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let device = get_device(&client, &EntityRef::key(16777220_i64)).await.unwrap();
    assert_eq!(device.name, "PC-001");
    assert_eq!(device.client, Some(1));
}

#[tokio::test]
async fn text_form_device_key_still_renders_bare() {
    let server = MockServer::start().await;
    let client = mock_client(&server).await;

    Mock::given(method("GET"))
        .and(path("/wmi/SMS_R_System(16777220)"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ResourceId": 16777220,
            "Name": "PC-001"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let device = get_device(&client, &EntityRef::key("16777220")).await.unwrap();
    assert_eq!(device.resource_id, 16777220);

    let paths: Vec<String> = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .map(|r| r.url.path().to_string())
        .collect();
    assert!(!paths.iter().any(|p| p.contains("('16777220')")), "got {paths:?}");
}

#[tokio::test]
async fn non_numeric_device_key_is_rejected_without_requests() {
    let server = MockServer::start().await;
    let client = mock_client(&server).await;
    let before = server.received_requests().await.unwrap().len();

    let err = get_device(&client, &EntityRef::key("PC-001")).await.unwrap_err();
    assert!(matches!(err, AdminError::Validation(_)), "got {err:?}");
    assert_eq!(server.received_requests().await.unwrap().len(), before);
}

#[tokio::test]
async fn get_device_by_name_resolves_then_fetches() {
    let server = MockServer::start().await;
    let client = mock_client(&server).await;

    Mock::given(method("GET"))
        .and(path("/wmi/SMS_R_System"))
        .and(query_param("$filter", "Name eq 'PC-001'"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": [
            { "ResourceId": 16777220, "Name": "PC-001" }
        ]})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/wmi/SMS_R_System(16777220)"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ResourceId": 16777220,
            "Name": "PC-001",
            "OperatingSystemNameandVersion": "Microsoft Windows NT Workstation 10.0"
        })))
        .mount(&server)
        .await;

    let device = get_device(&client, &EntityRef::name("PC-001")).await.unwrap();
    assert_eq!(device.resource_id, 16777220);
    assert!(device.operating_system.unwrap().contains("Windows"));
}

#[tokio::test]
async fn duplicate_device_names_are_ambiguous() {
    let server = MockServer::start().await;
    let client = mock_client(&server).await;

    Mock::given(method("GET"))
        .and(path("/wmi/SMS_R_System"))
        .and(query_param("$filter", "Name eq 'PC-001'"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": [
            { "ResourceId": 16777220, "Name": "PC-001" },
            { "ResourceId": 16777299, "Name": "PC-001" }
        ]})))
        .mount(&server)
        .await;

    let err = get_device(&client, &EntityRef::name("PC-001")).await.unwrap_err();
    assert!(
        matches!(err, AdminError::AmbiguousName { count: 2, .. }),
        "got {err:?}"
    );
}

#[tokio::test]
async fn find_devices_narrows_by_prefix_then_globs() {
    let server = MockServer::start().await;
    let client = mock_client(&server).await;

    Mock::given(method("GET"))
        .and(path("/wmi/SMS_R_System"))
        .and(query_param("$filter", "startswith(Name,'PC-00')"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": [
            { "ResourceId": 1, "Name": "PC-001" },
            { "ResourceId": 2, "Name": "PC-002" },
            { "ResourceId": 3, "Name": "PC-0010" }
        ]})))
        .expect(1)
        .mount(&server)
        .await;

    let found = find_devices(&client, "PC-00?").await.unwrap();
    let names: Vec<&str> = found.iter().map(|d| d.name.as_str()).collect();
    assert_eq!(names, vec!["PC-001", "PC-002"]);
}

#[tokio::test]
async fn name_and_key_together_are_rejected_without_requests() {
    let server = MockServer::start().await;
    let client = mock_client(&server).await;
    let before = server.received_requests().await.unwrap().len();

    let both = resolve_by_name_or_key(&client, &DEVICE, Some("PC-001"), Some(Key::from(1_i64)))
        .await
        .unwrap_err();
    assert!(matches!(both, AdminError::Validation(_)));

    let neither = resolve_by_name_or_key(&client, &DEVICE, None, None)
        .await
        .unwrap_err();
    assert!(matches!(neither, AdminError::Validation(_)));

    let key = resolve_by_name_or_key(&client, &DEVICE, None, Some(Key::from(7_i64)))
        .await
        .unwrap();
    assert_eq!(key, Key::from(7_i64));

    assert_eq!(server.received_requests().await.unwrap().len(), before);
}
