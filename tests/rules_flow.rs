//! Integration tests for collection membership rules using wiremock.
//!
//! - GET  wmi/SMS_Collection('{id}')                               — CollectionRules
//! - POST wmi/SMS_Collection('{id}')/AdminService.AddMembershipRule
//! - POST wmi/SMS_Collection('{id}')/AdminService.DeleteMembershipRule

use std::time::Duration;

use mecm_admin::client::{AdminServiceClient, ClientConfig};
use mecm_admin::error::AdminError;
use mecm_admin::resolver::EntityRef;
use mecm_admin::rules::*;
use mecm_admin::session::{ConnectOptions, connect};
use serde_json::{Value, json};
use wiremock::matchers::{body_json, body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const COLLECTION_PATH: &str = "/wmi/SMS_Collection('PS100012')";
const ADD_PATH: &str = "/wmi/SMS_Collection('PS100012')/AdminService.AddMembershipRule";
const DELETE_PATH: &str = "/wmi/SMS_Collection('PS100012')/AdminService.DeleteMembershipRule";

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

async fn mount_test_collection_name(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/wmi/SMS_Collection"))
        .and(query_param("$filter", "Name eq 'Test Collection'"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": [
            { "CollectionID": "PS100012", "Name": "Test Collection" }
        ]})))
        .mount(server)
        .await;
}

fn collection_with_rules(rules: Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "CollectionID": "PS100012",
        "Name": "Test Collection",
        "CollectionRules": rules
    }))
}

fn direct(resource_id: i64, name: &str) -> Value {
    json!({
        "@odata.type": "#AdminService.SMS_CollectionRuleDirect",
        "ResourceClassName": "SMS_R_System",
        "ResourceID": resource_id,
        "RuleName": name
    })
}

#[tokio::test]
async fn direct_rule_add_list_remove_scenario() {
    let server = MockServer::start().await;
    let client = mock_client(&server).await;
    mount_test_collection_name(&server).await;

    Mock::given(method("GET"))
        .and(path("/wmi/SMS_R_System(1001)"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ResourceId": 1001,
            "Name": "PC-1001"
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(ADD_PATH))
        .and(body_json(json!({ "collectionRule": direct(1001, "PC-1001") })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ReturnValue": 0 })))
        .expect(1)
        .mount(&server)
        .await;
    // Two reads see the new rule (list, then the lookup inside remove);
    // after the delete the collection has none.
    Mock::given(method("GET"))
        .and(path(COLLECTION_PATH))
        .respond_with(collection_with_rules(json!([direct(1001, "PC-1001")])))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(COLLECTION_PATH))
        .respond_with(collection_with_rules(json!([])))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(DELETE_PATH))
        .and(body_json(json!({ "collectionRule": direct(1001, "PC-1001") })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ReturnValue": 0 })))
        .expect(1)
        .mount(&server)
        .await;

    let collection = EntityRef::name("Test Collection");

    add_direct_rule(&client, &collection, &EntityRef::key(1001_i64))
        .await
        .unwrap();

    let rules = get_direct_membership_rules(&client, &collection).await.unwrap();
    assert_eq!(rules.len(), 1, "exactly one direct rule after the add");
    assert_eq!(rules[0].resource_id, 1001);

    remove_direct_rule(&client, &collection, 1001).await.unwrap();

    let rules = get_direct_membership_rules(&client, &collection).await.unwrap();
    assert!(rules.is_empty(), "rule list is empty after the remove");
}

#[tokio::test]
async fn add_query_rule_posts_wql() {
    let server = MockServer::start().await;
    let client = mock_client(&server).await;

    Mock::given(method("POST"))
        .and(path(ADD_PATH))
        .and(body_json(json!({ "collectionRule": {
            "@odata.type": "#AdminService.SMS_CollectionRuleQuery",
            "RuleName": "Windows 11",
            "QueryExpression": "select * from SMS_R_System where OperatingSystemNameandVersion like '%10.0.22%'"
        }})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "QueryID": 12 })))
        .expect(1)
        .mount(&server)
        .await;

    add_query_rule(
        &client,
        &EntityRef::key("PS100012"),
        "Windows 11",
        "select * from SMS_R_System where OperatingSystemNameandVersion like '%10.0.22%'",
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn add_include_rule_names_rule_after_source() {
    let server = MockServer::start().await;
    let client = mock_client(&server).await;

    Mock::given(method("GET"))
        .and(path("/wmi/SMS_Collection"))
        .and(query_param("$filter", "Name eq 'Pilot'"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": [
            { "CollectionID": "PS100020", "Name": "Pilot" }
        ]})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/wmi/SMS_Collection('PS100020')"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "CollectionID": "PS100020",
            "Name": "Pilot"
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(ADD_PATH))
        .and(body_partial_json(json!({ "collectionRule": {
            "@odata.type": "#AdminService.SMS_CollectionRuleIncludeCollection",
            "RuleName": "Pilot",
            "IncludeCollectionID": "PS100020"
        }})))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    add_include_rule(&client, &EntityRef::key("PS100012"), &EntityRef::name("Pilot"))
        .await
        .unwrap();
}

#[tokio::test]
async fn duplicate_rule_is_reported_by_server() {
    let server = MockServer::start().await;
    let client = mock_client(&server).await;

    Mock::given(method("POST"))
        .and(path(ADD_PATH))
        .respond_with(
            ResponseTemplate::new(400)
                .set_body_string(r#"{"error":{"message":"The rule already exists"}}"#),
        )
        .mount(&server)
        .await;

    let err = add_query_rule(&client, &EntityRef::key("PS100012"), "dup", "select 1")
        .await
        .unwrap_err();
    assert!(
        matches!(&err, AdminError::Http { body, .. } if body.contains("already exists")),
        "got {err:?}"
    );
}

#[tokio::test]
async fn rules_on_builtin_collection_are_rejected_without_requests() {
    let server = MockServer::start().await;
    let client = mock_client(&server).await;
    let before = server.received_requests().await.unwrap().len();

    let err = add_direct_rule(&client, &EntityRef::key("SMS00001"), &EntityRef::key(1001_i64))
        .await
        .unwrap_err();
    assert!(matches!(err, AdminError::ProtectedEntity { .. }), "got {err:?}");

    let err = remove_membership_rules(&client, &EntityRef::key("sms00001"), None, "*")
        .await
        .unwrap_err();
    assert!(matches!(err, AdminError::ProtectedEntity { .. }), "got {err:?}");

    assert_eq!(server.received_requests().await.unwrap().len(), before);
}

#[tokio::test]
async fn get_membership_rules_filters_kind_and_name() {
    let server = MockServer::start().await;
    let client = mock_client(&server).await;

    Mock::given(method("GET"))
        .and(path(COLLECTION_PATH))
        .respond_with(collection_with_rules(json!([
            direct(1001, "PC-1001"),
            direct(1002, "PC-1002"),
            direct(2001, "SRV-01"),
            {
                "@odata.type": "#AdminService.SMS_CollectionRuleQuery",
                "RuleName": "PC query",
                "QueryExpression": "select * from SMS_R_System",
                "QueryID": 3
            }
        ])))
        .mount(&server)
        .await;

    let pcs = get_membership_rules(&client, &EntityRef::key("PS100012"), Some(RuleKind::Direct), Some("PC-*"))
        .await
        .unwrap();
    assert_eq!(pcs.len(), 2);

    let everything_pc = get_membership_rules(&client, &EntityRef::key("PS100012"), None, Some("pc*"))
        .await
        .unwrap();
    assert_eq!(everything_pc.len(), 3, "kind filter is optional");
}

#[tokio::test]
async fn remove_membership_rules_continues_past_failures() {
    let server = MockServer::start().await;
    let client = mock_client(&server).await;

    Mock::given(method("GET"))
        .and(path(COLLECTION_PATH))
        .respond_with(collection_with_rules(json!([
            direct(1001, "PC-1001"),
            direct(1002, "PC-1002"),
            direct(2001, "SRV-01")
        ])))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(DELETE_PATH))
        .and(body_partial_json(json!({ "collectionRule": { "ResourceID": 1001 } })))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(DELETE_PATH))
        .and(body_partial_json(json!({ "collectionRule": { "ResourceID": 1002 } })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let report = remove_membership_rules(
        &client,
        &EntityRef::key("PS100012"),
        Some(RuleKind::Direct),
        "PC-*",
    )
    .await
    .unwrap();

    assert_eq!(report.len(), 2, "SRV-01 does not match");
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].item, "PC-1001");
    assert_eq!(report.succeeded[0].rule_name(), "PC-1002");
}

#[tokio::test]
async fn remove_all_rules_leaves_unknown_rule_types_alone() {
    let server = MockServer::start().await;
    let client = mock_client(&server).await;

    Mock::given(method("GET"))
        .and(path(COLLECTION_PATH))
        .respond_with(collection_with_rules(json!([
            direct(1001, "PC-1001"),
            {
                "@odata.type": "#AdminService.SMS_CollectionRuleFutureKind",
                "RuleName": "",
                "Something": 1
            }
        ])))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(DELETE_PATH))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let report = remove_membership_rules(&client, &EntityRef::key("PS100012"), None, "*")
        .await
        .unwrap();
    assert_eq!(report.succeeded.len(), 1);
    assert!(report.failed.is_empty());

    let deletes: Vec<Value> = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.path() == DELETE_PATH)
        .map(|r| serde_json::from_slice(&r.body).unwrap())
        .collect();
    assert_eq!(deletes, vec![json!({ "collectionRule": direct(1001, "PC-1001") })]);
}

#[tokio::test]
async fn removing_only_unknown_rules_is_not_found() {
    let server = MockServer::start().await;
    let client = mock_client(&server).await;

    Mock::given(method("GET"))
        .and(path(COLLECTION_PATH))
        .respond_with(collection_with_rules(json!([
            { "@odata.type": "#AdminService.SMS_CollectionRuleFutureKind", "RuleName": "x" }
        ])))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(DELETE_PATH))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let err = remove_membership_rules(&client, &EntityRef::key("PS100012"), None, "*")
        .await
        .unwrap_err();
    assert!(err.is_not_found(), "got {err:?}");
}

#[tokio::test]
async fn remove_direct_rule_for_absent_resource_is_not_found() {
    let server = MockServer::start().await;
    let client = mock_client(&server).await;

    Mock::given(method("GET"))
        .and(path(COLLECTION_PATH))
        .respond_with(collection_with_rules(json!([direct(1001, "PC-1001")])))
        .mount(&server)
        .await;

    let err = remove_direct_rule(&client, &EntityRef::key("PS100012"), 9999)
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(
        server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .filter(|r| r.method.as_str() != "GET")
            .count(),
        0
    );
}
