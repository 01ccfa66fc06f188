use async_trait::async_trait;
use ovskv::storage::kv::KvStore;
use ovskv::{Database, Handler, MemKv, Notifier, OvsdbError, OvskvConfig};
use serde_json::{Value, json};
use std::sync::Arc;

const SCHEMA: &str = r#"{
    "name": "OVN_Northbound",
    "version": "5.30.0",
    "tables": {
        "ACL": {
            "columns": {
                "action": {"type": "string"},
                "direction": {"type": "string"},
                "match": {"type": "string"},
                "priority": {"type": {"key": {"type": "integer",
                    "minInteger": 0, "maxInteger": 32767}}},
                "log": {"type": "boolean"},
                "severity": {"type": {"key": "string", "min": 0, "max": 1}},
                "external_ids": {"type": {"key": "string", "value": "string",
                    "min": 0, "max": "unlimited"}}
            }
        },
        "Address_Set": {
            "columns": {
                "name": {"type": "string", "mutable": false},
                "addresses": {"type": {"key": "string", "min": 0, "max": "unlimited"}},
                "external_ids": {"type": {"key": "string", "value": "string",
                    "min": 0, "max": "unlimited"}}
            }
        },
        "Logical_Switch": {
            "columns": {
                "name": {"type": "string"},
                "ports": {"type": {"key": {"type": "uuid",
                    "refTable": "Logical_Switch_Port", "refType": "strong"},
                    "min": 0, "max": "unlimited"}}
            }
        },
        "Logical_Switch_Port": {
            "columns": {
                "name": {"type": "string"}
            }
        }
    }
}"#;

struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn notify(&self, _method: &str, _params: Value) -> Result<(), OvsdbError> {
        Ok(())
    }
}

async fn setup() -> (Arc<MemKv>, Handler) {
    let kv = Arc::new(MemKv::new());
    let db = Database::new(kv.clone(), OvskvConfig::default()).expect("database");
    db.add_schema(SCHEMA).await.expect("schema");
    let handler = Handler::new(db, Arc::new(NullNotifier), "test-client");
    (kv, handler)
}

async fn transact(handler: &Handler, ops: Vec<Value>) -> Result<Value, OvsdbError> {
    let mut params = vec![json!("OVN_Northbound")];
    params.extend(ops);
    handler.dispatch("transact", Value::Array(params)).await
}

fn result_uuid(results: &Value, index: usize) -> String {
    results[index]["uuid"][1]
        .as_str()
        .expect("result carries a uuid")
        .to_string()
}

fn acl_row() -> Value {
    json!({
        "action": "allow-related",
        "direction": "to-lport",
        "match": "ip4.src==10.244.0.2",
        "priority": 1001
    })
}

#[tokio::test]
async fn insert_then_select_round_trips_with_defaults_filled() {
    let (_kv, handler) = setup().await;
    let results = transact(
        &handler,
        vec![json!({"op": "insert", "table": "ACL", "row": acl_row(), "uuid-name": "a"})],
    )
    .await
    .expect("insert");
    let uuid = result_uuid(&results, 0);

    let results = transact(
        &handler,
        vec![json!({
            "op": "select", "table": "ACL",
            "where": [["_uuid", "==", ["uuid", uuid]]]
        })],
    )
    .await
    .expect("select");
    let rows = results[0]["rows"].as_array().expect("rows");
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row["action"], "allow-related");
    assert_eq!(row["direction"], "to-lport");
    assert_eq!(row["match"], "ip4.src==10.244.0.2");
    assert_eq!(row["priority"], 1001);
    // defaults filled on insert
    assert_eq!(row["log"], false);
    assert_eq!(row["severity"], json!(["set", []]));
    assert_eq!(row["external_ids"], json!(["map", []]));
    // implicit columns assigned
    assert_eq!(row["_uuid"][1].as_str(), Some(uuid.as_str()));
    assert_eq!(row["_version"][0], "uuid");
}

#[tokio::test]
async fn named_uuids_link_rows_within_one_transaction() {
    let (_kv, handler) = setup().await;
    let results = transact(
        &handler,
        vec![
            json!({"op": "insert", "table": "Logical_Switch_Port",
                   "row": {"name": "lsp0"}, "uuid-name": "port"}),
            json!({"op": "insert", "table": "Logical_Switch",
                   "row": {"name": "sw0",
                           "ports": ["set", [["named-uuid", "port"]]]}}),
        ],
    )
    .await
    .expect("linked insert");
    let port_uuid = result_uuid(&results, 0);
    let switch_uuid = result_uuid(&results, 1);

    let results = transact(
        &handler,
        vec![json!({
            "op": "select", "table": "Logical_Switch",
            "where": [["_uuid", "==", ["uuid", switch_uuid]]]
        })],
    )
    .await
    .expect("select");
    let row = &results[0]["rows"][0];
    assert_eq!(row["ports"], json!(["set", [["uuid", port_uuid]]]));
}

#[tokio::test]
async fn select_cannot_mix_with_writes_and_nothing_is_written() {
    let (kv, handler) = setup().await;
    let before = kv.revision();
    let err = transact(
        &handler,
        vec![
            json!({"op": "select", "table": "ACL", "where": []}),
            json!({"op": "insert", "table": "ACL", "row": acl_row()}),
        ],
    )
    .await
    .expect_err("mixed transaction");
    assert_eq!(err.code(), "constraint violation");
    assert_eq!(kv.revision(), before, "no KV writes occurred");
    let rows = kv.get_prefix("ovsdb/OVN_Northbound/ACL/").await.expect("get");
    assert!(rows.is_empty());
}

#[tokio::test]
async fn mutate_inserts_into_a_set() {
    let (_kv, handler) = setup().await;
    transact(
        &handler,
        vec![json!({"op": "insert", "table": "Address_Set",
            "row": {"name": "kube-system_v4",
                    "addresses": ["set", ["10.244.0.2"]]}})],
    )
    .await
    .expect("seed");

    let results = transact(
        &handler,
        vec![json!({
            "op": "mutate", "table": "Address_Set",
            "where": [["name", "==", "kube-system_v4"]],
            "mutations": [["addresses", "insert", "10.244.0.5"]]
        })],
    )
    .await
    .expect("mutate");
    assert_eq!(results[0]["count"], 1);

    let results = transact(
        &handler,
        vec![json!({"op": "select", "table": "Address_Set",
                    "where": [["name", "==", "kube-system_v4"]],
                    "columns": ["addresses"]})],
    )
    .await
    .expect("select");
    assert_eq!(
        results[0]["rows"][0]["addresses"],
        json!(["set", ["10.244.0.2", "10.244.0.5"]])
    );
}

#[tokio::test]
async fn update_merges_map_columns_and_replaces_the_rest() {
    let (_kv, handler) = setup().await;
    let mut row = acl_row();
    row["external_ids"] = json!(["map", [["owner", "ovn"], ["stage", "from-lport"]]]);
    let results = transact(
        &handler,
        vec![json!({"op": "insert", "table": "ACL", "row": row})],
    )
    .await
    .expect("insert");
    let uuid = result_uuid(&results, 0);

    let results = transact(
        &handler,
        vec![json!({
            "op": "update", "table": "ACL",
            "where": [["_uuid", "==", ["uuid", uuid]]],
            "row": {"priority": 2002,
                    "external_ids": ["map", [["stage", "to-lport"], ["tier", "2"]]]}
        })],
    )
    .await
    .expect("update");
    assert_eq!(results[0]["count"], 1);

    let results = transact(
        &handler,
        vec![json!({"op": "select", "table": "ACL",
                    "where": [["_uuid", "==", ["uuid", uuid]]]})],
    )
    .await
    .expect("select");
    let row = &results[0]["rows"][0];
    assert_eq!(row["priority"], 2002);
    assert_eq!(
        row["external_ids"],
        json!(["map", [["owner", "ovn"], ["stage", "to-lport"], ["tier", "2"]]])
    );
}

#[tokio::test]
async fn writes_regenerate_version_but_never_uuid() {
    let (_kv, handler) = setup().await;
    let results = transact(
        &handler,
        vec![json!({"op": "insert", "table": "ACL", "row": acl_row()})],
    )
    .await
    .expect("insert");
    let uuid = result_uuid(&results, 0);

    let select = vec![json!({"op": "select", "table": "ACL",
                             "where": [["_uuid", "==", ["uuid", uuid]]]})];
    let before = transact(&handler, select.clone()).await.expect("select");
    let version_before = before[0]["rows"][0]["_version"][1].clone();

    transact(
        &handler,
        vec![json!({"op": "update", "table": "ACL",
                    "where": [["_uuid", "==", ["uuid", uuid]]],
                    "row": {"priority": 7}})],
    )
    .await
    .expect("update");

    let after = transact(&handler, select).await.expect("select");
    let row = &after[0]["rows"][0];
    assert_eq!(row["_uuid"][1].as_str(), Some(uuid.as_str()));
    assert_ne!(row["_version"][1], version_before);
}

#[tokio::test]
async fn delete_then_select_returns_nothing() {
    let (_kv, handler) = setup().await;
    transact(
        &handler,
        vec![json!({"op": "insert", "table": "ACL", "row": acl_row()})],
    )
    .await
    .expect("insert");

    let results = transact(
        &handler,
        vec![json!({"op": "delete", "table": "ACL",
                    "where": [["priority", "==", 1001]]})],
    )
    .await
    .expect("delete");
    assert_eq!(results[0]["count"], 1);

    let results = transact(
        &handler,
        vec![json!({"op": "select", "table": "ACL",
                    "where": [["priority", "==", 1001]]})],
    )
    .await
    .expect("select");
    assert_eq!(results[0]["rows"], json!([]));
}

#[tokio::test]
async fn durable_commit_is_not_supported() {
    let (kv, handler) = setup().await;
    let before = kv.revision();
    let err = transact(&handler, vec![json!({"op": "commit", "durable": true})])
        .await
        .expect_err("durable");
    assert_eq!(err.code(), "not supported");
    assert_eq!(kv.revision(), before);

    transact(&handler, vec![json!({"op": "commit", "durable": false})])
        .await
        .expect("non-durable commit is a no-op");
}

#[tokio::test]
async fn abort_always_aborts() {
    let (_kv, handler) = setup().await;
    let err = transact(
        &handler,
        vec![
            json!({"op": "insert", "table": "ACL", "row": acl_row()}),
            json!({"op": "abort"}),
        ],
    )
    .await
    .expect_err("abort");
    assert_eq!(err.code(), "aborted");

    let results = transact(
        &handler,
        vec![json!({"op": "select", "table": "ACL", "where": []})],
    )
    .await
    .expect("select");
    assert_eq!(results[0]["rows"], json!([]), "aborted insert left no row");
}

#[tokio::test]
async fn wait_compares_rows_in_a_single_pass() {
    let (_kv, handler) = setup().await;
    transact(
        &handler,
        vec![json!({"op": "insert", "table": "ACL", "row": acl_row()})],
    )
    .await
    .expect("insert");

    // until == with a matching row: satisfied
    transact(
        &handler,
        vec![json!({
            "op": "wait", "timeout": 0, "table": "ACL",
            "columns": ["priority"], "until": "==",
            "rows": [{"priority": 1001}]
        })],
    )
    .await
    .expect("wait ==");

    // until != with a matching row: times out immediately
    let err = transact(
        &handler,
        vec![json!({
            "op": "wait", "timeout": 0, "table": "ACL",
            "columns": ["priority"], "until": "!=",
            "rows": [{"priority": 1001}]
        })],
    )
    .await
    .expect_err("wait !=");
    assert_eq!(err.code(), "timed out");

    let err = transact(
        &handler,
        vec![json!({"op": "wait", "table": "ACL", "until": "==",
                    "rows": [{"priority": 1}]})],
    )
    .await
    .expect_err("missing timeout");
    assert_eq!(err.code(), "constraint violation");
}

#[tokio::test]
async fn comment_lands_in_the_comment_keyspace() {
    let (kv, handler) = setup().await;
    transact(
        &handler,
        vec![json!({"op": "comment", "comment": "ovn-nbctl ls-add sw0"})],
    )
    .await
    .expect("comment");
    let comments = kv
        .get_prefix("ovsdb/_comments/OVN_Northbound/")
        .await
        .expect("get");
    assert_eq!(comments.len(), 1);
    assert_eq!(comments[0].value, "ovn-nbctl ls-add sw0");
}

#[tokio::test]
async fn duplicate_uuid_name_in_one_transaction_is_rejected() {
    let (_kv, handler) = setup().await;
    let err = transact(
        &handler,
        vec![
            json!({"op": "insert", "table": "ACL", "row": acl_row(), "uuid-name": "a"}),
            json!({"op": "insert", "table": "ACL", "row": acl_row(), "uuid-name": "a"}),
        ],
    )
    .await
    .expect_err("duplicate name");
    assert_eq!(err.code(), "duplicate uuid-name");
}

#[tokio::test]
async fn reinserting_an_existing_uuid_is_rejected() {
    let (_kv, handler) = setup().await;
    let results = transact(
        &handler,
        vec![json!({"op": "insert", "table": "ACL", "row": acl_row()})],
    )
    .await
    .expect("insert");
    let uuid = result_uuid(&results, 0);

    let err = transact(
        &handler,
        vec![json!({"op": "insert", "table": "ACL", "row": acl_row(),
                    "uuid": ["uuid", uuid]})],
    )
    .await
    .expect_err("duplicate uuid");
    assert_eq!(err.code(), "duplicate uuid");
}

#[tokio::test]
async fn assert_and_echo_and_change_aware_are_accepted() {
    let (_kv, handler) = setup().await;
    let results = transact(&handler, vec![json!({"op": "assert", "lock": "l1"})])
        .await
        .expect("assert accepted");
    assert_eq!(results[0], json!({}));

    let echoed = handler
        .dispatch("echo", json!(["ping", 1]))
        .await
        .expect("echo");
    assert_eq!(echoed, json!(["ping", 1]));

    let ok = handler
        .dispatch("set_db_change_aware", json!([true]))
        .await
        .expect("set_db_change_aware");
    assert_eq!(ok, json!({}));
}

#[tokio::test]
async fn concurrent_transactions_serialise_per_database() {
    let (_kv, handler) = setup().await;
    let handler = Arc::new(handler);
    transact(
        &handler,
        vec![json!({"op": "insert", "table": "Address_Set",
                    "row": {"name": "workers"}})],
    )
    .await
    .expect("seed");

    let mut tasks = Vec::new();
    for n in 0..8 {
        let handler = Arc::clone(&handler);
        tasks.push(tokio::spawn(async move {
            transact(
                &handler,
                vec![json!({
                    "op": "mutate", "table": "Address_Set",
                    "where": [["name", "==", "workers"]],
                    "mutations": [["addresses", "insert", format!("10.0.0.{n}")]]
                })],
            )
            .await
            .expect("mutate")
        }));
    }
    for task in tasks {
        task.await.expect("task");
    }

    let results = transact(
        &handler,
        vec![json!({"op": "select", "table": "Address_Set",
                    "where": [["name", "==", "workers"]],
                    "columns": ["addresses"]})],
    )
    .await
    .expect("select");
    let addresses = results[0]["rows"][0]["addresses"][1]
        .as_array()
        .expect("set body");
    assert_eq!(addresses.len(), 8, "every concurrent mutation landed");
}

#[tokio::test]
async fn select_results_do_not_depend_on_where_order() {
    let (_kv, handler) = setup().await;
    transact(
        &handler,
        vec![json!({"op": "insert", "table": "ACL", "row": acl_row()})],
    )
    .await
    .expect("insert");

    let forward = transact(
        &handler,
        vec![json!({"op": "select", "table": "ACL",
                    "where": [["priority", "==", 1001],
                              ["direction", "==", "to-lport"]]})],
    )
    .await
    .expect("select");
    let reversed = transact(
        &handler,
        vec![json!({"op": "select", "table": "ACL",
                    "where": [["direction", "==", "to-lport"],
                              ["priority", "==", 1001]]})],
    )
    .await
    .expect("select");
    assert_eq!(forward, reversed);
}
