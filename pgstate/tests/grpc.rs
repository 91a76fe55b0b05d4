//! Wire-level round-trips through the gRPC service implementation, against
//! a live database named by `PGSTATE_TEST_URL` (tests skip without it).

use std::collections::HashMap;
use std::sync::Arc;

use pgstate::service::StateStoreService;
use pgstate_proto::v1 as proto;
use pgstate_proto::v1::state_store_server::StateStore as _;
use pgstate_store::{ResourceProvisioner, StateStore};
use tokio_util::sync::CancellationToken;
use tonic::{Code, Request};
use uuid::Uuid;

macro_rules! require_database {
    () => {
        match std::env::var("PGSTATE_TEST_URL") {
            Ok(url) if !url.is_empty() => url,
            _ => {
                eprintln!("skipping: set PGSTATE_TEST_URL to run database-backed tests");
                return;
            }
        }
    };
}

async fn initialized_service(url: &str, extra: &[(&str, &str)]) -> StateStoreService {
    let shutdown = CancellationToken::new();
    let store = Arc::new(StateStore::new(
        Arc::new(ResourceProvisioner::new()),
        &shutdown,
    ));
    let service = StateStoreService::new(store);
    let mut properties = HashMap::from([("connectionString".to_string(), url.to_string())]);
    for (key, value) in extra {
        properties.insert((*key).to_owned(), (*value).to_owned());
    }
    service
        .init(Request::new(proto::InitRequest { properties }))
        .await
        .expect("init failed");
    service
}

fn tenant(id: &str) -> HashMap<String, String> {
    HashMap::from([("tenantId".to_string(), id.to_string())])
}

fn unique(prefix: &str) -> String {
    format!("{prefix}-{:08x}", rand::random::<u32>())
}

#[tokio::test(flavor = "multi_thread")]
async fn wire_round_trip_with_etags() {
    let url = require_database!();
    let service = initialized_service(&url, &[("tenant", "schema")]).await;
    let t = unique("W");

    service
        .ping(Request::new(proto::PingRequest {}))
        .await
        .unwrap();

    service
        .set(Request::new(proto::SetRequest {
            key: "k".into(),
            value: br#"{"n": 1}"#.to_vec(),
            etag: None,
            metadata: tenant(&t),
            content_type: "application/json".into(),
        }))
        .await
        .unwrap();

    let found = service
        .get(Request::new(proto::GetRequest {
            key: "k".into(),
            metadata: tenant(&t),
        }))
        .await
        .unwrap()
        .into_inner();
    let etag = found.etag.expect("stored row carries an etag");
    assert_eq!(
        serde_json::from_slice::<serde_json::Value>(&found.data).unwrap(),
        serde_json::json!({"n": 1})
    );

    // Another tenant reading the same key gets the empty response.
    let missing = service
        .get(Request::new(proto::GetRequest {
            key: "k".into(),
            metadata: tenant(&unique("OTHER")),
        }))
        .await
        .unwrap()
        .into_inner();
    assert!(missing.data.is_empty());
    assert!(missing.etag.is_none());

    // A stale etag on the wire maps to FailedPrecondition.
    let status = service
        .set(Request::new(proto::SetRequest {
            key: "k".into(),
            value: br#"{"n": 2}"#.to_vec(),
            etag: Some(proto::Etag {
                value: Uuid::new_v4().to_string(),
            }),
            metadata: tenant(&t),
            content_type: "application/json".into(),
        }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::FailedPrecondition);

    // The current etag permits the update.
    service
        .set(Request::new(proto::SetRequest {
            key: "k".into(),
            value: br#"{"n": 2}"#.to_vec(),
            etag: Some(etag),
            metadata: tenant(&t),
            content_type: "application/json".into(),
        }))
        .await
        .unwrap();

    service
        .delete(Request::new(proto::DeleteRequest {
            key: "k".into(),
            etag: None,
            metadata: tenant(&t),
        }))
        .await
        .unwrap();
    let gone = service
        .get(Request::new(proto::GetRequest {
            key: "k".into(),
            metadata: tenant(&t),
        }))
        .await
        .unwrap()
        .into_inner();
    assert!(gone.data.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn wire_bulk_transact_rolls_back() {
    let url = require_database!();
    let service = initialized_service(&url, &[("tenant", "schema")]).await;
    let t = unique("W");

    let set = |key: &str| proto::SetRequest {
        key: key.into(),
        value: br#""v""#.to_vec(),
        etag: None,
        metadata: tenant(&t),
        content_type: "application/json".into(),
    };
    let mut failing = set("b");
    failing.etag = Some(proto::Etag {
        value: Uuid::new_v4().to_string(),
    });

    let status = service
        .bulk_transact(Request::new(proto::BulkTransactRequest {
            operations: vec![
                proto::TransactOperation {
                    operation: Some(proto::transact_operation::Operation::Set(set("a"))),
                },
                proto::TransactOperation {
                    operation: Some(proto::transact_operation::Operation::Set(failing)),
                },
            ],
            metadata: HashMap::new(),
        }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::FailedPrecondition);

    for key in ["a", "b"] {
        let response = service
            .get(Request::new(proto::GetRequest {
                key: key.into(),
                metadata: tenant(&t),
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(response.data.is_empty(), "{key} must have rolled back");
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn wire_bulk_get_mixes_hits_and_misses() {
    let url = require_database!();
    let service = initialized_service(&url, &[("tenant", "table")]).await;
    let t = unique("W");

    service
        .set(Request::new(proto::SetRequest {
            key: "here".into(),
            value: b"42".to_vec(),
            etag: None,
            metadata: tenant(&t),
            content_type: "application/json".into(),
        }))
        .await
        .unwrap();

    let items = service
        .bulk_get(Request::new(proto::BulkGetRequest {
            items: vec![
                proto::GetRequest {
                    key: "here".into(),
                    metadata: tenant(&t),
                },
                proto::GetRequest {
                    key: "gone".into(),
                    metadata: tenant(&t),
                },
            ],
        }))
        .await
        .unwrap()
        .into_inner()
        .items;

    assert_eq!(items.len(), 2);
    assert!(items[0].found);
    assert_eq!(items[0].data, b"42");
    assert!(!items[1].found);
    assert!(items[1].error.is_empty());
}
