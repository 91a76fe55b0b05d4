//! The gRPC face of the store: wire-type conversions and the translation of
//! classified engine errors into the statuses the sidecar expects.

use std::collections::HashMap;
use std::sync::Arc;

use pgstate_proto::v1 as proto;
use pgstate_proto::v1::state_store_server;
use pgstate_store::{
    DeleteOperation, GetOperation, SetOperation, StateStore, StoreError, TransactOperation,
};
use tonic::{Code, Request, Response, Status};
use tonic_types::{ErrorDetails, StatusExt};
use tracing::error;

const JSON_CONTENT_TYPE: &str = "application/json";
const OCTET_STREAM_CONTENT_TYPE: &str = "application/octet-stream";
/// Domain reported in `ErrorInfo` status details.
const ERROR_DOMAIN: &str = "statestore.pgstate";

#[derive(Clone)]
pub struct StateStoreService {
    store: Arc<StateStore>,
}

impl StateStoreService {
    pub fn new(store: Arc<StateStore>) -> Self {
        StateStoreService { store }
    }
}

#[tonic::async_trait]
impl state_store_server::StateStore for StateStoreService {
    async fn init(
        &self,
        request: Request<proto::InitRequest>,
    ) -> Result<Response<proto::InitResponse>, Status> {
        let request = request.into_inner();
        self.store.init(&request.properties).await.map_err(status)?;
        Ok(Response::new(proto::InitResponse {}))
    }

    async fn features(
        &self,
        _request: Request<proto::FeaturesRequest>,
    ) -> Result<Response<proto::FeaturesResponse>, Status> {
        Ok(Response::new(proto::FeaturesResponse {
            features: self
                .store
                .features()
                .iter()
                .map(|feature| feature.to_string())
                .collect(),
        }))
    }

    async fn ping(
        &self,
        _request: Request<proto::PingRequest>,
    ) -> Result<Response<proto::PingResponse>, Status> {
        self.store.ping().await.map_err(status)?;
        Ok(Response::new(proto::PingResponse {}))
    }

    async fn get(
        &self,
        request: Request<proto::GetRequest>,
    ) -> Result<Response<proto::GetResponse>, Status> {
        let request = request.into_inner();
        let operation = GetOperation {
            key: request.key,
            metadata: request.metadata,
        };
        let row = self.store.get(&operation).await.map_err(status)?;
        let response = match row {
            // Absence is an empty response, not an error.
            None => proto::GetResponse::default(),
            Some(row) => proto::GetResponse {
                data: encode_document(&row.value)?,
                etag: Some(proto::Etag {
                    value: row.etag.to_string(),
                }),
                metadata: HashMap::new(),
                content_type: JSON_CONTENT_TYPE.to_owned(),
            },
        };
        Ok(Response::new(response))
    }

    async fn set(
        &self,
        request: Request<proto::SetRequest>,
    ) -> Result<Response<proto::SetResponse>, Status> {
        let operation = set_operation(request.into_inner())?;
        self.store.set(&operation).await.map_err(status)?;
        Ok(Response::new(proto::SetResponse {}))
    }

    async fn delete(
        &self,
        request: Request<proto::DeleteRequest>,
    ) -> Result<Response<proto::DeleteResponse>, Status> {
        let operation = delete_operation(request.into_inner());
        self.store.delete(&operation).await.map_err(status)?;
        Ok(Response::new(proto::DeleteResponse {}))
    }

    async fn bulk_get(
        &self,
        request: Request<proto::BulkGetRequest>,
    ) -> Result<Response<proto::BulkGetResponse>, Status> {
        let request = request.into_inner();
        let operations: Vec<GetOperation> = request
            .items
            .into_iter()
            .map(|item| GetOperation {
                key: item.key,
                metadata: item.metadata,
            })
            .collect();
        let entries = self.store.bulk_get(&operations).await.map_err(status)?;

        let mut items = Vec::with_capacity(entries.len());
        for entry in entries {
            items.push(match entry.result {
                Ok(Some(row)) => proto::BulkGetItem {
                    key: entry.key,
                    data: encode_document(&row.value)?,
                    etag: Some(proto::Etag {
                        value: row.etag.to_string(),
                    }),
                    found: true,
                    error: String::new(),
                    content_type: JSON_CONTENT_TYPE.to_owned(),
                },
                Ok(None) => proto::BulkGetItem {
                    key: entry.key,
                    ..Default::default()
                },
                Err(err) => proto::BulkGetItem {
                    key: entry.key,
                    error: err.to_string(),
                    ..Default::default()
                },
            });
        }
        Ok(Response::new(proto::BulkGetResponse { items }))
    }

    async fn bulk_set(
        &self,
        request: Request<proto::BulkSetRequest>,
    ) -> Result<Response<proto::BulkSetResponse>, Status> {
        let operations = request
            .into_inner()
            .items
            .into_iter()
            .map(set_operation)
            .collect::<Result<Vec<_>, Status>>()?;
        self.store.bulk_set(&operations).await.map_err(status)?;
        Ok(Response::new(proto::BulkSetResponse {}))
    }

    async fn bulk_delete(
        &self,
        request: Request<proto::BulkDeleteRequest>,
    ) -> Result<Response<proto::BulkDeleteResponse>, Status> {
        let operations: Vec<DeleteOperation> = request
            .into_inner()
            .items
            .into_iter()
            .map(delete_operation)
            .collect();
        self.store.bulk_delete(&operations).await.map_err(status)?;
        Ok(Response::new(proto::BulkDeleteResponse {}))
    }

    async fn bulk_transact(
        &self,
        request: Request<proto::BulkTransactRequest>,
    ) -> Result<Response<proto::BulkTransactResponse>, Status> {
        let request = request.into_inner();
        let mut operations = Vec::with_capacity(request.operations.len());
        for element in request.operations {
            let operation = match element.operation {
                Some(proto::transact_operation::Operation::Set(mut set)) => {
                    set.metadata = merged_metadata(set.metadata, &request.metadata);
                    TransactOperation::Set(set_operation(set)?)
                }
                Some(proto::transact_operation::Operation::Delete(mut delete)) => {
                    delete.metadata = merged_metadata(delete.metadata, &request.metadata);
                    TransactOperation::Delete(delete_operation(delete))
                }
                None => {
                    return Err(Status::invalid_argument(
                        "transact operation carries neither a set nor a delete",
                    ))
                }
            };
            operations.push(operation);
        }
        self.store
            .bulk_transact(&operations)
            .await
            .map_err(status)?;
        Ok(Response::new(proto::BulkTransactResponse {}))
    }
}

/// Request-level metadata acts as a default; per-operation keys win.
fn merged_metadata(
    operation: HashMap<String, String>,
    request: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut merged = operation;
    for (key, value) in request {
        merged.entry(key.clone()).or_insert_with(|| value.clone());
    }
    merged
}

fn etag_value(etag: Option<proto::Etag>) -> Option<String> {
    etag.map(|etag| etag.value).filter(|value| !value.is_empty())
}

fn decode_document(value: Vec<u8>, content_type: &str) -> Result<serde_json::Value, Status> {
    if content_type.eq_ignore_ascii_case(OCTET_STREAM_CONTENT_TYPE) {
        return Err(Status::invalid_argument(
            "binary values are not supported; this store persists JSON documents",
        ));
    }
    serde_json::from_slice(&value)
        .map_err(|err| Status::invalid_argument(format!("value is not a JSON document: {err}")))
}

fn encode_document(value: &serde_json::Value) -> Result<Vec<u8>, Status> {
    serde_json::to_vec(value)
        .map_err(|err| Status::internal(format!("stored document failed to serialize: {err}")))
}

fn set_operation(request: proto::SetRequest) -> Result<SetOperation, Status> {
    let value = decode_document(request.value, &request.content_type)?;
    Ok(SetOperation {
        key: request.key,
        value,
        etag: etag_value(request.etag),
        metadata: request.metadata,
    })
}

fn delete_operation(request: proto::DeleteRequest) -> DeleteOperation {
    DeleteOperation {
        key: request.key,
        etag: etag_value(request.etag),
        metadata: request.metadata,
    }
}

fn status(err: StoreError) -> Status {
    match err {
        StoreError::Config(_) | StoreError::InvalidArgument(_) => {
            Status::invalid_argument(err.to_string())
        }
        StoreError::NotInitialized => Status::failed_precondition(err.to_string()),
        StoreError::MissingTenant => Status::with_error_details(
            Code::FailedPrecondition,
            err.to_string(),
            ErrorDetails::with_bad_request_violation(
                "metadata.tenantId",
                "required by the configured tenant mode",
            ),
        ),
        StoreError::EtagInvalid(_) => Status::with_error_details(
            Code::FailedPrecondition,
            err.to_string(),
            ErrorDetails::with_error_info("ETAG_INVALID", ERROR_DOMAIN, HashMap::new()),
        ),
        StoreError::EtagMismatch => Status::with_error_details(
            Code::FailedPrecondition,
            err.to_string(),
            ErrorDetails::with_error_info("ETAG_MISMATCH", ERROR_DOMAIN, HashMap::new()),
        ),
        err if err.is_transport() => Status::unavailable(err.to_string()),
        err => {
            error!(%err, "state operation failed");
            Status::internal(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use pgstate_proto::v1::state_store_server::StateStore as _;
    use pgstate_store::ResourceProvisioner;
    use pretty_assertions::assert_eq;
    use tokio_util::sync::CancellationToken;

    use super::*;

    fn service() -> StateStoreService {
        let shutdown = CancellationToken::new();
        let store = Arc::new(StateStore::new(
            Arc::new(ResourceProvisioner::new()),
            &shutdown,
        ));
        StateStoreService::new(store)
    }

    #[tokio::test]
    async fn features_advertise_etag_and_transactional() {
        let response = service()
            .features(Request::new(proto::FeaturesRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.features, vec!["ETAG", "TRANSACTIONAL"]);
    }

    #[tokio::test]
    async fn operations_before_init_are_rejected() {
        let status = service()
            .get(Request::new(proto::GetRequest {
                key: "k".into(),
                metadata: HashMap::new(),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::FailedPrecondition);
    }

    #[tokio::test]
    async fn init_rejects_unknown_tenant_mode() {
        let status = service()
            .init(Request::new(proto::InitRequest {
                properties: HashMap::from([
                    ("connectionString".to_string(), "host=localhost".to_string()),
                    ("tenant".to_string(), "database".to_string()),
                ]),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn init_requires_connection_string() {
        let status = service()
            .init(Request::new(proto::InitRequest {
                properties: HashMap::new(),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);
        assert!(status.message().contains("connectionString"));
    }

    #[tokio::test]
    async fn binary_values_are_rejected_up_front() {
        let status = service()
            .set(Request::new(proto::SetRequest {
                key: "k".into(),
                value: vec![0x00, 0xff, 0x17],
                etag: None,
                metadata: HashMap::new(),
                content_type: "application/octet-stream".into(),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);
    }

    #[test]
    fn empty_wire_etag_means_unconditional() {
        assert_eq!(etag_value(None), None);
        assert_eq!(
            etag_value(Some(proto::Etag {
                value: String::new()
            })),
            None
        );
        assert_eq!(
            etag_value(Some(proto::Etag { value: "e".into() })),
            Some("e".to_string())
        );
    }

    #[test]
    fn request_metadata_does_not_override_operation_metadata() {
        let operation = HashMap::from([("tenantId".to_string(), "T1".to_string())]);
        let request = HashMap::from([
            ("tenantId".to_string(), "T2".to_string()),
            ("ttlInSeconds".to_string(), "5".to_string()),
        ]);
        let merged = merged_metadata(operation, &request);
        assert_eq!(merged["tenantId"], "T1");
        assert_eq!(merged["ttlInSeconds"], "5");
    }

    #[test]
    fn classified_errors_map_to_expected_codes() {
        assert_eq!(
            status(StoreError::MissingTenant).code(),
            Code::FailedPrecondition
        );
        assert_eq!(
            status(StoreError::EtagMismatch).code(),
            Code::FailedPrecondition
        );
        assert_eq!(
            status(StoreError::EtagInvalid("bogus".into())).code(),
            Code::FailedPrecondition
        );
        assert_eq!(
            status(StoreError::InvalidArgument("ttl".into())).code(),
            Code::InvalidArgument
        );
        assert_eq!(
            status(StoreError::Internal("x".into())).code(),
            Code::Internal
        );
    }
}
