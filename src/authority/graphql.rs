//! [`Authority`] over the remote GraphQL API.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use log::{debug, error, log_enabled, trace, Level};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use url::Url;

use super::queries::{self, Envelope, GraphQlError};
use super::{
    decode_payload, Authority, Certificate, DomainId, EntityId, EntityRef, FetchOutcome,
    IssuanceHandle, IssuerId, SubmitRequest,
};
use crate::error::{CertError, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// GraphQL client authenticated with a bearer token.
pub struct AuthorityClient {
    http:     Client,
    endpoint: Url,
    token:    String,
}

impl AuthorityClient {
    /// `api_url` is the API base; `/graphql` is appended unless already there.
    pub fn new(api_url: &Url, token: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(CertError::Http)?;
        let endpoint = graphql_endpoint(api_url);
        debug!("init GraphQL client for {endpoint}");
        Ok(Self { http, endpoint, token: token.into() })
    }

    async fn execute_raw<T: DeserializeOwned>(
        &self,
        operation: &str,
        query:     &str,
        variables: Value,
    ) -> Result<Envelope<T>> {
        let body = json!({ "query": query, "variables": variables });
        if log_enabled!(Level::Trace) {
            trace!("{operation} request: {body}");
        }

        let resp = self
            .http
            .post(self.endpoint.clone())
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        let text = resp.text().await?;
        trace!("{operation} response: {text}");

        Ok(serde_json::from_str(&text)?)
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        operation: &str,
        query:     &str,
        variables: Value,
    ) -> Result<T> {
        let envelope = self.execute_raw(operation, query, variables).await?;
        if !envelope.errors.is_empty() {
            let msg = join_messages(&envelope.errors);
            error!("{operation} failed: {msg}");
            return Err(CertError::GraphQl(msg));
        }
        envelope
            .data
            .ok_or_else(|| CertError::Protocol(format!("{operation}: response carried no data")))
    }
}

#[async_trait]
impl Authority for AuthorityClient {
    async fn resolve_issuer(&self, name: &str) -> Result<IssuerId> {
        let data: queries::IssuersData<queries::UuidNode> = self
            .execute("fetchIssuerUUIDByName", queries::ISSUER_BY_NAME, json!({ "name": name }))
            .await?;
        match data.issuers.items.as_slice() {
            [issuer] => Ok(IssuerId(issuer.uuid)),
            _ => {
                error!("issuer {name:?} not found");
                Err(CertError::NotFound { entity: "issuer", key: name.to_string() })
            }
        }
    }

    async fn resolve_domain(&self) -> Result<DomainId> {
        let data: queries::DomainData = self
            .execute("fetchDomainUUID", queries::CURRENT_DOMAIN, json!({}))
            .await?;
        Ok(DomainId(data.current_domain.uuid))
    }

    async fn resolve_entity(&self, entity: &EntityRef) -> Result<EntityId> {
        let vars = json!({ "code": entity.code() });
        let items = match entity {
            EntityRef::System(_) => {
                let data: queries::SystemsData = self
                    .execute("fetchSystemUUIDByCode", queries::SYSTEM_BY_CODE, vars)
                    .await?;
                data.systems.items
            }
            EntityRef::Component(_) => {
                let data: queries::ComponentsData = self
                    .execute("fetchComponentUUIDByCode", queries::COMPONENT_BY_CODE, vars)
                    .await?;
                data.components.items
            }
        };
        match items.first() {
            Some(node) => Ok(EntityId(node.uuid)),
            None => {
                error!("{} {:?} not found", entity.kind(), entity.code());
                Err(CertError::NotFound { entity: entity.kind(), key: entity.code().to_string() })
            }
        }
    }

    async fn submit_certificate(&self, request: &SubmitRequest) -> Result<IssuanceHandle> {
        let vars = json!({
            "issuerUuid": request.issuer,
            "entityUuid": request.entity,
            "name":       request.name,
            "duration":   request.duration,
            "csr":        STANDARD.encode(request.csr.pem()),
            "usages":     request.usages,
        });
        debug!(
            "createCertificate issuer={} entity={} name={} duration={} usages={:?}",
            request.issuer, request.entity, request.name, request.duration, request.usages
        );

        let envelope: Envelope<queries::CreateCertificateData> = self
            .execute_raw("createCertificate", queries::CREATE_CERTIFICATE, vars)
            .await?;
        if envelope.errors.iter().any(|e| constraint_map(e).is_some()) {
            let reasons = rejection_reasons(&envelope.errors);
            error!("certificate request rejected:{reasons}");
            return Err(CertError::Rejected(reasons));
        }
        if !envelope.errors.is_empty() {
            let msg = join_messages(&envelope.errors);
            error!("createCertificate failed: {msg}");
            return Err(CertError::GraphQl(msg));
        }
        let data = envelope
            .data
            .ok_or_else(|| CertError::Protocol("createCertificate: response carried no data".into()))?;
        Ok(IssuanceHandle(data.create_certificate.uuid))
    }

    async fn fetch_certificate(&self, handle: &IssuanceHandle) -> Result<FetchOutcome> {
        let data: queries::CertificateData = self
            .execute("fetchCertificate", queries::CERTIFICATE_BY_UUID, json!({ "uuid": handle }))
            .await?;
        let node = data.certificate.ok_or_else(|| CertError::NotFound {
            entity: "certificate",
            key:    handle.to_string(),
        })?;

        match node.certificate.as_deref().map(str::trim) {
            None | Some("") => {
                debug!("certificate {handle} not yet signed");
                Ok(FetchOutcome::Pending { name: node.name })
            }
            Some(payload) => {
                let der = decode_payload(payload).map_err(|e| {
                    error!("certificate {handle}: {e}");
                    e
                })?;
                Ok(FetchOutcome::Signed(Certificate::from_der(der, node.name)?))
            }
        }
    }

    async fn fetch_ca(&self, issuer: &str) -> Result<Vec<u8>> {
        let data: queries::IssuersData<queries::CaNode> = self
            .execute("fetchCAByName", queries::CA_BY_ISSUER_NAME, json!({ "name": issuer }))
            .await?;
        let Some(node) = data.issuers.items.into_iter().next() else {
            error!("issuer {issuer:?} not found");
            return Err(CertError::NotFound { entity: "issuer", key: issuer.to_string() });
        };
        match node.ca.as_deref().map(str::trim) {
            None | Some("") => {
                error!("no CA found for issuer {issuer:?}");
                Err(CertError::NotFound { entity: "CA", key: issuer.to_string() })
            }
            Some(payload) => decode_payload(payload),
        }
    }
}

fn graphql_endpoint(api_url: &Url) -> Url {
    if api_url.path().trim_end_matches('/').ends_with("/graphql") {
        return api_url.clone();
    }
    let mut url = api_url.clone();
    let path = format!("{}/graphql", url.path().trim_end_matches('/'));
    url.set_path(&path);
    url
}

fn join_messages(errors: &[GraphQlError]) -> String {
    errors.iter().map(|e| e.message.as_str()).collect::<Vec<_>>().join("; ")
}

/// The per-constraint rejection map (`extensions.errors: {CODE: message}`),
/// if the error carries a non-empty one.
fn constraint_map(err: &GraphQlError) -> Option<&serde_json::Map<String, Value>> {
    err.extensions
        .get("errors")
        .and_then(Value::as_object)
        .filter(|m| !m.is_empty())
}

/// Flatten the rejection maps into one line.
fn rejection_reasons(errors: &[GraphQlError]) -> String {
    let mut out = String::new();
    for err in errors {
        match constraint_map(err) {
            Some(reasons) => {
                for (code, msg) in reasons {
                    let msg = msg.as_str().map(str::to_string).unwrap_or_else(|| msg.to_string());
                    out.push_str(&format!(" {msg} [{code}]."));
                }
            }
            _ => out.push_str(&format!(" {}.", err.message)),
        }
    }
    out
}
