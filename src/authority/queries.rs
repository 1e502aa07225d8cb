//! GraphQL documents and response shapes used by [`super::AuthorityClient`].

use serde::Deserialize;
use uuid::Uuid;

pub const ISSUER_BY_NAME: &str = "\
query fetchIssuerUUIDByName($name: String!) {
  issuers(where: {name: {_eq: $name}}, limit: 1) { items { uuid } }
}";

pub const CA_BY_ISSUER_NAME: &str = "\
query fetchCAByName($name: String!) {
  issuers(where: {name: {_eq: $name}}, limit: 1) { items { ca } }
}";

pub const CURRENT_DOMAIN: &str = "\
query fetchDomainUUID {
  currentDomain { uuid }
}";

pub const SYSTEM_BY_CODE: &str = "\
query fetchSystemUUIDByCode($code: String!) {
  systems(where: {code: {_eq: $code}}, limit: 1) { items { uuid } }
}";

pub const COMPONENT_BY_CODE: &str = "\
query fetchComponentUUIDByCode($code: String!) {
  components(where: {code: {_eq: $code}}, limit: 1) { items { uuid } }
}";

pub const CREATE_CERTIFICATE: &str = "\
mutation createCertificate(
  $issuerUuid: UUID!, $name: String!, $duration: Timespan!, $csr: String!,
  $entityUuid: UUID!, $usages: [CertificateUsage!]
) {
  createCertificate(
    issuerUuid: $issuerUuid, name: $name, duration: $duration, csr: $csr,
    entityUuid: $entityUuid, usages: $usages
  ) { uuid }
}";

pub const CERTIFICATE_BY_UUID: &str = "\
query fetchCertificate($uuid: UUID!) {
  certificate(uuid: $uuid) { name certificate }
}";

/// Standard GraphQL response envelope.
#[derive(Debug, Deserialize)]
pub struct Envelope<T> {
    pub data:   Option<T>,
    #[serde(default)]
    pub errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
pub struct GraphQlError {
    pub message:    String,
    #[serde(default)]
    pub extensions: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct Items<T> {
    #[serde(default)]
    pub items: Vec<T>,
}

#[derive(Debug, Deserialize)]
pub struct UuidNode {
    pub uuid: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct CaNode {
    pub ca: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct IssuersData<T> {
    pub issuers: Items<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainData {
    pub current_domain: UuidNode,
}

#[derive(Debug, Deserialize)]
pub struct SystemsData {
    pub systems: Items<UuidNode>,
}

#[derive(Debug, Deserialize)]
pub struct ComponentsData {
    pub components: Items<UuidNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCertificateData {
    pub create_certificate: UuidNode,
}

#[derive(Debug, Deserialize)]
pub struct CertificateNode {
    #[serde(default)]
    pub name:        String,
    pub certificate: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CertificateData {
    pub certificate: Option<CertificateNode>,
}
