//! Scripted in-memory [`Authority`] for tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::time::Instant;
use uuid::Uuid;

use super::{
    Authority, Certificate, DomainId, EntityId, EntityRef, FetchOutcome, IssuanceHandle,
    IssuerId, SubmitRequest,
};
use crate::error::{CertError, Result};

/// DER of a throwaway self-signed certificate with common name `cn`.
pub fn test_certificate_der(cn: &str) -> Vec<u8> {
    let key = rcgen::KeyPair::generate().unwrap();
    let mut params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
    let mut dn = rcgen::DistinguishedName::new();
    dn.push(rcgen::DnType::CommonName, cn);
    params.distinguished_name = dn;
    params.self_signed(&key).unwrap().der().to_vec()
}

/// One scripted answer to `fetch_certificate`.
#[derive(Debug, Clone)]
pub enum Step {
    Pending,
    Transport,
    Signed(Certificate),
    Fatal,
    /// Never answers.
    Hang,
    /// Blocks the calling thread, then reports pending.
    Block(std::time::Duration),
}

pub struct FakeAuthority {
    pub issuer:    IssuerId,
    pub domain:    DomainId,
    pub entity:    EntityId,
    pub handle:    IssuanceHandle,
    pub ca:        Vec<u8>,
    script:        Mutex<VecDeque<Step>>,
    /// Step replayed once the script runs out.
    repeat:        Step,
    fetches:       Mutex<Vec<Instant>>,
    submitted:     Mutex<Vec<SubmitRequest>>,
}

impl FakeAuthority {
    pub fn new(script: impl IntoIterator<Item = Step>, repeat: Step) -> Self {
        Self {
            issuer:    IssuerId(Uuid::new_v4()),
            domain:    DomainId(Uuid::new_v4()),
            entity:    EntityId(Uuid::new_v4()),
            handle:    IssuanceHandle(Uuid::new_v4()),
            ca:        test_certificate_der("test-ca"),
            script:    Mutex::new(script.into_iter().collect()),
            repeat,
            fetches:   Mutex::new(Vec::new()),
            submitted: Mutex::new(Vec::new()),
        }
    }

    pub fn fetch_times(&self) -> Vec<Instant> {
        self.fetches.lock().unwrap().clone()
    }

    pub fn submitted(&self) -> Vec<SubmitRequest> {
        self.submitted.lock().unwrap().clone()
    }
}

#[async_trait]
impl Authority for FakeAuthority {
    async fn resolve_issuer(&self, name: &str) -> Result<IssuerId> {
        if name == "default" {
            Ok(self.issuer)
        } else {
            Err(CertError::NotFound { entity: "issuer", key: name.to_string() })
        }
    }

    async fn resolve_domain(&self) -> Result<DomainId> {
        Ok(self.domain)
    }

    async fn resolve_entity(&self, entity: &EntityRef) -> Result<EntityId> {
        match entity {
            EntityRef::System(code) if code == "truck-7" => Ok(self.entity),
            other => Err(CertError::NotFound {
                entity: other.kind(),
                key:    other.code().to_string(),
            }),
        }
    }

    async fn submit_certificate(&self, request: &SubmitRequest) -> Result<IssuanceHandle> {
        self.submitted.lock().unwrap().push(request.clone());
        Ok(self.handle)
    }

    async fn fetch_certificate(&self, handle: &IssuanceHandle) -> Result<FetchOutcome> {
        assert_eq!(*handle, self.handle, "polled an unknown handle");
        self.fetches.lock().unwrap().push(Instant::now());
        let step = self.script.lock().unwrap().pop_front().unwrap_or_else(|| self.repeat.clone());
        match step {
            Step::Pending     => Ok(FetchOutcome::Pending { name: "device-01".into() }),
            Step::Transport   => Err(CertError::Protocol("connection reset".into())),
            Step::Signed(c)   => Ok(FetchOutcome::Signed(c)),
            Step::Fatal       => Err(CertError::Decode("garbled certificate".into())),
            Step::Hang        => std::future::pending().await,
            Step::Block(d)    => {
                std::thread::sleep(d);
                Ok(FetchOutcome::Pending { name: "device-01".into() })
            }
        }
    }

    async fn fetch_ca(&self, issuer: &str) -> Result<Vec<u8>> {
        if issuer == "default" {
            Ok(self.ca.clone())
        } else {
            Err(CertError::NotFound { entity: "issuer", key: issuer.to_string() })
        }
    }
}
