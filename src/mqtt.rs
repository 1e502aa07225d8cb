//! MQTT over mutual TLS: subscribe with the issued credential and wait for
//! one message, proving the broker grants the expected topic scope.

use std::time::Duration;

use log::{debug, info, warn};
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, MqttOptions, Packet, QoS, SubscribeReasonCode,
    TlsConfiguration, Transport,
};
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{CertError, Result};
use crate::pemfile::{self, PemLabel};

pub const DEFAULT_BROKER_PORT: u16 = 8883;
const KEEP_ALIVE: Duration = Duration::from_secs(30);
const MAX_PACKET_SIZE: usize = 1024 * 1024;

/// Broker endpoint plus the credential presented to it.
pub struct BrokerCredential {
    pub host:      String,
    pub port:      u16,
    pub client_id: String,
    /// CA certificates (DER) trusted for the broker.
    pub ca:        Vec<Vec<u8>>,
    pub cert_pem:  Vec<u8>,
    pub key_pem:   Vec<u8>,
}

impl BrokerCredential {
    pub fn client_id_or_random(client_id: Option<String>) -> String {
        client_id.unwrap_or_else(|| format!("cert-client-{}", Uuid::new_v4().simple()))
    }

    fn options(&self) -> MqttOptions {
        let ca_pem: String = self
            .ca
            .iter()
            .map(|der| pemfile::encode(PemLabel::Certificate, der))
            .collect();

        let mut opts = MqttOptions::new(&self.client_id, &self.host, self.port);
        opts.set_keep_alive(KEEP_ALIVE);
        opts.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);
        opts.set_transport(Transport::tls_with_config(TlsConfiguration::Simple {
            ca:          ca_pem.into_bytes(),
            alpn:        None,
            client_auth: Some((self.cert_pem.clone(), self.key_pem.clone())),
        }));
        opts
    }
}

/// First message seen on the subscribed topic.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub topic:   String,
    pub payload: Vec<u8>,
    pub elapsed: Duration,
}

/// Connect, subscribe to `topic` and return the first message, bounded by
/// `timeout`.
pub async fn await_one_message(
    broker:  &BrokerCredential,
    topic:   &str,
    timeout: Duration,
) -> Result<ReceivedMessage> {
    let started = Instant::now();
    let run = async {
        let (client, mut event_loop) = AsyncClient::new(broker.options(), 10);
        client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| CertError::Mqtt(format!("subscribe request: {e}")))?;

        loop {
            let event = event_loop
                .poll()
                .await
                .map_err(|e| CertError::Mqtt(format!("{}:{}: {e}", broker.host, broker.port)))?;
            match event {
                Event::Incoming(Packet::ConnAck(ack)) => {
                    if ack.code != ConnectReturnCode::Success {
                        return Err(CertError::Mqtt(format!("broker refused connection: {:?}", ack.code)));
                    }
                    info!("MQTT: connected to {}:{} as {}", broker.host, broker.port, broker.client_id);
                }
                Event::Incoming(Packet::SubAck(ack)) => {
                    if ack.return_codes.iter().any(|c| matches!(c, SubscribeReasonCode::Failure)) {
                        return Err(CertError::Mqtt(format!("broker denied subscription to {topic}")));
                    }
                    info!("MQTT: subscribed to {topic}; waiting for a message");
                }
                Event::Incoming(Packet::Publish(msg)) => {
                    let _ = client.disconnect().await;
                    return Ok(ReceivedMessage {
                        topic:   msg.topic,
                        payload: msg.payload.to_vec(),
                        elapsed: started.elapsed(),
                    });
                }
                Event::Incoming(Packet::Disconnect) => {
                    return Err(CertError::Mqtt("broker closed the session".into()));
                }
                other => debug!("MQTT: {other:?}"),
            }
        }
    };

    tokio::time::timeout(timeout, run).await.unwrap_or_else(|_| {
        warn!("MQTT: no message on {topic} within {timeout:?}");
        Err(CertError::TimedOut { what: format!("message on {topic}"), after: timeout })
    })
}

#[cfg(test)]
mod tests {
    use rcgen::ExtendedKeyUsagePurpose;
    use tokio::net::TcpListener;

    use super::*;
    use crate::keys::tests::shared_key;
    use crate::tls::tests::TestCa;

    /// A well-formed credential so the client gets as far as the network.
    fn credential(port: u16) -> BrokerCredential {
        let ca = TestCa::new("Issuer CA");
        let signer = shared_key().signer().unwrap();
        let cert = ca.sign(&signer, &[], ExtendedKeyUsagePurpose::ClientAuth);
        BrokerCredential {
            host:      "127.0.0.1".into(),
            port,
            client_id: "device-01".into(),
            ca:        vec![ca.der.clone()],
            cert_pem:  cert.pem().into_bytes(),
            key_pem:   signer.serialize_pem().into_bytes(),
        }
    }

    #[test]
    fn options_carry_endpoint_and_identity() {
        let opts = credential(DEFAULT_BROKER_PORT).options();
        assert_eq!(opts.broker_address(), ("127.0.0.1".to_string(), 8883));
        assert_eq!(opts.client_id(), "device-01");
        assert_eq!(opts.keep_alive(), KEEP_ALIVE);
    }

    #[test]
    fn random_client_ids_differ() {
        let a = BrokerCredential::client_id_or_random(None);
        let b = BrokerCredential::client_id_or_random(None);
        assert!(a.starts_with("cert-client-"));
        assert_ne!(a, b);
        assert_eq!(BrokerCredential::client_id_or_random(Some("x".into())), "x");
    }

    #[tokio::test]
    async fn silent_broker_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        // Accept and never answer.
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let err = await_one_message(&credential(port), "fleet/#", Duration::from_millis(300))
            .await
            .unwrap_err();
        assert!(matches!(err, CertError::TimedOut { .. }), "unexpected {err:?}");
    }

    #[tokio::test]
    async fn unreachable_broker_is_an_mqtt_error() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let err = await_one_message(&credential(port), "fleet/#", Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, CertError::Mqtt(_)), "unexpected {err:?}");
    }
}
