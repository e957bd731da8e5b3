//! Pure routing of rumqttc events
//!
//! The event-loop supervisor turns every polled event into an [`EventRoute`]
//! and acts on the route. Keeping the mapping pure lets it be tested without
//! a broker.

use super::acks::{AckKind, AckOutcome};
use crate::transport::InboundPublish;
use rumqttc::{Event, Outgoing, Packet, SubscribeReasonCode};

/// Routing decisions for broker events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// CONNACK with a successful return code
    ConnectionAcknowledged,
    /// Publish pushed by the broker
    MessageReceived(InboundPublish),
    /// A request left the client and now has a packet id
    RequestWritten { kind: AckKind, pkid: u16 },
    /// Broker acknowledged a request
    Acknowledged {
        kind: AckKind,
        pkid: u16,
        outcome: AckOutcome,
    },
    /// Our DISCONNECT was written
    DisconnectSent,
    /// Broker closed the session
    Disconnected,
    /// Anything else (pings, QoS 2 handshake steps)
    Infrastructure,
}

pub struct MessageHandler;

impl MessageHandler {
    pub fn route_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(packet) => Self::route_incoming(packet),
            Event::Outgoing(outgoing) => Self::route_outgoing(outgoing),
        }
    }

    fn route_incoming(packet: &Packet) -> EventRoute {
        match packet {
            Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
            Packet::Publish(publish) => EventRoute::MessageReceived(InboundPublish {
                topic: publish.topic.clone(),
                payload: publish.payload.clone(),
                qos: publish.qos,
                retain: publish.retain,
            }),
            Packet::SubAck(suback) => EventRoute::Acknowledged {
                kind: AckKind::Subscribe,
                pkid: suback.pkid,
                outcome: Self::subscription_outcome(&suback.return_codes),
            },
            Packet::UnsubAck(unsuback) => EventRoute::Acknowledged {
                kind: AckKind::Unsubscribe,
                pkid: unsuback.pkid,
                outcome: AckOutcome::Accepted,
            },
            Packet::PubAck(puback) => EventRoute::Acknowledged {
                kind: AckKind::Publish,
                pkid: puback.pkid,
                outcome: AckOutcome::Accepted,
            },
            Packet::PubComp(pubcomp) => EventRoute::Acknowledged {
                kind: AckKind::Publish,
                pkid: pubcomp.pkid,
                outcome: AckOutcome::Accepted,
            },
            Packet::Disconnect => EventRoute::Disconnected,
            _ => EventRoute::Infrastructure,
        }
    }

    fn route_outgoing(outgoing: &Outgoing) -> EventRoute {
        match outgoing {
            Outgoing::Subscribe(pkid) => EventRoute::RequestWritten {
                kind: AckKind::Subscribe,
                pkid: *pkid,
            },
            Outgoing::Unsubscribe(pkid) => EventRoute::RequestWritten {
                kind: AckKind::Unsubscribe,
                pkid: *pkid,
            },
            Outgoing::Publish(pkid) => EventRoute::RequestWritten {
                kind: AckKind::Publish,
                pkid: *pkid,
            },
            Outgoing::Disconnect => EventRoute::DisconnectSent,
            _ => EventRoute::Infrastructure,
        }
    }

    /// A SUBACK carrying any failure code rejects the subscription
    pub fn subscription_outcome(return_codes: &[SubscribeReasonCode]) -> AckOutcome {
        if return_codes
            .iter()
            .any(|code| matches!(code, SubscribeReasonCode::Failure))
        {
            AckOutcome::Rejected(format!(
                "broker refused subscription: {return_codes:?}"
            ))
        } else {
            AckOutcome::Accepted
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rumqttc::{ConnAck, ConnectReturnCode, PubAck, Publish, QoS, SubAck, UnsubAck};

    #[test]
    fn test_connack_routes_to_acknowledged() {
        let event = Event::Incoming(Packet::ConnAck(ConnAck::new(
            ConnectReturnCode::Success,
            false,
        )));
        assert_eq!(
            MessageHandler::route_event(&event),
            EventRoute::ConnectionAcknowledged
        );
    }

    #[test]
    fn test_publish_carries_topic_and_payload() {
        let mut publish = Publish::new("sensors/temp", QoS::AtLeastOnce, "22.5");
        publish.retain = true;
        let route = MessageHandler::route_event(&Event::Incoming(Packet::Publish(publish)));

        match route {
            EventRoute::MessageReceived(inbound) => {
                assert_eq!(inbound.topic, "sensors/temp");
                assert_eq!(inbound.payload, Bytes::from_static(b"22.5"));
                assert_eq!(inbound.qos, QoS::AtLeastOnce);
                assert!(inbound.retain);
            }
            other => panic!("unexpected route {other:?}"),
        }
    }

    #[test]
    fn test_suback_failure_is_rejection() {
        let suback = SubAck::new(4, vec![SubscribeReasonCode::Failure]);
        let route = MessageHandler::route_event(&Event::Incoming(Packet::SubAck(suback)));
        assert!(matches!(
            route,
            EventRoute::Acknowledged {
                kind: AckKind::Subscribe,
                pkid: 4,
                outcome: AckOutcome::Rejected(_)
            }
        ));
    }

    #[test]
    fn test_suback_success() {
        let outcome = MessageHandler::subscription_outcome(&[SubscribeReasonCode::Success(
            QoS::AtLeastOnce,
        )]);
        assert_eq!(outcome, AckOutcome::Accepted);
    }

    #[test]
    fn test_acks_route_by_kind() {
        let unsub = MessageHandler::route_event(&Event::Incoming(Packet::UnsubAck(UnsubAck::new(9))));
        assert_eq!(
            unsub,
            EventRoute::Acknowledged {
                kind: AckKind::Unsubscribe,
                pkid: 9,
                outcome: AckOutcome::Accepted
            }
        );

        let puback = MessageHandler::route_event(&Event::Incoming(Packet::PubAck(PubAck::new(3))));
        assert_eq!(
            puback,
            EventRoute::Acknowledged {
                kind: AckKind::Publish,
                pkid: 3,
                outcome: AckOutcome::Accepted
            }
        );
    }

    #[test]
    fn test_outgoing_requests_carry_packet_ids() {
        assert_eq!(
            MessageHandler::route_event(&Event::Outgoing(Outgoing::Subscribe(12))),
            EventRoute::RequestWritten {
                kind: AckKind::Subscribe,
                pkid: 12
            }
        );
        assert_eq!(
            MessageHandler::route_event(&Event::Outgoing(Outgoing::Disconnect)),
            EventRoute::DisconnectSent
        );
        assert_eq!(
            MessageHandler::route_event(&Event::Outgoing(Outgoing::PingReq)),
            EventRoute::Infrastructure
        );
    }
}
