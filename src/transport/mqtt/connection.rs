//! Pure connection state management for broker links
//!
//! Option building, state transitions and error classification live here so
//! they can be tested without a broker.

use crate::error::RelayError;
use crate::transport::{BrokerOptions, BrokerScheme};
use rumqttc::{ConnectReturnCode, ConnectionError, MqttOptions, Transport};
use tracing::{info, warn};

/// Connection state of one broker link
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Waiting for the first CONNACK
    Connecting,
    Connected,
    /// Lost after having been up; retrying (attempt count)
    Reconnecting(u32),
    /// Initial handshake failed on the network
    Unreachable(String),
    /// Broker refused the credentials
    Refused(String),
    /// Closed by us
    Closed,
}

/// Link events that drive state transitions
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    ConnAckReceived,
    LinkError {
        failure: LinkFailure,
        ever_connected: bool,
        attempt: u32,
    },
    BrokerDisconnected { attempt: u32 },
    Closed,
}

/// Classified event-loop error
#[derive(Debug, Clone, PartialEq)]
pub enum LinkFailure {
    Auth(String),
    Network(String),
}

impl LinkFailure {
    pub fn classify(error: &ConnectionError) -> Self {
        match error {
            ConnectionError::ConnectionRefused(
                code @ (ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized),
            ) => LinkFailure::Auth(format!("broker refused credentials: {code:?}")),
            other => LinkFailure::Network(other.to_string()),
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            LinkFailure::Auth(reason) | LinkFailure::Network(reason) => reason,
        }
    }
}

pub fn determine_next_state(event: ConnectionEvent) -> ConnectionState {
    match event {
        ConnectionEvent::ConnAckReceived => {
            info!("Broker link connected");
            ConnectionState::Connected
        }
        ConnectionEvent::LinkError {
            failure,
            ever_connected: false,
            ..
        } => match failure {
            LinkFailure::Auth(reason) => ConnectionState::Refused(reason),
            LinkFailure::Network(reason) => ConnectionState::Unreachable(reason),
        },
        ConnectionEvent::LinkError {
            failure, attempt, ..
        } => {
            warn!(attempt, reason = failure.reason(), "Broker link lost, reconnecting");
            ConnectionState::Reconnecting(attempt)
        }
        ConnectionEvent::BrokerDisconnected { attempt } => {
            warn!(attempt, "Broker closed the session, reconnecting");
            ConnectionState::Reconnecting(attempt)
        }
        ConnectionEvent::Closed => ConnectionState::Closed,
    }
}

/// Map the outcome of the initial handshake to a relay error
pub fn handshake_result(state: &ConnectionState) -> Option<Result<(), RelayError>> {
    match state {
        ConnectionState::Connected => Some(Ok(())),
        ConnectionState::Refused(reason) => Some(Err(RelayError::AuthFailure {
            message: reason.clone(),
        })),
        ConnectionState::Unreachable(reason) => Some(Err(RelayError::network(reason.clone()))),
        ConnectionState::Closed => Some(Err(RelayError::network("link closed during handshake"))),
        ConnectionState::Connecting | ConnectionState::Reconnecting(_) => None,
    }
}

/// Build rumqttc options: MQTT 3.1.1 with the relay's session settings
pub fn configure_mqtt_options(options: &BrokerOptions) -> Result<MqttOptions, RelayError> {
    let mut mqtt_options = if options.scheme.is_websocket() {
        MqttOptions::new(
            options.client_id.clone(),
            options.broker_url()?,
            options.port,
        )
    } else {
        MqttOptions::new(options.client_id.clone(), options.host.clone(), options.port)
    };

    mqtt_options.set_keep_alive(options.keep_alive);
    mqtt_options.set_clean_session(options.clean_session);

    if let Some((username, password)) = &options.credentials {
        mqtt_options.set_credentials(username.clone(), password.clone());
    }

    match options.scheme {
        BrokerScheme::Tcp => {}
        BrokerScheme::Tls => {
            mqtt_options.set_transport(Transport::tls_with_default_config());
        }
        BrokerScheme::Ws => {
            mqtt_options.set_transport(Transport::Ws);
        }
        BrokerScheme::Wss => {
            mqtt_options.set_transport(Transport::wss_with_default_config());
        }
    }

    Ok(mqtt_options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn options(scheme: BrokerScheme) -> BrokerOptions {
        BrokerOptions {
            connection_id: 1,
            scheme,
            host: "broker.local".to_string(),
            port: 1883,
            path: "/mqtt".to_string(),
            client_id: "dash-1".to_string(),
            credentials: Some(("ops".to_string(), "secret".to_string())),
            keep_alive: Duration::from_secs(60),
            clean_session: true,
            reconnect_period: Duration::from_secs(5),
            request_capacity: 10,
        }
    }

    #[test]
    fn test_tcp_options() {
        let mqtt_options = configure_mqtt_options(&options(BrokerScheme::Tcp)).unwrap();
        assert_eq!(mqtt_options.client_id(), "dash-1");
        assert_eq!(
            mqtt_options.broker_address(),
            ("broker.local".to_string(), 1883)
        );
        assert_eq!(mqtt_options.keep_alive(), Duration::from_secs(60));
        assert!(mqtt_options.clean_session());
        assert_eq!(
            mqtt_options.credentials(),
            Some(("ops".to_string(), "secret".to_string()))
        );
    }

    #[test]
    fn test_websocket_uses_full_url() {
        let mqtt_options = configure_mqtt_options(&options(BrokerScheme::Ws)).unwrap();
        assert_eq!(mqtt_options.broker_address().0, "ws://broker.local:1883/mqtt");
    }

    #[test]
    fn test_auth_failures_are_classified() {
        let refused = ConnectionError::ConnectionRefused(ConnectReturnCode::BadUserNamePassword);
        assert!(matches!(LinkFailure::classify(&refused), LinkFailure::Auth(_)));

        let unavailable = ConnectionError::ConnectionRefused(ConnectReturnCode::ServiceUnavailable);
        assert!(matches!(
            LinkFailure::classify(&unavailable),
            LinkFailure::Network(_)
        ));
    }

    #[test]
    fn test_first_failure_is_terminal() {
        let state = determine_next_state(ConnectionEvent::LinkError {
            failure: LinkFailure::Auth("bad password".into()),
            ever_connected: false,
            attempt: 1,
        });
        assert_eq!(state, ConnectionState::Refused("bad password".into()));
        assert!(matches!(
            handshake_result(&state),
            Some(Err(RelayError::AuthFailure { .. }))
        ));
    }

    #[test]
    fn test_failure_after_connect_reconnects() {
        let state = determine_next_state(ConnectionEvent::LinkError {
            failure: LinkFailure::Network("reset".into()),
            ever_connected: true,
            attempt: 2,
        });
        assert_eq!(state, ConnectionState::Reconnecting(2));
        assert!(handshake_result(&state).is_none());
    }

    #[test]
    fn test_handshake_success() {
        assert!(matches!(
            handshake_result(&ConnectionState::Connected),
            Some(Ok(()))
        ));
        assert!(handshake_result(&ConnectionState::Connecting).is_none());
    }
}
