//! HTTP surface
//!
//! Thin warp adapters over the relay service. Every MQTT operation answers
//! `{ success, ...echoed params }`; failures answer `{ error, code, details }`
//! with a status derived from the error kind. `/ws` upgrades to a live
//! gateway channel.
//!
//! Topic and key names travel as single percent-encoded path segments, so
//! `sensors/temp` arrives as `sensors%2Ftemp`.

use crate::error::{sanitize_error_message, FailureResponse, RelayError};
use crate::observability::metrics::metrics;
use crate::persistence::NewConnection;
use crate::service::RelayService;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{debug, Instrument};
use warp::http::StatusCode;
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

const MAX_BODY_BYTES: u64 = 64 * 1024;
const DEFAULT_MESSAGE_LIMIT: usize = 100;

#[derive(Debug, Deserialize)]
pub struct SubscribeRequest {
    pub topic: String,
    #[serde(default)]
    pub qos: u8,
}

#[derive(Debug, Deserialize)]
pub struct UnsubscribeRequest {
    pub topic: String,
}

#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    pub topic: String,
    pub payload: String,
    #[serde(default)]
    pub qos: u8,
    #[serde(default)]
    pub retain: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageQuery {
    pub connection_id: Option<i64>,
    pub limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConnectResponse {
    success: bool,
    connection_id: i64,
    connected: bool,
}

#[derive(Debug, Serialize)]
struct SuccessResponse {
    success: bool,
}

#[derive(Debug, Serialize)]
struct SubscribeResponse {
    success: bool,
    topic: String,
    qos: u8,
}

#[derive(Debug, Serialize)]
struct UnsubscribeResponse {
    success: bool,
    topic: String,
}

#[derive(Debug, Serialize)]
struct PublishResponse {
    success: bool,
    topic: String,
    payload: String,
    qos: u8,
    retain: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    connection_id: i64,
    connected: bool,
}

#[derive(Debug, Serialize)]
struct ClearResponse {
    success: bool,
    removed: u64,
}

/// Every route, with rejections turned into JSON failures
pub fn routes(
    service: Arc<RelayService>,
) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    connection_routes(service.clone())
        .or(operation_routes(service.clone()))
        .unify()
        .or(message_routes(service.clone()))
        .unify()
        .or(topic_routes(service.clone()))
        .unify()
        .or(live_route(service.clone()))
        .unify()
        .or(monitoring_routes(service))
        .unify()
        .recover(handle_rejection)
        .with(warp::trace::request())
}

fn with_service(
    service: Arc<RelayService>,
) -> impl Filter<Extract = (Arc<RelayService>,), Error = Infallible> + Clone {
    warp::any().map(move || service.clone())
}

fn json_body<T>() -> impl Filter<Extract = (T,), Error = Rejection> + Clone
where
    T: for<'de> Deserialize<'de> + Send,
{
    warp::body::content_length_limit(MAX_BODY_BYTES).and(warp::body::json())
}

fn connection_routes(
    service: Arc<RelayService>,
) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    let base = warp::path("api").and(warp::path("connections"));

    let list = base
        .and(warp::path::end())
        .and(warp::get())
        .and(with_service(service.clone()))
        .and_then(list_connections);

    let create = base
        .and(warp::path::end())
        .and(warp::post())
        .and(json_body::<NewConnection>())
        .and(with_service(service.clone()))
        .and_then(create_connection);

    let delete = base
        .and(warp::path::param::<i64>())
        .and(warp::path::end())
        .and(warp::delete())
        .and(with_service(service.clone()))
        .and_then(delete_connection);

    let status = base
        .and(warp::path::param::<i64>())
        .and(warp::path("status"))
        .and(warp::path::end())
        .and(warp::get())
        .and(with_service(service.clone()))
        .and_then(connection_status);

    let topics = base
        .and(warp::path::param::<i64>())
        .and(warp::path("topics"))
        .and(warp::path::end())
        .and(warp::get())
        .and(with_service(service))
        .and_then(list_topics);

    list.or(create)
        .unify()
        .or(delete)
        .unify()
        .or(status)
        .unify()
        .or(topics)
        .unify()
}

fn operation_routes(
    service: Arc<RelayService>,
) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    let base = warp::path("api")
        .and(warp::path("connections"))
        .and(warp::path::param::<i64>());

    let connect = base
        .and(warp::path("connect"))
        .and(warp::path::end())
        .and(warp::post())
        .and(with_service(service.clone()))
        .and_then(connect);

    let disconnect = base
        .and(warp::path("disconnect"))
        .and(warp::path::end())
        .and(warp::post())
        .and(with_service(service.clone()))
        .and_then(disconnect);

    let subscribe = base
        .and(warp::path("subscribe"))
        .and(warp::path::end())
        .and(warp::post())
        .and(json_body::<SubscribeRequest>())
        .and(with_service(service.clone()))
        .and_then(subscribe);

    let unsubscribe = base
        .and(warp::path("unsubscribe"))
        .and(warp::path::end())
        .and(warp::post())
        .and(json_body::<UnsubscribeRequest>())
        .and(with_service(service.clone()))
        .and_then(unsubscribe);

    let publish = base
        .and(warp::path("publish"))
        .and(warp::path::end())
        .and(warp::post())
        .and(json_body::<PublishRequest>())
        .and(with_service(service))
        .and_then(publish);

    connect
        .or(disconnect)
        .unify()
        .or(subscribe)
        .unify()
        .or(unsubscribe)
        .unify()
        .or(publish)
        .unify()
}

fn message_routes(
    service: Arc<RelayService>,
) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    let base = warp::path("api")
        .and(warp::path("messages"))
        .and(warp::path::end())
        .and(warp::query::<MessageQuery>());

    let list = base
        .and(warp::get())
        .and(with_service(service.clone()))
        .and_then(list_messages);

    let clear = base
        .and(warp::delete())
        .and(with_service(service))
        .and_then(clear_messages);

    list.or(clear).unify()
}

fn decoded_segment() -> impl Filter<Extract = (String,), Error = Rejection> + Clone {
    warp::path::param::<String>().map(|raw: String| decode_segment(&raw))
}

/// Percent-decode one path segment; `+` is kept literal
fn decode_segment(raw: &str) -> String {
    let escaped = raw
        .replace('+', "%2B")
        .replace('&', "%26")
        .replace('=', "%3D");
    url::form_urlencoded::parse(escaped.as_bytes())
        .next()
        .map(|(name, _)| name.into_owned())
        .unwrap_or_default()
}

fn topic_routes(
    service: Arc<RelayService>,
) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    let by_topic = warp::path!("api" / "messages" / "topic" / ..)
        .and(decoded_segment())
        .and(warp::path::end())
        .and(warp::get())
        .and(warp::query::<LimitQuery>())
        .and(with_service(service.clone()))
        .and_then(messages_by_topic);

    let topic_base = warp::path!("api" / "topics" / ..)
        .and(decoded_segment())
        .and(warp::path("keys"));

    let keys = topic_base
        .clone()
        .and(warp::path::end())
        .and(warp::get())
        .and(with_service(service.clone()))
        .and_then(topic_keys);

    let values = topic_base
        .and(decoded_segment())
        .and(warp::path("values"))
        .and(warp::path::end())
        .and(warp::get())
        .and(warp::query::<LimitQuery>())
        .and(with_service(service))
        .and_then(key_values);

    by_topic.or(keys).unify().or(values).unify()
}

fn live_route(
    service: Arc<RelayService>,
) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    warp::path("ws")
        .and(warp::path::end())
        .and(warp::ws())
        .and(with_service(service))
        .map(|ws: warp::ws::Ws, service: Arc<RelayService>| {
            let max_frame = service.gateway().max_frame_bytes();
            ws.max_frame_size(max_frame)
                .max_message_size(max_frame)
                .on_upgrade(move |socket| {
                    let span = crate::gateway_span!(channel = %uuid::Uuid::new_v4());
                    async move {
                        let end = service.gateway().serve_channel(socket).await;
                        debug!(?end, "Live channel finished");
                    }
                    .instrument(span)
                })
                .into_response()
        })
}

fn monitoring_routes(
    service: Arc<RelayService>,
) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    let health = warp::path("health")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_service(service))
        .and_then(|service: Arc<RelayService>| async move {
            let report = service.health().await;
            let status = if report.status == "stopping" {
                StatusCode::SERVICE_UNAVAILABLE
            } else {
                StatusCode::OK
            };
            Ok::<_, Infallible>(json_reply(&report, status))
        });

    let metrics_route = warp::path("metrics")
        .and(warp::path::end())
        .and(warp::get())
        .map(|| json_reply(&metrics().get_metrics(), StatusCode::OK));

    health.or(metrics_route).unify()
}

fn json_reply<T: Serialize>(body: &T, status: StatusCode) -> Response {
    warp::reply::with_status(warp::reply::json(body), status).into_response()
}

fn failure_reply(error: &RelayError, summary: &str) -> Response {
    let status =
        StatusCode::from_u16(error.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    json_reply(&error.to_failure(summary), status)
}

async fn list_connections(service: Arc<RelayService>) -> Result<Response, Infallible> {
    Ok(match service.list_connections().await {
        Ok(connections) => json_reply(&connections, StatusCode::OK),
        Err(e) => failure_reply(&e, "Failed to fetch connections"),
    })
}

async fn create_connection(
    new: NewConnection,
    service: Arc<RelayService>,
) -> Result<Response, Infallible> {
    Ok(match service.create_connection(new).await {
        Ok(connection) => json_reply(&connection, StatusCode::CREATED),
        Err(e) => failure_reply(&e, "Failed to create connection"),
    })
}

async fn delete_connection(id: i64, service: Arc<RelayService>) -> Result<Response, Infallible> {
    Ok(match service.delete_connection(id).await {
        Ok(()) => json_reply(&SuccessResponse { success: true }, StatusCode::OK),
        Err(e) => failure_reply(&e, "Failed to delete connection"),
    })
}

async fn connection_status(id: i64, service: Arc<RelayService>) -> Result<Response, Infallible> {
    let connected = service.registry().status(id).await;
    Ok(json_reply(
        &StatusResponse {
            connection_id: id,
            connected,
        },
        StatusCode::OK,
    ))
}

async fn list_topics(id: i64, service: Arc<RelayService>) -> Result<Response, Infallible> {
    Ok(match service.topics(id).await {
        Ok(topics) => json_reply(&topics, StatusCode::OK),
        Err(e) => failure_reply(&e, "Failed to fetch topics"),
    })
}

async fn connect(id: i64, service: Arc<RelayService>) -> Result<Response, Infallible> {
    let registry = service.registry();
    Ok(match registry.connect(id).await {
        Ok(()) => json_reply(
            &ConnectResponse {
                success: true,
                connection_id: id,
                connected: registry.status(id).await,
            },
            StatusCode::OK,
        ),
        Err(e) => failure_reply(&e, "Failed to connect to MQTT broker"),
    })
}

async fn disconnect(id: i64, service: Arc<RelayService>) -> Result<Response, Infallible> {
    service.registry().disconnect(id).await;
    Ok(json_reply(&SuccessResponse { success: true }, StatusCode::OK))
}

async fn subscribe(
    id: i64,
    request: SubscribeRequest,
    service: Arc<RelayService>,
) -> Result<Response, Infallible> {
    Ok(
        match service
            .registry()
            .subscribe(id, &request.topic, request.qos)
            .await
        {
            Ok(()) => json_reply(
                &SubscribeResponse {
                    success: true,
                    topic: request.topic,
                    qos: request.qos,
                },
                StatusCode::OK,
            ),
            Err(e) => failure_reply(&e, "Failed to subscribe to topic"),
        },
    )
}

async fn unsubscribe(
    id: i64,
    request: UnsubscribeRequest,
    service: Arc<RelayService>,
) -> Result<Response, Infallible> {
    Ok(match service.registry().unsubscribe(id, &request.topic).await {
        Ok(()) => json_reply(
            &UnsubscribeResponse {
                success: true,
                topic: request.topic,
            },
            StatusCode::OK,
        ),
        Err(e) => failure_reply(&e, "Failed to unsubscribe from topic"),
    })
}

async fn publish(
    id: i64,
    request: PublishRequest,
    service: Arc<RelayService>,
) -> Result<Response, Infallible> {
    let result = service
        .registry()
        .publish(
            id,
            &request.topic,
            &request.payload,
            request.qos,
            request.retain,
        )
        .await;
    Ok(match result {
        Ok(()) => json_reply(
            &PublishResponse {
                success: true,
                topic: request.topic,
                payload: request.payload,
                qos: request.qos,
                retain: request.retain,
            },
            StatusCode::OK,
        ),
        Err(e) => failure_reply(&e, "Failed to publish message"),
    })
}

async fn list_messages(
    query: MessageQuery,
    service: Arc<RelayService>,
) -> Result<Response, Infallible> {
    let limit = query.limit.unwrap_or(DEFAULT_MESSAGE_LIMIT);
    Ok(
        match service
            .persistence()
            .get_messages(query.connection_id, limit)
            .await
        {
            Ok(messages) => json_reply(&messages, StatusCode::OK),
            Err(e) => failure_reply(&RelayError::from(e), "Failed to fetch messages"),
        },
    )
}

async fn clear_messages(
    query: MessageQuery,
    service: Arc<RelayService>,
) -> Result<Response, Infallible> {
    Ok(
        match service.persistence().clear_messages(query.connection_id).await {
            Ok(removed) => json_reply(
                &ClearResponse {
                    success: true,
                    removed,
                },
                StatusCode::OK,
            ),
            Err(e) => failure_reply(&RelayError::from(e), "Failed to clear messages"),
        },
    )
}

fn require_topic(topic: &str) -> Result<(), RelayError> {
    if topic.trim().is_empty() {
        return Err(RelayError::EmptyTopic);
    }
    Ok(())
}

async fn messages_by_topic(
    topic: String,
    query: LimitQuery,
    service: Arc<RelayService>,
) -> Result<Response, Infallible> {
    if let Err(e) = require_topic(&topic) {
        return Ok(failure_reply(&e, "Failed to fetch messages"));
    }
    let limit = query.limit.unwrap_or(DEFAULT_MESSAGE_LIMIT);
    Ok(
        match service.persistence().get_messages_by_topic(&topic, limit).await {
            Ok(messages) => json_reply(&messages, StatusCode::OK),
            Err(e) => failure_reply(&RelayError::from(e), "Failed to fetch messages"),
        },
    )
}

async fn topic_keys(topic: String, service: Arc<RelayService>) -> Result<Response, Infallible> {
    if let Err(e) = require_topic(&topic) {
        return Ok(failure_reply(&e, "Failed to fetch topic keys"));
    }
    Ok(match service.persistence().get_topic_keys(&topic).await {
        Ok(keys) => json_reply(&keys, StatusCode::OK),
        Err(e) => failure_reply(&RelayError::from(e), "Failed to fetch topic keys"),
    })
}

async fn key_values(
    topic: String,
    key_name: String,
    query: LimitQuery,
    service: Arc<RelayService>,
) -> Result<Response, Infallible> {
    if let Err(e) = require_topic(&topic) {
        return Ok(failure_reply(&e, "Failed to fetch key values"));
    }
    let limit = query.limit.unwrap_or(DEFAULT_MESSAGE_LIMIT);
    Ok(
        match service
            .persistence()
            .get_key_values(&topic, &key_name, limit)
            .await
        {
            Ok(values) => json_reply(&values, StatusCode::OK),
            Err(e) => failure_reply(&RelayError::from(e), "Failed to fetch key values"),
        },
    )
}

async fn handle_rejection(rejection: Rejection) -> Result<Response, Infallible> {
    let (status, code, summary, details) = if rejection.is_not_found() {
        (
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            "Route not found",
            String::new(),
        )
    } else if let Some(e) = rejection.find::<warp::filters::body::BodyDeserializeError>() {
        (
            StatusCode::BAD_REQUEST,
            "INVALID_INPUT",
            "Invalid request body",
            e.to_string(),
        )
    } else if let Some(e) = rejection.find::<warp::reject::InvalidQuery>() {
        (
            StatusCode::BAD_REQUEST,
            "INVALID_INPUT",
            "Invalid query string",
            e.to_string(),
        )
    } else if rejection.find::<warp::reject::PayloadTooLarge>().is_some() {
        (
            StatusCode::PAYLOAD_TOO_LARGE,
            "INVALID_INPUT",
            "Request body too large",
            String::new(),
        )
    } else if rejection.find::<warp::reject::MethodNotAllowed>().is_some() {
        (
            StatusCode::METHOD_NOT_ALLOWED,
            "METHOD_NOT_ALLOWED",
            "Method not allowed",
            String::new(),
        )
    } else {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL",
            "Unhandled request failure",
            format!("{rejection:?}"),
        )
    };

    Ok(json_reply(
        &FailureResponse {
            error: summary.to_string(),
            code,
            details: sanitize_error_message(&details),
        },
        status,
    ))
}
