//! Session correlation over in-memory transports.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use duplex_rpc_core::codec;
use duplex_rpc_core::envelope::{Envelope, RequestId};
use duplex_rpc_core::error::{ErrorObject, HandlerError, RpcError, codes};
use duplex_rpc_core::methods;
use duplex_rpc_core::transport::TransportError;
use duplex_rpc_runtime::config::SessionConfig;
use duplex_rpc_runtime::session::{
    CancellationToken, HandlerRegistry, RequestOptions, Session, SessionExit,
};
use duplex_rpc_testing::memory::{self, RawPeer};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

const WAIT: Duration = Duration::from_secs(2);
const QUIET: Duration = Duration::from_millis(150);

fn start_raw(registry: HandlerRegistry) -> (Session, RawPeer) {
    duplex_rpc_testing::init_tracing();
    let (connection, peer) = memory::raw(64);
    (Session::start(connection, registry, SessionConfig::default()), peer)
}

fn start_pair(a: HandlerRegistry, b: HandlerRegistry) -> (Session, Session) {
    duplex_rpc_testing::init_tracing();
    let (left, right) = memory::pair(64);
    (
        Session::start(left, a, SessionConfig::default()),
        Session::start(right, b, SessionConfig::default()),
    )
}

fn echo_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.on_request("echo", |cx| async move {
        Ok(cx.raw_params().cloned().unwrap_or(Value::Null))
    });
    registry
}

fn error_code(envelope: &Envelope) -> i64 {
    match envelope {
        Envelope::Error(response) => response.error.code,
        other => panic!("expected an error response, got {other:?}"),
    }
}

fn cancelled_notification(id: i64) -> Envelope {
    Envelope::notification(
        methods::CANCELLED,
        Some(json!({"requestId": id, "reason": "test"})),
    )
}

#[tokio::test]
async fn concurrent_requests_each_get_their_own_response() {
    let (client, _server) = start_pair(HandlerRegistry::new(), echo_registry());

    let calls: Vec<_> = (0..50)
        .map(|n| {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .send_request("echo", Some(json!({"n": n})), RequestOptions::default())
                    .await
            })
        })
        .collect();

    for (n, call) in calls.into_iter().enumerate() {
        assert_eq!(call.await.unwrap().unwrap(), json!({"n": n}));
    }
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test]
async fn responses_match_by_id_not_by_order() {
    let (session, mut peer) = start_raw(HandlerRegistry::new());

    let first = {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .send_request("a", None, RequestOptions::default())
                .await
        })
    };
    let a = peer.recv_timeout(WAIT).await.unwrap();
    let second = {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .send_request("b", None, RequestOptions::default())
                .await
        })
    };
    let b = peer.recv_timeout(WAIT).await.unwrap();

    assert_eq!(a.id(), Some(&RequestId::Number(0)));
    assert_eq!(b.id(), Some(&RequestId::Number(1)));

    peer.send(Envelope::result(1, json!("for b"))).await.unwrap();
    peer.send(Envelope::result(0, json!("for a"))).await.unwrap();

    assert_eq!(first.await.unwrap().unwrap(), json!("for a"));
    assert_eq!(second.await.unwrap().unwrap(), json!("for b"));
}

#[tokio::test]
async fn error_responses_resolve_as_remote_errors() {
    let (session, mut peer) = start_raw(HandlerRegistry::new());
    let call = {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .send_request("x", None, RequestOptions::default())
                .await
        })
    };
    let request = peer.recv_timeout(WAIT).await.unwrap();
    peer.send(Envelope::error(
        request.id().cloned().unwrap(),
        ErrorObject::invalid_params("nope"),
    ))
    .await
    .unwrap();

    match call.await.unwrap() {
        Err(RpcError::Remote(error)) => assert_eq!(error.code, codes::INVALID_PARAMS),
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[tokio::test]
async fn timed_out_requests_drop_late_responses() {
    let (session, mut peer) = start_raw(HandlerRegistry::new());

    let outcome = session
        .send_request(
            "slow",
            None,
            RequestOptions::default().with_timeout(Duration::from_millis(50)),
        )
        .await;
    assert!(matches!(outcome, Err(RpcError::Timeout { .. })));
    assert_eq!(session.pending_requests(), 0);

    let request = peer.recv_timeout(WAIT).await.unwrap();
    let id = request.id().cloned().unwrap();
    let cancel = peer.recv_timeout(WAIT).await.unwrap();
    assert_eq!(cancel.method(), Some(methods::CANCELLED));
    assert_eq!(cancel.to_value()["params"]["requestId"], id.to_value());

    // The late answer is discarded and does not disturb the next request.
    peer.send(Envelope::result(id, json!("late"))).await.unwrap();
    let next = {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .send_request("ping", None, RequestOptions::default())
                .await
        })
    };
    let ping = peer.recv_timeout(WAIT).await.unwrap();
    assert_eq!(ping.id(), Some(&RequestId::Number(1)));
    peer.send(Envelope::result(1, json!("pong"))).await.unwrap();
    assert_eq!(next.await.unwrap().unwrap(), json!("pong"));
}

#[tokio::test]
async fn cancel_token_fails_locally_and_tells_the_peer() {
    let (session, mut peer) = start_raw(HandlerRegistry::new());
    let token = CancellationToken::new();
    let call = {
        let session = session.clone();
        let token = token.clone();
        tokio::spawn(async move {
            session
                .send_request("long", None, RequestOptions::default().with_cancel(token))
                .await
        })
    };

    let request = peer.recv_timeout(WAIT).await.unwrap();
    token.cancel();
    assert!(matches!(call.await.unwrap(), Err(RpcError::Cancelled(_))));

    let cancel = peer.recv_timeout(WAIT).await.unwrap();
    assert_eq!(cancel.method(), Some(methods::CANCELLED));
    assert_eq!(
        cancel.to_value()["params"]["requestId"],
        request.id().unwrap().to_value()
    );
}

#[tokio::test]
async fn dropping_the_future_cancels_the_request() {
    let (session, mut peer) = start_raw(HandlerRegistry::new());
    let call = {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .send_request("long", None, RequestOptions::default())
                .await
        })
    };
    peer.recv_timeout(WAIT).await.unwrap();
    call.abort();
    let _ = call.await;

    let cancel = peer.recv_timeout(WAIT).await.unwrap();
    assert_eq!(cancel.method(), Some(methods::CANCELLED));
    assert_eq!(session.pending_requests(), 0);
}

#[tokio::test]
async fn unknown_methods_answer_method_not_found() {
    let (_session, mut peer) = start_raw(HandlerRegistry::new());
    peer.send(Envelope::request(7, "nope", None)).await.unwrap();
    let response = peer.recv_timeout(WAIT).await.unwrap();
    assert_eq!(response.id(), Some(&RequestId::Number(7)));
    assert_eq!(error_code(&response), codes::METHOD_NOT_FOUND);
}

#[tokio::test]
async fn handler_failures_map_to_error_codes() {
    #[derive(serde::Deserialize)]
    struct Args {
        #[allow(dead_code)]
        count: u32,
    }

    let mut registry = HandlerRegistry::new();
    registry
        .on_request("typed", |cx| async move {
            let _args: Args = cx.params()?;
            Ok(json!("ok"))
        })
        .on_request("custom", |_cx| async {
            Err::<Value, _>(HandlerError::Rpc(ErrorObject::new(-1, "custom")))
        })
        .on_request("broken", |_cx| async { Err::<Value, _>(HandlerError::internal("db down")) })
        .on_request("panics", |_cx| async {
            let missing: Option<Value> = None;
            Ok(missing.expect("handler bug"))
        });
    let (_session, mut peer) = start_raw(registry);

    peer.send(Envelope::request(1, "typed", Some(json!({"count": "x"}))))
        .await
        .unwrap();
    assert_eq!(error_code(&peer.recv_timeout(WAIT).await.unwrap()), codes::INVALID_PARAMS);

    peer.send(Envelope::request(2, "custom", None)).await.unwrap();
    assert_eq!(error_code(&peer.recv_timeout(WAIT).await.unwrap()), -1);

    peer.send(Envelope::request(3, "broken", None)).await.unwrap();
    assert_eq!(error_code(&peer.recv_timeout(WAIT).await.unwrap()), codes::INTERNAL_ERROR);

    peer.send(Envelope::request(4, "panics", None)).await.unwrap();
    let response = peer.recv_timeout(WAIT).await.unwrap();
    assert_eq!(response.id(), Some(&RequestId::Number(4)));
    assert_eq!(error_code(&response), codes::INTERNAL_ERROR);
}

#[tokio::test]
async fn duplicate_open_ids_are_rejected() {
    let mut registry = HandlerRegistry::new();
    registry.on_request("wait", |_cx| async {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(json!(null))
    });
    let (session, mut peer) = start_raw(registry);

    peer.send(Envelope::request(5, "wait", None)).await.unwrap();
    peer.send(Envelope::request(5, "wait", None)).await.unwrap();
    let response = peer.recv_timeout(WAIT).await.unwrap();
    assert_eq!(response.id(), Some(&RequestId::Number(5)));
    assert_eq!(error_code(&response), codes::INVALID_REQUEST);
    assert_eq!(session.inbound_calls(), 1);
}

#[tokio::test]
async fn null_ids_are_rejected_without_a_response() {
    let (_session, mut peer) = start_raw(echo_registry());

    let null_id = codec::decode(br#"{"jsonrpc":"2.0","id":null,"method":"echo"}"#).unwrap_err();
    assert_eq!(null_id.salvaged_id(), None);
    peer.send_error(TransportError::from(null_id)).await.unwrap();
    assert_eq!(peer.recv_timeout(QUIET).await, None);

    // A salvageable id gets an error response; the session keeps going.
    let bad_version = codec::decode(br#"{"jsonrpc":"1.0","id":9,"method":"echo"}"#).unwrap_err();
    peer.send_error(bad_version.into()).await.unwrap();
    let response = peer.recv_timeout(WAIT).await.unwrap();
    assert_eq!(response.id(), Some(&RequestId::Number(9)));
    assert_eq!(error_code(&response), codes::INVALID_REQUEST);

    peer.send(Envelope::request(10, "echo", Some(json!([1])))).await.unwrap();
    assert_eq!(
        peer.recv_timeout(WAIT).await.unwrap(),
        Envelope::result(10, json!([1]))
    );
}

#[tokio::test]
async fn malformed_responses_fail_the_request_without_a_reply() {
    let (session, mut peer) = start_raw(HandlerRegistry::new());

    let call = tokio::spawn({
        let session = session.clone();
        async move {
            session
                .send_request("lookup", None, RequestOptions::default().with_timeout(WAIT * 5))
                .await
        }
    });
    let request = peer.recv_timeout(WAIT).await.unwrap();
    assert_eq!(request.id(), Some(&RequestId::Number(0)));

    let malformed = codec::decode(br#"{"id":0,"error":{"bogus":1}}"#).unwrap_err();
    peer.send_error(malformed.into()).await.unwrap();

    let outcome = tokio::time::timeout(WAIT, call).await.unwrap().unwrap();
    assert!(matches!(outcome, Err(RpcError::InvalidResult(_))), "got {outcome:?}");
    assert_eq!(session.pending_requests(), 0);
    assert_eq!(peer.recv_timeout(QUIET).await, None);
}

#[tokio::test]
async fn oversized_bodies_are_dropped_and_the_session_keeps_going() {
    duplex_rpc_testing::init_tracing();
    let config = SessionConfig::default().with_max_body_bytes(128);
    let (connection, mut peer) = memory::bodies(8, config.max_body_bytes);
    let _session = Session::start(connection, echo_registry(), config);

    let padding = "x".repeat(200);
    let oversized = codec::encode(&Envelope::request(1, "echo", Some(json!([padding])))).unwrap();
    peer.post(&oversized, 32).await.unwrap();
    assert_eq!(peer.recv_timeout(QUIET).await, None);

    let small = codec::encode(&Envelope::request(2, "echo", Some(json!([1])))).unwrap();
    peer.post(&small, 8).await.unwrap();
    assert_eq!(
        peer.recv_timeout(WAIT).await.unwrap(),
        Envelope::result(2, json!([1]))
    );
}

#[tokio::test]
async fn cancelled_inbound_requests_never_respond() {
    let mut registry = HandlerRegistry::new();
    registry.on_request("wait", |_cx| async {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(json!("too late"))
    });
    let (session, mut peer) = start_raw(registry);

    peer.send(Envelope::request(1, "wait", None)).await.unwrap();
    peer.send(cancelled_notification(1)).await.unwrap();
    assert_eq!(peer.recv_timeout(QUIET).await, None);
    assert_eq!(session.inbound_calls(), 0);
}

#[tokio::test]
async fn cancel_racing_completion_yields_at_most_one_response() {
    let mut registry = HandlerRegistry::new();
    registry.on_request("fast", |_cx| async { Ok(json!("done")) });
    let (session, mut peer) = start_raw(registry);

    for id in 0..50 {
        peer.send(Envelope::request(id, "fast", None)).await.unwrap();
        peer.send(cancelled_notification(id)).await.unwrap();
    }

    let mut responses = Vec::new();
    while let Some(envelope) = peer.recv_timeout(QUIET).await {
        responses.push(envelope.id().cloned().unwrap());
    }
    let mut deduped = responses.clone();
    deduped.sort();
    deduped.dedup();
    assert_eq!(deduped.len(), responses.len(), "a request was answered twice");
    assert_eq!(session.inbound_calls(), 0);
}

#[tokio::test]
async fn handlers_observe_cancellation() {
    let observed = Arc::new(Mutex::new(false));
    let mut registry = HandlerRegistry::new();
    let flag = Arc::clone(&observed);
    registry.on_request("watch", move |cx| {
        let flag = Arc::clone(&flag);
        async move {
            let token = cx.cancel_token().clone();
            tokio::spawn(async move {
                token.cancelled().await;
                *flag.lock().unwrap() = true;
            });
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(json!(null))
        }
    });
    let (_session, mut peer) = start_raw(registry);

    peer.send(Envelope::request(1, "watch", None)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    peer.send(cancelled_notification(1)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(*observed.lock().unwrap());
}

#[tokio::test]
async fn notifications_run_in_arrival_order() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut registry = HandlerRegistry::new();
    let log = Arc::clone(&seen);
    registry.on_notification("tick", move |cx| {
        let log = Arc::clone(&log);
        async move {
            let n: u32 = cx.raw_params().and_then(|p| p["n"].as_u64()).unwrap().try_into().unwrap();
            // A slow first handler must not let later ones overtake it.
            if n == 0 {
                tokio::time::sleep(Duration::from_millis(30)).await;
            }
            log.lock().unwrap().push(n);
        }
    });
    let fallback = Arc::clone(&seen);
    registry.on_unknown_notification(move |_cx| {
        let log = Arc::clone(&fallback);
        async move { log.lock().unwrap().push(99) }
    });
    let (_session, mut peer) = start_raw(registry);

    for n in 0..3 {
        peer.send(Envelope::notification("tick", Some(json!({"n": n}))))
            .await
            .unwrap();
    }
    peer.send(Envelope::notification("other", None)).await.unwrap();
    tokio::time::sleep(QUIET).await;
    assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 99]);
}

#[tokio::test]
async fn handlers_can_call_back_into_the_caller() {
    let mut caller = HandlerRegistry::new();
    caller.on_request("inner", |_cx| async { Ok(json!(41)) });

    let mut callee = HandlerRegistry::new();
    callee.on_request("outer", |cx| async move {
        let inner: i64 = cx.session().request("inner", &json!({})).await?;
        Ok(json!(inner + 1))
    });

    let (a, _b) = start_pair(caller, callee);
    assert_eq!(
        a.send_request("outer", None, RequestOptions::default())
            .await
            .unwrap(),
        json!(42)
    );
}

#[tokio::test]
async fn progress_reaches_the_callers_callback() {
    let mut server = HandlerRegistry::new();
    server.on_request("work", |cx| async move {
        for step in 1..=3u8 {
            cx.report_progress(f64::from(step), Some(3.0), Some(format!("step {step}")))
                .await;
        }
        Ok(json!("done"))
    });
    let (client, _server) = start_pair(HandlerRegistry::new(), server);

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    let result = client
        .send_request(
            "work",
            Some(json!({})),
            RequestOptions::default().with_progress(move |progress| {
                sink.lock().unwrap().push(progress.progress);
            }),
        )
        .await
        .unwrap();

    assert_eq!(result, json!("done"));
    assert_eq!(*received.lock().unwrap(), vec![1.0, 2.0, 3.0]);
}

#[tokio::test]
async fn typed_requests_validate_the_result_shape() {
    #[derive(serde::Deserialize, Debug)]
    struct Pong {
        #[allow(dead_code)]
        pong: bool,
    }

    let (client, _server) = start_pair(HandlerRegistry::new(), echo_registry());
    let ok: Pong = assert_ok!(client.request("echo", &json!({"pong": true})).await);
    assert!(ok.pong);
    let err = assert_err!(client.request::<_, Pong>("echo", &json!({"ping": 1})).await);
    assert!(matches!(err, RpcError::InvalidResult(_)));
}

#[tokio::test]
async fn pending_limit_is_enforced() {
    duplex_rpc_testing::init_tracing();
    let (connection, mut peer) = memory::raw(8);
    let session = Session::start(
        connection,
        HandlerRegistry::new(),
        SessionConfig::default().with_max_pending_requests(1),
    );

    let first = {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .send_request("a", None, RequestOptions::default())
                .await
        })
    };
    peer.recv_timeout(WAIT).await.unwrap();
    let second = session
        .send_request("b", None, RequestOptions::default())
        .await;
    assert!(matches!(second, Err(RpcError::TooManyPending(1))));

    peer.send(Envelope::result(0, json!(true))).await.unwrap();
    assert_eq!(first.await.unwrap().unwrap(), json!(true));
}

#[tokio::test]
async fn peer_hangup_fails_every_pending_request() {
    let (session, mut peer) = start_raw(HandlerRegistry::new());
    let calls: Vec<_> = (0..3)
        .map(|_| {
            let session = session.clone();
            tokio::spawn(async move {
                session
                    .send_request("x", None, RequestOptions::default())
                    .await
            })
        })
        .collect();
    for _ in 0..3 {
        peer.recv_timeout(WAIT).await.unwrap();
    }

    peer.close();
    for call in calls {
        assert!(matches!(call.await.unwrap(), Err(RpcError::ConnectionClosed)));
    }
    assert_eq!(session.closed().await, SessionExit::PeerClosed);
    assert!(session.is_closed());

    let after = session.send_request("y", None, RequestOptions::default()).await;
    assert!(matches!(after, Err(RpcError::ConnectionClosed)));
}

#[tokio::test]
async fn fatal_transport_errors_end_the_session() {
    let (session, mut peer) = start_raw(HandlerRegistry::new());
    peer.send_error(TransportError::Io("reset by peer".into()))
        .await
        .unwrap();
    assert_eq!(
        session.closed().await,
        SessionExit::TransportFailed("I/O error: reset by peer".into())
    );
}

#[tokio::test]
async fn close_stops_the_session_and_the_peer_sees_eof() {
    let (session, mut peer) = start_raw(HandlerRegistry::new());
    session.send_notification("bye", None).await;
    session.close();
    assert_eq!(session.closed().await, SessionExit::Closed);

    assert_eq!(
        peer.recv_timeout(WAIT).await,
        Some(Envelope::notification("bye", None))
    );
    assert_eq!(peer.recv_timeout(WAIT).await, None);
}
