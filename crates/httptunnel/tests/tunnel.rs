use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use http::StatusCode;
use httptunnel::{
    handler_fn, Body, BoxFuture, Channel, ChannelConfig, Client, Context, Discovery, Handler,
    RawTarget, Recorder, Resolver, ResponseWriter, Server, StaticResolver, Target,
    DO_NOT_LOG_ERROR_HEADER,
};
use httptunnel_rpc::{CancellationToken, RpcConnection};
use pretty_assertions::assert_eq;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};

/// Echoes method, raw target, selected headers and body so the caller can see what arrived.
fn echo() -> impl Handler {
    handler_fn(|mut req: httptunnel::Request| async move {
        let body = req.body_mut().read_all().unwrap();
        let target = req
            .extensions()
            .get::<RawTarget>()
            .map(|t| t.as_str().to_owned())
            .unwrap_or_default();
        let tenant = req
            .headers()
            .get("x-scope-orgid")
            .map(|v| v.to_str().unwrap().to_owned())
            .unwrap_or_default();
        http::Response::builder()
            .status(StatusCode::OK)
            .header("x-echo-method", req.method().as_str())
            .header("x-echo-target", target)
            .header("x-echo-tenant", tenant)
            .header("set-cookie", "a=1")
            .header("set-cookie", "b=2")
            .body(body)
            .unwrap()
    })
}

/// Connects an origin to a terminus over an in-memory stream.
async fn tunnel<H: Handler>(handler: H) -> (Client<RpcConnection>, RpcConnection) {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let server = Server::new(handler);
    let (server_conn, client) = tokio::join!(
        server.serve_connection(server_io),
        RpcConnection::handshake_as_client(client_io)
    );
    let (client_conn, _welcome) = client.expect("client handshake");
    (
        Client::with_client(client_conn),
        server_conn.expect("server handshake"),
    )
}

async fn send(client: &impl Handler, req: httptunnel::Request) -> Recorder {
    let mut rec = Recorder::new();
    client.serve(req, &mut rec).await;
    rec
}

fn get(path: &str) -> httptunnel::Request {
    http::Request::builder()
        .uri(path)
        .body(Body::empty())
        .unwrap()
}

async fn body_of(client: &impl Handler) -> String {
    let rec = send(client, get("/")).await;
    assert_eq!(rec.status(), StatusCode::OK);
    String::from_utf8(rec.body().to_vec()).unwrap()
}

#[tokio::test]
async fn request_and_response_survive_the_tunnel() {
    let (client, _server) = tunnel(echo()).await;

    let req = http::Request::builder()
        .method("POST")
        .uri("/api/v1/push?org=a%2Fb")
        .header("X-Scope-OrgID", "tenant-1")
        .body(Body::from(vec![0u8, 1, 2, 255]))
        .unwrap();
    let rec = send(&client, req).await;

    assert_eq!(rec.status(), StatusCode::OK);
    assert_eq!(rec.body(), &[0u8, 1, 2, 255]);
    let headers = rec.headers();
    assert_eq!(headers.get("x-echo-method").unwrap(), "POST");
    assert_eq!(
        headers.get("x-echo-target").unwrap(),
        "/api/v1/push?org=a%2Fb"
    );
    assert_eq!(headers.get("x-echo-tenant").unwrap(), "tenant-1");
    let cookies: Vec<_> = headers.get_all("set-cookie").iter().collect();
    assert_eq!(cookies, vec!["a=1", "b=2"]);
}

#[tokio::test]
async fn server_errors_reach_the_caller_unchanged() {
    let handler = handler_fn(|req: httptunnel::Request| async move {
        let quiet = req.uri().path() == "/quiet";
        let mut resp = http::Response::builder()
            .status(StatusCode::SERVICE_UNAVAILABLE)
            .header("retry-after", "5");
        if quiet {
            resp = resp.header(DO_NOT_LOG_ERROR_HEADER, "");
        }
        resp.body(b"overloaded".to_vec()).unwrap()
    });
    let (client, _server) = tunnel(handler).await;

    for path in ["/loud", "/quiet"] {
        let req = http::Request::builder()
            .uri(path)
            .body(Body::empty())
            .unwrap();
        let rec = send(&client, req).await;
        assert_eq!(rec.status(), StatusCode::SERVICE_UNAVAILABLE, "{path}");
        assert_eq!(rec.body(), b"overloaded", "{path}");
        assert_eq!(rec.headers().get("retry-after").unwrap(), "5", "{path}");
        assert!(
            rec.headers().get(DO_NOT_LOG_ERROR_HEADER).is_none(),
            "{path}: marker header leaked"
        );
    }
}

#[tokio::test]
async fn transport_failures_become_500_with_the_error_text() {
    let (client, server) = tunnel(echo()).await;
    server.shutdown().await.unwrap();

    let req = http::Request::builder()
        .uri("/")
        .body(Body::empty())
        .unwrap();
    let rec = tokio::time::timeout(Duration::from_secs(5), send(&client, req))
        .await
        .expect("call hung after the terminus went away");
    assert_eq!(rec.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(!rec.body().is_empty());
    assert_eq!(
        rec.headers().get("content-type").unwrap(),
        "text/plain; charset=utf-8"
    );
}

/// A handler that waits for cancellation and reports whether it observed it.
struct WaitForCancel {
    observed: parking_lot::Mutex<Option<oneshot::Sender<()>>>,
}

impl Handler for WaitForCancel {
    fn serve<'a>(
        &'a self,
        req: httptunnel::Request,
        w: &'a mut dyn ResponseWriter,
    ) -> httptunnel::BoxFuture<'a, ()> {
        Box::pin(async move {
            let ctx = req
                .extensions()
                .get::<Context>()
                .cloned()
                .unwrap_or_default();
            ctx.done().await;
            if let Some(tx) = self.observed.lock().take() {
                let _ = tx.send(());
            }
            w.write_head(StatusCode::GATEWAY_TIMEOUT);
        })
    }
}

#[tokio::test]
async fn cancelling_the_caller_cancels_the_terminus_handler() {
    let (observed_tx, observed_rx) = oneshot::channel();
    let (client, _server) = tunnel(WaitForCancel {
        observed: parking_lot::Mutex::new(Some(observed_tx)),
    })
    .await;

    let (cancel_tx, token) = CancellationToken::channel();
    let mut req = http::Request::builder()
        .uri("/slow")
        .body(Body::empty())
        .unwrap();
    req.extensions_mut()
        .insert(Context::with_cancellation(token));

    let call = tokio::spawn(async move { send(&client, req).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel_tx.send(true).unwrap();

    let rec = tokio::time::timeout(Duration::from_secs(5), call)
        .await
        .expect("call did not return after cancellation")
        .unwrap();
    assert_eq!(rec.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(rec.body(), b"request cancelled\n");

    tokio::time::timeout(Duration::from_secs(5), observed_rx)
        .await
        .expect("terminus handler never saw the cancellation")
        .unwrap();
}

#[tokio::test]
async fn request_deadline_bounds_the_call() {
    let handler = handler_fn(|_req| async {
        tokio::time::sleep(Duration::from_secs(30)).await;
        http::Response::new(Vec::new())
    });
    let (client, _server) = tunnel(handler).await;
    let client = client.with_request_timeout(Duration::from_millis(50));

    let req = http::Request::builder()
        .uri("/")
        .body(Body::empty())
        .unwrap();
    let rec = tokio::time::timeout(Duration::from_secs(5), send(&client, req))
        .await
        .expect("deadline did not fire");
    assert_eq!(rec.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(rec.body(), b"deadline exceeded\n");
}

/// Starts a terminus on an ephemeral port whose handler answers with `name`.
async fn spawn_terminus(name: &'static str, shutdown: watch::Receiver<bool>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Server::new(handler_fn(move |_req| async move {
        http::Response::new(name.as_bytes().to_vec())
    }));
    tokio::spawn(async move { server.serve(listener, shutdown).await });
    addr
}

#[tokio::test]
async fn channel_round_robins_over_discovered_termini() {
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let a = spawn_terminus("a", shutdown_rx.clone()).await;
    let b = spawn_terminus("b", shutdown_rx).await;

    let discovery =
        Discovery::new().with_resolver("kubernetes", StaticResolver::new([a, b]));
    let client = Client::new("svc.ns:9095", discovery).unwrap();
    assert_eq!(
        client.channel().target(),
        &Target::parse("kubernetes:///svc.ns:9095")
    );
    assert_eq!(client.channel().connection_count(), 0);

    let mut hits = BTreeMap::new();
    for _ in 0..4 {
        let req = http::Request::builder()
            .uri("/")
            .body(Body::empty())
            .unwrap();
        let rec = send(&client, req).await;
        assert_eq!(rec.status(), StatusCode::OK);
        *hits
            .entry(String::from_utf8(rec.body().to_vec()).unwrap())
            .or_insert(0) += 1;
    }

    assert_eq!(client.channel().connection_count(), 2);
    assert_eq!(
        hits,
        BTreeMap::from([("a".to_owned(), 2), ("b".to_owned(), 2)])
    );
}

#[tokio::test]
async fn unreachable_termini_fall_back_to_500() {
    // Bind and drop to get a port nobody listens on.
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let discovery = Discovery::new().with_direct_resolver(StaticResolver::new([addr]));
    let client = Client::with_client(Channel::new(
        Target::parse(&httptunnel::parse_url("direct://terminus:9095").unwrap()),
        discovery,
    ));

    let req = http::Request::builder()
        .uri("/")
        .body(Body::empty())
        .unwrap();
    let rec = send(&client, req).await;
    assert_eq!(rec.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = String::from_utf8(rec.body().to_vec()).unwrap();
    assert!(body.starts_with("no terminus reachable at terminus:9095"), "{body}");
}

#[tokio::test]
async fn deadline_bounds_connection_setup() {
    // Accepts connections but never answers the hello.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    let client = Client::with_client(Channel::new(
        Target::parse("kubernetes:///svc.ns:9095"),
        Discovery::new().with_resolver("kubernetes", StaticResolver::new([addr])),
    ));

    let mut req = get("/");
    req.extensions_mut()
        .insert(Context::background().with_timeout(Duration::from_millis(100)));
    let started = Instant::now();
    let rec = tokio::time::timeout(Duration::from_secs(2), send(&client, req))
        .await
        .expect("connection setup ignored the request deadline");

    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(rec.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(rec.body(), b"deadline exceeded\n");
}

/// Resolves to whatever the test currently lists.
#[derive(Clone, Default)]
struct Listed(Arc<parking_lot::Mutex<Vec<SocketAddr>>>);

impl Resolver for Listed {
    fn resolve<'a>(&'a self, _endpoint: &'a str) -> BoxFuture<'a, io::Result<Vec<SocketAddr>>> {
        let addrs = self.0.lock().clone();
        Box::pin(async move { Ok(addrs) })
    }
}

#[tokio::test]
async fn channel_follows_termini_as_discovery_changes() {
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let a = spawn_terminus("a", shutdown_rx.clone()).await;
    let listed = Listed::default();
    listed.0.lock().push(a);

    let client = Client::with_client(Channel::with_config(
        Target::parse("kubernetes:///svc.ns:9095"),
        Discovery::new().with_resolver("kubernetes", listed.clone()),
        ChannelConfig {
            refresh_interval: Duration::from_millis(50),
            ..ChannelConfig::default()
        },
    ));
    assert_eq!(body_of(&client).await, "a");
    assert_eq!(client.channel().connection_count(), 1);

    let b = spawn_terminus("b", shutdown_rx).await;
    listed.0.lock().push(b);
    tokio::time::timeout(Duration::from_secs(5), async {
        while client.channel().connection_count() < 2 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            // Drives the refresh; a call may land on a connection being closed.
            send(&client, get("/")).await;
        }
    })
    .await
    .expect("new terminus never joined the channel");

    let mut hits = BTreeSet::new();
    for _ in 0..4 {
        hits.insert(body_of(&client).await);
    }
    assert_eq!(hits, BTreeSet::from(["a".to_owned(), "b".to_owned()]));

    listed.0.lock().retain(|addr| *addr != a);
    tokio::time::timeout(Duration::from_secs(5), async {
        while client.channel().connection_count() > 1 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            // Drives the refresh; a call may land on a connection being closed.
            send(&client, get("/")).await;
        }
    })
    .await
    .expect("removed terminus stayed in the channel");
    for _ in 0..3 {
        assert_eq!(body_of(&client).await, "b");
    }
}

#[tokio::test]
async fn panicking_handler_becomes_500() {
    let handler = handler_fn(|req: httptunnel::Request| async move {
        if req.uri().path() == "/boom" {
            panic!("handler exploded");
        }
        http::Response::new(b"fine".to_vec())
    });
    let (client, _server) = tunnel(handler).await;

    let rec = tokio::time::timeout(Duration::from_secs(5), send(&client, get("/boom")))
        .await
        .expect("call hung after the handler panicked");
    assert_eq!(rec.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(rec.body(), b"remote error: request handler panicked\n");

    let rec = send(&client, get("/ok")).await;
    assert_eq!(rec.status(), StatusCode::OK);
    assert_eq!(rec.body(), b"fine");
}

#[tokio::test]
async fn serve_stops_on_shutdown() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = Server::new(echo());
    let task = tokio::spawn(async move { server.serve(listener, shutdown_rx).await });

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("server did not stop")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn handler_observes_a_live_context() {
    let seen = Arc::new(AtomicBool::new(false));
    let flag = seen.clone();
    let handler = handler_fn(move |req: httptunnel::Request| {
        let has_ctx = req
            .extensions()
            .get::<Context>()
            .is_some_and(|ctx| !ctx.is_cancelled());
        flag.store(has_ctx, Ordering::SeqCst);
        async { http::Response::new(Vec::new()) }
    });
    let (client, _server) = tunnel(handler).await;

    let req = http::Request::builder()
        .uri("/")
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&client, req).await.status(), StatusCode::OK);
    assert!(seen.load(Ordering::SeqCst));
}
