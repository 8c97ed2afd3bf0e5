//! Test-only helpers for spinning up a throwaway HTTP server and asserting
//! against it. Not compiled into the release binary.

use std::convert::Infallible;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{LazyLock, Mutex};
use std::{collections::HashSet, net::TcpListener as StdTcpListener};

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use serde_json::Value;

const MAX_PORT_ALLOCATION_ATTEMPTS: usize = 100;

pub struct PortGuard {
    addr: SocketAddr,
}

impl Drop for PortGuard {
    fn drop(&mut self) {
        RESERVED_PORTS.lock().unwrap().remove(&self.addr.port());
    }
}

static RESERVED_PORTS: LazyLock<Mutex<HashSet<u16>>> = LazyLock::new(|| Mutex::new(HashSet::new()));

fn next_addr() -> (PortGuard, SocketAddr) {
    for _ in 0..MAX_PORT_ALLOCATION_ATTEMPTS {
        let listener = StdTcpListener::bind((IpAddr::V4(Ipv4Addr::LOCALHOST), 0))
            .expect("failed to bind to an OS-assigned port");
        let addr = listener.local_addr().expect("listener has no local addr");
        let mut reserved = RESERVED_PORTS.lock().unwrap();
        if reserved.contains(&addr.port()) {
            continue;
        }
        reserved.insert(addr.port());
        drop(reserved);
        drop(listener);
        return (PortGuard { addr }, addr);
    }
    panic!("failed to allocate a unique port after {MAX_PORT_ALLOCATION_ATTEMPTS} attempts");
}

/// Spawn an HTTP server on a random local port running `handler`. Returns a
/// base URL like `http://127.0.0.1:PORT/` once the socket is accepting
/// connections.
pub async fn spawn_fake_server<H, F>(handler: H) -> String
where
    H: Fn(Request<Body>) -> F + Clone + Send + Sync + 'static,
    F: Future<Output = Response<Body>> + Send + 'static,
{
    let (guard, addr) = next_addr();

    let make_service = make_service_fn(move |_conn| {
        let handler = handler.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let handler = handler.clone();
                async move { Ok::<_, Infallible>(handler(req).await) }
            }))
        }
    });

    let server = Server::bind(&addr).serve(make_service);
    tokio::spawn(async move {
        let _guard = guard;
        if let Err(error) = server.await {
            tracing::error!(%error, "fake test server error");
        }
    });

    wait_for_tcp(addr).await;
    format!("http://{addr}/")
}

async fn wait_for_tcp(addr: SocketAddr) {
    for _ in 0..100 {
        if tokio::net::TcpStream::connect(addr).await.is_ok() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("fake test server at {addr} never started accepting connections");
}

/// Build a JSON response with the given status code.
pub fn respond_json(status: u16, body: Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("static response parts should always build")
}

/// Build a plain-text response, used to exercise the not-JSON error path.
pub fn respond_text(status: u16, body: &str) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain")
        .body(Body::from(body.to_string()))
        .expect("static response parts should always build")
}
