//! End-to-end scenarios: the HTTP API and the controller wired to the
//! memory store, a static lease pool standing in for the upstream DHCP
//! server, and the fabricated link layer.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use mayfly_common::AllocationState;
use mayfly_dhcp::{DeviceManager, LeaseBinder, MemoryLinkLayer, StaticLeaseFactory};
use mayfly_server::api::{api_router, AppState};
use mayfly_server::Controller;
use mayfly_store::{IndexMaintainer, MemoryStore, StateStore};

const IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 17);

struct Harness {
    store: Arc<dyn StateStore>,
    link: Arc<MemoryLinkLayer>,
    factory: Arc<StaticLeaseFactory>,
    binder: Arc<LeaseBinder>,
    controller: Arc<Controller>,
    _index: IndexMaintainer,
    app: Router,
}

async fn start(
    addresses: Vec<Ipv4Addr>,
    macs: &[&str],
    request_timeout: Duration,
) -> Harness {
    let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
    for mac in macs {
        store.put_mac(mac.parse().unwrap()).await.unwrap();
    }

    let link = Arc::new(MemoryLinkLayer::new("eth0"));
    let factory = Arc::new(StaticLeaseFactory::new(
        addresses,
        Duration::from_secs(3600),
    ));
    let binder = Arc::new(LeaseBinder::new(
        factory.clone(),
        link.clone(),
        "eth0",
        Duration::from_millis(250),
        false,
    ));
    let devices = Arc::new(DeviceManager::new(link.clone()));
    let controller = Controller::new(store.clone(), binder.clone(), devices, true, false);
    controller.start().await.unwrap();
    let index = IndexMaintainer::spawn(store.clone()).await.unwrap();

    let app = api_router().with_state(AppState {
        store: store.clone(),
        request_timeout,
    });

    Harness {
        store,
        link,
        factory,
        binder,
        controller,
        _index: index,
        app,
    }
}

async fn call(app: &Router, method: Method, path: &str, body: Option<Value>) -> (StatusCode, Value) {
    let body = match body {
        Some(value) => Body::from(value.to_string()),
        None => Body::empty(),
    };
    let request = Request::builder()
        .method(method)
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json")
        .body(body)
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

/// Give the controller and index maintainer a beat to observe events.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(150)).await;
}

#[tokio::test]
async fn scenario_happy_path() {
    let h = start(vec![IP], &["aa:bb:cc:dd:ee:01"], Duration::from_secs(2)).await;

    let (status, body) = call(
        &h.app,
        Method::POST,
        "/v1/ip",
        Some(json!({"service": "prod/web"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "success");
    assert_eq!(body["ip"], "10.0.0.17");
    assert!(!body["id"].as_str().unwrap().is_empty());

    let (status, snapshot) = call(&h.app, Method::GET, "/v1/status", None).await;
    assert_eq!(status, StatusCode::OK);
    let allocations = snapshot["Allocations"].as_array().unwrap();
    assert_eq!(allocations.len(), 1);
    assert_eq!(allocations[0]["Hostname"], "web.prod");
    assert_eq!(allocations[0]["State"], 1);
    assert_eq!(
        allocations[0]["Interface"]["HardwareAddr"],
        "aa:bb:cc:dd:ee:01"
    );
    assert_eq!(snapshot["AvailableMACs"].as_array().unwrap().len(), 0);

    // One vf- device bridged next to the uplink.
    assert_eq!(h.link.link_names().len(), 2);
    assert!(h.binder.has_client(IP));
}

#[tokio::test]
async fn scenario_obtain_timeout_removes_allocation() {
    // Nothing upstream ever answers; the MAC pool is fine.
    let h = start(Vec::new(), &["aa:bb:cc:dd:ee:01"], Duration::from_secs(1)).await;

    let started = std::time::Instant::now();
    let (status, body) = call(
        &h.app,
        Method::POST,
        "/v1/ip",
        Some(json!({"service": "x/y"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "timeout");
    assert_eq!(body["ip"], "");
    assert!(started.elapsed() < Duration::from_secs(2));

    settle().await;
    assert!(h.store.allocations().await.unwrap().is_empty());
    // The popped MAC went back to the pool after the failed bind.
    assert_eq!(
        h.store.mac_pool().await.unwrap(),
        vec!["aa:bb:cc:dd:ee:01"]
    );
    assert_eq!(h.link.link_names(), vec!["eth0"]);
}

#[tokio::test]
async fn scenario_release_returns_mac_and_stops_client() {
    let h = start(vec![IP], &["aa:bb:cc:dd:ee:01"], Duration::from_secs(2)).await;

    let (_, body) = call(
        &h.app,
        Method::POST,
        "/v1/ip",
        Some(json!({"service": "prod/web"})),
    )
    .await;
    assert_eq!(body["status"], "success");
    settle().await;

    let (status, body) = call(
        &h.app,
        Method::DELETE,
        "/v1/ip",
        Some(json!({"ip": "10.0.0.17"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "success");
    assert_eq!(body["ip"], "10.0.0.17");

    settle().await;
    assert!(h.store.allocations().await.unwrap().is_empty());
    assert_eq!(
        h.store.mac_pool().await.unwrap(),
        vec!["aa:bb:cc:dd:ee:01"]
    );
    assert!(!h.binder.has_client(IP));
    assert_eq!(h.link.link_names(), vec!["eth0"]);
}

#[tokio::test]
async fn scenario_release_of_unknown_ip_is_an_error() {
    let h = start(vec![IP], &[], Duration::from_secs(1)).await;

    let (status, body) = call(
        &h.app,
        Method::DELETE,
        "/v1/ip",
        Some(json!({"ip": "192.0.2.55"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "error");

    let (_, body) = call(
        &h.app,
        Method::DELETE,
        "/v1/ip",
        Some(json!({"ip": "not-an-ip"})),
    )
    .await;
    assert_eq!(body["status"], "error");
    assert_eq!(body["ip"], "invalid");
}

#[tokio::test]
async fn scenario_mac_registration_rejects_bad_inputs() {
    let h = start(Vec::new(), &[], Duration::from_secs(1)).await;

    let (status, body) = call(
        &h.app,
        Method::POST,
        "/v1/mac",
        Some(json!({"MACs": ["aa:bb", "aa:bb:cc:dd:ee:02"]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["Status"], "error");
    assert_eq!(body["Rejected"], json!(["aa:bb"]));

    // The pool grew by exactly one.
    assert_eq!(
        h.store.mac_pool().await.unwrap(),
        vec!["aa:bb:cc:dd:ee:02"]
    );

    let (_, body) = call(
        &h.app,
        Method::DELETE,
        "/v1/mac",
        Some(json!({"MACs": ["nope", "aa:bb:cc:dd:ee:02"]})),
    )
    .await;
    assert_eq!(body["Status"], "error");
    assert_eq!(body["Unprocessed"], json!(["nope"]));
    assert!(h.store.mac_pool().await.unwrap().is_empty());
}

#[tokio::test]
async fn scenario_resurrection_after_drain() {
    let h = start(vec![IP], &["aa:bb:cc:dd:ee:01"], Duration::from_secs(2)).await;

    let (_, body) = call(
        &h.app,
        Method::POST,
        "/v1/ip",
        Some(json!({"service": "prod/web"})),
    )
    .await;
    assert_eq!(body["status"], "success");

    // Graceful shutdown: the client stops, the device goes away, the record
    // survives as Stopped.
    h.controller.stop().await;
    let drained = h.store.allocations().await.unwrap();
    assert_eq!(drained.len(), 1);
    assert_eq!(drained[0].state, AllocationState::Stopped);
    assert!(!h.binder.has_client(IP));
    assert_eq!(h.link.link_names(), vec!["eth0"]);
    let remembered = drained[0].interface.clone().unwrap();

    // "Restart": a fresh controller over the same store and uplink, with an
    // empty MAC pool. The remembered device name and MAC make upstream
    // re-issue the same address.
    assert!(h.store.mac_pool().await.unwrap().is_empty());
    let binder = Arc::new(LeaseBinder::new(
        h.factory.clone(),
        h.link.clone(),
        "eth0",
        Duration::from_millis(250),
        false,
    ));
    let devices = Arc::new(DeviceManager::new(h.link.clone()));
    let controller = Controller::new(h.store.clone(), binder.clone(), devices, true, false);
    controller.converge().await.unwrap();

    let revived = h.store.allocations().await.unwrap();
    assert_eq!(revived.len(), 1);
    assert_eq!(revived[0].state, AllocationState::Bound);
    let lease = revived[0].lease.as_ref().unwrap();
    assert_eq!(lease.fixed_address, IP);
    let iface = revived[0].interface.as_ref().unwrap();
    assert_eq!(iface.name, remembered.name);
    assert_eq!(iface.hardware_addr, remembered.hardware_addr);
    assert!(binder.has_client(IP));
    // The resurrected MAC is in use, not parked.
    assert!(h.store.mac_pool().await.unwrap().is_empty());
}

#[tokio::test]
async fn scenario_pool_exhaustion_without_dynamic_interfaces() {
    // Addresses are available upstream, but there is no MAC to claim and
    // dynamic interfaces are off.
    let h = start(vec![IP], &[], Duration::from_secs(1)).await;

    let (status, body) = call(
        &h.app,
        Method::POST,
        "/v1/ip",
        Some(json!({"service": "prod/web"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "timeout");

    // The request was withdrawn on timeout; nothing lingers.
    settle().await;
    assert!(h.store.allocations().await.unwrap().is_empty());
    assert_eq!(h.link.link_names(), vec!["eth0"]);
}
