//! End-to-end RPC: direct client-server traffic, the registry mesh, and
//! failure propagation across the pool.

use std::net::SocketAddr;
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use fiber::net::sleep_ms;
use fiber::Reactor;
use fibernet::{ConnectionPool, RpcClient, RpcCode, RpcRegistry, RpcServer, Strategy};

const WAIT: Duration = Duration::from_secs(20);

fn reactor(name: &str) -> Arc<Reactor> { Reactor::new(2, false, name).unwrap() }

fn any_addr() -> SocketAddr { "127.0.0.1:0".parse().unwrap() }

/// Binds and starts a server with the stock test handlers; returns its
/// address.
fn start_server(reactor: &Arc<Reactor>, registry: Option<SocketAddr>) -> SocketAddr {
    let server = RpcServer::new(reactor.clone());
    server.register("Add", |(a, b): (i32, i32)| a + b);
    server.register("Concat", |(a, b): (String, String)| format!("{a}{b}"));
    server.register("Ping", |_: ()| ());
    server.register("Delay", |(ms,): (u64,)| {
        sleep_ms(ms);
        ms
    });
    server.bind(any_addr()).unwrap();
    let addr = server.local_addrs()[0];

    let (tx, rx) = mpsc::channel();
    let starter = server.clone();
    reactor.schedule(move || {
        if let Some(registry) = registry {
            starter.bind_registry(registry).unwrap();
        }
        starter.start().unwrap();
        tx.send(()).unwrap();
    });
    rx.recv_timeout(WAIT).unwrap();
    addr
}

#[test]
fn unary_calls() {
    let server_reactor = reactor("server");
    let addr = start_server(&server_reactor, None);

    let client_reactor = reactor("client");
    let (tx, rx) = mpsc::channel();
    client_reactor.schedule(move || {
        let client = RpcClient::new(false);
        client.connect(addr).unwrap();

        let add: fibernet::RpcResult<i32> = client.call("Add", (3i32, 4i32));
        assert!(add.is_ok());
        assert_eq!(*add.value(), 7);

        let concat: fibernet::RpcResult<String> =
            client.call("Concat", ("foo".to_owned(), "bar".to_owned()));
        assert_eq!(concat.value(), "foobar");

        let ping: fibernet::RpcResult<()> = client.call("Ping", ());
        assert!(ping.is_ok());

        let missing: fibernet::RpcResult<i32> = client.call("Mul", (3i32, 4i32));
        assert_eq!(missing.code(), RpcCode::NoMethod);

        // A truncated argument tuple must not crash the server.
        let mismatch: fibernet::RpcResult<i32> = client.call("Add", (3i32,));
        assert_eq!(mismatch.code(), RpcCode::NoMatch);

        client.close();
        tx.send(()).unwrap();
    });
    rx.recv_timeout(WAIT).unwrap();
}

#[test]
fn responses_reach_their_callers_out_of_order() {
    let server_reactor = reactor("server");
    let addr = start_server(&server_reactor, None);

    let client_reactor = reactor("client");
    let (tx, rx) = mpsc::channel();
    let client = RpcClient::new(false);
    {
        let client = client.clone();
        let ready = tx.clone();
        client_reactor.schedule(move || {
            client.connect(addr).unwrap();
            ready.send((0u64, true)).unwrap();
        });
    }
    rx.recv_timeout(WAIT).unwrap();

    // The slower call is issued first; its reply arrives after the fast
    // one, yet each caller sees its own echo.
    for delay in [300u64, 20] {
        let client = client.clone();
        let tx = tx.clone();
        client_reactor.schedule(move || {
            let result: fibernet::RpcResult<u64> = client.call("Delay", (delay,));
            tx.send((delay, result.is_ok() && *result.value() == delay)).unwrap();
        });
    }
    let first = rx.recv_timeout(WAIT).unwrap();
    let second = rx.recv_timeout(WAIT).unwrap();
    assert!(first.1, "call for {} failed", first.0);
    assert!(second.1, "call for {} failed", second.0);
    assert_eq!(first.0, 20, "fast call must complete first");
    assert_eq!(second.0, 300);
}

#[test]
fn call_timeout_drops_the_late_response() {
    let server_reactor = reactor("server");
    let addr = start_server(&server_reactor, None);

    let client_reactor = reactor("client");
    let (tx, rx) = mpsc::channel();
    client_reactor.schedule(move || {
        let client = RpcClient::new(false);
        client.connect(addr).unwrap();
        client.set_timeout_ms(100);

        let start = Instant::now();
        let slow: fibernet::RpcResult<u64> = client.call("Delay", (500u64,));
        let elapsed = start.elapsed();
        assert_eq!(slow.code(), RpcCode::Timeout);
        assert_eq!(slow.message(), "call timeout");
        assert!(elapsed < Duration::from_millis(450), "timeout fired at {elapsed:?}");

        // The late response must be dropped, not delivered to the next
        // call on the same connection.
        client.set_timeout_ms(10_000);
        sleep_ms(600);
        let add: fibernet::RpcResult<i32> = client.call("Add", (1i32, 2i32));
        assert!(add.is_ok());
        assert_eq!(*add.value(), 3);

        client.close();
        tx.send(()).unwrap();
    });
    rx.recv_timeout(WAIT).unwrap();
}

#[test]
fn async_and_callback_calls() {
    let server_reactor = reactor("server");
    let addr = start_server(&server_reactor, None);

    let client_reactor = reactor("client");
    let (tx, rx) = mpsc::channel();
    client_reactor.schedule(move || {
        let client = RpcClient::new(false);
        client.connect(addr).unwrap();

        let pending = client.async_call::<i32, _>("Add", (20i32, 22i32));
        let tx_cb = tx.clone();
        client.call_with::<i32, _>("Add", (2i32, 3i32), move |result| {
            tx_cb.send(*result.value()).unwrap();
        });
        tx.send(*pending.recv().unwrap().value()).unwrap();
    });
    let mut outcomes = vec![rx.recv_timeout(WAIT).unwrap(), rx.recv_timeout(WAIT).unwrap()];
    outcomes.sort();
    assert_eq!(outcomes, vec![5, 42]);
}

#[test]
fn server_publishes_to_subscribers() {
    let server_reactor = reactor("server");
    let server = RpcServer::new(server_reactor.clone());
    server.register("Add", |(a, b): (i32, i32)| a + b);
    server.bind(any_addr()).unwrap();
    let addr = server.local_addrs()[0];
    {
        let (tx, rx) = mpsc::channel();
        let starter = server.clone();
        server_reactor.schedule(move || {
            starter.start().unwrap();
            tx.send(()).unwrap();
        });
        rx.recv_timeout(WAIT).unwrap();
    }

    let client_reactor = reactor("client");
    let (tx, rx) = mpsc::channel();
    client_reactor.schedule(move || {
        let client = RpcClient::new(false);
        client.connect(addr).unwrap();
        let tx = std::sync::Mutex::new(tx);
        client.subscribe("news", move |payload| {
            let body: String = payload.read().unwrap();
            tx.lock().unwrap().send(body).unwrap();
        });
        // Keep the receive fiber alive for the publish below.
        sleep_ms(5000);
    });

    // Let the subscription land before publishing.
    std::thread::sleep(Duration::from_millis(500));
    let publisher = server.clone();
    server_reactor.schedule(move || {
        publisher.publish("news", "fresh".to_owned());
    });
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), "fresh");
}

#[test]
fn registry_mesh_discovers_and_survives_provider_death() {
    let registry_reactor = reactor("registry");
    let registry = RpcRegistry::new(registry_reactor.clone());
    registry.bind(any_addr()).unwrap();
    let registry_addr = registry.local_addrs()[0];
    {
        let (tx, rx) = mpsc::channel();
        let starter = registry.clone();
        registry_reactor.schedule(move || {
            starter.start().unwrap();
            tx.send(()).unwrap();
        });
        rx.recv_timeout(WAIT).unwrap();
    }

    // Two providers of the same service.
    let server_reactor_a = reactor("server-a");
    let server_a = RpcServer::new(server_reactor_a.clone());
    server_a.register("Add", |(a, b): (i32, i32)| a + b);
    server_a.bind(any_addr()).unwrap();
    {
        let (tx, rx) = mpsc::channel();
        let starter = server_a.clone();
        server_reactor_a.schedule(move || {
            starter.bind_registry(registry_addr).unwrap();
            starter.start().unwrap();
            tx.send(()).unwrap();
        });
        rx.recv_timeout(WAIT).unwrap();
    }
    let server_reactor_b = reactor("server-b");
    let _addr_b = start_server(&server_reactor_b, Some(registry_addr));

    let pool_reactor = reactor("pool");
    let pool = ConnectionPool::new(5000, Strategy::Polling);
    {
        let (tx, rx) = mpsc::channel();
        let pool = pool.clone();
        pool_reactor.schedule(move || {
            pool.connect(registry_addr).unwrap();
            let result: fibernet::RpcResult<i32> = pool.call("Add", (19i32, 23i32));
            assert!(result.is_ok(), "mesh call failed: {}", result.message());
            assert_eq!(*result.value(), 42);
            tx.send(pool.cached_providers("Add")).unwrap();
        });
        let providers = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(providers.len(), 2, "expected both providers, got {providers:?}");
    }

    // Kill one provider; the registry publishes its services down and the
    // pool's cache follows.
    {
        let (tx, rx) = mpsc::channel();
        let stopper = server_a.clone();
        server_reactor_a.schedule(move || {
            stopper.stop();
            tx.send(()).unwrap();
        });
        rx.recv_timeout(WAIT).unwrap();
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    let survivors = loop {
        let (tx, rx) = mpsc::channel();
        let observer = pool.clone();
        pool_reactor.schedule(move || {
            tx.send(observer.cached_providers("Add")).unwrap();
        });
        let providers = rx.recv_timeout(WAIT).unwrap();
        if providers.len() <= 1 || Instant::now() > deadline {
            break providers;
        }
        std::thread::sleep(Duration::from_millis(200));
    };
    assert_eq!(survivors.len(), 1, "down delta not applied: {survivors:?}");

    // Calls keep succeeding through the surviving provider.
    let (tx, rx) = mpsc::channel();
    {
        let pool = pool.clone();
        pool_reactor.schedule(move || {
            let result: fibernet::RpcResult<i32> = pool.call("Add", (40i32, 2i32));
            tx.send(result.is_ok() && *result.value() == 42).unwrap();
        });
    }
    assert!(rx.recv_timeout(WAIT).unwrap());
}

#[test]
fn discovery_of_unknown_service_is_no_method() {
    let registry_reactor = reactor("registry");
    let registry = RpcRegistry::new(registry_reactor.clone());
    registry.bind(any_addr()).unwrap();
    let registry_addr = registry.local_addrs()[0];
    {
        let (tx, rx) = mpsc::channel();
        let starter = registry.clone();
        registry_reactor.schedule(move || {
            starter.start().unwrap();
            tx.send(()).unwrap();
        });
        rx.recv_timeout(WAIT).unwrap();
    }

    let pool_reactor = reactor("pool");
    let pool = ConnectionPool::new(5000, Strategy::Random);
    let (tx, rx) = mpsc::channel();
    pool_reactor.schedule(move || {
        pool.connect(registry_addr).unwrap();
        let result: fibernet::RpcResult<i32> = pool.call("Nowhere", (1i32,));
        tx.send(result.code()).unwrap();
    });
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), RpcCode::NoMethod);
}
