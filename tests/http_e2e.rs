//! End-to-end scenarios over real sockets.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{init_test_logging, wait_until, TestClient};
use weft::{Handler, HttpExchange, HttpResponse, Server, ServerConfig};

fn hello_handler() -> Arc<dyn Handler> {
    Arc::new(|ex: HttpExchange| {
        ex.connection()
            .append_response(HttpResponse::ok_with_content_type(
                b"hi".as_slice(),
                "text/plain",
            ));
    })
}

/// Starts a server, registers `routes`, and gives the workers a moment to
/// apply the broadcast.
fn start_server(config: ServerConfig, routes: Vec<(String, Arc<dyn Handler>)>) -> Server {
    init_test_logging();
    let server = Server::bind(config).expect("server bind failed");
    server.register_url_handlers(routes);
    std::thread::sleep(Duration::from_millis(100));
    server
}

#[test]
fn get_hello_returns_ok_with_common_headers() {
    let server = start_server(
        ServerConfig::default().worker_count(1),
        vec![("/hello".to_owned(), hello_handler())],
    );

    let mut client = TestClient::connect(server.local_addr());
    let resp = client.get("/hello");
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body, b"hi");
    assert_eq!(resp.header("Content-Type"), Some("text/plain"));
    assert_eq!(resp.header("Content-Length"), Some("2"));
    assert!(resp.header("Server").expect("Server header").starts_with("weft/"));
    let date = resp.header("Date").expect("Date header");
    assert_eq!(date.len(), 29);
    assert!(date.ends_with(" GMT"));
    assert_eq!(&date[3..5], ", ");
}

#[test]
fn missing_path_yields_shared_not_found() {
    let server = start_server(ServerConfig::default().worker_count(1), Vec::new());

    let mut client = TestClient::connect(server.local_addr());
    let resp = client.get("/missing");
    assert_eq!(resp.status, 404);
    assert_eq!(resp.header("Content-Length"), Some("0"));
    assert!(resp.body.is_empty());
}

#[test]
fn lookup_is_exact_match_on_path_without_query() {
    let server = start_server(
        ServerConfig::default().worker_count(1),
        vec![("/hello".to_owned(), hello_handler())],
    );

    let mut client = TestClient::connect(server.local_addr());
    assert_eq!(client.get("/hello?x=1").status, 200);
    assert_eq!(client.get("/hello/deeper").status, 404);
}

#[test]
fn pipelined_responses_arrive_in_request_order() {
    let a: Arc<dyn Handler> = Arc::new(|ex: HttpExchange| {
        // Make the first handler the slow one so reordering would show.
        std::thread::sleep(Duration::from_millis(10));
        ex.connection()
            .append_response(HttpResponse::ok(b"alpha".as_slice()));
    });
    let b: Arc<dyn Handler> = Arc::new(|ex: HttpExchange| {
        ex.connection()
            .append_response(HttpResponse::ok(b"bravo".as_slice()));
    });
    let server = start_server(
        ServerConfig::default().worker_count(1),
        vec![("/a".to_owned(), a), ("/b".to_owned(), b)],
    );

    let mut client = TestClient::connect(server.local_addr());
    client.send_raw(b"GET /a HTTP/1.1\r\nHost: t\r\n\r\nGET /b HTTP/1.1\r\nHost: t\r\n\r\n");
    let first = client.read_response();
    let second = client.read_response();
    assert_eq!(first.body, b"alpha");
    assert_eq!(second.body, b"bravo");
}

#[test]
fn keep_alive_serves_sequential_requests_on_one_connection() {
    let server = start_server(
        ServerConfig::default().worker_count(1),
        vec![("/hello".to_owned(), hello_handler())],
    );
    let stats = server.stats();

    let mut client = TestClient::connect(server.local_addr());
    for _ in 0..3 {
        let resp = client.get("/hello");
        assert_eq!(resp.status, 200);
    }
    assert!(wait_until(Duration::from_secs(2), || {
        stats.connections_accepted() == 1
    }));
    assert_eq!(stats.requests_served(), 3);
}

#[test]
fn connection_close_header_closes_after_response() {
    let server = start_server(
        ServerConfig::default().worker_count(1),
        vec![("/hello".to_owned(), hello_handler())],
    );

    let mut client = TestClient::connect(server.local_addr());
    let resp = client.request("GET", "/hello", "Connection: close\r\n");
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body, b"hi");
    assert!(client.expect_eof(), "server should close after the response");
}

#[test]
fn http10_defaults_to_close() {
    let server = start_server(
        ServerConfig::default().worker_count(1),
        vec![("/hello".to_owned(), hello_handler())],
    );

    let mut client = TestClient::connect(server.local_addr());
    client.send_raw(b"GET /hello HTTP/1.0\r\n\r\n");
    let resp = client.read_response();
    assert_eq!(resp.status, 200);
    assert!(client.expect_eof());
}

#[test]
fn peer_close_mid_request_releases_everything() {
    let server = start_server(
        ServerConfig::default().worker_count(1),
        vec![("/hello".to_owned(), hello_handler())],
    );
    let stats = server.stats();

    let mut client = TestClient::connect(server.local_addr());
    client.send_raw(b"GET /hel");
    assert!(wait_until(Duration::from_secs(2), || {
        stats.active_connections() == 1
    }));
    drop(client);

    assert!(wait_until(Duration::from_secs(2), || {
        stats.active_connections() == 0
    }));
    assert!(wait_until(Duration::from_secs(2), || {
        stats.buffers_in_use() == 0
    }));
}

#[test]
fn malformed_request_closes_without_response() {
    let server = start_server(ServerConfig::default().worker_count(1), Vec::new());

    let mut client = TestClient::connect(server.local_addr());
    client.send_raw(b"NOT-HTTP\r\n\r\n");
    assert!(client.expect_eof(), "parse errors close the connection");
}

#[test]
fn date_header_crosses_a_second_boundary() {
    let server = start_server(
        ServerConfig::default().worker_count(1),
        vec![("/hello".to_owned(), hello_handler())],
    );

    let mut client = TestClient::connect(server.local_addr());
    let first = client.get("/hello").header("Date").expect("date").to_owned();
    std::thread::sleep(Duration::from_millis(1100));
    let second = client.get("/hello").header("Date").expect("date").to_owned();
    assert_ne!(first, second);
    assert!(first.ends_with(" GMT"));
    assert!(second.ends_with(" GMT"));
}

#[test]
fn response_exceeding_write_buffer_closes_gracefully() {
    let big: Arc<dyn Handler> = Arc::new(|ex: HttpExchange| {
        ex.connection()
            .append_response(HttpResponse::ok(vec![b'x'; 4096]));
    });
    let server = start_server(
        ServerConfig::default()
            .worker_count(1)
            .connection_buffer_size(512),
        vec![("/big".to_owned(), big)],
    );
    let stats = server.stats();

    let mut client = TestClient::connect(server.local_addr());
    client.send_raw(b"GET /big HTTP/1.1\r\nHost: t\r\n\r\n");
    assert!(
        client.expect_eof(),
        "an unrenderable response must close the connection"
    );
    assert!(wait_until(Duration::from_secs(2), || {
        stats.buffers_in_use() == 0
    }));
}

#[test]
fn full_response_queue_parks_and_resumes_the_handler() {
    let served = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&served);
    let handler: Arc<dyn Handler> = Arc::new(move |ex: HttpExchange| {
        counter.fetch_add(1, Ordering::SeqCst);
        ex.connection()
            .append_response(HttpResponse::ok(b"slot".as_slice()));
    });
    let server = start_server(
        ServerConfig::default()
            .worker_count(1)
            .ready_response_queue_capacity(1),
        vec![("/slot".to_owned(), handler)],
    );

    let mut client = TestClient::connect(server.local_addr());
    let one = b"GET /slot HTTP/1.1\r\nHost: t\r\n\r\n";
    let mut burst = Vec::new();
    for _ in 0..3 {
        burst.extend_from_slice(one);
    }
    client.send_raw(&burst);
    for _ in 0..3 {
        let resp = client.read_response();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, b"slot");
    }
    assert_eq!(served.load(Ordering::SeqCst), 3);
}

#[test]
fn handler_panic_closes_only_the_offending_connection() {
    let panicking: Arc<dyn Handler> = Arc::new(|_ex: HttpExchange| {
        panic!("handler blew up");
    });
    let server = start_server(
        ServerConfig::default().worker_count(1),
        vec![
            ("/panic".to_owned(), panicking),
            ("/hello".to_owned(), hello_handler()),
        ],
    );

    let mut victim = TestClient::connect(server.local_addr());
    victim.send_raw(b"GET /panic HTTP/1.1\r\nHost: t\r\n\r\n");
    assert!(victim.expect_eof(), "panicking handler closes its connection");

    let mut healthy = TestClient::connect(server.local_addr());
    assert_eq!(healthy.get("/hello").status, 200);
}

#[test]
fn handlers_can_be_registered_while_serving() {
    let server = start_server(ServerConfig::default().worker_count(1), Vec::new());

    let mut client = TestClient::connect(server.local_addr());
    assert_eq!(client.get("/late").status, 404);

    server.register_url_handler("/late", hello_handler());
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(client.get("/late").status, 200);
}

#[test]
fn round_robin_spreads_connections_across_workers() {
    let server = start_server(
        ServerConfig::default().worker_count(2),
        vec![("/hello".to_owned(), hello_handler())],
    );
    let stats = server.stats();

    let mut clients: Vec<TestClient> = (0..8)
        .map(|_| TestClient::connect(server.local_addr()))
        .collect();
    for client in &mut clients {
        assert_eq!(client.get("/hello").status, 200);
    }
    drop(clients);

    assert!(wait_until(Duration::from_secs(2), || {
        stats.active_connections() == 0
    }));
    assert_eq!(stats.connections_accepted(), 8);
    assert_eq!(stats.requests_served(), 8);
    assert!(wait_until(Duration::from_secs(2), || {
        stats.buffers_in_use() == 0
    }));
}

#[test]
fn reuseport_fanout_serves_many_concurrent_connections_without_leaks() {
    let server = start_server(
        ServerConfig::default().worker_count(4).reuse_port(true),
        vec![("/hello".to_owned(), hello_handler())],
    );
    let stats = server.stats();
    let addr = server.local_addr();

    const THREADS: usize = 8;
    const CONNS_PER_THREAD: usize = 16;
    let threads: Vec<_> = (0..THREADS)
        .map(|_| {
            std::thread::spawn(move || {
                for _ in 0..CONNS_PER_THREAD {
                    let mut client = TestClient::connect(addr);
                    let resp = client.get("/hello");
                    assert_eq!(resp.status, 200);
                    assert_eq!(resp.body, b"hi");
                }
            })
        })
        .collect();
    for thread in threads {
        thread.join().expect("client thread panicked");
    }

    let total = (THREADS * CONNS_PER_THREAD) as u64;
    assert!(wait_until(Duration::from_secs(5), || {
        stats.active_connections() == 0
    }));
    assert_eq!(stats.connections_accepted(), total);
    assert_eq!(stats.requests_served(), total);
    assert!(wait_until(Duration::from_secs(5), || {
        stats.buffers_in_use() == 0
    }));

    server.shutdown();
}

#[test]
fn shutdown_closes_idle_connections() {
    let server = start_server(
        ServerConfig::default().worker_count(1),
        vec![("/hello".to_owned(), hello_handler())],
    );

    let mut client = TestClient::connect(server.local_addr());
    assert_eq!(client.get("/hello").status, 200);
    server.shutdown();
    assert!(client.expect_eof(), "shutdown closes idle connections");
}
