use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use courier_fabric::{
    driver::{
        ClientSecurity, ClientTls, Driver, MemoryDriver, MemoryNetwork, Sasl, ServerSecurity,
        TlsCredentials, Wakeup,
    },
    error::Error,
    Connection, State,
};

fn driver(network: &MemoryNetwork) -> MemoryDriver {
    MemoryDriver::new(network.clone()).unwrap()
}

#[test]
fn connect_accept_and_exchange_frames() {
    let network = MemoryNetwork::new();
    let mut server = driver(&network);
    let listener = server
        .listen("localhost", "5672", &ServerSecurity::default())
        .unwrap();

    let mut client = driver(&network);
    let connector = client
        .connect("localhost", "5672", &ClientSecurity::default())
        .unwrap();
    let mut conn = Connection::new("client");
    conn.open();
    client.process(connector, &mut conn).unwrap();

    assert_eq!(
        server.wait(Some(Duration::from_secs(1))).unwrap(),
        Wakeup::Ready
    );
    assert_eq!(server.ready_listener(), Some(listener));
    let accepted = server.accept(listener).unwrap().unwrap();
    assert_eq!(server.listener_of(accepted), Some(listener));
    assert_eq!(server.listener_of(connector), None);

    let mut peer = Connection::new("server");
    server.process(accepted, &mut peer).unwrap();
    assert_eq!(peer.remote_state(), State::Active);
    assert_eq!(peer.remote_container(), Some("client"));

    peer.open();
    server.process(accepted, &mut peer).unwrap();
    assert_eq!(
        client.wait(Some(Duration::from_secs(1))).unwrap(),
        Wakeup::Ready
    );
    assert_eq!(client.ready_connector(), Some(connector));
    client.process(connector, &mut conn).unwrap();
    assert_eq!(conn.remote_container(), Some("server"));
}

#[test]
fn wildcard_listener_accepts_any_host() {
    let network = MemoryNetwork::new();
    let mut server = driver(&network);
    let listener = server
        .listen("0.0.0.0", "7000", &ServerSecurity::default())
        .unwrap();

    let mut client = driver(&network);
    client
        .connect("some-host", "7000", &ClientSecurity::default())
        .unwrap();

    server.wait(Some(Duration::from_secs(1))).unwrap();
    assert!(server.accept(listener).unwrap().is_some());
}

#[test]
fn refused_connection_closes() {
    let network = MemoryNetwork::new();
    let mut client = driver(&network);
    let connector = client
        .connect("nowhere", "5672", &ClientSecurity::default())
        .unwrap();
    assert!(!client.closed(connector));

    let mut conn = Connection::new("client");
    conn.open();
    client.process(connector, &mut conn).unwrap();
    assert!(client.closed(connector));

    client.close(connector);
    assert!(client.connectors().is_empty());
}

#[test]
fn empty_host_fails_to_connect() {
    let network = MemoryNetwork::new();
    let mut client = driver(&network);

    match client.connect("", "5672", &ClientSecurity::default()) {
        Err(Error::Connect(msg)) => assert!(msg.contains("empty host")),
        other => panic!("Expected Connect error, got {:?}", other),
    }
}

#[test]
fn duplicate_bind_fails() {
    let network = MemoryNetwork::new();
    let mut first = driver(&network);
    let mut second = driver(&network);
    first
        .listen("localhost", "5800", &ServerSecurity::default())
        .unwrap();

    match second.listen("localhost", "5800", &ServerSecurity::default()) {
        Err(Error::Bind(msg)) => assert!(msg.contains("5800")),
        other => panic!("Expected Bind error, got {:?}", other),
    }

    drop(first);
    assert!(second
        .listen("localhost", "5800", &ServerSecurity::default())
        .is_ok());
}

#[test]
fn closing_a_listener_frees_the_port() {
    let network = MemoryNetwork::new();
    let mut server = driver(&network);
    let listener = server
        .listen("localhost", "5801", &ServerSecurity::default())
        .unwrap();
    server.close_listener(listener);
    assert!(server.listeners().is_empty());
    assert!(server
        .listen("localhost", "5801", &ServerSecurity::default())
        .is_ok());
}

#[test]
fn missing_credentials_are_rejected() {
    let network = MemoryNetwork::new();
    let mut client = driver(&network);
    let security = ClientSecurity {
        tls: Some(ClientTls {
            credentials: Some(TlsCredentials {
                certificate: PathBuf::from("/nonexistent/cert.pem"),
                private_key: PathBuf::from("/nonexistent/key.pem"),
                password: None,
            }),
            ..Default::default()
        }),
        sasl: Sasl::Anonymous,
    };

    match client.connect("localhost", "5671", &security) {
        Err(Error::Credentials(msg)) => assert!(msg.contains("cert.pem")),
        other => panic!("Expected Credentials error, got {:?}", other),
    }

    let server_security = ServerSecurity {
        tls: Some(TlsCredentials {
            certificate: PathBuf::from("/nonexistent/cert.pem"),
            private_key: PathBuf::from("/nonexistent/key.pem"),
            password: None,
        }),
        trusted_certificates: None,
    };
    assert!(matches!(
        client.listen("localhost", "5671", &server_security),
        Err(Error::Credentials(_))
    ));
}

#[test]
fn wait_times_out_when_idle() {
    let network = MemoryNetwork::new();
    let mut idle = driver(&network);

    let start = Instant::now();
    let wakeup = idle.wait(Some(Duration::from_millis(30))).unwrap();
    assert_eq!(wakeup, Wakeup::TimedOut);
    assert!(start.elapsed() >= Duration::from_millis(30));

    assert_eq!(idle.wait(Some(Duration::ZERO)).unwrap(), Wakeup::TimedOut);
}

#[test]
fn waker_interrupts_a_blocked_wait() {
    let network = MemoryNetwork::new();
    let mut idle = driver(&network);
    let waker = idle.waker();

    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        waker.wake();
    });

    assert_eq!(idle.wait(None).unwrap(), Wakeup::Interrupted);
    handle.join().unwrap();

    // the wakeup is consumed
    assert_eq!(
        idle.wait(Some(Duration::from_millis(10))).unwrap(),
        Wakeup::TimedOut
    );
}

#[test]
fn peer_hangup_closes_the_connector() {
    let network = MemoryNetwork::new();
    let mut server = driver(&network);
    let listener = server
        .listen("localhost", "5802", &ServerSecurity::default())
        .unwrap();
    let mut client = driver(&network);
    let connector = client
        .connect("localhost", "5802", &ClientSecurity::default())
        .unwrap();

    server.wait(Some(Duration::from_secs(1))).unwrap();
    let accepted = server.accept(listener).unwrap().unwrap();

    client.close(connector);
    assert_eq!(
        server.wait(Some(Duration::from_secs(1))).unwrap(),
        Wakeup::Ready
    );
    assert_eq!(server.ready_connector(), Some(accepted));

    let mut conn = Connection::new("server");
    server.process(accepted, &mut conn).unwrap();
    assert!(server.closed(accepted));
}
