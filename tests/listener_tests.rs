//! Listener hub scenarios: init-retry supervision, beacon lifecycle and
//! the hand-off of accepted connections to the arbiter.

mod common;

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::{read_cr_line, send};
use hamlink::exchange::{ExchangeArbiter, SessionFactory};
use hamlink::fbb::{Session, UserAgent};
use hamlink::listener::ListenerHub;
use hamlink::transport::{Accepted, Acceptor, Beacon, TransportListener};
use tokio::io::DuplexStream;
use tokio::sync::Mutex as AsyncMutex;

fn noop_factory(log: Arc<Mutex<Vec<(String, bool)>>>) -> SessionFactory {
    Box::new(move |target, master| {
        log.lock().unwrap().push((target.to_string(), master));
        let mut session = Session::new("N0CALL", target, "JP20QH", None);
        session.set_user_agent(UserAgent {
            name: "hamlink".into(),
            version: "0.1.0".into(),
        });
        session.set_master(master);
        session
    })
}

/// Fails `fail_times` inits, then comes up with an acceptor that never
/// produces a connection.
struct FlakyTransport {
    attempts: AtomicUsize,
    fail_times: usize,
}

#[async_trait]
impl TransportListener for FlakyTransport {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn init(&self) -> io::Result<Box<dyn Acceptor>> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.fail_times {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "tnc not ready"));
        }
        Ok(Box::new(IdleAcceptor))
    }
}

struct IdleAcceptor;

#[async_trait]
impl Acceptor for IdleAcceptor {
    async fn accept(&mut self) -> io::Result<Accepted> {
        std::future::pending().await
    }
}

#[tokio::test(start_paused = true)]
async fn retries_init_until_listener_comes_up() {
    let arbiter = Arc::new(ExchangeArbiter::new(noop_factory(Arc::default())));
    let hub = ListenerHub::new(arbiter);

    let transport = Arc::new(FlakyTransport {
        attempts: AtomicUsize::new(0),
        fail_times: 4,
    });
    hub.enable(Arc::clone(&transport) as Arc<dyn TransportListener>);

    // Erroring while retrying: not part of the active set.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(hub.active().is_empty());

    let mut polls = 0;
    while hub.active().is_empty() {
        polls += 1;
        assert!(polls < 1000, "listener never came up");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(hub.active(), vec!["flaky".to_string()]);
    // One init per retry interval plus the one that succeeded.
    assert_eq!(transport.attempts.load(Ordering::SeqCst), 5);

    assert!(hub.disable("flaky"));
    assert!(!hub.disable("flaky"));
    assert!(hub.active().is_empty());
}

#[tokio::test]
async fn enable_is_idempotent() {
    let arbiter = Arc::new(ExchangeArbiter::new(noop_factory(Arc::default())));
    let hub = ListenerHub::new(arbiter);

    let transport = Arc::new(FlakyTransport {
        attempts: AtomicUsize::new(0),
        fail_times: 0,
    });
    hub.enable(Arc::clone(&transport) as Arc<dyn TransportListener>);
    hub.enable(transport as Arc<dyn TransportListener>);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(hub.active().len(), 1);
    hub.close_all();
}

/// Yields one prepared connection, then idles.
struct OneShotTransport {
    conn: AsyncMutex<Option<DuplexStream>>,
    beacon: CountingBeacon,
}

#[derive(Default)]
struct CountingBeacon {
    starts: AtomicUsize,
    stops: AtomicUsize,
}

impl Beacon for CountingBeacon {
    fn start(&self) -> io::Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl TransportListener for OneShotTransport {
    fn name(&self) -> &str {
        "oneshot"
    }

    async fn init(&self) -> io::Result<Box<dyn Acceptor>> {
        Ok(Box::new(OneShotAcceptor {
            conn: self.conn.lock().await.take(),
        }))
    }

    fn beacon(&self) -> Option<&dyn Beacon> {
        Some(&self.beacon)
    }
}

struct OneShotAcceptor {
    conn: Option<DuplexStream>,
}

#[async_trait]
impl Acceptor for OneShotAcceptor {
    async fn accept(&mut self) -> io::Result<Accepted> {
        match self.conn.take() {
            Some(stream) => Ok(Accepted {
                stream: Box::new(stream),
                remote_call: Some("REMOTE-1".to_string()),
            }),
            None => std::future::pending().await,
        }
    }
}

#[tokio::test]
async fn accepted_connection_runs_as_secondary() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let arbiter = Arc::new(ExchangeArbiter::new(noop_factory(Arc::clone(&log))));
    let hub = ListenerHub::new(arbiter);

    let (stream, mut peer) = tokio::io::duplex(4096);
    let transport = Arc::new(OneShotTransport {
        conn: AsyncMutex::new(Some(stream)),
        beacon: CountingBeacon::default(),
    });
    hub.enable(Arc::clone(&transport) as Arc<dyn TransportListener>);

    // We play the calling station: master side of the handshake.
    let script = async {
        send(&mut peer, ";FW: REMOTE-1\r[mock-1.0-B2FHM$]\r; N0CALL DE REMOTE-1 (AA00AA)>\r").await;

        // The accepted side answers with its own block, then its turn.
        loop {
            let line = read_cr_line(&mut peer).await;
            if line == "FF" {
                break;
            }
        }
        send(&mut peer, "FQ\r").await;
    };
    tokio::time::timeout(Duration::from_secs(5), script)
        .await
        .expect("scripted master stalled");

    // The hub must have submitted the connection as a secondary-role job.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if !log.lock().unwrap().is_empty() {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "no exchange observed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(
        *log.lock().unwrap(),
        vec![("REMOTE-1".to_string(), false)]
    );

    assert_eq!(transport.beacon.starts.load(Ordering::SeqCst), 1);
    hub.close_all();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while transport.beacon.stops.load(Ordering::SeqCst) == 0 {
        assert!(tokio::time::Instant::now() < deadline, "beacon never stopped");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
