use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use bui_longpoll::{
    Context, Environment, Error, PageOptions, Registry, Session, SessionOptions,
};

const LIMIT: Duration = Duration::from_secs(5);

/// Speaks just enough HTTP/1.1 to stand in for the browser.
struct Client {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Client {
        Client {
            stream: TcpStream::connect(addr).await.unwrap(),
            buf: Vec::new(),
        }
    }

    async fn send(&mut self, method: &str, path: &str, body: &str) {
        let request = format!(
            "{} {} HTTP/1.1\r\nHost: test\r\nContent-Length: {}\r\n\r\n{}",
            method,
            path,
            body.len(),
            body
        );
        self.stream.write_all(request.as_bytes()).await.unwrap();
    }

    /// `None` once the server drops the connection.
    async fn response(&mut self) -> Option<(u16, String)> {
        loop {
            if let Some(pos) = self.buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8(self.buf[..pos].to_vec()).unwrap();
                let status: u16 = head.split(' ').nth(1).unwrap().parse().unwrap();
                let len: usize = head
                    .lines()
                    .find_map(|l| l.strip_prefix("Content-Length: "))
                    .unwrap()
                    .parse()
                    .unwrap();
                while self.buf.len() < pos + 4 + len {
                    if !self.fill().await {
                        return None;
                    }
                }
                let body = String::from_utf8(self.buf[pos + 4..pos + 4 + len].to_vec()).unwrap();
                self.buf.drain(..pos + 4 + len);
                return Some((status, body));
            }
            if !self.fill().await {
                return None;
            }
        }
    }

    async fn fill(&mut self) -> bool {
        let mut chunk = [0u8; 4096];
        match self.stream.read(&mut chunk).await {
            Ok(0) | Err(_) => false,
            Ok(n) => {
                self.buf.extend_from_slice(&chunk[..n]);
                true
            }
        }
    }

    async fn request(&mut self, method: &str, path: &str, body: &str) -> Option<(u16, String)> {
        self.send(method, path, body).await;
        timeout(LIMIT, self.response()).await.unwrap()
    }
}

fn session_id_of(document: &str) -> String {
    let start = document.find("var sessionId = \"").unwrap() + "var sessionId = \"".len();
    let len = document[start..].find('"').unwrap();
    document[start..start + len].to_string()
}

/// Request a session on a fresh port and open it from a test client.
async fn connected(registry: &Registry, path: &str) -> (Session, Client, SocketAddr) {
    let pending = registry
        .request_session("127.0.0.1:0", SessionOptions::default())
        .await
        .unwrap();
    let addr = pending.local_addr();
    let mut client = Client::connect(addr).await;
    let (status, document) = client.request("GET", path, "").await.unwrap();
    assert_eq!(status, 200);
    let session = timeout(LIMIT, pending.established()).await.unwrap().unwrap();
    assert_eq!(session.id().as_str(), session_id_of(&document));
    (session, client, addr)
}

fn wait_path(session: &Session, n: u32) -> String {
    format!("/{}/wait_server_event({})", session.id(), n)
}

#[tokio::test(flavor = "multi_thread")]
async fn refuses_sessions_nobody_asked_for() {
    let registry = Registry::new(Default::default()).unwrap();
    let addr = registry.listen("127.0.0.1:0").await.unwrap();
    let mut client = Client::connect(addr).await;
    let (status, body) = client.request("GET", "/room/alice", "").await.unwrap();
    assert_eq!(status, 404);
    assert_eq!(body, "not taking new sessions right now");
    assert!(timeout(LIMIT, client.response()).await.unwrap().is_none());
    assert!(registry.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn admission_sends_bootstrap() {
    let registry = Registry::new(Default::default()).unwrap();
    let (session, mut client, _) = connected(&registry, "/room/alice").await;
    assert_eq!(session.path(), "/room/alice");
    assert_eq!(registry.len(), 1);
    assert_eq!(registry.session(session.id()), Some(session.clone()));

    // the favicon never consumes an admission
    let (status, _) = client.request("GET", "/favicon.ico", "").await.unwrap();
    assert_eq!(status, 200);
}

#[tokio::test(flavor = "multi_thread")]
async fn bind_failure_is_reported() {
    let registry = Registry::new(Default::default()).unwrap();
    let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = blocker.local_addr().unwrap().to_string();
    let err = registry
        .request_session(&addr, SessionOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Bind { .. }), "{:?}", err);
}

#[tokio::test(flavor = "multi_thread")]
async fn wait_is_released_by_update_from_another_thread() {
    let registry = Registry::new(Default::default()).unwrap();
    let (session, mut client, _) = connected(&registry, "/").await;

    session
        .new_page("<p id=\"x\"></p>", Environment::new(), PageOptions::default())
        .unwrap();
    let (_, first) = client.request("GET", &wait_path(&session, 0), "").await.unwrap();
    assert!(first.contains("<p id=\\\"x\\\"></p>"));

    client.send("GET", &wait_path(&session, 1), "").await;
    // nothing queued: the request stays parked
    assert!(timeout(Duration::from_millis(200), client.response())
        .await
        .is_err());

    let s2 = session.clone();
    std::thread::spawn(move || s2.update([("x", "1")]).unwrap());
    let (status, body) = timeout(LIMIT, client.response()).await.unwrap().unwrap();
    assert_eq!(status, 200);
    assert_eq!(body, "document.getElementById(\"x\").innerHTML = \"1\"");
}

#[tokio::test(flavor = "multi_thread")]
async fn mutations_arrive_in_append_order() {
    let registry = Registry::new(Default::default()).unwrap();
    let (session, mut client, _) = connected(&registry, "/").await;
    let a = session.clone();
    std::thread::spawn(move || a.update([("a", "1")]).unwrap())
        .join()
        .unwrap();
    let b = session.clone();
    std::thread::spawn(move || b.update([("b", "2")]).unwrap())
        .join()
        .unwrap();
    let (_, body) = client.request("GET", &wait_path(&session, 0), "").await.unwrap();
    let a = body.find("\"a\"").unwrap();
    let b = body.find("\"b\"").unwrap();
    assert!(a < b);
}

#[tokio::test(flavor = "multi_thread")]
async fn event_and_tick_dispatch() {
    let registry = Registry::new(Default::default()).unwrap();
    let (session, mut client, addr) = connected(&registry, "/").await;
    let ticks = Arc::new(AtomicUsize::new(0));
    let ticks2 = ticks.clone();
    let env = Environment::new()
        .handler("add", |ctx: &Context| {
            let n = ctx.args()[0].as_i64().unwrap_or_default();
            ctx.session().update([("out", format!("{}", n + 1))])?;
            Ok(())
        })
        .handler("timer_tick", move |_: &Context| {
            ticks2.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
    session
        .new_page(
            r#"<b rust-onclick="add(41)">+</b><p id="out"></p>"#,
            env,
            PageOptions::default(),
        )
        .unwrap();
    client.request("GET", &wait_path(&session, 0), "").await.unwrap();

    let (status, body) = client
        .request("POST", &format!("/{}/T(0)", session.id()), r#"{"event": {}}"#)
        .await
        .unwrap();
    assert_eq!(status, 200);
    assert_eq!(body, "document.getElementById(\"out\").innerHTML = \"42\"");

    let tick = format!("/{}/timer_tick(ctx%2C%200)", session.id());
    let (status, _) = client.request("POST", &tick, "{}").await.unwrap();
    assert_eq!(status, 200);
    assert_eq!(ticks.load(Ordering::SeqCst), 1);

    // a deviating tick is dropped before reaching the handler
    let bad_tick = format!("/{}/timer_tick(ctx%2C1)", session.id());
    assert!(client.request("POST", &bad_tick, "{}").await.is_none());
    assert_eq!(ticks.load(Ordering::SeqCst), 1);
    assert!(!session.is_closed());

    // and the session keeps working on a new connection
    let mut client = Client::connect(addr).await;
    let (status, _) = client.request("POST", &tick, "{}").await.unwrap();
    assert_eq!(status, 200);
    assert_eq!(ticks.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn protocol_violations_drop_the_connection_only() {
    let registry = Registry::new(Default::default()).unwrap();
    let (session, mut client, addr) = connected(&registry, "/").await;
    session
        .new_page(
            r#"<b rust-onclick="go">x</b>"#,
            Environment::new().handler("go", |_: &Context| Ok(())),
            PageOptions::default(),
        )
        .unwrap();
    let token = format!("/{}/T(0)", session.id());
    assert!(client.request("POST", &token, "{not json").await.is_none());

    let mut client = Client::connect(addr).await;
    let unknown = format!("/{}/T(9)", session.id());
    assert!(client.request("POST", &unknown, "{}").await.is_none());

    let mut client = Client::connect(addr).await;
    let stale = "/.session-1.000001-000000000000/wait_server_event(0)";
    assert!(client.request("GET", stale, "").await.is_none());

    let mut client = Client::connect(addr).await;
    let (status, _) = client.request("POST", &token, "{}").await.unwrap();
    assert_eq!(status, 200);
}

#[tokio::test(flavor = "multi_thread")]
async fn sessions_are_isolated() {
    let registry = Registry::new(Default::default()).unwrap();
    let (alice, mut alice_client, addr) = connected(&registry, "/roomX/alice").await;

    // a second admission on the same listener
    let pending = registry
        .request_session(&addr.to_string(), SessionOptions::default())
        .await
        .unwrap();
    assert_eq!(pending.local_addr(), addr);
    let mut bob_client = Client::connect(addr).await;
    let (_, document) = bob_client.request("GET", "/roomX/bob", "").await.unwrap();
    let bob = timeout(LIMIT, pending.established()).await.unwrap().unwrap();
    assert_eq!(bob.id().as_str(), session_id_of(&document));
    assert_ne!(alice, bob);
    assert_eq!(bob.path(), "/roomX/bob");

    let hits = Arc::new(AtomicUsize::new(0));
    let hits2 = hits.clone();
    alice
        .new_page(
            r#"<b rust-onclick="hit">x</b>"#,
            Environment::new().handler("hit", move |_: &Context| {
                hits2.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
            PageOptions::default(),
        )
        .unwrap();
    bob.new_page(r#"<b rust-onclick="other">x</b>"#, Environment::new(), PageOptions::default())
        .unwrap();
    alice_client.request("GET", &wait_path(&alice, 0), "").await.unwrap();
    bob_client.request("GET", &wait_path(&bob, 0), "").await.unwrap();

    // both pages use T(0); each resolves in its own session
    let (status, _) = bob_client
        .request("POST", &format!("/{}/T(0)", bob.id()), "{}")
        .await
        .unwrap();
    assert_eq!(status, 200);
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    alice.update([("x", "for alice")]).unwrap();
    bob_client.send("GET", &wait_path(&bob, 1), "").await;
    assert!(timeout(Duration::from_millis(200), bob_client.response())
        .await
        .is_err());
    let (_, body) = alice_client
        .request("GET", &wait_path(&alice, 1), "")
        .await
        .unwrap();
    assert!(body.contains("for alice"));
}

#[tokio::test(flavor = "multi_thread")]
async fn current_values_round_trip() {
    let registry = Registry::new(Default::default()).unwrap();
    let (session, mut client, _) = connected(&registry, "/").await;
    session
        .new_page("<div id=\"x\"></div>", Environment::new(), PageOptions::default())
        .unwrap();
    session.update([("x", "<b>hi</b>")]).unwrap();
    let (tx, rx) = mpsc::channel();
    let tx = Arc::new(std::sync::Mutex::new(tx));
    session
        .current(["x"], move |values: &bui_longpoll::CurrentValues| {
            tx.lock().unwrap().send(values.clone())?;
            Ok(())
        })
        .unwrap();
    let (_, body) = client.request("GET", &wait_path(&session, 0), "").await.unwrap();
    assert!(body.ends_with(
        r#"sendToServer("C(0)", JSON.stringify({"current_dict": {"x": document.getElementById("x")["innerHTML"]}}), evalResponse)"#
    ));

    let (status, _) = client
        .request(
            "POST",
            &format!("/{}/C(0)", session.id()),
            r#"{"current_dict": {"x": "<b>hi</b>"}}"#,
        )
        .await
        .unwrap();
    assert_eq!(status, 200);
    let values = rx.recv_timeout(LIMIT).unwrap();
    assert_eq!(values["x"], "<b>hi</b>");
}

#[tokio::test(flavor = "multi_thread")]
async fn close_releases_a_parked_wait() {
    let registry = Registry::new(Default::default()).unwrap();
    let (session, mut client, _) = connected(&registry, "/").await;
    client.send("GET", &wait_path(&session, 0), "").await;
    assert!(timeout(Duration::from_millis(200), client.response())
        .await
        .is_err());
    session.close();
    assert!(timeout(LIMIT, client.response()).await.unwrap().is_none());
    assert!(session.is_closed());
    assert!(registry.session(session.id()).is_none());
    assert!(matches!(
        session.update([("x", "1")]),
        Err(Error::SessionClosed)
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn event_on_one_connection_releases_wait_on_another() {
    let registry = Registry::new(Default::default()).unwrap();
    let (session, mut waiter, addr) = connected(&registry, "/").await;
    let env = Environment::new().handler("ping", |ctx: &Context| {
        ctx.session().update([("out", "pong")])?;
        Ok(())
    });
    session
        .new_page(r#"<b rust-onclick="ping">x</b><p id="out"></p>"#, env, PageOptions::default())
        .unwrap();
    waiter.request("GET", &wait_path(&session, 0), "").await.unwrap();
    waiter.send("GET", &wait_path(&session, 1), "").await;
    assert!(timeout(Duration::from_millis(200), waiter.response())
        .await
        .is_err());

    let mut events = Client::connect(addr).await;
    let (status, body) = events
        .request("POST", &format!("/{}/T(0)", session.id()), r#"{"event": {}}"#)
        .await
        .unwrap();
    assert_eq!(status, 200);
    // already handed to the parked request
    assert_eq!(body, "");
    let (status, pushed) = timeout(LIMIT, waiter.response()).await.unwrap().unwrap();
    assert_eq!(status, 200);
    assert_eq!(pushed, "document.getElementById(\"out\").innerHTML = \"pong\"");
}

#[tokio::test(flavor = "multi_thread")]
async fn goodbye_page_reaches_the_browser_before_close() {
    let registry = Registry::new(Default::default()).unwrap();
    let (session, mut waiter, addr) = connected(&registry, "/").await;
    let env = Environment::new().handler("finish", |ctx: &Context| {
        ctx.session().new_page(
            "<p>thank you</p>",
            Environment::new(),
            PageOptions::static_page(),
        )?;
        std::thread::sleep(Duration::from_millis(300));
        ctx.session().close();
        Ok(())
    });
    session
        .new_page(r#"<b rust-onclick="finish">done</b>"#, env, PageOptions::default())
        .unwrap();
    waiter.request("GET", &wait_path(&session, 0), "").await.unwrap();
    waiter.send("GET", &wait_path(&session, 1), "").await;
    assert!(timeout(Duration::from_millis(200), waiter.response())
        .await
        .is_err());

    let mut events = Client::connect(addr).await;
    events
        .send("POST", &format!("/{}/T(0)", session.id()), "{}")
        .await;
    let (_, pushed) = timeout(LIMIT, waiter.response()).await.unwrap().unwrap();
    assert!(pushed.starts_with("detach();\n"), "{}", pushed);
    assert!(pushed.contains("thank you"));

    // the event request is answered even though the callback closed the session
    let (status, _) = timeout(LIMIT, events.response()).await.unwrap().unwrap();
    assert_eq!(status, 200);
    assert!(session.is_closed());
    assert!(registry.session(session.id()).is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn static_page_detaches() {
    let registry = Registry::new(Default::default()).unwrap();
    let (session, mut client, _) = connected(&registry, "/").await;
    session
        .new_page("bye", Environment::new(), PageOptions::static_page())
        .unwrap();
    let (_, body) = client.request("GET", &wait_path(&session, 0), "").await.unwrap();
    assert!(body.starts_with("detach();\n"));
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_fails_pending_admissions() {
    let registry = Registry::new(Default::default()).unwrap();
    let pending = registry
        .request_session("127.0.0.1:0", SessionOptions::default())
        .await
        .unwrap();
    let addr = pending.local_addr();
    registry.shutdown();
    let err = timeout(LIMIT, pending.established()).await.unwrap().unwrap_err();
    assert!(matches!(err, Error::ListenerClosed(a) if a == addr));
}
