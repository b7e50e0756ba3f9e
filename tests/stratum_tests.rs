//! Stratum server over a real socket: subscribe/configure/authorize flow,
//! difficulty handling, submission replies, and session resumption.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};

use common::{template_at, test_net};
use peerpool_node::primitives::address::{script_to_address, PayoutScript};
use peerpool_node::stratum::{
    FoundWork, GlobalLimits, StratumServer, StratumShared, VardiffConfig,
};
use peerpool_node::tracker::ShareTracker;
use peerpool_node::work::WorkGenerator;

struct Harness {
    addr: std::net::SocketAddr,
    _found_rx: mpsc::Receiver<FoundWork>,
    shared: Arc<StratumShared>,
    // Senders stay alive for the duration of the test; dropping them would
    // end every connection's watch stream
    _template_tx: watch::Sender<Option<Arc<peerpool_node::parent::BlockTemplate>>>,
    _epoch_tx: watch::Sender<u64>,
}

async fn start_server() -> Harness {
    let net = test_net();
    let tracker = Arc::new(Mutex::new(ShareTracker::new(Arc::clone(&net))));
    let workgen = Arc::new(Mutex::new(WorkGenerator::new(Arc::clone(&net), 5, true)));
    let (template_tx, template_rx) = watch::channel(Some(template_at(1_700_000_000)));
    let (epoch_tx, epoch_rx) = watch::channel(0u64);
    let (found_tx, found_rx) = mpsc::channel(64);
    let shared = Arc::new(StratumShared {
        net,
        tracker,
        workgen,
        template_rx,
        work_epoch: epoch_rx,
        found_tx,
        limits: GlobalLimits::new(1000),
        session_cache: Mutex::new(HashMap::new()),
        vardiff_config: VardiffConfig::default(),
        version_mask: peerpool_node::stratum::DEFAULT_VERSION_MASK,
        control: tokio::sync::broadcast::channel(8).0,
    });
    // Port 0: the OS picks a free port
    let server = StratumServer::new(Arc::clone(&shared), 0);
    let listener = server.bind().await.expect("bind");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server.run(listener));
    Harness {
        addr,
        _found_rx: found_rx,
        shared,
        _template_tx: template_tx,
        _epoch_tx: epoch_tx,
    }
}

struct Client {
    lines: tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>,
    write: tokio::net::tcp::OwnedWriteHalf,
}

impl Client {
    async fn connect(addr: std::net::SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        let (read, write) = stream.into_split();
        Self {
            lines: BufReader::new(read).lines(),
            write,
        }
    }

    async fn send(&mut self, value: Value) {
        let mut line = value.to_string().into_bytes();
        line.push(b'\n');
        self.write.write_all(&line).await.expect("write");
    }

    async fn recv(&mut self) -> Value {
        let line = tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
            .await
            .expect("line timeout")
            .expect("read")
            .expect("connection open");
        serde_json::from_str(&line).expect("json line")
    }

    /// Read until the response with the given id arrives, collecting any
    /// notifications seen on the way
    async fn response(&mut self, id: u64) -> (Value, Vec<Value>) {
        let mut notifications = Vec::new();
        loop {
            let value = self.recv().await;
            if value["id"] == json!(id) {
                return (value, notifications);
            }
            notifications.push(value);
        }
    }
}

fn miner_address() -> String {
    let net = test_net();
    let script = PayoutScript::P2pkh([0x42; 20]).to_script();
    script_to_address(&script, &net.parent.address).unwrap()
}

#[tokio::test]
async fn subscribe_authorize_and_receive_work() {
    let harness = start_server().await;
    let mut client = Client::connect(harness.addr).await;

    client
        .send(json!({"id": 1, "method": "mining.subscribe", "params": ["test-miner/1.0"]}))
        .await;
    let (reply, _) = client.response(1).await;
    assert!(reply["error"].is_null());
    let extranonce1 = reply["result"][1].as_str().unwrap();
    assert_eq!(extranonce1.len(), 8);
    assert_eq!(reply["result"][2], json!(4));

    client
        .send(json!({"id": 2, "method": "mining.authorize", "params": [miner_address(), "x"]}))
        .await;
    let (reply, _) = client.response(2).await;
    assert_eq!(reply["result"], json!(true));

    // set_difficulty then notify, in that order, with a null id
    let first = client.recv().await;
    assert_eq!(first["method"], "mining.set_difficulty");
    assert!(first["id"].is_null());
    let second = client.recv().await;
    assert_eq!(second["method"], "mining.notify");
    let job_id = second["params"][0].as_str().unwrap();
    assert_eq!(job_id.len(), 8);
    assert_eq!(second["params"][8], json!(true)); // clean_jobs
}

#[tokio::test]
async fn authorize_with_bad_address_is_unauthorized() {
    let harness = start_server().await;
    let mut client = Client::connect(harness.addr).await;
    client
        .send(json!({"id": 1, "method": "mining.subscribe", "params": []}))
        .await;
    client.response(1).await;
    client
        .send(json!({"id": 2, "method": "mining.authorize", "params": ["not-an-address", "x"]}))
        .await;
    let (reply, _) = client.response(2).await;
    assert_eq!(reply["error"][0], json!(24));
}

#[tokio::test]
async fn configure_negotiates_version_rolling_and_min_difficulty() {
    let harness = start_server().await;
    let mut client = Client::connect(harness.addr).await;
    client
        .send(json!({
            "id": 1,
            "method": "mining.configure",
            "params": [
                ["version-rolling", "minimum-difficulty"],
                {"version-rolling.mask": "ffffffff", "minimum-difficulty.value": 2.0}
            ]
        }))
        .await;
    let (reply, _) = client.response(1).await;
    assert_eq!(reply["result"]["version-rolling"], json!(true));
    // The granted mask never exceeds the pool's allowance
    let mask = u32::from_str_radix(
        reply["result"]["version-rolling.mask"].as_str().unwrap(),
        16,
    )
    .unwrap();
    assert_eq!(mask & !peerpool_node::stratum::DEFAULT_VERSION_MASK, 0);
    assert_eq!(reply["result"]["minimum-difficulty"], json!(true));
}

#[tokio::test]
async fn ping_answers_pong() {
    let harness = start_server().await;
    let mut client = Client::connect(harness.addr).await;
    client
        .send(json!({"id": 9, "method": "mining.ping", "params": []}))
        .await;
    let (reply, _) = client.response(9).await;
    assert_eq!(reply["result"], json!("pong"));
}

#[tokio::test]
async fn suggest_difficulty_resends_work() {
    let harness = start_server().await;
    let mut client = Client::connect(harness.addr).await;
    client
        .send(json!({"id": 1, "method": "mining.subscribe", "params": []}))
        .await;
    client.response(1).await;
    client
        .send(json!({"id": 2, "method": "mining.authorize", "params": [miner_address(), "x"]}))
        .await;
    client.response(2).await;
    // Drain the initial work pair
    client.recv().await;
    client.recv().await;

    client
        .send(json!({"id": 3, "method": "mining.suggest_difficulty", "params": [64.0]}))
        .await;
    let (reply, _) = client.response(3).await;
    assert_eq!(reply["result"], json!(true));
    // Fresh difficulty and job follow shortly after
    let push = client.recv().await;
    assert_eq!(push["method"], "mining.set_difficulty");
    let push = client.recv().await;
    assert_eq!(push["method"], "mining.notify");
}

#[tokio::test]
async fn submissions_are_answered_and_vardiff_adjusts() {
    let harness = start_server().await;
    let mut client = Client::connect(harness.addr).await;
    client
        .send(json!({"id": 1, "method": "mining.subscribe", "params": []}))
        .await;
    client.response(1).await;
    let worker = miner_address();
    client
        .send(json!({"id": 2, "method": "mining.authorize", "params": [worker.clone(), "x"]}))
        .await;
    client.response(2).await;
    client.recv().await; // set_difficulty
    let notify = client.recv().await;
    let job_id = notify["params"][0].as_str().unwrap().to_string();
    let ntime = notify["params"][7].as_str().unwrap().to_string();

    // With the pinned pseudo target at the share target, roughly half of
    // arbitrary nonces are accepted; every reply is true/false/error 23
    let mut accepted = 0;
    let mut id = 10u64;
    for nonce in 0..64u32 {
        id += 1;
        client
            .send(json!({
                "id": id,
                "method": "mining.submit",
                "params": [worker.clone(), job_id.clone(), "00000001", ntime.clone(), format!("{:08x}", nonce)]
            }))
            .await;
        let (reply, pushes) = client.response(id).await;
        if reply["result"] == json!(true) {
            accepted += 1;
        } else {
            assert!(
                reply["result"] == json!(false) || reply["error"][0] == json!(23),
                "unexpected reply {}",
                reply
            );
        }
        // Vardiff pushes arrive as notifications with null ids
        for push in pushes {
            assert!(push["id"].is_null());
        }
        if accepted >= 4 {
            break;
        }
    }
    assert!(accepted >= 4, "only {} accepted", accepted);
}

#[tokio::test]
async fn unknown_job_submission_is_false_not_error() {
    let harness = start_server().await;
    let mut client = Client::connect(harness.addr).await;
    client
        .send(json!({"id": 1, "method": "mining.subscribe", "params": []}))
        .await;
    client.response(1).await;
    let worker = miner_address();
    client
        .send(json!({"id": 2, "method": "mining.authorize", "params": [worker.clone(), "x"]}))
        .await;
    client.response(2).await;
    client.recv().await;
    client.recv().await;

    client
        .send(json!({
            "id": 3,
            "method": "mining.submit",
            "params": [worker.clone(), "ffffffff", "00000000", "65000000", "00000000"]
        }))
        .await;
    let (reply, _) = client.response(3).await;
    assert_eq!(reply["result"], json!(false));
    assert!(reply["error"].is_null());
}

#[tokio::test]
async fn control_messages_reach_every_miner() {
    let harness = start_server().await;
    let mut client = Client::connect(harness.addr).await;
    client
        .send(json!({"id": 1, "method": "mining.subscribe", "params": []}))
        .await;
    client.response(1).await;

    harness
        .shared
        .control
        .send(peerpool_node::stratum::ControlMessage::ShowMessage(
            "maintenance at midnight".to_string(),
        ))
        .unwrap();
    let push = client.recv().await;
    assert_eq!(push["method"], "client.show_message");
    assert_eq!(push["params"][0], json!("maintenance at midnight"));

    harness
        .shared
        .control
        .send(peerpool_node::stratum::ControlMessage::Reconnect)
        .unwrap();
    let push = client.recv().await;
    assert_eq!(push["method"], "client.reconnect");
}

#[tokio::test]
async fn session_state_survives_reconnect() {
    let harness = start_server().await;
    let mut client = Client::connect(harness.addr).await;
    client
        .send(json!({"id": 1, "method": "mining.subscribe", "params": []}))
        .await;
    let (reply, _) = client.response(1).await;
    let session_id = reply["result"][0][0][1].as_str().unwrap().to_string();

    // Pin a recognizable difficulty, then drop the connection
    let login = format!("{}+512", miner_address());
    client
        .send(json!({"id": 2, "method": "mining.authorize", "params": [login, "x"]}))
        .await;
    client.response(2).await;
    let push = client.recv().await;
    assert_eq!(push["method"], "mining.set_difficulty");
    assert_eq!(push["params"][0], json!(512.0));
    drop(client);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(harness
        .shared
        .session_cache
        .lock()
        .await
        .contains_key(&session_id));

    // Resume: the restored difficulty applies without a vardiff warmup
    let mut client = Client::connect(harness.addr).await;
    client
        .send(json!({"id": 1, "method": "mining.subscribe", "params": ["agent", session_id]}))
        .await;
    client.response(1).await;
    client
        .send(json!({"id": 2, "method": "mining.authorize", "params": [miner_address(), "x"]}))
        .await;
    client.response(2).await;
    let push = client.recv().await;
    assert_eq!(push["method"], "mining.set_difficulty");
    assert_eq!(push["params"][0], json!(512.0));
}
