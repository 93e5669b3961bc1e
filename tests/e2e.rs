//! End-to-end scenarios against a real server on an ephemeral port.

use std::collections::HashMap;
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, Stream, StreamExt};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

use caas::client::Client;
use caas::config::{ClientConfig, ServerConfig};
use caas::protocol::{opcode, CommandRequest};

struct TestServer {
    addr: SocketAddr,
    metadata_dir: PathBuf,
    _tmp: TempDir,
}

impl TestServer {
    async fn start(mutate: impl FnOnce(&mut ServerConfig)) -> Self {
        let tmp = TempDir::new().unwrap();
        let metadata_dir = tmp.path().join("metadata");
        let mut cfg = ServerConfig {
            metadata_dir: metadata_dir.to_string_lossy().into_owned(),
            work_dir: tmp.path().join("workdir").to_string_lossy().into_owned(),
            ..ServerConfig::default()
        };
        mutate(&mut cfg);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(caas::server::serve(listener, cfg));

        Self {
            addr,
            metadata_dir,
            _tmp: tmp,
        }
    }

    fn url(&self) -> String {
        format!("ws://{}/", self.addr)
    }

    fn run_dir(&self, id: &str) -> PathBuf {
        self.metadata_dir.join(id)
    }
}

#[derive(Clone, Default)]
struct Capture(Arc<Mutex<Vec<u8>>>);

impl Capture {
    fn bytes(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }

    fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes()).into_owned()
    }
}

impl Write for Capture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn capturing_client(server: &TestServer, mutate: impl FnOnce(&mut ClientConfig)) -> (Client, Capture, Capture) {
    let mut cfg = ClientConfig {
        server: server.url(),
        ..ClientConfig::default()
    };
    mutate(&mut cfg);
    let stdout = Capture::default();
    let stderr = Capture::default();
    let client = Client::new(cfg).with_output(Box::new(stdout.clone()), Box::new(stderr.clone()));
    (client, stdout, stderr)
}

fn command(id: &str, script: &str) -> CommandRequest {
    CommandRequest {
        id: id.to_string(),
        script: script.to_string(),
        ..CommandRequest::default()
    }
}

async fn wait_for_file(path: &Path) -> String {
    for _ in 0..50 {
        if let Ok(content) = std::fs::read_to_string(path) {
            return content;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("file never appeared: {}", path.display());
}

#[tokio::test]
async fn success_run_streams_stdout_and_persists_metadata() {
    let server = TestServer::start(|_| {}).await;
    let (mut client, stdout, _stderr) = capturing_client(&server, |_| {});

    client.connect().await.unwrap();
    client.exec(&command("s1", "echo hi")).await.unwrap();

    assert_eq!(stdout.text(), "hi\n");
    let dir = server.run_dir("s1");
    assert_eq!(wait_for_file(&dir.join("status")).await, "success");
    assert_eq!(wait_for_file(&dir.join("log")).await, "hi\n");
    assert_eq!(wait_for_file(&dir.join("script")).await, "echo hi");
    client.close();
}

#[tokio::test]
async fn nonzero_exit_surfaces_code_and_failure_metadata() {
    let server = TestServer::start(|_| {}).await;
    let (mut client, _stdout, _stderr) = capturing_client(&server, |_| {});

    client.connect().await.unwrap();
    let err = client.exec(&command("s2", "exit 3")).await.unwrap_err();
    assert_eq!(err.exit_code, 3);

    let dir = server.run_dir("s2");
    assert_eq!(wait_for_file(&dir.join("status")).await, "failure");
    assert!(wait_for_file(&dir.join("error")).await.contains('3'));
    client.close();
}

#[tokio::test]
async fn auth_failure_refuses_with_reason_and_exit_one() {
    let server = TestServer::start(|cfg| {
        cfg.client_id = "a".into();
        cfg.client_secret = "b".into();
    })
    .await;
    let (mut client, _stdout, stderr) = capturing_client(&server, |cfg| {
        cfg.client_id = "a".into();
        cfg.client_secret = "x".into();
    });

    let err = client.connect().await.unwrap_err();
    let exit = err.downcast_ref::<caas::ExitError>().expect("exit error");
    assert_eq!(exit.exit_code, 1);
    assert!(exit.message.contains("invalid client id or secret"));
    assert!(stderr.text().contains("failed to authenticate"));
}

#[tokio::test]
async fn auth_success_allows_execution() {
    let server = TestServer::start(|cfg| {
        cfg.client_id = "a".into();
        cfg.client_secret = "b".into();
    })
    .await;
    let (mut client, stdout, _stderr) = capturing_client(&server, |cfg| {
        cfg.client_id = "a".into();
        cfg.client_secret = "b".into();
    });

    client.connect().await.unwrap();
    client.exec(&command("auth-ok", "echo authed")).await.unwrap();
    assert_eq!(stdout.text(), "authed\n");
    client.close();
}

#[tokio::test]
async fn command_deadline_kills_child_and_records_failure() {
    let server = TestServer::start(|cfg| cfg.timeout = 1).await;
    let (mut client, _stdout, _stderr) = capturing_client(&server, |_| {});

    client.connect().await.unwrap();
    let started = std::time::Instant::now();
    let err = client.exec(&command("s4", "sleep 5")).await.unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(4));
    // Signal death wraps to 255 on the single exit byte.
    assert_eq!(err.exit_code, 255);

    let dir = server.run_dir("s4");
    assert_eq!(wait_for_file(&dir.join("status")).await, "failure");
    client.close();
}

#[tokio::test]
async fn disconnect_mid_run_cancels_without_verdict_metadata() {
    let server = TestServer::start(|_| {}).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(server.url()).await.unwrap();
    ws.send(Message::Text(frame_text(
        opcode::AUTH_REQUEST,
        br#"{"client_id":"","client_secret":""}"#,
    )))
    .await
    .unwrap();
    let verdict = next_frame(&mut ws).await.expect("auth verdict");
    assert_eq!(verdict[0], opcode::AUTH_RESPONSE_SUCCESS);

    ws.send(Message::Text(frame_text(
        opcode::COMMAND,
        br#"{"id":"s5","script":"sleep 10"}"#,
    )))
    .await
    .unwrap();

    let dir = server.run_dir("s5");
    wait_for_file(&dir.join("start_at")).await;
    ws.close(None).await.unwrap();
    drop(ws);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(!dir.join("status").exists());
    assert!(!dir.join("succeed_at").exists());
    assert!(!dir.join("failed_at").exists());
}

#[tokio::test]
async fn command_before_auth_is_refused_then_closed() {
    let server = TestServer::start(|cfg| {
        cfg.client_id = "a".into();
        cfg.client_secret = "b".into();
    })
    .await;

    let (mut ws, _) = tokio_tungstenite::connect_async(server.url()).await.unwrap();
    ws.send(Message::Text(frame_text(
        opcode::COMMAND,
        br#"{"script":"echo hi"}"#,
    )))
    .await
    .unwrap();

    let stderr = next_frame(&mut ws).await.expect("stderr frame");
    assert_eq!(stderr[0], opcode::COMMAND_STDERR);
    assert_eq!(&stderr[1..], b"not authenticated\n");

    let exit = next_frame(&mut ws).await.expect("exit frame");
    assert_eq!(exit, vec![opcode::COMMAND_EXIT_CODE, 1]);

    assert!(next_frame(&mut ws).await.is_none());
}

#[tokio::test]
async fn second_command_is_a_protocol_error() {
    let server = TestServer::start(|_| {}).await;
    let (mut client, _stdout, stderr) = capturing_client(&server, |_| {});

    client.connect().await.unwrap();
    client.exec(&command("first", "true")).await.unwrap();

    let err = client.exec(&command("second", "true")).await.unwrap_err();
    assert_eq!(err.exit_code, 1);
    assert!(stderr.text().contains("command already executed"));
    client.close();
}

#[tokio::test]
async fn environment_merge_lets_the_server_win() {
    let server = TestServer::start(|cfg| {
        cfg.environment.insert("A".into(), "2".into());
    })
    .await;
    let (mut client, stdout, _stderr) = capturing_client(&server, |_| {});

    client.connect().await.unwrap();
    let mut request = command("s6", r#"echo "$A:$PATH""#);
    request.environment = HashMap::from([
        ("A".to_string(), "1".to_string()),
        ("PATH".to_string(), "/x".to_string()),
    ]);
    client.exec(&request).await.unwrap();

    assert_eq!(stdout.text(), "2:/x\n");
    let env_file = wait_for_file(&server.run_dir("s6").join("env")).await;
    assert!(env_file.lines().any(|line| line == "A=2"));
    assert!(env_file.lines().any(|line| line == "PATH=/x"));
    client.close();
}

#[tokio::test]
async fn stream_bytes_arrive_in_order_and_mirror_the_log() {
    let server = TestServer::start(|_| {}).await;
    let (mut client, stdout, stderr) = capturing_client(&server, |_| {});

    client.connect().await.unwrap();
    client
        .exec(&command(
            "order",
            "printf 'a\\nb\\nc\\n'; printf 'x\\ny\\n' 1>&2",
        ))
        .await
        .unwrap();

    assert_eq!(stdout.text(), "a\nb\nc\n");
    assert_eq!(stderr.text(), "x\ny\n");
    let log = wait_for_file(&server.run_dir("order").join("log")).await;
    assert!(log.contains("a\nb\nc\n"));
    assert!(log.contains("x\ny\n"));
    client.close();
}

#[tokio::test]
async fn non_utf8_output_survives_the_wire() {
    let server = TestServer::start(|_| {}).await;
    let (mut client, stdout, _stderr) = capturing_client(&server, |_| {});

    client.connect().await.unwrap();
    client
        .exec(&command("raw", r"printf '\377\376'"))
        .await
        .unwrap();

    assert_eq!(stdout.bytes(), vec![0xff, 0xfe]);
    client.close();
}

#[tokio::test]
async fn exec_timeout_guards_the_client_locally() {
    let server = TestServer::start(|_| {}).await;
    let (mut client, _stdout, stderr) = capturing_client(&server, |cfg| {
        cfg.exec_timeout = Duration::from_millis(300);
    });

    client.connect().await.unwrap();
    let err = client.exec(&command("slow", "sleep 5")).await.unwrap_err();
    assert_eq!(err.exit_code, 1);
    assert!(stderr.text().contains("command exec timeout"));
    client.close();
}

#[tokio::test]
async fn output_returns_trimmed_text_even_on_failure() {
    let server = TestServer::start(|_| {}).await;
    let (mut client, _stdout, _stderr) = capturing_client(&server, |_| {});

    client.connect().await.unwrap();
    let text = client
        .output(&command("out", "echo captured; exit 2"))
        .await
        .unwrap();
    assert_eq!(text, "captured");
}

#[tokio::test]
async fn workdir_is_cleaned_after_success_when_enabled() {
    let server = TestServer::start(|cfg| cfg.auto_clean_workdir = true).await;
    let (mut client, stdout, _stderr) = capturing_client(&server, |_| {});

    client.connect().await.unwrap();
    client.exec(&command("clean", "pwd; touch artifact")).await.unwrap();

    let work_dir = PathBuf::from(stdout.text().trim());
    assert_eq!(wait_for_file(&server.run_dir("clean").join("status")).await, "success");
    assert!(!work_dir.exists());
    client.close();
}

fn frame_text(op: u8, payload: &[u8]) -> String {
    let mut frame = vec![op];
    frame.extend_from_slice(payload);
    String::from_utf8(frame).unwrap()
}

async fn next_frame(
    ws: &mut (impl Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin),
) -> Option<Vec<u8>> {
    while let Some(msg) = ws.next().await {
        match msg {
            Ok(Message::Text(text)) => return Some(text.into_bytes()),
            Ok(Message::Binary(data)) => return Some(data),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
    None
}
