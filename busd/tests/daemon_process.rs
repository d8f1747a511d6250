#![cfg(unix)]

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use busd_client::BusClient;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout};

fn busd_command(socket: &Path) -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_busd"));
    command
        .arg("--socket")
        .arg(socket)
        .arg("--tracker-mode")
        .arg("memory")
        .env_remove("BUSD_CONFIG")
        .env_remove("BUSD_SOCKET")
        .env_remove("BUSD_TRACKER")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .kill_on_drop(true);
    command
}

async fn wait_until_ready(socket: &Path) -> BusClient {
    for _ in 0..100 {
        if let Ok(client) = BusClient::connect(socket).await {
            return client;
        }
        sleep(Duration::from_millis(50)).await;
    }
    panic!("busd did not come up on {}", socket.display());
}

fn terminate(child: &Child) {
    let pid = child.id().expect("child pid") as i32;
    kill(Pid::from_raw(pid), Signal::SIGTERM).expect("send SIGTERM");
}

#[tokio::test]
async fn single_instance_and_clean_sigterm_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("busd.sock");
    let pid_file = socket.with_extension("pid");

    let mut first = busd_command(&socket)
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn busd");
    let client = wait_until_ready(&socket).await;
    client.register("w1").await.unwrap();
    let submitted = client.submit("any-task").await.unwrap();
    assert_eq!(submitted.assigned_to.as_deref(), Some("w1"));

    let recorded: u32 = std::fs::read_to_string(&pid_file)
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    assert_eq!(Some(recorded), first.id());

    let mut second = busd_command(&socket)
        .stderr(Stdio::piped())
        .spawn()
        .expect("spawn second busd");
    let status = timeout(Duration::from_secs(10), second.wait())
        .await
        .expect("second instance exits")
        .unwrap();
    assert!(!status.success());
    let mut stderr = String::new();
    second
        .stderr
        .take()
        .unwrap()
        .read_to_string(&mut stderr)
        .await
        .unwrap();
    assert!(stderr.contains("already running"), "stderr was: {stderr}");

    // The running broker is unaffected.
    assert!(client.status().await.is_ok());

    terminate(&first);
    let status = timeout(Duration::from_secs(10), first.wait())
        .await
        .expect("busd exits after SIGTERM")
        .unwrap();
    assert!(status.success());
    assert!(!socket.exists());
    assert!(!pid_file.exists());
}

#[tokio::test]
async fn stale_socket_file_is_replaced_on_start() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("busd.sock");
    drop(std::os::unix::net::UnixListener::bind(&socket).unwrap());
    assert!(socket.exists());

    let child = busd_command(&socket)
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn busd");
    let client = wait_until_ready(&socket).await;
    assert!(client.status().await.is_ok());

    terminate(&child);
    let mut child = child;
    timeout(Duration::from_secs(10), child.wait())
        .await
        .expect("busd exits")
        .unwrap();
}
