mod common;

use common::{metadata_json, TestContext};
use mockito::Server;

#[test]
fn test_check_reports_up_to_date() {
    let ctx = TestContext::new();
    let mut server = Server::new();
    let meta = server
        .mock("GET", "/update.json")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(metadata_json("1.4.0", ""))
        .create();

    let endpoint = format!("{}/update.json", server.url());
    ctx.run(&["check", "--endpoint", &endpoint, "--local-version", "1.4"])
        .assert_success()
        .assert_stdout_contains("1.4 is up to date");
    meta.assert();
}

#[test]
fn test_check_reports_available_release() {
    let ctx = TestContext::new();
    let mut server = Server::new();
    let _meta = server
        .mock("GET", "/update.yaml")
        .with_status(200)
        .with_body("program:\n  name: Acme\n  version: \"2.1\"\n  beta: \"1\"\n  changelog: Faster startup\n")
        .create();

    let endpoint = format!("{}/update.yaml", server.url());
    ctx.run(&["check", "--endpoint", &endpoint, "--local-version", "2.0.9"])
        .assert_success()
        .assert_stdout_contains("is available")
        .assert_stdout_contains("2.1")
        .assert_stdout_contains("[beta]")
        .assert_stdout_contains("Faster startup");
    assert!(ctx.workspaces().is_empty());
}

#[test]
fn test_check_reads_xml_metadata() {
    let ctx = TestContext::new();
    let mut server = Server::new();
    let _meta = server
        .mock("GET", "/update.xml")
        .with_status(200)
        .with_header("content-type", "text/xml")
        .with_body(
            "<?xml version=\"1.0\"?><update><program><name>Acme</name>\
             <version>1.1</version><beta>0</beta><changelog>Smaller installer</changelog>\
             </program></update>",
        )
        .create();

    let endpoint = format!("{}/update.xml", server.url());
    ctx.run(&["check", "--endpoint", &endpoint, "--local-version", "1.0"])
        .assert_success()
        .assert_stdout_contains("1.1")
        .assert_stdout_contains("Smaller installer");
}

#[test]
fn test_check_falls_back_to_configured_mirror() {
    let ctx = TestContext::new();
    let mut server = Server::new();
    let _meta = server
        .mock("GET", "/mirror.json")
        .with_status(200)
        .with_body(metadata_json("3.0", ""))
        .create();

    let endpoints = format!("http://127.0.0.1:1/update.json,{}/mirror.json", server.url());
    ctx.run(&["config", "set", &format!("endpoints={}", endpoints)])
        .assert_success();

    ctx.run(&["check", "--local-version", "3.0", "--timeout", "5"])
        .assert_success()
        .assert_stdout_contains("3.0 is up to date");
}

#[test]
fn test_check_failure_exits_with_one() {
    let ctx = TestContext::new();
    let mut server = Server::new();
    let _meta = server
        .mock("GET", "/update.json")
        .with_status(200)
        .with_body("<html>maintenance</html>")
        .create();

    let endpoint = format!("{}/update.json", server.url());
    ctx.run(&["check", "--endpoint", &endpoint, "--local-version", "1.0"])
        .assert_code(1)
        .assert_stderr_contains("update check failed");

    ctx.run(&[
        "update",
        "--endpoint",
        "http://127.0.0.1:1/a.json,http://127.0.0.1:1/b.json",
        "--pids",
        "999999",
        "--local-version",
        "1.0",
    ])
    .assert_code(1)
    .assert_stderr_contains("update check failed");
    assert!(ctx.workspaces().is_empty());
}

#[test]
fn test_update_declined_without_terminal() {
    let ctx = TestContext::new();
    let mut server = Server::new();
    let artifact_url = format!("{}/app", server.url());
    let _meta = server
        .mock("GET", "/update.json")
        .with_status(200)
        .with_body(metadata_json("2.0", &artifact_url))
        .create();
    let probe = server.mock("HEAD", "/app").expect(0).create();

    let endpoint = format!("{}/update.json", server.url());
    ctx.run(&[
        "update",
        "--endpoint",
        &endpoint,
        "--pids",
        "999999",
        "--local-version",
        "1.0",
    ])
    .assert_success()
    .assert_stdout_contains("is available");

    probe.assert();
    assert!(ctx.workspaces().is_empty());
}

#[test]
fn test_update_download_failure_cleans_workspace() {
    let ctx = TestContext::new();
    let mut server = Server::new();
    let artifact_url = format!("{}/missing", server.url());
    let _meta = server
        .mock("GET", "/update.json")
        .with_status(200)
        .with_body(metadata_json("2.0", &artifact_url))
        .create();
    let _probe = server.mock("HEAD", "/missing").with_status(404).create();

    let endpoint = format!("{}/update.json", server.url());
    ctx.run(&[
        "update",
        "--endpoint",
        &endpoint,
        "--pids",
        "999999",
        "--local-version",
        "1.0",
        "--yes",
    ])
    .assert_code(1)
    .assert_stderr_contains("download failed");
    assert!(ctx.workspaces().is_empty());
}

#[cfg(unix)]
#[test]
fn test_update_installs_and_stops_processes() {
    use std::time::{Duration, Instant};

    let ctx = TestContext::new();
    let installer = "#!/bin/sh\necho installed > installed.txt\n";

    let mut server = Server::new();
    let artifact_url = format!("{}/acme-installer", server.url());
    let _meta = server
        .mock("GET", "/update.json")
        .with_status(200)
        .with_body(metadata_json("2.0", &artifact_url))
        .create();
    let _probe = server
        .mock("HEAD", "/acme-installer")
        .with_status(200)
        .with_header("content-length", &installer.len().to_string())
        .with_body(installer)
        .create();
    let _download = server
        .mock("GET", "/acme-installer")
        .with_status(200)
        .with_body(installer)
        .create();

    // Stand-in for the running application, reaped as soon as it exits
    let mut app = std::process::Command::new("sleep").arg("60").spawn().unwrap();
    let app_pid = app.id();
    let reaper = std::thread::spawn(move || app.wait());

    let endpoint = format!("{}/update.json", server.url());
    ctx.run(&[
        "update",
        "--endpoint",
        &endpoint,
        "--pids",
        &app_pid.to_string(),
        "--local-version",
        "1.0",
        "--yes",
    ])
    .assert_success()
    .assert_stdout_contains("Started installer");

    assert!(!reaper.join().unwrap().unwrap().success());

    let workspaces = ctx.workspaces();
    assert_eq!(workspaces.len(), 1);
    let artifact = workspaces[0].join(format!("2.0{}", std::env::consts::EXE_SUFFIX));
    assert_eq!(std::fs::read_to_string(&artifact).unwrap(), installer);

    let marker = workspaces[0].join("installed.txt");
    let deadline = Instant::now() + Duration::from_secs(10);
    while !marker.exists() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(100));
    }
    assert!(marker.exists(), "installer did not run in its workspace");
}

/// Serves metadata and a size probe, then stalls forever partway through the
/// artifact body. The receiver fires once the body has started.
#[cfg(unix)]
fn stalling_server() -> (String, std::sync::mpsc::Receiver<()>) {
    use std::io::{Read, Write};
    use std::net::TcpListener;

    let (stalled_tx, stalled_rx) = std::sync::mpsc::channel();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let artifact_url = format!("{}/stalled", base);

    std::thread::spawn(move || {
        let mut held = Vec::new();
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { continue };
            let mut request = [0u8; 4096];
            let n = stream.read(&mut request).unwrap_or(0);
            let request = String::from_utf8_lossy(&request[..n]).to_string();

            if request.starts_with("GET /update.json") {
                let body = metadata_json("2.0", &artifact_url);
                let _ = write!(
                    stream,
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
            } else if request.starts_with("HEAD /stalled") {
                let _ = write!(
                    stream,
                    "HTTP/1.1 200 OK\r\nContent-Length: 1048576\r\nConnection: close\r\n\r\n"
                );
            } else {
                let _ = write!(stream, "HTTP/1.1 200 OK\r\nContent-Length: 1048576\r\n\r\npartial");
                let _ = stream.flush();
                held.push(stream);
                let _ = stalled_tx.send(());
            }
        }
    });

    (format!("{}/update.json", base), stalled_rx)
}

#[cfg(unix)]
#[test]
fn test_second_interrupt_aborts_stalled_download() {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    use std::time::{Duration, Instant};

    let ctx = TestContext::new();
    let (endpoint, stalled) = stalling_server();

    let mut child = ctx
        .cmd()
        .args([
            "update",
            "--endpoint",
            &endpoint,
            "--pids",
            "999999",
            "--local-version",
            "1.0",
            "--yes",
        ])
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .unwrap();
    let pid = Pid::from_raw(child.id() as i32);

    stalled
        .recv_timeout(Duration::from_secs(10))
        .expect("download never started");
    assert_eq!(ctx.workspaces().len(), 1);

    // The first press only requests cancellation, which a stalled stream never sees
    kill(pid, Signal::SIGINT).unwrap();
    std::thread::sleep(Duration::from_millis(500));
    assert!(child.try_wait().unwrap().is_none());

    kill(pid, Signal::SIGINT).unwrap();
    let deadline = Instant::now() + Duration::from_secs(10);
    let status = loop {
        if let Some(status) = child.try_wait().unwrap() {
            break status;
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            panic!("updraft did not exit after a second interrupt");
        }
        std::thread::sleep(Duration::from_millis(50));
    };

    assert_eq!(status.code(), Some(1));
    assert!(ctx.workspaces().is_empty());
}
