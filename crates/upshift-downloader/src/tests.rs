use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sha2::{Digest, Sha256};
use upshift_core::{
    ArchiveType, HashAlgorithm, PatchState, PatchType, Update, UpdateDescriptor, UpdateLayout,
};

use super::*;

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn test_dir(label: &str) -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time")
        .as_nanos();
    std::env::temp_dir().join(format!(
        "upshift-downloader-{label}-{}-{}",
        std::process::id(),
        nanos
    ))
}

fn test_layout(label: &str) -> UpdateLayout {
    let root = test_dir(label);
    UpdateLayout::new(root.join("install"), root.join("updates"))
}

/// Minimal single-threaded HTTP responder with range-request support, enough
/// for the blocking client to exercise resume and fallback paths against.
struct TestServer {
    port: u16,
    requests: Arc<Mutex<Vec<String>>>,
}

impl TestServer {
    fn start(routes: Vec<(&'static str, Vec<u8>)>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("must bind test server");
        let port = listener.local_addr().expect("local addr").port();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&requests);

        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                handle_connection(stream, &routes, &seen);
            }
        });

        Self { port, requests }
    }

    fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.port, path)
    }

    fn requests(&self) -> Vec<String> {
        self.requests.lock().expect("request log").clone()
    }

    fn requests_for(&self, path: &str) -> usize {
        self.requests()
            .iter()
            .filter(|line| line.contains(path))
            .count()
    }
}

fn handle_connection(
    mut stream: TcpStream,
    routes: &[(&'static str, Vec<u8>)],
    seen: &Arc<Mutex<Vec<String>>>,
) {
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("read timeout");

    let mut raw = Vec::new();
    let mut buffer = [0u8; 1024];
    while !raw.windows(4).any(|window| window == b"\r\n\r\n") {
        let Ok(read) = stream.read(&mut buffer) else {
            return;
        };
        if read == 0 {
            break;
        }
        raw.extend_from_slice(&buffer[..read]);
    }

    let text = String::from_utf8_lossy(&raw);
    let mut lines = text.lines();
    let request_line = lines.next().unwrap_or_default().to_string();
    let path = request_line.split_whitespace().nth(1).unwrap_or("/");

    let range_offset = lines
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            if !name.trim().eq_ignore_ascii_case("range") {
                return None;
            }
            let value = value.trim();
            let value = value.strip_prefix("bytes=")?;
            value.trim_end_matches('-').parse::<u64>().ok()
        })
        .next();

    seen.lock()
        .expect("request log")
        .push(match range_offset {
            Some(offset) => format!("{request_line} [range={offset}]"),
            None => request_line.clone(),
        });

    let body = routes
        .iter()
        .find(|(route, _)| *route == path)
        .map(|(_, body)| body.clone());

    let response = match body {
        None => b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_vec(),
        Some(body) => match range_offset {
            Some(offset) if (offset as usize) < body.len() => {
                let tail = &body[offset as usize..];
                let mut response = format!(
                    "HTTP/1.1 206 Partial Content\r\nContent-Length: {}\r\nContent-Range: bytes {}-{}/{}\r\nConnection: close\r\n\r\n",
                    tail.len(),
                    offset,
                    body.len() - 1,
                    body.len()
                )
                .into_bytes();
                response.extend_from_slice(tail);
                response
            }
            _ => {
                let mut response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                )
                .into_bytes();
                response.extend_from_slice(&body);
                response
            }
        },
    };

    let _ = stream.write_all(&response);
    let _ = stream.flush();
}

fn update_with_complete_only(url: &str, body: &[u8]) -> Update {
    let raw = format!(
        r#"
id = "app-2.0"
version = "2.0"
type = "major"
channel = "release"

[[patches]]
type = "complete"
url = "{url}"
hash_algorithm = "sha256"
hash_value = "{hash}"
byte_size = {size}
"#,
        url = url,
        hash = sha256_hex(body),
        size = body.len()
    );
    let descriptor = UpdateDescriptor::from_toml_str(&raw).expect("descriptor should parse");
    Update::from_descriptor(descriptor).expect("update should build")
}

fn update_with_both(
    partial_url: &str,
    partial_body: &[u8],
    declared_partial_size: u64,
    complete_url: &str,
    complete_body: &[u8],
) -> Update {
    let raw = format!(
        r#"
id = "app-2.0"
version = "2.0"
type = "major"
channel = "release"

[[patches]]
type = "partial"
url = "{partial_url}"
hash_algorithm = "sha256"
hash_value = "{partial_hash}"
byte_size = {partial_size}

[[patches]]
type = "complete"
url = "{complete_url}"
hash_algorithm = "sha256"
hash_value = "{complete_hash}"
byte_size = {complete_size}
"#,
        partial_url = partial_url,
        partial_hash = sha256_hex(partial_body),
        partial_size = declared_partial_size,
        complete_url = complete_url,
        complete_hash = sha256_hex(complete_body),
        complete_size = complete_body.len()
    );
    let descriptor = UpdateDescriptor::from_toml_str(&raw).expect("descriptor should parse");
    Update::from_descriptor(descriptor).expect("update should build")
}

#[test]
fn fetch_downloads_and_verifies_a_complete_patch() {
    let body = vec![0xa5u8; 70_000];
    let server = TestServer::start(vec![("/patch.tar.gz", body.clone())]);
    let layout = test_layout("complete");
    let mut update = update_with_complete_only(&server.url("/patch.tar.gz"), &body);

    let control = DownloadControl::new();
    let mut reports = Vec::new();
    let outcome = Downloader::new(0)
        .fetch(&mut update, &layout, &control, &mut |report| {
            reports.push(report)
        })
        .expect("fetch must run");

    assert_eq!(outcome, DownloadOutcome::Success);
    let patch = update.selected_patch().expect("selected patch");
    assert_eq!(patch.state, PatchState::PendingApply);
    assert_eq!(patch.progress_bytes, body.len() as u64);

    let archive = std::fs::read(layout.archive_path(ArchiveType::TarGz))
        .expect("archive must be in place");
    assert_eq!(archive, body);
    assert!(!layout.archive_part_path(ArchiveType::TarGz).exists());

    assert!(!reports.is_empty(), "progress must be reported");
    assert!(reports
        .windows(2)
        .all(|pair| pair[0].bytes_so_far <= pair[1].bytes_so_far));
    let last = reports.last().expect("last report");
    assert_eq!(last.bytes_so_far, body.len() as u64);
    assert_eq!(last.total_bytes, body.len() as u64);

    let _ = std::fs::remove_dir_all(layout.updates_dir().parent().expect("root"));
}

#[test]
fn failed_partial_verification_falls_back_to_complete_exactly_once() {
    let partial_body = vec![0x11u8; 4_000];
    let complete_body = vec![0x22u8; 24_000];
    let server = TestServer::start(vec![
        ("/partial.tar.gz", partial_body.clone()),
        ("/complete.tar.gz", complete_body.clone()),
    ]);
    let layout = test_layout("fallback");
    // The descriptor lies about the partial size, so verification must fail
    // after the bytes land.
    let mut update = update_with_both(
        &server.url("/partial.tar.gz"),
        &partial_body,
        partial_body.len() as u64 + 17,
        &server.url("/complete.tar.gz"),
        &complete_body,
    );

    let control = DownloadControl::new();
    let outcome = Downloader::new(0)
        .fetch(&mut update, &layout, &control, &mut |_| {})
        .expect("fetch must run");

    assert_eq!(outcome, DownloadOutcome::Success);
    assert!(update.is_complete_update);
    assert_eq!(
        update.selected_patch().expect("selected").patch_type,
        PatchType::Complete
    );
    assert_eq!(
        update
            .patch_of_type(PatchType::Partial)
            .expect("partial patch")
            .state,
        PatchState::FailedVerification
    );

    assert_eq!(server.requests_for("/partial.tar.gz"), 1);
    assert_eq!(server.requests_for("/complete.tar.gz"), 1);
    // The complete transfer starts from byte 0, not from a stale offset.
    assert!(server
        .requests()
        .iter()
        .filter(|line| line.contains("/complete.tar.gz"))
        .all(|line| !line.contains("[range=")));

    let archive = std::fs::read(layout.archive_path(ArchiveType::TarGz))
        .expect("complete archive must be in place");
    assert_eq!(archive, complete_body);

    let _ = std::fs::remove_dir_all(layout.updates_dir().parent().expect("root"));
}

#[test]
fn exhausted_fallback_reports_verification_failure() {
    let partial_body = vec![0x11u8; 2_000];
    let complete_body = vec![0x22u8; 3_000];
    let server = TestServer::start(vec![
        ("/partial.tar.gz", partial_body.clone()),
        ("/complete.tar.gz", complete_body.clone()),
    ]);
    let layout = test_layout("exhausted");
    let mut update = update_with_both(
        &server.url("/partial.tar.gz"),
        b"wrong partial bytes",
        partial_body.len() as u64,
        &server.url("/complete.tar.gz"),
        b"wrong complete bytes",
    );
    // Patch the declared sizes so the size pre-check passes and the hash
    // mismatch is what rejects both transfers.
    update
        .patch_of_type_mut(PatchType::Partial)
        .expect("partial")
        .byte_size = partial_body.len() as u64;
    update
        .patch_of_type_mut(PatchType::Complete)
        .expect("complete")
        .byte_size = complete_body.len() as u64;

    let control = DownloadControl::new();
    let outcome = Downloader::new(0)
        .fetch(&mut update, &layout, &control, &mut |_| {})
        .expect("fetch must run");

    assert_eq!(outcome, DownloadOutcome::VerificationFailed);
    assert_eq!(
        update
            .patch_of_type(PatchType::Partial)
            .expect("partial")
            .state,
        PatchState::FailedVerification
    );
    assert_eq!(
        update
            .patch_of_type(PatchType::Complete)
            .expect("complete")
            .state,
        PatchState::FailedVerification
    );
    // Exactly one attempt per rung of the ladder, never a third try.
    assert_eq!(server.requests_for("/partial.tar.gz"), 1);
    assert_eq!(server.requests_for("/complete.tar.gz"), 1);

    let _ = std::fs::remove_dir_all(layout.updates_dir().parent().expect("root"));
}

#[test]
fn abort_keeps_the_patch_pending_and_resumable() {
    let body = vec![0x77u8; 50_000];
    let server = TestServer::start(vec![("/patch.tar.gz", body.clone())]);
    let layout = test_layout("abort");
    let mut update = update_with_complete_only(&server.url("/patch.tar.gz"), &body);

    let control = DownloadControl::new();
    control.abort();
    let outcome = Downloader::new(0)
        .fetch(&mut update, &layout, &control, &mut |_| {})
        .expect("fetch must run");

    assert_eq!(outcome, DownloadOutcome::Aborted);
    assert_eq!(
        update.selected_patch().expect("selected").state,
        PatchState::Pending
    );
    assert!(
        !layout.archive_path(ArchiveType::TarGz).exists(),
        "an aborted transfer must not produce a final archive"
    );

    let _ = std::fs::remove_dir_all(layout.updates_dir().parent().expect("root"));
}

#[test]
fn resume_continues_from_the_partial_file_offset() {
    let body: Vec<u8> = (0..60_000u32).map(|value| (value % 251) as u8).collect();
    let server = TestServer::start(vec![("/patch.tar.gz", body.clone())]);
    let layout = test_layout("resume");
    let mut update = update_with_complete_only(&server.url("/patch.tar.gz"), &body);

    // Seed the first half as if an earlier transfer was paused there.
    layout.ensure_base_dirs().expect("must create dirs");
    std::fs::write(
        layout.archive_part_path(ArchiveType::TarGz),
        &body[..30_000],
    )
    .expect("must seed partial file");

    let control = DownloadControl::new();
    let outcome = Downloader::new(0)
        .fetch(&mut update, &layout, &control, &mut |_| {})
        .expect("fetch must run");

    assert_eq!(outcome, DownloadOutcome::Success);
    let archive = std::fs::read(layout.archive_path(ArchiveType::TarGz))
        .expect("archive must be in place");
    assert_eq!(archive, body);
    assert!(
        server
            .requests()
            .iter()
            .any(|line| line.contains("[range=30000]")),
        "the transfer must resume with a range request: {:?}",
        server.requests()
    );

    let _ = std::fs::remove_dir_all(layout.updates_dir().parent().expect("root"));
}

#[test]
fn unreachable_server_reports_network_error_after_retries() {
    // Bind and drop a listener so the port is very likely unused.
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").expect("must bind");
        listener.local_addr().expect("local addr").port()
    };
    let layout = test_layout("network");
    let mut update = update_with_complete_only(
        &format!("http://127.0.0.1:{port}/patch.tar.gz"),
        b"unused body",
    );

    let control = DownloadControl::new();
    let outcome = Downloader::new(1)
        .with_retry_delay(Duration::from_millis(10))
        .fetch(&mut update, &layout, &control, &mut |_| {})
        .expect("fetch must run");

    assert!(
        matches!(outcome, DownloadOutcome::NetworkError(_)),
        "unexpected outcome: {outcome:?}"
    );
    assert_eq!(
        update.selected_patch().expect("selected").state,
        PatchState::Pending
    );

    let _ = std::fs::remove_dir_all(layout.updates_dir().parent().expect("root"));
}
