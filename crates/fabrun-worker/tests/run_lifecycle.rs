//! End-to-end run scenarios against a mock Control Center.
//!
//! The mock is a bare TCP acceptor speaking just enough HTTP/1.1 for the
//! agent: it records every request and answers each page with a canned body.

#![cfg(unix)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use fabrun_worker::config::Config;
use fabrun_worker::protocol::TaskRunInfo;
use fabrun_worker::server::RequestQueue;
use fabrun_worker::status::RunStatus;
use fabrun_worker::sync::SyncLoop;

#[derive(Debug, Clone)]
struct Recorded {
    target: String,
    body: String,
}

type Records = Arc<Mutex<Vec<Recorded>>>;

/// Start the mock Control Center; `sync_response` is the body served for
/// `Synchronize` requests, every other page gets an empty 200.
async fn mock_control_center(sync_response: &'static str) -> (String, Records) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}/", listener.local_addr().unwrap());
    let records: Records = Arc::new(Mutex::new(Vec::new()));

    let server_records = records.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let records = server_records.clone();
            tokio::spawn(async move {
                let mut raw = Vec::new();
                let mut buf = [0u8; 4096];
                let header_end = loop {
                    match stream.read(&mut buf).await {
                        Ok(0) => return,
                        Ok(n) => raw.extend_from_slice(&buf[..n]),
                        Err(_) => return,
                    }
                    if let Some(pos) = find_header_end(&raw) {
                        break pos;
                    }
                };

                let headers = String::from_utf8_lossy(&raw[..header_end]).into_owned();
                let target = headers
                    .lines()
                    .next()
                    .and_then(|line| line.split_whitespace().nth(1))
                    .unwrap_or_default()
                    .to_owned();
                let content_length: usize = headers
                    .lines()
                    .filter_map(|line| line.split_once(':'))
                    .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
                    .and_then(|(_, value)| value.trim().parse().ok())
                    .unwrap_or(0);

                let mut body = raw[header_end + 4..].to_vec();
                while body.len() < content_length {
                    match stream.read(&mut buf).await {
                        Ok(0) => break,
                        Ok(n) => body.extend_from_slice(&buf[..n]),
                        Err(_) => return,
                    }
                }

                records.lock().unwrap().push(Recorded {
                    target: target.clone(),
                    body: String::from_utf8_lossy(&body).into_owned(),
                });

                let payload = if target.starts_with("/Synchronize") {
                    sync_response
                } else {
                    ""
                };
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    payload.len(),
                    payload
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });

    (base_url, records)
}

fn find_header_end(raw: &[u8]) -> Option<usize> {
    raw.windows(4).position(|w| w == b"\r\n\r\n")
}

async fn wait_for_request(
    records: &Records,
    page: &str,
) -> Recorded {
    for _ in 0..200 {
        if let Some(found) = records
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.target.starts_with(page))
            .cloned()
        {
            return found;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("no request for {page} arrived");
}

/// A workspace with wrapper, report and product directories plus a parsed
/// configuration pointing at the mock server.
struct Workspace {
    dir: tempfile::TempDir,
    config: Arc<Config>,
}

impl Workspace {
    fn new(base_url: &str, wrapper_name: &str, wrapper_file: &str, script: &str) -> Workspace {
        let dir = tempfile::tempdir().unwrap();
        let wrappers = dir.path().join("wrappers");
        std::fs::create_dir_all(wrappers.join(wrapper_name)).unwrap();
        std::fs::write(wrappers.join(wrapper_name).join(wrapper_file), script).unwrap();
        std::fs::create_dir_all(dir.path().join("reports")).unwrap();
        std::fs::create_dir_all(dir.path().join("products")).unwrap();

        let xml = format!(
            r#"<taskrunner>
                <controlCenter serverBaseURL="{base_url}" tokenId="tr" tokenPass="secret"/>
                <output reportBaseDir="{reports}" productBaseDir="{products}"/>
                <generic logLevel="info"/>
                <wrappers dir="{wrappers}"/>
                <parameter name="FACTORY_NAME" value="pc-test"/>
            </taskrunner>"#,
            reports = dir.path().join("reports").display(),
            products = dir.path().join("products").display(),
            wrappers = wrappers.display(),
        );
        let config = Arc::new(Config::parse(&xml).unwrap());
        Workspace { dir, config }
    }

    fn report_dir(&self) -> std::path::PathBuf {
        self.dir.path().join("reports/230101/1200-ABCD/build")
    }
}

fn execute_info(wrapper: &str) -> TaskRunInfo {
    let xml = format!(
        r#"<start>
            <run jobId="230101-1200-ABCD" taskId="build" runId="0"/>
            <task target="linux" framework="f" script="s">
                <param name="sf.wrapper" value="{wrapper}"/>
                <param name="CFG" value="release"/>
            </task>
            <output name="BINARY"/>
        </start>"#
    );
    let doc = roxmltree::Document::parse(&xml).unwrap();
    TaskRunInfo::parse_execute(&doc.root_element()).unwrap()
}

fn extract_info(wrapper: &str) -> TaskRunInfo {
    let xml = format!(
        r#"<extract>
            <shadowrun shadowId="SID-7"/>
            <run jobId="230101-1200-ABCD" taskId="build" runId="0"/>
            <task target="linux" framework="f" script="s">
                <param name="sf.wrapper" value="{wrapper}"/>
            </task>
        </extract>"#
    );
    let doc = roxmltree::Document::parse(&xml).unwrap();
    TaskRunInfo::parse_extract(&doc.root_element()).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn normal_run_reports_task_done() {
    let (base_url, records) = mock_control_center("").await;
    let workspace = Workspace::new(
        &base_url,
        "build",
        "wrapper.sh",
        "#!/bin/sh\n\
         echo \"result=ok\" > \"$SF_RESULTS\"\n\
         echo \"summary=all good\" >> \"$SF_RESULTS\"\n",
    );

    let (queue, _queue_task) = RequestQueue::start(&workspace.config.control_center);
    let status = RunStatus::new(workspace.config.clone(), queue);
    status.clone().start_task(execute_info("build")).await;
    status.wait_idle().await;

    let done = wait_for_request(&records, "/TaskDone").await;
    assert!(done.target.contains("id=230101-1200-ABCD"));
    assert!(done.target.contains("name=build"));
    assert!(done.body.contains("result=ok"));
    assert!(done.body.contains("summary=all+good"));
    assert!(done.body.contains("report=wrapper_log.txt"));

    // The report directory holds the startup script and the artifacts.
    let report_dir = workspace.report_dir();
    assert!(report_dir.join("execute.sh").is_file());
    assert!(report_dir.join("results.properties").is_file());
    assert!(report_dir.join("wrapper_log.txt").is_file());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn aborted_run_reports_abort_summary() {
    let (base_url, records) = mock_control_center("").await;
    let workspace = Workspace::new(&base_url, "build", "wrapper.sh", "#!/bin/sh\nexec sleep 30\n");

    let (queue, _queue_task) = RequestQueue::start(&workspace.config.control_center);
    let status = RunStatus::new(workspace.config.clone(), queue);
    status.clone().start_task(execute_info("build")).await;

    // Give the wrapper a moment to start, then abort twice; the second
    // abort must collapse into the first.
    tokio::time::sleep(Duration::from_millis(200)).await;
    status.abort_task();
    status.abort_task();
    status.wait_idle().await;

    let done = wait_for_request(&records, "/TaskDone").await;
    assert!(done.body.contains("result=error"));
    assert!(done
        .body
        .contains("summary=Aborted+by+request+of+the+Control+Center"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn extraction_run_reports_shadow_id() {
    let (base_url, records) = mock_control_center("").await;
    let workspace = Workspace::new(
        &base_url,
        "build",
        "extractor.sh",
        "#!/bin/sh\n\
         echo \"extraction.result=ok\" > \"$SF_RESULTS\"\n\
         echo \"data.loc=1234\" >> \"$SF_RESULTS\"\n",
    );
    // Extraction reuses the work environment of the execution run.
    std::fs::create_dir_all(workspace.report_dir()).unwrap();

    let (queue, _queue_task) = RequestQueue::start(&workspace.config.control_center);
    let status = RunStatus::new(workspace.config.clone(), queue);
    status.clone().start_task(extract_info("build")).await;
    status.wait_idle().await;

    let done = wait_for_request(&records, "/TaskDone").await;
    assert!(done.target.contains("shadowId=SID-7"));
    assert!(done.body.contains("extraction.result=ok"));
    assert!(done.body.contains("data.loc=1234"));
    // Extraction results carry no reports and no output locators.
    assert!(!done.body.contains("report="));
    assert!(!done.body.contains("output."));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_wrapper_reports_error() {
    let (base_url, records) = mock_control_center("").await;
    let workspace = Workspace::new(&base_url, "other", "wrapper.sh", "#!/bin/sh\n");

    let (queue, _queue_task) = RequestQueue::start(&workspace.config.control_center);
    let status = RunStatus::new(workspace.config.clone(), queue);
    status.clone().start_task(execute_info("build")).await;
    status.wait_idle().await;

    let done = wait_for_request(&records, "/TaskDone").await;
    assert!(done.body.contains("result=error"));
    assert!(done.body.contains("No+wrapper+implementation+found"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sync_loop_exits_on_exit_command() {
    let (base_url, records) = mock_control_center("<response><exit/></response>").await;
    let workspace = Workspace::new(&base_url, "build", "wrapper.sh", "#!/bin/sh\n");

    let (queue, queue_task) = RequestQueue::start(&workspace.config.control_center);
    let status = RunStatus::new(workspace.config.clone(), queue.clone());
    let sync_loop = SyncLoop::new(status, queue, queue_task);

    tokio::time::timeout(Duration::from_secs(15), sync_loop.main_loop())
        .await
        .expect("sync loop should exit on <exit/>");

    let sync = wait_for_request(&records, "/Synchronize").await;
    assert!(sync.body.contains("<request host="));
    assert!(sync.body.contains("runnerVersion="));
}
