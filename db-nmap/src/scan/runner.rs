use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use anyhow::{Context, Result};
use tokio::io::BufReader;
use tokio::process::Command;
use crate::scan::args;
use crate::scan::decoder::{self, DecodeError, DecodeSummary};
use crate::scan::tee::TeeTransport;
use crate::store_manager::{Ingest, IngestTotals};

/// One scanner invocation whose report is decoded while it runs.
#[derive(Debug, Clone)]
pub struct LiveScan {
    pub binary: String,
    /// Arguments as the user gave them, before output rewriting.
    pub args: Vec<String>,
    pub pipe_capacity: usize,
}

#[derive(Debug)]
pub struct ScanOutcome {
    pub status: ExitStatus,
    pub totals: IngestTotals,
    pub decode: Result<DecodeSummary, DecodeError>,
    pub persisted: Option<PathBuf>,
}

impl ScanOutcome {
    /// Process exit code: the scanner's own, or 1 when it was killed or
    /// succeeded while decoding failed.
    pub fn exit_code(&self) -> u8 {
        match self.status.code() {
            Some(0) if self.decode.is_err() => 1,
            Some(code) => u8::try_from(code & 0xff).unwrap_or(1),
            None => 1,
        }
    }
}

impl LiveScan {
    #[tracing::instrument(name = "live_scan", skip_all, fields(binary = %self.binary))]
    pub async fn run(&self, ingest: Ingest) -> Result<ScanOutcome> {
        let target = args::resolve_output_target(&self.args);
        let scanner_args = args::scanner_args(&self.args);

        let (mut tee, pipe) = TeeTransport::open(target.as_ref(), self.pipe_capacity).await?;

        let decode_task = tokio::spawn(async move {
            let mut ingest = ingest;
            let result = decoder::decode(BufReader::new(pipe), &mut ingest).await;
            if let Err(e) = &result {
                tracing::error!(error = e as &dyn std::error::Error, "Error watching XML");
            }
            (ingest, result)
        });

        tracing::debug!(args = ?scanner_args, "Running scanner");
        let mut child = Command::new(&self.binary)
            .args(&scanner_args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("Failed to start {}", self.binary))?;

        let stdout = child
            .stdout
            .take()
            .context("Scanner stdout was not captured")?;

        // Runs until the scanner closes stdout, normally at exit.
        if let Err(e) = tee.pump(stdout).await {
            tracing::warn!("Failed reading scanner output: {e}");
        }
        let waited = child.wait().await;

        let persisted = match tee.close().await {
            Ok(stats) => {
                tracing::debug!(bytes = stats.bytes, "Scanner output drained");
                stats.persisted
            }
            Err(e) => {
                tracing::error!("Failed to persist report: {e:#}");
                None
            }
        };

        let (ingest, decode) = decode_task.await.context("Decode task panicked")?;
        let status = waited.with_context(|| format!("Failed waiting for {}", self.binary))?;

        if !status.success() {
            tracing::warn!("Scanner exited with {status}");
        }

        Ok(ScanOutcome {
            status,
            totals: ingest.totals(),
            decode,
            persisted,
        })
    }
}

/// Wait for a repeated interrupt.
///
/// The first one is only logged: the scanner shares the terminal's process
/// group, gets the same signal and exits on its own, and its remaining output
/// still has to be drained. Returns once a second interrupt arrives.
pub async fn second_interrupt<F, Fut>(mut interrupt: F) -> io::Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<()>>,
{
    interrupt().await?;
    tracing::info!("Interrupted, waiting for the scanner to exit (press Ctrl-C again to quit)");
    interrupt().await
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use super::*;
    use crate::store::db::ScanDb;
    use crate::store::merge::MergePolicy;
    use crate::store::supervisor::{ConnectionSupervisor, SqliteConnector};
    use crate::store_manager::StoreHandle;

    fn fixture() -> String {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("testdata/scanme.xml")
            .display()
            .to_string()
    }

    async fn ingest() -> (StoreHandle, Ingest) {
        let store = StoreHandle::spawn(
            ScanDb::open(":memory:").unwrap(),
            None::<ConnectionSupervisor<SqliteConnector>>,
            MergePolicy::default(),
        );
        let workspace_id = store.workspace_id("default").await.unwrap();
        (store.clone(), Ingest::new(store, workspace_id))
    }

    /// A stand-in scanner: `sh -c script`. The appended `-oX -` lands in `$0`/`$1`.
    fn shell(script: &str, extra: &[&str]) -> LiveScan {
        let mut args = vec!["-c".to_string(), script.to_string()];
        args.extend(extra.iter().map(|s| s.to_string()));
        LiveScan {
            binary: "sh".to_string(),
            args,
            pipe_capacity: 512,
        }
    }

    #[tokio::test]
    async fn test_live_scan_registers_hosts() {
        let (store, ingest) = ingest().await;

        let outcome = shell(&format!("cat '{}'", fixture()), &[]).run(ingest).await.unwrap();

        assert!(outcome.status.success());
        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(outcome.totals, IngestTotals { hosts: 1, services: 4, failed: 0 });
        assert!(outcome.decode.as_ref().unwrap().finished);
        assert_eq!(outcome.persisted, None);
        store.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_live_scan_tees_report() {
        let dir = tempfile::tempdir().unwrap();
        let report = dir.path().join("report.xml");
        let (store, ingest) = ingest().await;

        let report_arg = report.display().to_string();
        let scan = shell(&format!("cat '{}'", fixture()), &["-oX", &report_arg]);
        let outcome = scan.run(ingest).await.unwrap();

        assert_eq!(outcome.persisted.as_deref(), Some(report.as_path()));
        assert_eq!(std::fs::read(&report).unwrap(), std::fs::read(fixture()).unwrap());
        assert_eq!(outcome.totals.services, 4);
        store.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_exit_code_mirrors_scanner() {
        let (store, ingest) = ingest().await;

        let outcome = shell("exit 3", &[]).run(ingest).await.unwrap();

        assert_eq!(outcome.exit_code(), 3);
        assert!(!outcome.decode.as_ref().unwrap().finished);
        assert_eq!(outcome.totals, IngestTotals::default());
        store.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_decode_failure_fails_successful_scan() {
        let (store, ingest) = ingest().await;

        let script = r#"echo '<nmaprun version="7.94"><host><ports></hostnames></host></nmaprun>'"#;
        let outcome = shell(script, &[]).run(ingest).await.unwrap();

        assert!(outcome.status.success());
        assert!(matches!(outcome.decode, Err(DecodeError::Malformed { .. })));
        assert_eq!(outcome.exit_code(), 1);
        store.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_scanner_binary() {
        let (store, ingest) = ingest().await;
        let scan = LiveScan {
            binary: "/nonexistent/nmap".to_string(),
            args: vec!["10.0.0.1".to_string()],
            pipe_capacity: 512,
        };

        let err = scan.run(ingest).await.unwrap_err();
        assert!(err.to_string().contains("Failed to start"));
        store.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_second_interrupt_returns_after_two_signals() {
        let mut calls = 0;
        second_interrupt(|| {
            calls += 1;
            async { Ok(()) }
        })
        .await
        .unwrap();
        assert_eq!(calls, 2);
    }

    #[tokio::test]
    async fn test_second_interrupt_propagates_listener_error() {
        let mut calls = 0;
        let result = second_interrupt(|| {
            calls += 1;
            async { Err(io::Error::new(io::ErrorKind::Other, "no signal handler")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
