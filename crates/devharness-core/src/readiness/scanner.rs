//! Line scanner over the child's stderr.

use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::ComponentEndpoint;
use crate::logging::Logger;

/// What the scanner reports to the barrier.
#[derive(Debug)]
pub enum ScanEvent {
    /// A component announced its address.
    Address { name: String, address: String },
    /// Reading the stream failed; no further events follow.
    ReadError(std::io::Error),
    /// The stream reached EOF; no further events follow.
    Closed,
}

/// Matches stderr lines against the still-unresolved discovery patterns.
#[derive(Debug)]
pub struct AddressScanner {
    pending: Vec<(String, Regex)>,
    logger: Logger,
}

impl AddressScanner {
    pub fn new(endpoints: &[ComponentEndpoint], logger: Logger) -> Self {
        let pending = endpoints
            .iter()
            .filter(|e| !e.is_resolved())
            .map(|e| (e.name.clone(), e.pattern.clone()))
            .collect();
        Self { pending, logger }
    }

    /// Names not yet announced.
    pub fn pending(&self) -> impl Iterator<Item = &str> {
        self.pending.iter().map(|(name, _)| name.as_str())
    }

    /// Match one line. Each name is reported at most once over the
    /// scanner's lifetime.
    pub fn scan_line(&mut self, line: &str) -> Vec<(String, String)> {
        let mut found = Vec::new();
        self.pending.retain(|(name, pattern)| {
            let address = pattern
                .captures(line)
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str().to_string());
            match address {
                Some(address) => {
                    found.push((name.clone(), address));
                    false
                }
                None => true,
            }
        });
        found
    }

    /// Read `stream` until EOF or error, mirroring lines to the logger and
    /// sending discoveries on `events`.
    ///
    /// Reading continues after the barrier stops listening so the child
    /// never blocks on a full stderr pipe.
    pub fn spawn<R>(mut self, stream: R, events: mpsc::Sender<ScanEvent>) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        tokio::spawn(async move {
            let mut reader = BufReader::new(stream);
            let mut buf = Vec::new();
            let mut last_level = None;

            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => {
                        debug!("child stderr closed");
                        let _ = events.send(ScanEvent::Closed).await;
                        break;
                    }
                    Ok(_) => {
                        // Stray bytes from the child must not end the scan.
                        let line = String::from_utf8_lossy(trim_line_ending(&buf));
                        self.logger.mirror_child(&line, &mut last_level);
                        for (name, address) in self.scan_line(&line) {
                            debug!(component = %name, address = %address, "component announced");
                            // The barrier may already be gone; keep draining.
                            let _ = events.send(ScanEvent::Address { name, address }).await;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "error reading child stderr");
                        let _ = events.send(ScanEvent::ReadError(e)).await;
                        break;
                    }
                }
            }
        })
    }
}

fn trim_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::logging::{CaptureSink, LogLevel};
    use crate::readiness::required_endpoints;

    fn scanner(threshold: LogLevel) -> (AddressScanner, CaptureSink) {
        let sink = CaptureSink::new();
        let logger = Logger::new(threshold, Arc::new(sink.clone()));
        (AddressScanner::new(&required_endpoints("default", &[]), logger), sink)
    }

    #[test]
    fn first_match_wins_per_component() {
        let (mut scanner, _) = scanner(LogLevel::Error);
        assert_eq!(
            scanner.scan_line("Starting API server at: http://localhost:1"),
            vec![("API".to_string(), "http://localhost:1".to_string())]
        );
        assert!(scanner.scan_line("Starting API server at: http://localhost:2").is_empty());
        assert_eq!(scanner.pending().collect::<Vec<_>>(), vec!["admin", "default"]);
    }

    #[test]
    fn unrelated_lines_match_nothing() {
        let (mut scanner, _) = scanner(LogLevel::Error);
        assert!(scanner.scan_line("INFO Skipping SDK update check.").is_empty());
        assert_eq!(scanner.pending().count(), 3);
    }

    #[tokio::test]
    async fn streams_events_then_closed() {
        let (scanner, sink) = scanner(LogLevel::Child);
        let stderr: &[u8] = b"INFO boot\n\
            Starting API server at: http://localhost:1\n\
            Starting module \"default\" running at: http://localhost:2\n\
            Starting admin server at: http://localhost:3\n\
            Starting API server at: http://localhost:9\n";
        let (tx, mut rx) = mpsc::channel(16);

        scanner.spawn(stderr, tx).await.unwrap();

        let mut seen = Vec::new();
        while let Some(event) = rx.recv().await {
            match event {
                ScanEvent::Address { name, address } => seen.push((name, address)),
                ScanEvent::Closed => break,
                ScanEvent::ReadError(e) => panic!("unexpected read error: {e}"),
            }
        }
        assert_eq!(
            seen,
            vec![
                ("API".to_string(), "http://localhost:1".to_string()),
                ("default".to_string(), "http://localhost:2".to_string()),
                ("admin".to_string(), "http://localhost:3".to_string()),
            ]
        );
        assert_eq!(sink.lines().len(), 5);
    }

    #[tokio::test]
    async fn invalid_utf8_is_decoded_lossily() {
        let (scanner, sink) = scanner(LogLevel::Child);
        let stderr: &[u8] = b"INFO caf\xe9 loaded\r\n\
            Starting API server at: http://localhost:1\n\
            Starting module \"default\" running at: http://localhost:2\n\
            Starting admin server at: http://localhost:3";
        let (tx, mut rx) = mpsc::channel(16);

        scanner.spawn(stderr, tx).await.unwrap();

        let mut resolved = 0;
        while let Some(event) = rx.recv().await {
            match event {
                ScanEvent::Address { .. } => resolved += 1,
                ScanEvent::Closed => break,
                ScanEvent::ReadError(e) => panic!("unexpected read error: {e}"),
            }
        }
        assert_eq!(resolved, 3);
        assert_eq!(sink.lines()[0], "CHILD: INFO caf\u{fffd} loaded");
    }

    #[test]
    fn line_endings_are_trimmed() {
        assert_eq!(trim_line_ending(b"a\r\n"), b"a");
        assert_eq!(trim_line_ending(b"a\n"), b"a");
        assert_eq!(trim_line_ending(b"a"), b"a");
    }

    #[tokio::test]
    async fn keeps_draining_after_receiver_drops() {
        let (scanner, _) = scanner(LogLevel::Error);
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let stderr: &[u8] = b"Starting API server at: http://localhost:1\nmore\nlines\n";
        scanner.spawn(stderr, tx).await.unwrap();
    }
}
