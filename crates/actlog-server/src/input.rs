//! Line-oriented JSON input for the binary.
//!
//! Each non-blank line is either one `LogEntry` object or an array of them
//! (a batch submission).

use actlog_client::{IngestionBuffer, PipelineError, Result};
use actlog_core::LogEntry;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::warn;

#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    One(LogEntry),
    Batch(Vec<LogEntry>),
}

/// Parse one input line. `Ok(None)` for blank lines.
pub fn parse_line(line: &str) -> serde_json::Result<Option<Submission>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let value: Value = serde_json::from_str(line)?;
    let submission = match value {
        Value::Array(_) => Submission::Batch(serde_json::from_value(value)?),
        _ => Submission::One(serde_json::from_value(value)?),
    };
    Ok(Some(submission))
}

impl Submission {
    pub async fn submit(self, buffer: &IngestionBuffer) -> Result<Vec<String>> {
        match self {
            Submission::One(entry) => Ok(vec![buffer.submit(entry).await?]),
            Submission::Batch(entries) => buffer.submit_batch(entries).await,
        }
    }
}

/// Submit every line of `reader` until end of input, handing accepted ids
/// to `on_accepted`. Malformed lines are logged and skipped. Returns the
/// number of accepted records.
pub async fn pump_lines<R, F>(reader: R, buffer: &IngestionBuffer, mut on_accepted: F) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
    F: FnMut(&str),
{
    let mut lines = reader.lines();
    let mut accepted = 0;
    let mut line_no = 0usize;

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| PipelineError::Internal(format!("reading input: {}", e)))?
    {
        line_no += 1;
        let submission = match parse_line(&line) {
            Ok(Some(submission)) => submission,
            Ok(None) => continue,
            Err(e) => {
                warn!(line = line_no, error = %e, "Skipping malformed input line");
                continue;
            }
        };
        for id in submission.submit(buffer).await? {
            on_accepted(&id);
            accepted += 1;
        }
    }
    Ok(accepted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use actlog_broker::{BrokerClient, InMemoryBroker};
    use actlog_client::IngestionConfig;
    use actlog_core::Severity;
    use std::sync::Arc;

    #[test]
    fn test_parse_single_and_batch() {
        let one = parse_line(r#"{"service":"auth","action":"login","userId":"u1","severity":"warn"}"#)
            .unwrap()
            .unwrap();
        match one {
            Submission::One(entry) => {
                assert_eq!(entry.user_id.as_deref(), Some("u1"));
                assert_eq!(entry.severity, Severity::Warn);
            }
            other => panic!("expected single entry, got {:?}", other),
        }

        let batch = parse_line(r#"[{"service":"a","action":"x"},{"service":"b","action":"y"}]"#)
            .unwrap()
            .unwrap();
        assert!(matches!(batch, Submission::Batch(ref entries) if entries.len() == 2));

        assert_eq!(parse_line("   ").unwrap(), None);
        assert!(parse_line(r#"{"service":"a"}"#).is_err());
        assert!(parse_line("not json").is_err());
    }

    #[tokio::test]
    async fn test_pump_skips_bad_lines() {
        let broker = InMemoryBroker::new("logs", 1);
        let client: Arc<dyn BrokerClient> = Arc::new(broker.client("producer"));
        let buffer = IngestionBuffer::new(client, IngestionConfig::default()).unwrap();

        let input = concat!(
            "{\"service\":\"auth\",\"action\":\"login\"}\n",
            "garbage\n",
            "\n",
            "[{\"service\":\"a\",\"action\":\"x\"},{\"service\":\"b\",\"action\":\"y\"}]\n",
        );
        let mut ids = Vec::new();
        let accepted = pump_lines(input.as_bytes(), &buffer, |id| ids.push(id.to_string()))
            .await
            .unwrap();

        assert_eq!(accepted, 3);
        assert_eq!(ids.len(), 3);
        assert_eq!(buffer.pending().await, 3);
    }
}
