//! Replays payloads from a file (or stdin), one JSON payload per line.

use log::{info, warn};
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::mpsc::SyncSender;
use std::thread::{self, JoinHandle};

use crate::models::datapoint::{Datapoint, decode_payload};

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct ReplayStats {
    pub lines: usize,
    pub datapoints: usize,
    pub rejected: usize,
}

/// Reads `path` on a background thread. The sender is dropped at end of input,
/// which tells the control loop to finish.
pub fn spawn(path: PathBuf, sender: SyncSender<Datapoint>) -> Result<JoinHandle<()>, String> {
    let reader: Box<dyn BufRead + Send> = if path == Path::new("-") {
        info!("Reading datapoints from stdin");
        Box::new(BufReader::new(io::stdin()))
    } else {
        let file = File::open(&path).map_err(|e| format!("failed to open {}: {}", path.display(), e))?;
        info!("Reading datapoints from {}", path.display());
        Box::new(BufReader::new(file))
    };

    thread::Builder::new()
        .name("file-source".to_string())
        .spawn(move || match replay(reader, &sender) {
            Ok(stats) => info!(
                "End of input: {} line(s), {} datapoint(s), {} rejected",
                stats.lines, stats.datapoints, stats.rejected
            ),
            Err(e) => warn!("Reading input failed: {}", e),
        })
        .map_err(|e| format!("failed to start file reader thread: {}", e))
}

pub fn replay(reader: impl BufRead, sender: &SyncSender<Datapoint>) -> io::Result<ReplayStats> {
    let mut stats = ReplayStats::default();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        stats.lines += 1;
        match decode_payload(&line) {
            Ok(points) => {
                for dp in points {
                    if sender.send(dp).is_err() {
                        return Ok(stats);
                    }
                    stats.datapoints += 1;
                }
            }
            Err(e) => {
                warn!("Line {}: {}", index + 1, e);
                stats.rejected += 1;
            }
        }
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::mpsc;

    #[test]
    fn replays_lines_and_skips_bad_ones() {
        let input = concat!(
            r#"{"measurement":"power","timestamp":1000,"tags":{"id":"s1"},"fields":{"value":1}}"#,
            "\n\n",
            "garbage\n",
            r#"[{"measurement":"power","timestamp":2000,"tags":{"id":"s1"},"fields":{"value":2}},"#,
            r#"{"measurement":"power","timestamp":3000,"tags":{"id":"s2"},"fields":{"value":3}}]"#,
            "\n"
        );
        let (tx, rx) = mpsc::sync_channel(8);

        let stats = replay(Cursor::new(input), &tx).unwrap();
        assert_eq!(stats, ReplayStats { lines: 3, datapoints: 3, rejected: 1 });
        let values: Vec<f64> = rx.try_iter().map(|dp| dp.value).collect();
        assert_eq!(values, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn stops_when_receiver_dropped() {
        let input = r#"{"measurement":"power","timestamp":1000,"tags":{"id":"s1"},"fields":{"value":1}}"#;
        let (tx, rx) = mpsc::sync_channel(1);
        drop(rx);
        let stats = replay(Cursor::new(input), &tx).unwrap();
        assert_eq!(stats.datapoints, 0);
    }

    #[test]
    fn missing_file_is_an_error() {
        let (tx, _rx) = mpsc::sync_channel(1);
        assert!(spawn(PathBuf::from("/nonexistent/input.jsonl"), tx).is_err());
    }
}
