//! Arduino serial link.
//!
//! An Arduino with analog pH and turbidity probes prints one JSON object per
//! line, e.g. `{"ph": 7.02, "turbidity": 812.5}`. A background task keeps the
//! most recent reading; the collector only uses it while it is fresh.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ArduinoConfig;

const REOPEN_DELAY: Duration = Duration::from_secs(5);

/// One line from the Arduino.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct ArduinoReading {
    pub ph: f64,
    pub turbidity: f64,
}

/// Most recent reading, shared between the serial task and the collector.
#[derive(Debug, Clone, Default)]
pub struct ArduinoLatest {
    inner: Arc<Mutex<Option<(ArduinoReading, Instant)>>>,
}

impl ArduinoLatest {
    pub fn update(&self, reading: ArduinoReading) {
        *self.inner.lock() = Some((reading, Instant::now()));
    }

    /// The last reading, if it is younger than `max_age`.
    pub fn fresh(&self, max_age: Duration) -> Option<ArduinoReading> {
        match *self.inner.lock() {
            Some((reading, at)) if at.elapsed() <= max_age => Some(reading),
            _ => None,
        }
    }
}

/// Parse one serial line. Partial or garbled lines yield `None`.
pub fn parse_line(line: &str) -> Option<ArduinoReading> {
    let line = line.trim();
    if !(line.starts_with('{') && line.ends_with('}')) {
        return None;
    }
    serde_json::from_str(line).ok()
}

/// Feed readings from `reader` into `latest` until EOF or cancellation.
pub async fn read_lines<R>(
    reader: R,
    latest: &ArduinoLatest,
    cancel: &CancellationToken,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            line = lines.next_line() => match line? {
                Some(line) => match parse_line(&line) {
                    Some(reading) => latest.update(reading),
                    None => debug!("Ignoring Arduino line: {:?}", line),
                },
                None => return Ok(()),
            },
        }
    }
}

/// Keep the serial port open and feed `latest`, reopening after failures.
pub async fn run(config: ArduinoConfig, latest: ArduinoLatest, cancel: CancellationToken) {
    info!(
        "Reading Arduino sensors from {} at {} baud",
        config.port, config.baud_rate
    );

    while !cancel.is_cancelled() {
        let builder = tokio_serial::new(&config.port, config.baud_rate);
        match tokio_serial::SerialStream::open(&builder) {
            Ok(serial) => {
                if let Err(e) = read_lines(serial, &latest, &cancel).await {
                    warn!("Arduino serial read failed: {}", e);
                }
            }
            Err(e) => {
                warn!("Failed to open Arduino port '{}': {}", config.port, e);
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(REOPEN_DELAY) => {}
        }
    }

    debug!("Arduino reader stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line() {
        assert_eq!(
            parse_line("{\"ph\": 7.02, \"turbidity\": 812.5}\r\n"),
            Some(ArduinoReading {
                ph: 7.02,
                turbidity: 812.5
            })
        );
        assert_eq!(parse_line("\"ph\": 7.02}"), None);
        assert_eq!(parse_line("{\"ph\": 7.02}"), None);
        assert_eq!(parse_line("booting..."), None);
    }

    #[test]
    fn test_stale_reading_is_ignored() {
        let latest = ArduinoLatest::default();
        assert!(latest.fresh(Duration::from_secs(10)).is_none());

        latest.update(ArduinoReading {
            ph: 7.0,
            turbidity: 500.0,
        });
        assert!(latest.fresh(Duration::from_secs(10)).is_some());

        std::thread::sleep(Duration::from_millis(20));
        assert!(latest.fresh(Duration::from_millis(5)).is_none());
    }

    #[tokio::test]
    async fn test_read_lines_keeps_last_valid_reading() {
        let input: &[u8] = b"{\"ph\": 6.9, \"turbidity\": 700}\n\
            garbage\n\
            {\"ph\": 7.1, \"turbidity\": 710}\n\
            {\"ph\": 7.2\n";
        let latest = ArduinoLatest::default();

        read_lines(input, &latest, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            latest.fresh(Duration::from_secs(10)),
            Some(ArduinoReading {
                ph: 7.1,
                turbidity: 710.0
            })
        );
    }
}
