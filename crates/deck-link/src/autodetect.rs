use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::AsyncReadExt;
use tokio::time::Instant;
use tokio_serial::SerialPortBuilderExt;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub dev: String,
    pub baud: u32,
    pub hb_seen: bool,
    pub elapsed_ms: u64,
    pub note: String,
}

#[derive(Debug, Clone)]
pub struct AutodetectResult {
    pub chosen: Option<(String, u32)>,
    pub probes: Vec<ProbeResult>,
}

pub fn default_candidate_devs() -> Vec<String> {
    vec![
        "/dev/ttyACM0".into(),
        "/dev/ttyACM1".into(),
        "/dev/ttyUSB0".into(),
        "/dev/ttyUSB1".into(),
        "/dev/serial0".into(),
        "/dev/ttyAMA0".into(),
    ]
}

pub fn default_candidate_bauds() -> Vec<u32> {
    vec![57600, 115200, 921600]
}

/// Tries every dev/baud pair and stops at the first one carrying a MAVLink HEARTBEAT.
pub async fn autodetect_serial(devs: &[String], bauds: &[u32], heartbeat_timeout: Duration) -> AutodetectResult {
    let mut probes = Vec::new();

    for dev in devs {
        for &baud in bauds {
            let start = Instant::now();
            let (hb_seen, note) = match probe(dev, baud, heartbeat_timeout).await {
                Ok(true) => (true, "heartbeat".to_string()),
                Ok(false) => (false, "no heartbeat".to_string()),
                Err(e) => {
                    warn!("serial autodetect: probe failed dev={} baud={} err={:#}", dev, baud, e);
                    (false, format!("open failed: {:#}", e))
                }
            };
            probes.push(ProbeResult {
                dev: dev.clone(),
                baud,
                hb_seen,
                elapsed_ms: start.elapsed().as_millis() as u64,
                note,
            });
            if hb_seen {
                info!("serial autodetect: OK {} @ {}", dev, baud);
                return AutodetectResult { chosen: Some((dev.clone(), baud)), probes };
            }
        }
    }

    AutodetectResult { chosen: None, probes }
}

async fn probe(dev: &str, baud: u32, timeout: Duration) -> Result<bool> {
    let mut port = tokio_serial::new(dev, baud)
        .open_native_async()
        .with_context(|| format!("open serial device {}", dev))?;

    let deadline = Instant::now() + timeout;
    let mut buf: Vec<u8> = Vec::with_capacity(1024);
    let mut chunk = [0u8; 256];
    loop {
        let n = match tokio::time::timeout_at(deadline, port.read(&mut chunk)).await {
            Ok(r) => r.with_context(|| format!("read {}", dev))?,
            Err(_) => return Ok(false),
        };
        if n == 0 { return Ok(false); }
        buf.extend_from_slice(&chunk[..n]);
        if contains_heartbeat(&buf) { return Ok(true); }
        if buf.len() > 4096 {
            buf.drain(..buf.len() - 16);
        }
    }
}

/// Looks for a HEARTBEAT frame header (msg id 0, 9 byte payload), v1 or v2.
/// The checksum is not verified; a wrong baud rate produces noise that
/// practically never lines up with both the length and the id.
fn contains_heartbeat(buf: &[u8]) -> bool {
    for i in 0..buf.len() {
        match buf[i] {
            0xFD if i + 10 <= buf.len() => {
                if buf[i + 1] == 9 && buf[i + 7..i + 10] == [0, 0, 0] { return true; }
            }
            0xFE if i + 6 <= buf.len() => {
                if buf[i + 1] == 9 && buf[i + 5] == 0 { return true; }
            }
            _ => {}
        }
    }
    false
}
