use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use deck_core::{ControlConfig, Coordinator, CoordinatorConfig, CoordinatorHandle, FlightConfig, FlightState};
use deck_link::autodetect::{autodetect_serial, default_candidate_bauds, default_candidate_devs};
use deck_link::{open_link, LinkConfig, LinkKind};
use deck_proto::telemetry::VehicleState;

#[derive(Debug, Parser)]
#[command(name = "deck", version, about = "skydeck - manual multirotor flight from the console")]
struct Cli {
    #[arg(long, default_value = "deck.toml")]
    config: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Check the config without opening the link.
    Doctor,
    /// Connect and fly: verbs on stdin, status on stdout.
    Fly,
    /// Probe serial ports/bauds for MAVLink heartbeats.
    Probe,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct Config {
    link: LinkConfig,
    flight: FlightConfig,
    control: ControlConfig,
    display: DisplayCfg,
}

#[derive(Debug, Default, serde::Deserialize)]
struct DisplayCfg {
    poll_hz: Option<f32>,
}

impl Config {
    fn coordinator(&self) -> CoordinatorConfig {
        CoordinatorConfig { flight: self.flight.clone(), control: self.control.clone() }
    }

    fn poll_period(&self) -> Duration {
        let hz = self.display.poll_hz.unwrap_or(10.0).clamp(0.5, 60.0);
        Duration::from_millis((1000.0 / hz) as u64)
    }
}

fn load_config(path: &str) -> Result<Config> {
    let s = std::fs::read_to_string(path).with_context(|| format!("read config {}", path))?;
    toml::from_str(&s).context("parse config toml")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;

    match cli.cmd {
        Command::Doctor => doctor(&cfg)?,
        Command::Fly => fly(&cfg).await?,
        Command::Probe => probe(&cfg).await?,
    }
    Ok(())
}

fn doctor(cfg: &Config) -> Result<()> {
    info!("doctor: starting");
    cfg.link.check().context("[link]")?;
    cfg.coordinator().check().context("[flight]/[control]")?;
    if let Some(hz) = cfg.display.poll_hz {
        anyhow::ensure!(hz > 0.0, "display.poll_hz must be > 0");
    }
    match cfg.link.kind {
        LinkKind::Sim => info!("doctor: simulated vehicle, nothing will fly"),
        LinkKind::Mavlink if cfg.link.address.trim() == "serial:auto" => {
            info!("doctor: serial autodetect enabled (OK)")
        }
        LinkKind::Mavlink => info!("doctor: mavlink at {}", cfg.link.address),
    }
    info!("doctor: OK");
    Ok(())
}

async fn probe(cfg: &Config) -> Result<()> {
    let devs = cfg.link.candidate_devs.clone().unwrap_or_else(default_candidate_devs);
    let bauds = cfg.link.candidate_bauds.clone().unwrap_or_else(default_candidate_bauds);
    let timeout = Duration::from_millis(cfg.link.heartbeat_timeout_ms.unwrap_or(3000));

    let res = autodetect_serial(&devs, &bauds, timeout).await;
    match &res.chosen {
        Some((dev, baud)) => println!("CHOSEN: {} @ {}", dev, baud),
        None => println!("CHOSEN: none"),
    }
    for p in &res.probes {
        println!("probe dev={} baud={} hb={} {}ms note={}", p.dev, p.baud, p.hb_seen, p.elapsed_ms, p.note);
    }
    Ok(())
}

async fn fly(cfg: &Config) -> Result<()> {
    let coord = Coordinator::spawn(open_link(&cfg.link), cfg.coordinator());
    let deck = coord.handle();

    if let Err(e) = deck.connect(&cfg.link.address).await {
        coord.shutdown().await;
        return Err(e).context("connect");
    }
    print_help();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut poll = tokio::time::interval(cfg.poll_period());
    let mut shown = String::new();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            line = lines.next_line() => match line.context("read stdin")? {
                Some(l) => {
                    if !run_verb(&deck, &l).await {
                        break;
                    }
                }
                None => break,
            },
            _ = poll.tick() => {
                let line = status_line(&deck.state(), deck.flight_state());
                if line != shown {
                    println!("{}", line);
                    shown = line;
                }
            }
        }
    }

    info!("fly: shutting down");
    coord.shutdown().await;
    Ok(())
}

/// Runs one console verb. False when the operator asked to quit.
async fn run_verb(deck: &CoordinatorHandle, line: &str) -> bool {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else { return true };

    let result = match verb {
        "arm" => deck.arm().await,
        "disarm" => deck.disarm().await,
        "land" => deck.land().await,
        "override" => deck.override_airborne().await,
        "takeoff" => {
            // waits out the grace period; keep the console responsive meanwhile
            let h = deck.clone();
            tokio::spawn(async move {
                match h.takeoff().await {
                    Ok(true) => println!("takeoff: airborne"),
                    Ok(false) => println!("takeoff: not airborne after grace period (see `override`)"),
                    Err(e) => println!("takeoff: {}", e),
                }
            });
            Ok(())
        }
        "sticks" | "s" => {
            let Some([t, y, p, r]) = parse_sticks(words) else {
                println!("usage: sticks <throttle> <yaw> <pitch> <roll>   (each -1..1)");
                return true;
            };
            let stored = deck.update_controls(t, y, p, r);
            println!(
                "sticks: throttle {:.2} yaw {:.2} pitch {:.2} roll {:.2}",
                stored.throttle, stored.yaw, stored.pitch, stored.roll
            );
            Ok(())
        }
        "reset" => {
            deck.reset_controls();
            Ok(())
        }
        "probe" => {
            let a = deck.probe_attitude();
            println!("attitude: roll {:.1} pitch {:.1} yaw {:.1} deg", a.roll_deg, a.pitch_deg, a.yaw_deg);
            Ok(())
        }
        "status" => {
            print_status(&deck.state(), deck.flight_state());
            Ok(())
        }
        "help" | "?" => {
            print_help();
            Ok(())
        }
        "quit" | "exit" | "q" => return false,
        other => {
            println!("unknown command: {} (try `help`)", other);
            Ok(())
        }
    };
    if let Err(e) = result {
        warn!("fly: {} failed: {}", verb, e);
        println!("{}: {}", verb, e);
    }
    true
}

fn parse_sticks<'a>(words: impl Iterator<Item = &'a str>) -> Option<[f32; 4]> {
    let v: Vec<f32> = words.map(|w| w.parse().ok()).collect::<Option<_>>()?;
    v.try_into().ok()
}

fn print_help() {
    println!("commands: arm | disarm | takeoff | land | sticks <t> <y> <p> <r> | reset | override | probe | status | quit");
}

fn status_line(s: &VehicleState, flight: FlightState) -> String {
    format!(
        "{}{} | {} | alt {:.1} m | bat {:.0}% | {} ({} sats) | sticks {}",
        if s.connected { "" } else { "LINK LOST | " },
        flight.label(),
        if s.armed { "ARMED" } else { "disarmed" },
        s.position.relative_altitude_m,
        s.battery_percent,
        s.gps_fix.name(),
        s.satellites,
        if flight == FlightState::AirborneOffboard { "live" } else { "inactive" },
    )
}

fn print_status(s: &VehicleState, flight: FlightState) {
    let now_ms = (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64;
    println!("connected={} armed={} in_air={} flight={:?}", s.connected, s.armed, s.in_air, flight);
    println!(
        "position lat={:.7} lon={:.7} rel_alt={:.2} m",
        s.position.latitude_deg, s.position.longitude_deg, s.position.relative_altitude_m
    );
    println!(
        "attitude roll={:.1} pitch={:.1} yaw={:.1} deg",
        s.attitude.roll_deg, s.attitude.pitch_deg, s.attitude.yaw_deg
    );
    println!("battery={:.0}% gps={} ({:?}) sats={}", s.battery_percent, s.gps_fix.name(), s.gps_fix.quality(), s.satellites);
    if s.updated_at_ms > 0 {
        println!("last_update_age={}ms", now_ms - s.updated_at_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_config_parses_and_passes_doctor() {
        let cfg: Config = toml::from_str(include_str!("../../../deck.toml")).unwrap();
        assert_eq!(cfg.link.kind, LinkKind::Sim);
        assert_eq!(cfg.poll_period(), Duration::from_millis(100));
        doctor(&cfg).unwrap();
    }

    #[test]
    fn empty_config_falls_back_to_sim() {
        let cfg: Config = toml::from_str("").unwrap();
        assert_eq!(cfg.link.kind, LinkKind::Sim);
        assert_eq!(cfg.coordinator().flight.takeoff_altitude_m(), 5.0);
    }

    #[test]
    fn sticks_need_four_numbers() {
        assert_eq!(parse_sticks("1 0 -0.5 0.25".split_whitespace()), Some([1.0, 0.0, -0.5, 0.25]));
        assert_eq!(parse_sticks("1 0 0".split_whitespace()), None);
        assert_eq!(parse_sticks("1 0 x 0".split_whitespace()), None);
    }

    #[test]
    fn status_line_flags_lost_link() {
        let mut s = VehicleState::default();
        assert!(status_line(&s, FlightState::Ground).starts_with("LINK LOST | On Ground"));
        s.connected = true;
        s.armed = true;
        let line = status_line(&s, FlightState::AirborneOffboard);
        assert!(line.starts_with("In Flight | ARMED"));
        assert!(line.ends_with("sticks live"));
    }
}
