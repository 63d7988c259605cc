//! Topology: unit ids, spawn geometry, server discovery
//!
//! Unit ids are derived deterministically from the variant artifact path so
//! a names file can always be regenerated identically. Discovery walks a
//! port range per host and asks every reachable server for its planets and
//! live units.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tokio::net::TcpStream;

use super::protocol::{Request, Response};
use super::tcp::Connection;
use super::{Endpoint, Position, RuntimeError};

/// Derive a globally unique unit name for one spawn of an artifact.
///
/// The id is a pure function of its inputs: the same variant path,
/// generation and sequence always yield the same name.
pub fn generate_unit_id(
    artifact_path: &Path,
    namespace: &str,
    generation: u32,
    sequence: usize,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(namespace.as_bytes());
    hasher.update([0u8]);
    hasher.update(artifact_path.to_string_lossy().as_bytes());
    hasher.update([0u8]);
    hasher.update(generation.to_le_bytes());
    hasher.update((sequence as u64).to_le_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("unit-g{}-{}-{}", generation, sequence, &digest[..16])
}

/// `n` points evenly spread over a sphere of `radius` around `center`
/// (Fibonacci lattice)
pub fn sphere_points(n: usize, radius: f64, center: &Position) -> Vec<Position> {
    let golden_angle = std::f64::consts::PI * (3.0 - 5f64.sqrt());
    (0..n)
        .map(|i| {
            let y = 1.0 - 2.0 * (i as f64 + 0.5) / n as f64;
            let ring = (1.0 - y * y).max(0.0).sqrt();
            let theta = golden_angle * i as f64;
            center + Position::new(theta.cos() * ring, y, theta.sin() * ring) * radius
        })
        .collect()
}

/// Parse a planet location written as `(x,y,z)`
pub fn parse_planet(s: &str) -> Result<Position, String> {
    let inner = s
        .trim()
        .strip_prefix('(')
        .and_then(|r| r.strip_suffix(')'))
        .ok_or_else(|| format!("planet {:?} is not of the form (x,y,z)", s))?;
    let coords: Vec<f64> = inner
        .split(',')
        .map(|c| c.trim().parse::<f64>())
        .collect::<Result<_, _>>()
        .map_err(|e| format!("planet {:?}: {}", s, e))?;
    match coords.as_slice() {
        [x, y, z] => Ok(Position::new(*x, *y, *z)),
        _ => Err(format!("planet {:?} needs exactly three coordinates", s)),
    }
}

/// A planet seen during a scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanetInfo {
    pub name: String,
    pub position: [f64; 3],
    pub host: String,
    pub port: u16,
}

/// Result of scanning all configured servers
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TopologySnapshot {
    pub planets: Vec<PlanetInfo>,
    /// Live unit names per `host:port`
    pub units_by_host: BTreeMap<String, Vec<String>>,
}

impl TopologySnapshot {
    pub fn total_units(&self) -> usize {
        self.units_by_host.values().map(|u| u.len()).sum()
    }
}

/// How to walk the server fleet
#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub hosts: Vec<String>,
    pub start_port: u16,
    pub port_step: u16,
    pub pods: u16,
    pub auth_pass: String,
    pub delimiter: String,
    pub timeout: Duration,
}

/// Ask every server in the fleet for its planets and units.
/// Unreachable servers are skipped.
pub async fn scan(config: &ScanConfig) -> TopologySnapshot {
    let mut snapshot = TopologySnapshot::default();
    for host in &config.hosts {
        for pod in 0..config.pods {
            let Some(port) = pod
                .checked_mul(config.port_step)
                .and_then(|offset| config.start_port.checked_add(offset))
            else {
                warn!("Port range overflow scanning {} pod {}", host, pod);
                break;
            };
            let endpoint = Endpoint {
                address: format!("{}:{}", host, port),
                auth_pass: config.auth_pass.clone(),
                delimiter: config.delimiter.clone(),
                timeout: config.timeout,
            };
            match scan_server(&endpoint).await {
                Ok((planets, units)) => {
                    snapshot.planets.extend(planets.into_iter().map(|p| PlanetInfo {
                        name: p.name,
                        position: p.position,
                        host: host.clone(),
                        port,
                    }));
                    snapshot.units_by_host.insert(endpoint.address.clone(), units);
                }
                Err(e) => debug!("Skipping {}: {}", endpoint.address, e),
            }
        }
    }
    info!(
        "Scan found {} planets and {} units across {} servers",
        snapshot.planets.len(),
        snapshot.total_units(),
        snapshot.units_by_host.len()
    );
    snapshot
}

async fn scan_server(
    endpoint: &Endpoint,
) -> Result<(Vec<super::protocol::WirePlanet>, Vec<String>), RuntimeError> {
    let mut conn = Connection::open(endpoint).await?;
    let planets = match conn.request(&Request::ListPlanets).await? {
        Response::Planets { planets } => planets,
        other => return Err(conn.unexpected(other)),
    };
    let units = match conn.request(&Request::ListUnits).await? {
        Response::Units { mut names } => {
            names.sort();
            names
        }
        other => return Err(conn.unexpected(other)),
    };
    Ok((planets, units))
}

/// Dial `address` until it accepts a TCP connection, waiting `delay`
/// between attempts. Returns the attempt number that succeeded.
pub async fn probe_with_retries(
    address: &str,
    timeout: Duration,
    delay: Duration,
    attempts: u32,
) -> Result<u32, RuntimeError> {
    let mut last = None;
    for attempt in 1..=attempts {
        info!("Attempt {}: connecting to {}", attempt, address);
        match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
            Ok(Ok(_stream)) => {
                info!("Connected to {} on attempt {}", address, attempt);
                return Ok(attempt);
            }
            Ok(Err(e)) => {
                warn!("Attempt {} to reach {} failed: {}", attempt, address, e);
                last = Some(RuntimeError::Connect {
                    address: address.to_string(),
                    source: e,
                });
            }
            Err(_) => {
                warn!("Attempt {} to reach {} timed out", attempt, address);
                last = Some(RuntimeError::Timeout {
                    address: address.to_string(),
                    millis: timeout.as_millis() as u64,
                });
            }
        }
        if attempt < attempts {
            tokio::time::sleep(delay).await;
        }
    }
    Err(last.unwrap_or_else(|| RuntimeError::Protocol {
        address: address.to_string(),
        reason: "no probe attempts configured".to_string(),
    }))
}
