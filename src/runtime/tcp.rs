//! TCP runtime: drives units on a remote world server
//!
//! Each operation opens its own authenticated connection, except `pulse`
//! which keeps one connection for the whole evaluation window. Unit
//! policies run locally; the server only receives movement deltas.

use log::{debug, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{self, Instant};

use super::protocol::{encode_frame, FrameReader, Request, Response};
use super::{tick_count, unit_step, AgentRuntime, Endpoint, Position, RuntimeError, SpawnRequest};
use crate::model::PolicyNetwork;

/// An authenticated connection to one world server
pub struct Connection {
    stream: TcpStream,
    reader: FrameReader,
    address: String,
    delimiter: String,
    timeout: Duration,
}

impl Connection {
    pub async fn open(endpoint: &Endpoint) -> Result<Self, RuntimeError> {
        let millis = endpoint.timeout.as_millis() as u64;
        let stream = time::timeout(endpoint.timeout, TcpStream::connect(&endpoint.address))
            .await
            .map_err(|_| RuntimeError::Timeout {
                address: endpoint.address.clone(),
                millis,
            })?
            .map_err(|source| RuntimeError::Connect {
                address: endpoint.address.clone(),
                source,
            })?;

        let mut conn = Self {
            stream,
            reader: FrameReader::new(&endpoint.delimiter),
            address: endpoint.address.clone(),
            delimiter: endpoint.delimiter.clone(),
            timeout: endpoint.timeout,
        };
        let reply = conn
            .request(&Request::Auth {
                pass: endpoint.auth_pass.clone(),
            })
            .await?;
        conn.expect_ok(reply)?;
        Ok(conn)
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Send one request and wait for its reply
    pub async fn request(&mut self, request: &Request) -> Result<Response, RuntimeError> {
        let millis = self.timeout.as_millis() as u64;
        let frame = encode_frame(request, &self.delimiter).map_err(|source| RuntimeError::Json {
            address: self.address.clone(),
            source,
        })?;

        time::timeout(self.timeout, self.stream.write_all(&frame))
            .await
            .map_err(|_| RuntimeError::Timeout {
                address: self.address.clone(),
                millis,
            })?
            .map_err(|source| RuntimeError::Io {
                address: self.address.clone(),
                source,
            })?;

        let bytes = time::timeout(self.timeout, self.reader.read_frame(&mut self.stream))
            .await
            .map_err(|_| RuntimeError::Timeout {
                address: self.address.clone(),
                millis,
            })?
            .map_err(|source| RuntimeError::Io {
                address: self.address.clone(),
                source,
            })?
            .ok_or_else(|| RuntimeError::Protocol {
                address: self.address.clone(),
                reason: "connection closed before reply".to_string(),
            })?;

        serde_json::from_slice(&bytes).map_err(|source| RuntimeError::Json {
            address: self.address.clone(),
            source,
        })
    }

    /// Map a reply that should be a bare acknowledgement
    pub fn expect_ok(&self, reply: Response) -> Result<(), RuntimeError> {
        match reply {
            Response::Ok => Ok(()),
            other => Err(self.unexpected(other)),
        }
    }

    pub fn unexpected(&self, reply: Response) -> RuntimeError {
        match reply {
            Response::Error { message } => RuntimeError::Rejected {
                address: self.address.clone(),
                reason: message,
            },
            other => RuntimeError::Protocol {
                address: self.address.clone(),
                reason: format!("unexpected reply {:?}", other),
            },
        }
    }
}

#[derive(Debug, Clone)]
struct TrackedUnit {
    session: String,
    model: Arc<PolicyNetwork>,
    origin: Position,
    position: Position,
    clamp: f64,
}

/// `AgentRuntime` backed by a remote world server
pub struct TcpRuntime {
    endpoint: Endpoint,
    units: Mutex<HashMap<String, TrackedUnit>>,
}

impl TcpRuntime {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            units: Mutex::new(HashMap::new()),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Number of units this client believes are alive
    pub async fn tracked_units(&self) -> usize {
        self.units.lock().await.len()
    }
}

impl AgentRuntime for TcpRuntime {
    fn address(&self) -> &str {
        &self.endpoint.address
    }

    async fn spawn(&self, request: SpawnRequest) -> Result<(), RuntimeError> {
        let mut conn = Connection::open(&self.endpoint).await?;
        let p = request.position;
        let reply = conn
            .request(&Request::Spawn {
                session: request.session.clone(),
                name: request.name.clone(),
                position: [p.x, p.y, p.z],
            })
            .await?;
        conn.expect_ok(reply)?;

        self.units.lock().await.insert(
            request.name,
            TrackedUnit {
                session: request.session,
                model: request.model,
                origin: p,
                position: p,
                clamp: request.clamp,
            },
        );
        Ok(())
    }

    async fn unfreeze_all(&self, session: &str) -> Result<(), RuntimeError> {
        let mut conn = Connection::open(&self.endpoint).await?;
        let reply = conn
            .request(&Request::UnfreezeAll {
                session: session.to_string(),
            })
            .await?;
        conn.expect_ok(reply)
    }

    async fn pulse(
        &self,
        session: &str,
        tick_rate_hz: u32,
        duration: Duration,
    ) -> Result<u64, RuntimeError> {
        let deadline = Instant::now() + duration;
        let max_ticks = tick_count(tick_rate_hz, duration);
        if max_ticks == 0 {
            time::sleep_until(deadline).await;
            return Ok(0);
        }

        let mut batch: Vec<(String, TrackedUnit)> = self
            .units
            .lock()
            .await
            .iter()
            .filter(|(_, u)| u.session == session)
            .map(|(name, u)| (name.clone(), u.clone()))
            .collect();
        batch.sort_by(|a, b| a.0.cmp(&b.0));

        let mut conn = Connection::open(&self.endpoint).await?;
        let mut interval = time::interval(Duration::from_secs_f64(1.0 / tick_rate_hz as f64));
        let mut ticks = 0u64;

        while ticks < max_ticks {
            interval.tick().await;
            if Instant::now() > deadline {
                break;
            }
            for (name, unit) in batch.iter_mut() {
                let delta = unit_step(&unit.model, &unit.origin, &unit.position, unit.clamp);
                match conn
                    .request(&Request::Move {
                        name: name.clone(),
                        delta: [delta.x, delta.y, delta.z],
                    })
                    .await?
                {
                    Response::Ok => unit.position += delta,
                    Response::Error { message } => debug!(
                        "Move rejected for {} on {}: {}",
                        name, self.endpoint.address, message
                    ),
                    other => warn!("Unexpected move reply for {}: {:?}", name, other),
                }
            }
            ticks += 1;
        }
        time::sleep_until(deadline).await;

        // keep local estimates for the next tick window
        let mut units = self.units.lock().await;
        for (name, unit) in batch {
            if let Some(tracked) = units.get_mut(&name) {
                tracked.position = unit.position;
            }
        }
        Ok(ticks)
    }

    async fn refresh_position(&self, unit: &str) -> Result<Position, RuntimeError> {
        let mut conn = Connection::open(&self.endpoint).await?;
        let reply = conn
            .request(&Request::GetPosition {
                name: unit.to_string(),
            })
            .await?;
        match reply {
            Response::Position { position, .. } => {
                let pos = Position::new(position[0], position[1], position[2]);
                if let Some(tracked) = self.units.lock().await.get_mut(unit) {
                    tracked.position = pos;
                }
                Ok(pos)
            }
            Response::Error { .. } => Err(RuntimeError::UnknownUnit {
                address: self.endpoint.address.clone(),
                unit: unit.to_string(),
            }),
            other => Err(conn.unexpected(other)),
        }
    }

    async fn despawn(&self, unit: &str) -> Result<(), RuntimeError> {
        let mut conn = Connection::open(&self.endpoint).await?;
        let reply = conn
            .request(&Request::Despawn {
                name: unit.to_string(),
            })
            .await?;
        conn.expect_ok(reply)?;
        self.units.lock().await.remove(unit);
        Ok(())
    }

    async fn destroy_all(&self, session: &str) -> Result<usize, RuntimeError> {
        let mut conn = Connection::open(&self.endpoint).await?;
        let reply = conn
            .request(&Request::DestroyAll {
                session: session.to_string(),
            })
            .await?;
        let count = match reply {
            Response::Destroyed { count } => count,
            other => return Err(conn.unexpected(other)),
        };
        self.units.lock().await.retain(|_, u| u.session != session);
        Ok(count)
    }
}

/// In-process stand-in for a world server, for tests
#[cfg(test)]
pub(crate) mod fake {
    use super::super::protocol::{encode_frame, FrameReader, Request, Response, WirePlanet};
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};

    pub const DELIM: &str = "<???DONE???---";
    pub const PASS: &str = "my_secure_password";

    #[derive(Default)]
    pub struct FakeWorld {
        pub units: HashMap<String, (String, [f64; 3])>,
        pub moves: usize,
        pub unfreezes: usize,
    }

    pub async fn start(planets: Vec<WirePlanet>) -> (String, Arc<Mutex<FakeWorld>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let world = Arc::new(Mutex::new(FakeWorld::default()));
        let shared = world.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let world = shared.clone();
                let planets = planets.clone();
                tokio::spawn(async move { serve(stream, world, planets).await });
            }
        });
        (address, world)
    }

    async fn serve(mut stream: TcpStream, world: Arc<Mutex<FakeWorld>>, planets: Vec<WirePlanet>) {
        let mut reader = FrameReader::new(DELIM);
        let mut authed = false;
        while let Ok(Some(frame)) = reader.read_frame(&mut stream).await {
            let Ok(request) = serde_json::from_slice::<Request>(&frame) else {
                return;
            };
            let reply = if !authed {
                match request {
                    Request::Auth { pass } if pass == PASS => {
                        authed = true;
                        Response::Ok
                    }
                    _ => Response::Error {
                        message: "unauthorized".into(),
                    },
                }
            } else {
                handle(request, &world, &planets)
            };
            let bytes = encode_frame(&reply, DELIM).unwrap();
            if stream.write_all(&bytes).await.is_err() || !authed {
                return;
            }
        }
    }

    fn handle(request: Request, world: &Mutex<FakeWorld>, planets: &[WirePlanet]) -> Response {
        let mut w = world.lock().unwrap();
        match request {
            Request::Auth { .. } => Response::Ok,
            Request::Spawn { session, name, position } => {
                w.units.insert(name, (session, position));
                Response::Ok
            }
            Request::UnfreezeAll { .. } => {
                w.unfreezes += 1;
                Response::Ok
            }
            Request::Move { name, delta } => {
                w.moves += 1;
                match w.units.get_mut(&name) {
                    Some((_, pos)) => {
                        for axis in 0..3 {
                            pos[axis] += delta[axis];
                        }
                        Response::Ok
                    }
                    None => Response::Error {
                        message: "no such unit".into(),
                    },
                }
            }
            Request::GetPosition { name } => match w.units.get(&name) {
                Some((_, pos)) => Response::Position { name, position: *pos },
                None => Response::Error {
                    message: "no such unit".into(),
                },
            },
            Request::Despawn { name } => {
                w.units.remove(&name);
                Response::Ok
            }
            Request::DestroyAll { session } => {
                let before = w.units.len();
                w.units.retain(|_, (s, _)| *s != session);
                Response::Destroyed {
                    count: before - w.units.len(),
                }
            }
            Request::ListPlanets => Response::Planets {
                planets: planets.to_vec(),
            },
            Request::ListUnits => Response::Units {
                names: w.units.keys().cloned().collect(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Activation, ExperimentMode, NumericType};

    fn endpoint(address: &str, pass: &str) -> Endpoint {
        Endpoint {
            address: address.to_string(),
            auth_pass: pass.to_string(),
            delimiter: fake::DELIM.to_string(),
            timeout: Duration::from_secs(2),
        }
    }

    fn model() -> Arc<PolicyNetwork> {
        Arc::new(PolicyNetwork::random(
            NumericType::Float32,
            ExperimentMode::Standard,
            &[6, 8, 3],
            &[Activation::Linear, Activation::Relu, Activation::Tanh],
            5,
        ))
    }

    #[tokio::test]
    async fn test_spawn_pulse_refresh_destroy() {
        let (address, world) = fake::start(Vec::new()).await;
        let runtime = TcpRuntime::new(endpoint(&address, fake::PASS));

        for i in 0..2 {
            runtime
                .spawn(SpawnRequest {
                    session: "float32_Standard".into(),
                    name: format!("unit-{}", i),
                    model: model(),
                    position: Position::new(i as f64, 0.0, 0.0),
                    clamp: 20.0,
                })
                .await
                .unwrap();
        }
        runtime.unfreeze_all("float32_Standard").await.unwrap();
        let ticks = runtime
            .pulse("float32_Standard", 20, Duration::from_millis(200))
            .await
            .unwrap();
        assert!(ticks > 0 && ticks <= 4);
        assert_eq!(world.lock().unwrap().moves as u64, ticks * 2);

        let pos = runtime.refresh_position("unit-0").await.unwrap();
        let server_pos = world.lock().unwrap().units["unit-0"].1;
        assert_eq!(pos, Position::new(server_pos[0], server_pos[1], server_pos[2]));

        assert_eq!(runtime.destroy_all("float32_Standard").await.unwrap(), 2);
        assert_eq!(runtime.tracked_units().await, 0);
        assert!(world.lock().unwrap().units.is_empty());
    }

    #[tokio::test]
    async fn test_bad_password_is_rejected() {
        let (address, _world) = fake::start(Vec::new()).await;
        let runtime = TcpRuntime::new(endpoint(&address, "wrong"));
        let err = runtime.unfreeze_all("s").await.unwrap_err();
        assert!(matches!(err, RuntimeError::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_unknown_unit_refresh() {
        let (address, _world) = fake::start(Vec::new()).await;
        let runtime = TcpRuntime::new(endpoint(&address, fake::PASS));
        let err = runtime.refresh_position("ghost").await.unwrap_err();
        assert!(matches!(err, RuntimeError::UnknownUnit { .. }));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // bind then drop to get a port nothing listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);
        let runtime = TcpRuntime::new(endpoint(&address, fake::PASS));
        let err = runtime.despawn("u").await.unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::Connect { .. } | RuntimeError::Timeout { .. }
        ));
    }
}
