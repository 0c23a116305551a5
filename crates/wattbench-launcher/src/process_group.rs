use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info};
use wattbench_core::{Collective, Result, WattBenchError};

const ARRIVE: u8 = 0x1;
const RELEASE: u8 = 0x2;
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(50);

enum Peers {
    /// Rank 0: one stream per follower, indexed by rank - 1.
    Leader(Mutex<Vec<TcpStream>>),
    Follower(Mutex<TcpStream>),
    Solo,
}

/// Centralized TCP barrier implementing the [`Collective`] seam.
///
/// Rank 0 binds the rendezvous address and accepts `world_size - 1`
/// peers; followers connect with bounded retry and identify themselves
/// with a rank handshake. A barrier round is one arrive byte from every
/// follower followed by one release byte to every follower. Connections
/// stay open for the lifetime of the group; barriers block without
/// timeout, so a hung rank hangs the whole benchmark.
pub struct ProcessGroup {
    rank: usize,
    world_size: usize,
    peers: Peers,
}

impl ProcessGroup {
    pub fn init(rank: usize, world_size: usize, addr: &str, timeout: Duration) -> Result<Self> {
        if world_size == 0 {
            return Err(WattBenchError::Config("world size must be at least 1".to_string()));
        }
        if rank >= world_size {
            return Err(WattBenchError::Config(format!(
                "rank {rank} is out of range for world size {world_size}"
            )));
        }
        if world_size == 1 {
            debug!("Single-rank process group, barriers are no-ops");
            return Ok(Self {
                rank,
                world_size,
                peers: Peers::Solo,
            });
        }

        let deadline = Instant::now() + timeout;
        let peers = if rank == 0 {
            Peers::Leader(Mutex::new(Self::accept_followers(addr, world_size, deadline)?))
        } else {
            Peers::Follower(Mutex::new(Self::connect_to_leader(addr, rank, deadline)?))
        };

        info!("Process group initialized for rank {rank}/{world_size}");
        Ok(Self {
            rank,
            world_size,
            peers,
        })
    }

    /// Reads `RANK`, `WORLD_SIZE`, `MASTER_ADDR` and `MASTER_PORT`, the
    /// convention the rank fan-out populates.
    pub fn init_from_env(timeout: Duration) -> Result<Self> {
        let rank = env_parse("RANK", 0usize)?;
        let world_size = env_parse("WORLD_SIZE", 1usize)?;
        let addr = std::env::var("MASTER_ADDR").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env_parse("MASTER_PORT", 29500u16)?;
        Self::init(rank, world_size, &format!("{addr}:{port}"), timeout)
    }

    fn accept_followers(
        addr: &str,
        world_size: usize,
        deadline: Instant,
    ) -> Result<Vec<TcpStream>> {
        let listener = TcpListener::bind(addr).map_err(|e| {
            WattBenchError::Collective(format!("rank 0 could not bind {addr}: {e}"))
        })?;
        listener
            .set_nonblocking(true)
            .map_err(|e| WattBenchError::Collective(format!("rendezvous listener: {e}")))?;

        let mut slots: Vec<Option<TcpStream>> = (1..world_size).map(|_| None).collect();
        let mut connected = 0;
        while connected < world_size - 1 {
            if Instant::now() >= deadline {
                return Err(WattBenchError::Collective(format!(
                    "rendezvous timed out with {connected}/{} followers connected",
                    world_size - 1
                )));
            }
            match listener.accept() {
                Ok((mut stream, peer)) => {
                    let remaining = deadline
                        .saturating_duration_since(Instant::now())
                        .max(Duration::from_millis(1));
                    stream
                        .set_read_timeout(Some(remaining))
                        .map_err(|e| WattBenchError::Collective(e.to_string()))?;
                    let mut handshake = [0u8; 4];
                    stream
                        .read_exact(&mut handshake)
                        .map_err(|e| WattBenchError::Collective(format!("rank handshake: {e}")))?;
                    let peer_rank = u32::from_be_bytes(handshake) as usize;
                    if peer_rank == 0 || peer_rank >= world_size {
                        return Err(WattBenchError::Collective(format!(
                            "unexpected rank {peer_rank} in handshake from {peer}"
                        )));
                    }
                    if slots[peer_rank - 1].is_some() {
                        return Err(WattBenchError::Collective(format!(
                            "rank {peer_rank} connected twice"
                        )));
                    }
                    configure_stream(&stream)?;
                    debug!("Rank {peer_rank} joined the process group from {peer}");
                    slots[peer_rank - 1] = Some(stream);
                    connected += 1;
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(CONNECT_RETRY_INTERVAL);
                }
                Err(e) => {
                    return Err(WattBenchError::Collective(format!("rendezvous accept: {e}")));
                }
            }
        }

        let mut streams = Vec::with_capacity(world_size - 1);
        for slot in slots {
            match slot {
                Some(stream) => streams.push(stream),
                None => {
                    return Err(WattBenchError::Collective(
                        "rendezvous finished with a missing rank".to_string(),
                    ));
                }
            }
        }
        Ok(streams)
    }

    fn connect_to_leader(addr: &str, rank: usize, deadline: Instant) -> Result<TcpStream> {
        loop {
            match TcpStream::connect(addr) {
                Ok(mut stream) => {
                    stream
                        .write_all(&(rank as u32).to_be_bytes())
                        .map_err(|e| WattBenchError::Collective(format!("rank handshake: {e}")))?;
                    configure_stream(&stream)?;
                    return Ok(stream);
                }
                Err(_) if Instant::now() < deadline => {
                    // rank 0 may not be listening yet
                    thread::sleep(CONNECT_RETRY_INTERVAL);
                }
                Err(e) => {
                    return Err(WattBenchError::Collective(format!(
                        "rank {rank} could not reach the rendezvous at {addr}: {e}"
                    )));
                }
            }
        }
    }
}

/// Barriers block indefinitely once the group is formed; only the
/// rendezvous itself is bounded by the timeout.
fn configure_stream(stream: &TcpStream) -> Result<()> {
    stream
        .set_nodelay(true)
        .and_then(|_| stream.set_read_timeout(None))
        .map_err(|e| WattBenchError::Collective(e.to_string()))
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw.parse().map_err(|_| {
            WattBenchError::Config(format!("invalid value for {name}: {raw}"))
        }),
        Err(_) => Ok(default),
    }
}

impl Collective for ProcessGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn barrier(&self) -> Result<()> {
        match &self.peers {
            Peers::Solo => Ok(()),
            Peers::Leader(streams) => {
                let mut streams = streams
                    .lock()
                    .map_err(|_| WattBenchError::Collective("barrier state poisoned".to_string()))?;
                let mut arrive = [0u8; 1];
                for stream in streams.iter_mut() {
                    stream
                        .read_exact(&mut arrive)
                        .map_err(|e| WattBenchError::Collective(format!("barrier arrive: {e}")))?;
                }
                for stream in streams.iter_mut() {
                    stream
                        .write_all(&[RELEASE])
                        .map_err(|e| WattBenchError::Collective(format!("barrier release: {e}")))?;
                }
                Ok(())
            }
            Peers::Follower(stream) => {
                let mut stream = stream
                    .lock()
                    .map_err(|_| WattBenchError::Collective("barrier state poisoned".to_string()))?;
                stream
                    .write_all(&[ARRIVE])
                    .map_err(|e| WattBenchError::Collective(format!("barrier arrive: {e}")))?;
                let mut release = [0u8; 1];
                stream
                    .read_exact(&mut release)
                    .map_err(|e| WattBenchError::Collective(format!("barrier release: {e}")))?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn free_local_addr() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        addr
    }

    #[test]
    fn solo_group_barriers_are_noops() {
        let group = ProcessGroup::init(0, 1, "127.0.0.1:0", Duration::from_secs(1)).unwrap();
        assert_eq!(group.rank(), 0);
        assert_eq!(group.world_size(), 1);
        group.barrier().unwrap();
        group.barrier().unwrap();
    }

    #[test]
    fn out_of_range_rank_is_rejected() {
        assert!(ProcessGroup::init(2, 2, "127.0.0.1:0", Duration::from_secs(1)).is_err());
    }

    #[test]
    fn three_ranks_synchronize_over_tcp() {
        let addr = free_local_addr();
        let world_size = 3;
        let arrivals = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for rank in 0..world_size {
            let addr = addr.clone();
            let arrivals = Arc::clone(&arrivals);
            handles.push(thread::spawn(move || {
                let group =
                    ProcessGroup::init(rank, world_size, &addr, Duration::from_secs(10)).unwrap();
                for round in 0..3 {
                    arrivals.fetch_add(1, Ordering::SeqCst);
                    group.barrier().unwrap();
                    // after the barrier every rank must have arrived in
                    // this round
                    assert!(arrivals.load(Ordering::SeqCst) >= (round + 1) * world_size);
                    group.barrier().unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(arrivals.load(Ordering::SeqCst), 3 * world_size);
    }

    #[test]
    fn rendezvous_times_out_without_followers() {
        let addr = free_local_addr();
        let result = ProcessGroup::init(0, 2, &addr, Duration::from_millis(200));
        assert!(result.is_err());
    }
}
