use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::{Error, Result, Stage};
use crate::signature::Signature;

/// When the generator stops on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Budget {
    Packets(u64),
    Duration(Duration),
}

#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    pub signature: Signature,
    pub seed: u64,
    pub budget: Budget,
    /// Packets per second, unlimited when `None`
    pub rate: Option<u64>,
    /// Inclusive destination port range
    pub port_range: (u16, u16),
    /// Upper bound of random bytes appended after the signature
    pub max_padding: usize,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            signature: Signature::default(),
            seed: 1,
            budget: Budget::Packets(1000),
            rate: Some(500),
            port_range: (1024, 65535),
            max_padding: 64,
        }
    }
}

impl GeneratorConfig {
    pub fn validate(&self) -> Result<()> {
        match self.budget {
            Budget::Packets(0) => return Err(Error::config("budget", "packet budget is zero")),
            Budget::Duration(d) if d.is_zero() => {
                return Err(Error::config("budget", "duration budget is zero"));
            }
            _ => {}
        }
        if self.rate == Some(0) {
            return Err(Error::config("rate", "must be greater than zero"));
        }
        let (low, high) = self.port_range;
        if low == 0 || low > high {
            return Err(Error::config(
                "port_range",
                format!("{}-{} is not a valid port range", low, high),
            ));
        }
        Ok(())
    }
}

/// Seeded source of attack datagrams.
///
/// Each datagram body starts with the signature, so on the wire it sits right
/// after the 8-byte UDP header.
pub struct PayloadStream {
    rng: StdRng,
    signature: Signature,
    max_padding: usize,
    port_range: (u16, u16),
}

impl PayloadStream {
    pub fn new(config: &GeneratorConfig) -> Self {
        Self {
            rng: StdRng::seed_from_u64(config.seed),
            signature: config.signature.clone(),
            max_padding: config.max_padding,
            port_range: config.port_range,
        }
    }

    /// Next (destination port, datagram body)
    pub fn next_datagram(&mut self) -> (u16, Vec<u8>) {
        let port = self.rng.gen_range(self.port_range.0..=self.port_range.1);
        let padding = self.rng.gen_range(0..=self.max_padding);
        let mut body = Vec::with_capacity(self.signature.len() + padding);
        body.extend_from_slice(self.signature.as_bytes());
        body.resize(self.signature.len() + padding, 0);
        self.rng.fill(&mut body[self.signature.len()..]);
        (port, body)
    }
}

/// Fixed-interval pacing for the send loop
struct RateLimiter {
    interval: Option<Duration>,
    last_send: Instant,
}

impl RateLimiter {
    fn new(rate: Option<u64>) -> Self {
        Self {
            interval: rate.map(|r| Duration::from_nanos(1_000_000_000 / r.max(1))),
            last_send: Instant::now(),
        }
    }

    fn acquire(&mut self) {
        let Some(required_interval) = self.interval else {
            return;
        };
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_send);

        if elapsed < required_interval {
            let sleep_time = required_interval - elapsed;

            if sleep_time > Duration::from_micros(100) {
                thread::sleep(sleep_time);
            } else {
                // Busy wait for sub-100us precision
                while Instant::now().duration_since(now) < sleep_time {
                    std::hint::spin_loop();
                }
            }
        }

        self.last_send = Instant::now();
    }
}

#[derive(Default)]
struct Stats {
    sent_packets: u64,
    sent_bytes: u64,
    errors: u64,
}

/// Outcome of one generator run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeneratorReport {
    pub sent_packets: u64,
    pub sent_bytes: u64,
    pub errors: u64,
    pub elapsed: Duration,
}

/// UDP flood toward a single target address
pub struct AttackGenerator {
    config: GeneratorConfig,
    target: IpAddr,
}

impl AttackGenerator {
    pub fn new(config: GeneratorConfig, target: IpAddr) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, target })
    }

    fn open_socket(&self) -> Result<Socket> {
        let domain = Domain::for_address(SocketAddr::new(self.target, 0));
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| Error::lifecycle(Stage::Generate, format!("socket: {}", e)))?;
        if let Err(e) = socket.set_send_buffer_size(1024 * 1024) {
            warn!("Failed to set send buffer: {}", e);
        }
        Ok(socket)
    }

    /// Start the flood on a dedicated thread
    pub fn spawn(self) -> Result<GeneratorHandle> {
        let socket = self.open_socket()?;
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();

        let thread = thread::Builder::new()
            .name("attack-generator".to_string())
            .spawn(move || self.send_loop(&socket, &flag))
            .map_err(|e| Error::lifecycle(Stage::Generate, format!("spawn: {}", e)))?;

        Ok(GeneratorHandle {
            running,
            thread: Some(thread),
        })
    }

    /// Run the flood on the calling thread until the budget is spent
    pub fn run(self) -> Result<GeneratorReport> {
        let socket = self.open_socket()?;
        let running = AtomicBool::new(true);
        Ok(self.send_loop(&socket, &running))
    }

    fn send_loop(&self, socket: &Socket, running: &AtomicBool) -> GeneratorReport {
        let mut stats = Stats::default();
        let mut payloads = PayloadStream::new(&self.config);
        let mut limiter = RateLimiter::new(self.config.rate);
        let started = Instant::now();
        let mut attempts = 0u64;

        info!(
            target_ip = %self.target,
            budget = ?self.config.budget,
            seed = self.config.seed,
            "Starting attack generator"
        );

        while running.load(Ordering::Relaxed) {
            let exhausted = match self.config.budget {
                Budget::Packets(limit) => attempts >= limit,
                Budget::Duration(limit) => started.elapsed() >= limit,
            };
            if exhausted {
                break;
            }

            let (port, body) = payloads.next_datagram();
            limiter.acquire();
            attempts += 1;

            let dest_addr = SockAddr::from(SocketAddr::new(self.target, port));
            match socket.send_to(&body, &dest_addr) {
                Ok(bytes_sent) => {
                    stats.sent_packets += 1;
                    stats.sent_bytes += bytes_sent as u64;
                }
                Err(e) => {
                    stats.errors += 1;
                    if stats.errors == 1 {
                        warn!("Failed to send to {}:{} - {}", self.target, port, e);
                    } else {
                        debug!("Failed to send to {}:{} - {}", self.target, port, e);
                    }
                }
            }
        }

        let report = GeneratorReport {
            sent_packets: stats.sent_packets,
            sent_bytes: stats.sent_bytes,
            errors: stats.errors,
            elapsed: started.elapsed(),
        };
        info!(
            "Attack generator finished: {} packets, {} bytes, {} errors in {:.2}s",
            report.sent_packets,
            report.sent_bytes,
            report.errors,
            report.elapsed.as_secs_f64()
        );
        report
    }
}

/// Handle to a running generator thread
pub struct GeneratorHandle {
    running: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<GeneratorReport>>,
}

impl GeneratorHandle {
    /// Ask the generator to stop before its budget is exhausted
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(|t| t.is_finished())
    }

    /// Block until the generator thread exits
    pub fn join(mut self) -> Result<GeneratorReport> {
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| Error::lifecycle(Stage::Generate, "generator thread panicked")),
            None => Err(Error::lifecycle(Stage::Generate, "generator already joined")),
        }
    }
}

impl Drop for GeneratorHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.stop();
        }
    }
}
