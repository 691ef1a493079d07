//! Periodic polling of the sensor board.
//!
//! Every round opens the serial channel, reads all registers, checks the status bytes and
//! either publishes the CO2eq/TVOC pair or drops the whole round.

use crate::{
    device::{Connector, FramedPort},
    devices::sgp30::{Register, Sample, Sgp30Frame},
    error::{DecodeError, PublishError},
    output::Sink,
    protocol::{Exception, READ_INPUT_REGISTERS},
};
use chrono::Utc;
use log::{debug, error, info, warn};
use std::fmt;
use std::time::Duration;
use tokio::sync::watch;

/// Pause between two polling rounds.
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// How long to wait for the board to answer a request.
pub const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Sum of the status bytes of a round in which every register answered.
pub const EXPECTED_STATUS_SUM: u32 = READ_INPUT_REGISTERS as u32 * Register::ALL.len() as u32;

/// Settings of the polling loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamplerConfig {
    /// Device the samples are published for
    pub device_id: String,
    pub interval: Duration,
    pub read_timeout: Duration,
    /// Stop after this many rounds. Runs until cancelled if `None`.
    pub iterations: Option<usize>,
}

impl SamplerConfig {
    pub fn new(device_id: impl Into<String>) -> Self {
        SamplerConfig {
            device_id: device_id.into(),
            interval: POLL_INTERVAL,
            read_timeout: READ_TIMEOUT,
            iterations: None,
        }
    }
}

/// Sending half of the cancellation signal.
#[derive(Debug)]
pub struct ShutdownHandle(watch::Sender<bool>);

impl ShutdownHandle {
    pub fn trigger(&self) {
        // receivers may be gone already, then there is nobody left to stop
        let _ = self.0.send(true);
    }
}

/// Cancellation signal checked by the polling loop.
#[derive(Debug, Clone)]
pub struct Shutdown(watch::Receiver<bool>);

impl Shutdown {
    pub fn new() -> (ShutdownHandle, Shutdown) {
        let (tx, rx) = watch::channel(false);
        (ShutdownHandle(tx), Shutdown(rx))
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once shutdown was requested. Never resolves if the handle was dropped untriggered.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.0.borrow_and_update() {
                return;
            }
            if self.0.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Why a register spoiled the round.
#[derive(Debug, Clone, PartialEq)]
pub enum RegisterFailure {
    /// The board answered with an unexpected function code.
    Status {
        register: Register,
        status: u8,
        exception: Option<Exception>,
    },
    /// The answer was too short to decode.
    Decode {
        register: Register,
        error: DecodeError,
    },
}

impl fmt::Display for RegisterFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterFailure::Status {
                register,
                status,
                exception: Some(e),
            } => write!(f, "{}: status {} ({})", register, status, e),
            RegisterFailure::Status {
                register, status, ..
            } => write!(f, "{}: status {}", register, status),
            RegisterFailure::Decode { register, error } => write!(f, "{}: {}", register, error),
        }
    }
}

/// Result of one polling round.
#[derive(Debug)]
pub enum Outcome {
    Published(Sample),
    /// At least one register disagreed, nothing was published.
    Discarded {
        accumulator: u32,
        failures: Vec<RegisterFailure>,
    },
    TransportFailed(anyhow::Error),
    PublishFailed(Sample, PublishError),
    Cancelled,
}

/// Status bytes and values collected while querying the registers.
#[derive(Debug, Default)]
struct Round {
    accumulator: u32,
    values: [Option<u16>; 4],
    failures: Vec<RegisterFailure>,
}

impl Round {
    fn record(&mut self, index: usize, register: Register, frame: Sgp30Frame) {
        self.accumulator += frame.status as u32;
        if frame.is_ok() {
            info!("{}: {}", register, frame.value);
            self.values[index] = Some(frame.value);
        } else {
            self.failures.push(RegisterFailure::Status {
                register,
                status: frame.status,
                exception: frame.exception(),
            });
        }
    }

    fn record_decode_error(&mut self, register: Register, error: DecodeError) {
        self.failures.push(RegisterFailure::Decode { register, error });
    }

    /// CO2eq and TVOC if every register answered with the expected status.
    fn evaluate(self) -> Result<(u16, u16), Outcome> {
        let discarded = |round: Round| Outcome::Discarded {
            accumulator: round.accumulator,
            failures: round.failures,
        };
        if self.accumulator != EXPECTED_STATUS_SUM || !self.failures.is_empty() {
            return Err(discarded(self));
        }
        match (self.values[0], self.values[1]) {
            (Some(co2eq), Some(tvoc)) => Ok((co2eq, tvoc)),
            _ => Err(discarded(self)),
        }
    }
}

enum State<P> {
    Connecting,
    Querying {
        port: FramedPort<P, Sgp30Frame>,
        next: usize,
        round: Round,
    },
    Evaluating(Round),
    Publishing(u16, u16),
}

impl<P> fmt::Display for State<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Connecting => write!(f, "connecting"),
            State::Querying { next, .. } => match Register::ALL.get(*next) {
                Some(register) => write!(f, "querying {}", register),
                None => write!(f, "closing"),
            },
            State::Evaluating(_) => write!(f, "evaluating"),
            State::Publishing(..) => write!(f, "publishing"),
        }
    }
}

/// Polling loop for one sensor board.
pub struct Sampler<C, S> {
    connector: C,
    sink: S,
    config: SamplerConfig,
}

impl<C, S> Sampler<C, S>
where
    C: Connector,
    S: Sink,
{
    pub fn new(connector: C, sink: S, config: SamplerConfig) -> Self {
        Sampler {
            connector,
            sink,
            config,
        }
    }

    /// Poll until cancelled or the configured number of rounds is done.
    ///
    /// Returns the number of rounds started.
    pub async fn run(&mut self, mut shutdown: Shutdown) -> usize {
        let mut rounds = 0;
        while !shutdown.is_cancelled() && !self.limit_reached(rounds) {
            let outcome = self.poll_once(&mut shutdown).await;
            rounds += 1;
            report(&outcome);

            if matches!(outcome, Outcome::Cancelled) || self.limit_reached(rounds) {
                break;
            }

            info!("sleeping {}s...", self.config.interval.as_secs_f32());
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => (),
                _ = shutdown.cancelled() => break,
            }
        }
        info!("Polling stopped after {} rounds", rounds);
        rounds
    }

    fn limit_reached(&self, rounds: usize) -> bool {
        self.config.iterations.map_or(false, |n| rounds >= n)
    }

    /// Run a single polling round.
    ///
    /// The serial channel is opened at the start of the round and released once all
    /// registers are read.
    pub async fn poll_once(&mut self, shutdown: &mut Shutdown) -> Outcome {
        let mut state = State::<C::Port>::Connecting;
        loop {
            debug!("state: {}", state);
            state = match state {
                State::Connecting => {
                    if shutdown.is_cancelled() {
                        return Outcome::Cancelled;
                    }
                    match self.connector.open().await {
                        Ok(port) => State::Querying {
                            port: FramedPort::new(port, self.config.read_timeout),
                            next: 0,
                            round: Round::default(),
                        },
                        Err(e) => return Outcome::TransportFailed(e.into()),
                    }
                }
                State::Querying {
                    mut port,
                    next,
                    mut round,
                } => match Register::ALL.get(next) {
                    // port goes out of scope here, which closes it
                    None => State::Evaluating(round),
                    Some(&register) => {
                        let response = tokio::select! {
                            biased;
                            _ = shutdown.cancelled() => return Outcome::Cancelled,
                            response = port.transact(register.request()) => response,
                        };
                        match response {
                            Ok(frame) => round.record(next, register, frame),
                            Err(e) => match e.downcast::<DecodeError>() {
                                Ok(decode) => round.record_decode_error(register, decode),
                                Err(e) => return Outcome::TransportFailed(e),
                            },
                        }
                        State::Querying {
                            port,
                            next: next + 1,
                            round,
                        }
                    }
                },
                State::Evaluating(round) => match round.evaluate() {
                    Ok((co2eq, tvoc)) => State::Publishing(co2eq, tvoc),
                    Err(outcome) => return outcome,
                },
                State::Publishing(co2eq, tvoc) => return self.publish(shutdown, co2eq, tvoc).await,
            }
        }
    }

    /// Hand a validated pair to the sink, unless shutdown was requested meanwhile.
    async fn publish(&mut self, shutdown: &Shutdown, co2eq: u16, tvoc: u16) -> Outcome {
        if shutdown.is_cancelled() {
            return Outcome::Cancelled;
        }
        let sample = Sample {
            co2eq,
            tvoc,
            timestamp: Utc::now().timestamp_millis(),
        };
        match self.sink.publish(&self.config.device_id, &sample).await {
            Ok(()) => Outcome::Published(sample),
            Err(e) => Outcome::PublishFailed(sample, e),
        }
    }
}

fn report(outcome: &Outcome) {
    match outcome {
        Outcome::Published(sample) => info!("Published {}", sample),
        Outcome::Discarded {
            accumulator,
            failures,
        } => {
            let failures = failures
                .iter()
                .map(|f| f.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            warn!(
                "Protocol error, sample discarded (status sum {} != {}): {}",
                accumulator, EXPECTED_STATUS_SUM, failures
            );
        }
        Outcome::TransportFailed(e) => warn!("Transport error: {:#}", e),
        Outcome::PublishFailed(sample, e) => error!("Failed to publish {}: {}", sample, e),
        Outcome::Cancelled => info!("Round cancelled"),
    }
}
