//! Mock Hardware Implementations
//!
//! Provides simulated instruments for running a sweep without the rig.
//! All mock devices use async-safe operations (no blocking sleeps) and keep a
//! log of the calls they received so tests can assert on the exact sequence.
//!
//! # Available Mocks
//!
//! - `MockLockIn` - Lock-in with four DACs wired to a simulated stepper stage;
//!   its X output follows `cos(nθ)` of the physical stage angle
//! - `MockCurrentSource` - Magnet supply that ramps instantly
//! - `MockRig` - `RigConnector` handing out the mocks above
//! - `ScriptedLink` - `InstrumentLink` with canned replies for driver tests

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::trace;

use crate::error::SweepError;
use crate::hardware::adapter::InstrumentLink;
use crate::hardware::capabilities::{
    AnalogOutputs, CurrentSource, LockInAmplifier, LockInWithOutputs, Rig, RigConnector,
};
use crate::hardware::stepper::{Direction, StepperLines, LINE_THRESHOLD};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// Simulated rotation stage
// =============================================================================

/// Physical step counter of the simulated rotation stage.
///
/// Shared between the lock-in that drives the stage and any lock-in that
/// only observes the sample.
#[derive(Debug, Clone, Default)]
pub struct MockStage {
    steps: Arc<AtomicI64>,
}

impl MockStage {
    /// Stage at step zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Net physical steps taken since creation.
    pub fn steps(&self) -> i64 {
        self.steps.load(Ordering::SeqCst)
    }

    fn advance(&self, increment: i64) {
        self.steps.fetch_add(increment, Ordering::SeqCst);
    }
}

/// Second-harmonic style signal seen by a mock lock-in.
#[derive(Debug, Clone, Copy)]
pub struct SignalModel {
    /// Peak X amplitude (V)
    pub amplitude: f64,
    /// Angular harmonic; X = amplitude · cos(harmonic · θ)
    pub harmonic: f64,
    /// Uniform noise half-width added to X and Y (V)
    pub noise: f64,
    /// Stage rotation per physical step (deg)
    pub degrees_per_step: f64,
}

impl Default for SignalModel {
    fn default() -> Self {
        Self {
            amplitude: 1.0e-6,
            harmonic: 2.0,
            noise: 1.0e-8,
            degrees_per_step: 90.0 / 50.0 / 2.0,
        }
    }
}

impl SignalModel {
    fn sample(&self, steps: i64) -> (f64, f64) {
        let theta = (steps as f64 * self.degrees_per_step).to_radians();
        let mut x = self.amplitude * (self.harmonic * theta).cos();
        let mut y = 0.0;
        if self.noise > 0.0 {
            let mut rng = rand::thread_rng();
            x += rng.gen_range(-self.noise..self.noise);
            y += rng.gen_range(-self.noise..self.noise);
        }
        (x, y)
    }
}

// =============================================================================
// MockLockIn
// =============================================================================

/// Mock lock-in amplifier
///
/// Simulates a DSP 7265 with:
/// - Four auxiliary DACs that read back what was written
/// - A stepper stage that advances on every threshold crossing of the step
///   line, in the sense selected by the direction line
/// - X/Y readings derived from the stage angle
///
/// # Example
///
/// ```rust,ignore
/// let lockin = MockLockIn::new(StepperLines::default(), SignalModel::default());
/// lockin.set_dac(3, 5.0).await?;
/// assert_eq!(lockin.stage().steps(), 1);
/// ```
pub struct MockLockIn {
    lines: Option<StepperLines>,
    stage: MockStage,
    signal: SignalModel,
    levels: Mutex<[f64; 4]>,
    dac_writes: Mutex<Vec<(u8, f64)>>,
    reads: AtomicUsize,
    fail_reads: AtomicBool,
}

impl MockLockIn {
    /// Lock-in whose DACs drive a new stage through `lines`.
    pub fn new(lines: StepperLines, signal: SignalModel) -> Self {
        Self::build(Some(lines), MockStage::new(), signal)
    }

    /// Lock-in that observes `stage` but does not drive it.
    pub fn observing(stage: MockStage, signal: SignalModel) -> Self {
        Self::build(None, stage, signal)
    }

    fn build(lines: Option<StepperLines>, stage: MockStage, signal: SignalModel) -> Self {
        Self {
            lines,
            stage,
            signal,
            levels: Mutex::new([0.0; 4]),
            dac_writes: Mutex::new(Vec::new()),
            reads: AtomicUsize::new(0),
            fail_reads: AtomicBool::new(false),
        }
    }

    /// Stage moved by this lock-in's DACs.
    pub fn stage(&self) -> &MockStage {
        &self.stage
    }

    /// Every `set_dac` call in order.
    pub fn dac_writes(&self) -> Vec<(u8, f64)> {
        lock(&self.dac_writes).clone()
    }

    /// Number of X or Y reads served.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Make subsequent X/Y reads fail, simulating a dropped instrument.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    fn check_channel(channel: u8) -> Result<usize> {
        if !(1..=4).contains(&channel) {
            return Err(anyhow!(SweepError::Instrument(format!(
                "mock lock-in has DACs 1-4, got {}",
                channel
            ))));
        }
        Ok(channel as usize - 1)
    }

    fn read(&self) -> Result<(f64, f64)> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(anyhow!(SweepError::Instrument(
                "mock lock-in read failed".into()
            )));
        }
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.signal.sample(self.stage.steps()))
    }
}

#[async_trait]
impl LockInAmplifier for MockLockIn {
    async fn x(&self) -> Result<f64> {
        Ok(self.read()?.0)
    }

    async fn y(&self) -> Result<f64> {
        Ok(self.read()?.1)
    }
}

#[async_trait]
impl AnalogOutputs for MockLockIn {
    async fn dac(&self, channel: u8) -> Result<f64> {
        let index = Self::check_channel(channel)?;
        Ok(lock(&self.levels)[index])
    }

    async fn set_dac(&self, channel: u8, volts: f64) -> Result<()> {
        let index = Self::check_channel(channel)?;
        let mut levels = lock(&self.levels);
        let previous = levels[index];
        levels[index] = volts;
        lock(&self.dac_writes).push((channel, volts));

        if let Some(lines) = self.lines {
            let crossed = (previous < LINE_THRESHOLD) != (volts < LINE_THRESHOLD);
            if channel == lines.step_channel && crossed {
                let direction =
                    Direction::from_level(levels[lines.direction_channel as usize - 1]);
                self.stage.advance(direction.increment());
                trace!(steps = self.stage.steps(), "Mock stage stepped");
            }
        }
        Ok(())
    }
}

// =============================================================================
// MockCurrentSource
// =============================================================================

/// Mock magnet supply that reaches every setpoint immediately.
#[derive(Default)]
pub struct MockCurrentSource {
    current: Mutex<f64>,
    enabled: AtomicBool,
    calls: Mutex<Vec<String>>,
    failing: Mutex<Vec<&'static str>>,
}

impl MockCurrentSource {
    /// Disabled source at zero current.
    pub fn new() -> Self {
        Self::default()
    }

    /// Present output current (A).
    pub fn current(&self) -> f64 {
        *lock(&self.current)
    }

    /// Whether the output is on.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Calls received, e.g. `ramp 1 @ 0.1`, `enable`, `disable`.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    /// Make `operation` (`ramp`, `ramp_to_zero`, `enable`, `disable`) fail.
    pub fn fail_on(&self, operation: &'static str) {
        lock(&self.failing).push(operation);
    }

    fn record(&self, operation: &'static str, call: String) -> Result<()> {
        lock(&self.calls).push(call);
        if lock(&self.failing).contains(&operation) {
            return Err(anyhow!(SweepError::Instrument(format!(
                "mock current source {} failed",
                operation
            ))));
        }
        Ok(())
    }
}

#[async_trait]
impl CurrentSource for MockCurrentSource {
    async fn ramp_to_current(&self, current: f64, rate: f64) -> Result<()> {
        self.record("ramp", format!("ramp {} @ {}", current, rate))?;
        *lock(&self.current) = current;
        Ok(())
    }

    async fn ramp_to_zero(&self, rate: f64) -> Result<()> {
        self.record("ramp_to_zero", format!("ramp_to_zero @ {}", rate))?;
        *lock(&self.current) = 0.0;
        Ok(())
    }

    async fn enable(&self) -> Result<()> {
        self.record("enable", "enable".into())?;
        self.enabled.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disable(&self) -> Result<()> {
        self.record("disable", "disable".into())?;
        self.enabled.store(false, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// MockRig
// =============================================================================

/// Connector that hands out one shared set of mock instruments.
///
/// Tests keep the `Arc`s to inspect the instruments after the sweep.
#[derive(Clone)]
pub struct MockRig {
    /// Lock-in that drives the stage.
    pub lockin1: Arc<MockLockIn>,
    /// Observing lock-in.
    pub lockin2: Arc<MockLockIn>,
    /// Magnet supply.
    pub source: Arc<MockCurrentSource>,
    connections: Arc<AtomicUsize>,
    fail_connect: Arc<AtomicBool>,
}

impl MockRig {
    /// Noise-free rig with the given stepper wiring.
    pub fn new(lines: StepperLines, degrees_per_step: f64) -> Self {
        let signal = SignalModel {
            noise: 0.0,
            degrees_per_step,
            ..SignalModel::default()
        };
        Self::with_signal(lines, signal)
    }

    /// Rig whose lock-in 1 sees `signal` and lock-in 2 the first harmonic.
    pub fn with_signal(lines: StepperLines, signal: SignalModel) -> Self {
        let lockin1 = MockLockIn::new(lines, signal);
        let lockin2 = MockLockIn::observing(
            lockin1.stage().clone(),
            SignalModel {
                harmonic: 1.0,
                ..signal
            },
        );
        Self {
            lockin1: Arc::new(lockin1),
            lockin2: Arc::new(lockin2),
            source: Arc::new(MockCurrentSource::new()),
            connections: Arc::new(AtomicUsize::new(0)),
            fail_connect: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Make `connect` fail, simulating an unreachable instrument.
    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Number of successful connections.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

impl Default for MockRig {
    fn default() -> Self {
        Self::new(StepperLines::default(), SignalModel::default().degrees_per_step)
    }
}

#[async_trait]
impl RigConnector for MockRig {
    async fn connect(&self) -> Result<Rig> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(anyhow!(SweepError::Instrument(
                "mock rig connection refused".into()
            )));
        }
        self.connections.fetch_add(1, Ordering::SeqCst);
        let lockin1: Arc<dyn LockInWithOutputs> = self.lockin1.clone();
        let lockin2: Arc<dyn LockInAmplifier> = self.lockin2.clone();
        let source: Arc<dyn CurrentSource> = self.source.clone();
        Ok(Rig {
            lockin1,
            lockin2,
            source,
        })
    }
}

// =============================================================================
// ScriptedLink
// =============================================================================

/// `InstrumentLink` with canned replies.
///
/// - `with_reply(query, reply)` answers `query` with `reply`
/// - `with_replies(query, [..])` answers successive queries in order and
///   repeats the last reply once the script runs out
/// - `with_register(name, value)` models a settable value: a write of
///   `name <v>` updates it and `name?` reads it back
///
/// Every call is logged as `? <query>` or `! <command>`.
pub struct ScriptedLink {
    name: String,
    replies: Mutex<HashMap<String, VecDeque<String>>>,
    registers: Mutex<HashMap<String, String>>,
    log: Mutex<Vec<String>>,
}

impl ScriptedLink {
    /// Link with no scripted replies.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            replies: Mutex::new(HashMap::new()),
            registers: Mutex::new(HashMap::new()),
            log: Mutex::new(Vec::new()),
        }
    }

    /// Answer `query` with `reply`.
    pub fn with_reply(self, query: &str, reply: &str) -> Self {
        self.with_replies(query, [reply])
    }

    /// Answer `query` with `replies` in order; the last one repeats.
    pub fn with_replies<I, S>(self, query: &str, replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        lock(&self.replies)
            .entry(query.to_string())
            .or_default()
            .extend(replies.into_iter().map(Into::into));
        self
    }

    /// Seed a register that commands update and queries read back.
    pub fn with_register(self, name: &str, value: &str) -> Self {
        lock(&self.registers).insert(name.to_string(), value.to_string());
        self
    }

    /// Calls received so far.
    pub fn log(&self) -> Vec<String> {
        lock(&self.log).clone()
    }
}

#[async_trait]
impl InstrumentLink for ScriptedLink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write(&self, command: &str) -> Result<()> {
        lock(&self.log).push(format!("! {}", command));
        if let Some((register, value)) = command.split_once(' ') {
            if let Some(slot) = lock(&self.registers).get_mut(register) {
                *slot = value.to_string();
            }
        }
        Ok(())
    }

    async fn ask(&self, query: &str) -> Result<String> {
        lock(&self.log).push(format!("? {}", query));

        if let Some(register) = query.strip_suffix('?') {
            if let Some(value) = lock(&self.registers).get(register) {
                return Ok(value.clone());
            }
        }

        let mut replies = lock(&self.replies);
        let script = replies.get_mut(query).ok_or_else(|| {
            anyhow!(SweepError::Instrument(format!(
                "{}: no reply scripted for '{}'",
                self.name, query
            )))
        })?;
        let reply = if script.len() > 1 {
            script.pop_front()
        } else {
            script.front().cloned()
        };
        reply.ok_or_else(|| {
            anyhow!(SweepError::Instrument(format!(
                "{}: empty script for '{}'",
                self.name, query
            )))
        })
    }
}
