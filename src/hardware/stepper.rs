//! Stepper motor driven by toggling two DAC lines.
//!
//! The rotation stage's driver board listens to two logic inputs wired to
//! lock-in DAC outputs:
//!
//! - **step line**: every transition (rising or falling) advances the motor by
//!   one increment
//! - **direction line**: LOW rotates clockwise, HIGH counterclockwise
//!
//! There is no encoder. [`StepperMotor::position`] is the only record of where
//! the stage is, and it is correct only as long as no physical step is missed.

use crate::hardware::capabilities::AnalogOutputs;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Output level written for a logic LOW (V)
pub const LINE_LOW: f64 = 0.0;
/// Output level written for a logic HIGH (V)
pub const LINE_HIGH: f64 = 5.0;
/// Read-back levels below this count as LOW (V)
pub const LINE_THRESHOLD: f64 = 2.5;

/// Rotation sense selected by the direction line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Direction line LOW; each step adds one to the position
    Clockwise,
    /// Direction line HIGH; each step subtracts one from the position
    Counterclockwise,
}

impl Direction {
    /// Output level that selects this direction.
    pub fn level(self) -> f64 {
        match self {
            Direction::Clockwise => LINE_LOW,
            Direction::Counterclockwise => LINE_HIGH,
        }
    }

    /// Direction encoded by a read-back line level.
    pub fn from_level(volts: f64) -> Self {
        if volts < LINE_THRESHOLD {
            Direction::Clockwise
        } else {
            Direction::Counterclockwise
        }
    }

    /// Position change of one step in this direction.
    pub fn increment(self) -> i64 {
        match self {
            Direction::Clockwise => 1,
            Direction::Counterclockwise => -1,
        }
    }
}

/// DAC channel assignment of the stepper lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepperLines {
    /// DAC toggled once per step
    pub step_channel: u8,
    /// DAC selecting the rotation direction
    pub direction_channel: u8,
}

impl Default for StepperLines {
    fn default() -> Self {
        Self {
            step_channel: 3,
            direction_channel: 4,
        }
    }
}

/// Signed step counter plus the line protocol that moves it.
#[derive(Debug, Clone)]
pub struct StepperMotor {
    lines: StepperLines,
    position: i64,
}

impl StepperMotor {
    /// New motor at home (position 0).
    pub fn new(lines: StepperLines) -> Self {
        Self { lines, position: 0 }
    }

    /// Net signed steps since the last home.
    pub fn position(&self) -> i64 {
        self.position
    }

    /// Declare the present physical position to be home.
    pub fn reset(&mut self) {
        self.position = 0;
    }

    /// Drive both lines LOW.
    pub async fn zero_lines<O>(&self, outputs: &O) -> Result<()>
    where
        O: AnalogOutputs + ?Sized,
    {
        outputs.set_dac(self.lines.step_channel, LINE_LOW).await?;
        outputs.set_dac(self.lines.direction_channel, LINE_LOW).await
    }

    /// Select the rotation direction for following steps.
    pub async fn set_direction<O>(&self, outputs: &O, direction: Direction) -> Result<()>
    where
        O: AnalogOutputs + ?Sized,
    {
        outputs
            .set_dac(self.lines.direction_channel, direction.level())
            .await
    }

    /// Toggle the step line once, count the step, then wait `settle`.
    ///
    /// The direction is read back from the instrument, so the count follows
    /// whatever level the line actually has.
    pub async fn step<O>(&mut self, outputs: &O, settle: Duration) -> Result<()>
    where
        O: AnalogOutputs + ?Sized,
    {
        let step_level = outputs.dac(self.lines.step_channel).await?;
        let next = if step_level < LINE_THRESHOLD {
            LINE_HIGH
        } else {
            LINE_LOW
        };
        outputs.set_dac(self.lines.step_channel, next).await?;

        let direction_level = outputs.dac(self.lines.direction_channel).await?;
        self.position += Direction::from_level(direction_level).increment();

        debug!(
            step_line = next,
            direction_line = direction_level,
            position = self.position,
            "Step"
        );

        if !settle.is_zero() {
            tokio::time::sleep(settle).await;
        }
        Ok(())
    }

    /// Step back to position 0, waiting `settle` after each step.
    ///
    /// Runs |position| steps. There is no stop check and no timeout.
    pub async fn home<O>(&mut self, outputs: &O, settle: Duration) -> Result<()>
    where
        O: AnalogOutputs + ?Sized,
    {
        let direction = if self.position > 0 {
            Direction::Counterclockwise
        } else {
            Direction::Clockwise
        };
        self.set_direction(outputs, direction).await?;

        while self.position != 0 {
            self.step(outputs, settle).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Dacs {
        levels: Mutex<[f64; 4]>,
        writes: Mutex<Vec<(u8, f64)>>,
    }

    #[async_trait]
    impl AnalogOutputs for Dacs {
        async fn dac(&self, channel: u8) -> Result<f64> {
            Ok(self.levels.lock().unwrap()[channel as usize - 1])
        }

        async fn set_dac(&self, channel: u8, volts: f64) -> Result<()> {
            self.levels.lock().unwrap()[channel as usize - 1] = volts;
            self.writes.lock().unwrap().push((channel, volts));
            Ok(())
        }
    }

    #[test]
    fn direction_levels() {
        assert_eq!(Direction::from_level(0.0), Direction::Clockwise);
        assert_eq!(Direction::from_level(2.49), Direction::Clockwise);
        assert_eq!(Direction::from_level(2.5), Direction::Counterclockwise);
        assert_eq!(Direction::Counterclockwise.level(), LINE_HIGH);
    }

    #[tokio::test]
    async fn step_toggles_step_line() {
        let dacs = Dacs::default();
        let mut motor = StepperMotor::new(StepperLines::default());

        motor.step(&dacs, Duration::ZERO).await.unwrap();
        assert_eq!(dacs.dac(3).await.unwrap(), LINE_HIGH);
        motor.step(&dacs, Duration::ZERO).await.unwrap();
        assert_eq!(dacs.dac(3).await.unwrap(), LINE_LOW);
        assert_eq!(motor.position(), 2);
    }

    #[tokio::test]
    async fn counterclockwise_counts_down() {
        let dacs = Dacs::default();
        let mut motor = StepperMotor::new(StepperLines::default());
        motor
            .set_direction(&dacs, Direction::Counterclockwise)
            .await
            .unwrap();

        for _ in 0..7 {
            motor.step(&dacs, Duration::ZERO).await.unwrap();
        }
        assert_eq!(motor.position(), -7);
    }

    #[tokio::test]
    async fn home_from_positive_position() {
        let dacs = Dacs::default();
        let mut motor = StepperMotor::new(StepperLines::default());
        for _ in 0..5 {
            motor.step(&dacs, Duration::ZERO).await.unwrap();
        }

        motor.home(&dacs, Duration::ZERO).await.unwrap();
        assert_eq!(motor.position(), 0);
        assert_eq!(dacs.dac(4).await.unwrap(), LINE_HIGH);
    }

    #[tokio::test]
    async fn home_from_negative_position() {
        let dacs = Dacs::default();
        let mut motor = StepperMotor::new(StepperLines::default());
        motor
            .set_direction(&dacs, Direction::Counterclockwise)
            .await
            .unwrap();
        for _ in 0..3 {
            motor.step(&dacs, Duration::ZERO).await.unwrap();
        }

        motor.home(&dacs, Duration::ZERO).await.unwrap();
        assert_eq!(motor.position(), 0);
        assert_eq!(dacs.dac(4).await.unwrap(), LINE_LOW);
    }

    #[tokio::test]
    async fn home_at_zero_only_sets_direction() {
        let dacs = Dacs::default();
        let mut motor = StepperMotor::new(StepperLines::default());

        motor.home(&dacs, Duration::ZERO).await.unwrap();
        assert_eq!(*dacs.writes.lock().unwrap(), vec![(4, LINE_LOW)]);
    }

    #[tokio::test]
    async fn custom_channels_are_respected() {
        let dacs = Dacs::default();
        let mut motor = StepperMotor::new(StepperLines {
            step_channel: 1,
            direction_channel: 2,
        });
        motor.step(&dacs, Duration::ZERO).await.unwrap();
        assert_eq!(dacs.dac(1).await.unwrap(), LINE_HIGH);
        assert_eq!(dacs.dac(3).await.unwrap(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn step_waits_for_settle() {
        let dacs = Dacs::default();
        let mut motor = StepperMotor::new(StepperLines::default());
        let start = tokio::time::Instant::now();
        motor
            .step(&dacs, Duration::from_millis(350))
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(350));
    }
}
