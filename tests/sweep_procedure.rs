//! Integration tests for the rotation sweep against the mock rig.
//!
//! These cover the full startup → execute → shutdown lifecycle: record
//! counts per half sweep, progress, stop handling and the guarantee that the
//! stage is back home and the magnet at zero afterwards.

use second_harmonic::data::{MemoryEmitter, StopFlag};
use second_harmonic::error::SweepError;
use second_harmonic::hardware::mock::MockRig;
use second_harmonic::hardware::StepperLines;
use second_harmonic::procedures::{
    run_procedure, Procedure, ProcedureStatus, SecondHarmonicSweep, SweepParameters, SweepTiming,
};
use std::sync::Arc;
use tracing_test::traced_test;

fn params(max_angle: f64) -> SweepParameters {
    SweepParameters {
        max_angle,
        delay_seconds: 0.0,
        ..Default::default()
    }
}

fn sweep_on(rig: &MockRig, params: SweepParameters) -> SecondHarmonicSweep {
    SecondHarmonicSweep::new(
        params,
        SweepTiming::immediate(),
        Arc::new(rig.clone()),
        StepperLines::default(),
    )
}

// =============================================================================
// Full sweeps
// =============================================================================

#[tokio::test]
async fn test_full_sweep_emits_both_halves() {
    let rig = MockRig::default();
    let mut sweep = sweep_on(&rig, params(180.0));
    assert_eq!(sweep.params().pulse_count(), 200);

    let mut emitter = MemoryEmitter::new();
    let status = run_procedure(&mut sweep, &mut emitter).await.unwrap();
    assert_eq!(status, ProcedureStatus::Finished);

    let records = emitter.records();
    assert_eq!(records.len(), 402);

    // First half rotates out to +180°, second half back to 0°
    assert_eq!(records[0].angle_degrees, 0.0);
    assert!((records[200].angle_degrees - 180.0).abs() < 1e-9);
    assert!((records[201].angle_degrees - 180.0).abs() < 1e-9);
    assert!(records[401].angle_degrees.abs() < 1e-9);

    for record in records {
        assert_eq!(record.current_amps, 1.0);
        assert!((record.field_tesla - 13.69).abs() < 1e-12);
    }
}

#[tokio::test]
async fn test_progress_is_monotonic_and_ends_at_100() {
    let rig = MockRig::default();
    let mut sweep = sweep_on(&rig, params(18.0));
    let mut emitter = MemoryEmitter::new();
    run_procedure(&mut sweep, &mut emitter).await.unwrap();

    let progress = emitter.progress_updates();
    assert_eq!(progress.len(), emitter.records().len());
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(progress[0], 0.0);
    assert_eq!(progress[20], 50.0);
    assert_eq!(progress[21], 50.0);
    assert_eq!(*progress.last().unwrap(), 100.0);
}

#[tokio::test]
async fn test_lifecycle_drives_source_in_order() {
    let rig = MockRig::default();
    let mut sweep = sweep_on(&rig, params(9.0));
    run_procedure(&mut sweep, &mut MemoryEmitter::new())
        .await
        .unwrap();

    assert_eq!(
        rig.source.calls(),
        vec![
            "ramp_to_zero @ 0.1",
            "enable",
            "ramp 1 @ 0.1",
            "ramp_to_zero @ 0.1",
            "disable"
        ]
    );
    assert_eq!(rig.source.current(), 0.0);
    assert!(!rig.source.is_enabled());
    assert_eq!(rig.connections(), 1);
}

#[tokio::test]
async fn test_signal_shows_second_harmonic() {
    let rig = MockRig::default();
    let mut sweep = sweep_on(&rig, params(90.0));
    let mut emitter = MemoryEmitter::new();
    run_procedure(&mut sweep, &mut emitter).await.unwrap();

    let records = emitter.records();
    // Noise-free mock: cos(2θ) is +1 at 0° and -1 at 90°
    assert!((records[0].lockin1_x - 1.0e-6).abs() < 1e-12);
    assert!((records[100].lockin1_x + 1.0e-6).abs() < 1e-12);
}

// =============================================================================
// Stop handling
// =============================================================================

#[tokio::test]
#[traced_test]
async fn test_stop_mid_sweep_measures_second_half_once_and_homes() {
    let rig = MockRig::default();
    let mut sweep = sweep_on(&rig, params(9.0));
    assert_eq!(sweep.params().pulse_count(), 10);

    // Stop once the sixth point is in: five steps have been taken
    let mut emitter = MemoryEmitter::new().stop_after(6);
    sweep.startup().await.unwrap();
    let status = sweep.execute(&mut emitter).await.unwrap();

    assert_eq!(status, ProcedureStatus::Aborted);
    // Six clockwise points, no closing point, then the counterclockwise
    // half measures once where the stage stopped
    let records = emitter.records();
    assert_eq!(records.len(), 7);
    assert!((records[6].angle_degrees - 4.5).abs() < 1e-9);
    assert_eq!(sweep.position(), 5);
    assert_eq!(rig.lockin1.stage().steps(), 5);

    let progress = emitter.progress_updates();
    assert_eq!(progress.len(), 7);
    assert!(progress[..6].iter().all(|p| *p < 50.0));
    assert_eq!(progress[6], 50.0);
    assert!(logs_contain("Caught the stop flag"));

    sweep.shutdown().await.unwrap();
    assert_eq!(sweep.position(), 0);
    assert_eq!(rig.lockin1.stage().steps(), 0);
    assert_eq!(rig.source.current(), 0.0);
}

#[tokio::test]
async fn test_stop_before_execute_measures_once_per_half() {
    let rig = MockRig::default();
    let mut sweep = sweep_on(&rig, params(9.0));
    let stop = StopFlag::new();
    let mut emitter = MemoryEmitter::new().with_stop_flag(stop.clone());
    stop.request_stop();

    let status = run_procedure(&mut sweep, &mut emitter).await.unwrap();
    assert_eq!(status, ProcedureStatus::Aborted);
    assert_eq!(emitter.records().len(), 2);
    assert_eq!(rig.lockin1.stage().steps(), 0);
    assert_eq!(emitter.progress_updates(), &[0.0, 50.0]);
}

#[tokio::test]
async fn test_stop_in_second_half_returns_home() {
    let rig = MockRig::default();
    let mut sweep = sweep_on(&rig, params(9.0));
    // 11 points in the first half, stop on the third of the second
    let mut emitter = MemoryEmitter::new().stop_after(14);

    let status = run_procedure(&mut sweep, &mut emitter).await.unwrap();
    assert_eq!(status, ProcedureStatus::Aborted);
    assert_eq!(emitter.records().len(), 14);
    assert!((emitter.records()[13].angle_degrees - 7.2).abs() < 1e-9);
    assert_eq!(rig.lockin1.stage().steps(), 0);
}

// =============================================================================
// Failures
// =============================================================================

#[tokio::test]
async fn test_connection_failure_propagates() {
    let rig = MockRig::default();
    rig.set_fail_connect(true);
    let mut sweep = sweep_on(&rig, params(9.0));

    let result = run_procedure(&mut sweep, &mut MemoryEmitter::new()).await;
    assert!(result.is_err());
    assert!(rig.source.calls().is_empty());
}

#[tokio::test]
async fn test_read_failure_still_shuts_down() {
    let rig = MockRig::default();
    rig.lockin2.set_fail_reads(true);
    let mut sweep = sweep_on(&rig, params(9.0));

    let err = run_procedure(&mut sweep, &mut MemoryEmitter::new())
        .await
        .unwrap_err();
    assert!(format!("{:#}", err).contains("Lock-in 2"));
    assert_eq!(rig.source.calls().last().unwrap(), "disable");
    assert_eq!(rig.source.current(), 0.0);
}

#[tokio::test]
async fn test_invalid_parameters_rejected_at_startup() {
    let rig = MockRig::default();
    let mut sweep = sweep_on(
        &rig,
        SweepParameters {
            degrees_per_step: 0.0,
            ..params(9.0)
        },
    );

    let err = run_procedure(&mut sweep, &mut MemoryEmitter::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<SweepError>(),
        Some(SweepError::InvalidParameter(_))
    ));
    assert_eq!(rig.connections(), 0);
}
