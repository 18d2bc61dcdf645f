//! Integration tests for the simulated instrument.

use iic_core::device::{DeviceCommand, DeviceInterface, DeviceOutcome, Phase};
use iic_core::error::DeviceErrorKind;
use iic_core::resource::ResourceName;
use iic_driver_mock::*;
use std::time::Duration;

async fn run_to_end(mock: &MockInstrument, command: &DeviceCommand) -> DeviceOutcome {
    let token = mock.dispatch(command).await.unwrap();
    loop {
        let outcome = mock.poll(&token).await;
        if outcome.is_final() {
            return outcome;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Lamp warm-up time comes from the command
#[tokio::test(start_paused = true)]
async fn test_lamp_warmup_takes_warming_time() {
    let mock = MockInstrument::realistic(TimingConfig::integration_only());
    let on = DeviceCommand::new(ResourceName::lamp("halogen"), "on").with_param("warmingTime", 15.0);

    let start = tokio::time::Instant::now();
    let outcome = run_to_end(&mock, &on).await;
    assert!(matches!(outcome, DeviceOutcome::Done(_)));
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(15) && elapsed < Duration::from_secs(16));
}

/// Silent resources never leave the busy phase
#[tokio::test(start_paused = true)]
async fn test_silent_resource_stays_busy() {
    let hexapod = ResourceName::hexapod(1);
    let mock = MockInstrument::instant().with_errors(ErrorConfig::scenario(ErrorScenario::Silence {
        resource: hexapod.clone(),
    }));
    let token = mock
        .dispatch(&DeviceCommand::new(hexapod.clone(), "home"))
        .await
        .unwrap();
    tokio::time::advance(Duration::from_secs(3600)).await;
    assert_eq!(mock.poll(&token).await, DeviceOutcome::InProgress(Phase::Busy));

    // stop() still brings it back to idle
    mock.stop(&hexapod).await.unwrap();
    match mock.poll(&token).await {
        DeviceOutcome::Error(e) => assert_eq!(e.kind, DeviceErrorKind::Stopped),
        other => panic!("unexpected outcome {other:?}"),
    }
}

/// Chaos mode with a fixed seed fails the same commands every run
#[tokio::test(start_paused = true)]
async fn test_chaos_is_reproducible() {
    async fn run() -> Vec<bool> {
        let mock = MockInstrument::new(MockMode::Chaos)
            .with_errors(ErrorConfig::random_failures_seeded(0.4, Some(2024)));
        let cmd = DeviceCommand::new(ResourceName::fps(), "home");
        let mut results = Vec::new();
        for _ in 0..20 {
            let outcome = run_to_end(&mock, &cmd).await;
            results.push(matches!(outcome, DeviceOutcome::Done(_)));
        }
        results
    }
    let first = run().await;
    assert_eq!(first, run().await);
    assert!(first.iter().any(|ok| !ok));
    assert!(first.iter().any(|ok| *ok));
}

/// The call log keeps dispatch order and timestamps
#[tokio::test(start_paused = true)]
async fn test_call_log_orders_dispatches() {
    let mock = MockInstrument::realistic(TimingConfig::integration_only());
    let b1 = DeviceCommand::new(ResourceName::arm("b1"), "expose").with_param("exptime", 5.0);
    let r1 = DeviceCommand::new(ResourceName::arm("r1"), "expose").with_param("exptime", 5.0);
    run_to_end(&mock, &b1).await;
    run_to_end(&mock, &r1).await;

    let b1_at = mock.dispatches(&ResourceName::arm("b1"), "expose");
    let r1_at = mock.dispatches(&ResourceName::arm("r1"), "expose");
    assert_eq!((b1_at.len(), r1_at.len()), (1, 1));
    assert!(r1_at[0] - b1_at[0] >= Duration::from_secs(5));
    assert_eq!(mock.in_flight(), 0);
}
