//! Tick thread tests.
#![cfg(feature = "runtime")]

use std::time::Duration;

use twpc_rail::hal::{MockLines, SimBus};
use twpc_rail::services::{self, StationHandle};
use twpc_rail::{
    BusConfig, Config, DeviceConfig, FaultKind, HostCommand, HostError, HostReply, MasterEvent,
    RunnerError, Station, StationEvent,
};

const TIMEOUT: Duration = Duration::from_secs(20);

fn config() -> Config {
    Config::default().with_bus(BusConfig::default().with_fault_threshold(Some(16)))
}

fn spawn_layout(trains: usize) -> StationHandle<SimBus> {
    let config = config();
    let mut bus = SimBus::new(&config.bus);
    for _ in 0..trains {
        bus.attach(&DeviceConfig::default());
    }
    services::spawn(Station::new(&config, bus), Duration::ZERO).unwrap()
}

async fn wait_ready(handle: &StationHandle<SimBus>, id: u8) {
    tokio::time::timeout(TIMEOUT, async {
        loop {
            let ready = handle
                .with(move |s| s.master().table().get(id).is_some_and(|e| e.is_ready()))
                .await
                .unwrap();
            if ready {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("device never became ready");
}

#[tokio::test]
async fn commands_round_trip_through_the_tick_thread() {
    let handle = spawn_layout(0);
    assert!(handle.is_running());
    assert_eq!(handle.execute(HostCommand::LightOn).await, Ok(HostReply::On));
    assert_eq!(
        handle.execute(HostCommand::Identity { id: 9 }).await,
        Err(RunnerError::Host(HostError::NoDevice(9)))
    );

    let station = handle.stop().unwrap();
    assert!(station.ticks() > 0);
}

#[tokio::test]
async fn train_joins_and_shows_in_snapshot() {
    let handle = spawn_layout(1);
    wait_ready(&handle, 1).await;

    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.devices.len(), 1);
    assert_eq!(snapshot.devices[0].id, 1);
    assert_eq!(snapshot.devices[0].identity, *b"ASD");
    assert!(!snapshot.enumeration_enabled);
}

#[tokio::test]
async fn events_are_broadcast() {
    let handle = spawn_layout(1);
    wait_ready(&handle, 1).await;
    let mut events = handle.subscribe();

    handle.execute(HostCommand::Stop).await.unwrap();
    let sent = tokio::time::timeout(TIMEOUT, async {
        loop {
            if let StationEvent::Bus(MasterEvent::BroadcastSent { command, .. }) =
                events.recv().await.unwrap()
            {
                return command;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(sent, twpc_rail::Opcode::Stop as u8);
}

#[test]
fn blocking_calls_from_plain_threads() {
    let station = Station::new(&config(), MockLines::new());
    let handle = services::spawn(station, Duration::ZERO).unwrap();
    assert_eq!(
        handle.execute_blocking(HostCommand::EnableEnumeration),
        Ok(HostReply::Con)
    );
    let snapshot = handle.snapshot_blocking().unwrap();
    assert!(snapshot.enumeration_enabled);

    let ticks = handle.with_blocking(|s| s.ticks()).unwrap();
    std::thread::sleep(Duration::from_millis(10));
    let later = handle.with_blocking(|s| s.ticks()).unwrap();
    assert!(later > ticks);
}

#[tokio::test]
async fn faults_reach_subscribers() {
    let bus = BusConfig::default()
        .with_fault_threshold(Some(16))
        .with_initial_device(9);
    let config = Config::default().with_bus(bus);
    let handle = services::spawn(
        Station::new(&config, MockLines::new()),
        Duration::from_micros(200),
    )
    .unwrap();
    let mut events = handle.subscribe();

    let gone = tokio::time::timeout(TIMEOUT, async {
        loop {
            if let StationEvent::Bus(MasterEvent::Disconnected { id, fault }) =
                events.recv().await.unwrap()
            {
                return (id, fault);
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(gone, (9, Some(FaultKind::Sync)));

    let station = handle.stop().unwrap();
    assert_eq!(station.master().last_fault().map(|f| f.code()), Some(0x0100_0009));
}
