//! End-to-end runs of the control loop against the simulated site and tariff.

use chrono::Local;
use energy_diverter::controller::{
    Collaborators, ControlLoop, DeviceHealth, LoopSettings, ManagedDevice, ModeDecisionEngine,
    RetryPolicy,
};
use energy_diverter::domain::{BoostOrder, DeviceId, Mode, Thresholds};
use energy_diverter::hardware::{SimulatedSite, SiteCommand};
use energy_diverter::optimizer::{BoostScheduler, SchedulerConstraints};
use energy_diverter::prices::SimulatedPriceProvider;
use energy_diverter::repo::{FileStateStore, StateStore};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn zappi() -> DeviceId {
    DeviceId::new("zappi-1")
}

fn settings() -> LoopSettings {
    LoopSettings {
        retry: RetryPolicy {
            max_attempts: 1,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        },
        ..LoopSettings::default()
    }
}

fn build(site: Arc<SimulatedSite>, store: Arc<FileStateStore>) -> ControlLoop {
    ControlLoop::new(
        Collaborators {
            states: site.clone(),
            commands: site,
            prices: Arc::new(SimulatedPriceProvider::default()),
        },
        ModeDecisionEngine::new(500.0),
        BoostScheduler::new(SchedulerConstraints::default()),
        settings(),
        vec![ManagedDevice::new(
            "zappi-1",
            Thresholds {
                charge_below: Some(20.0),
                stop_at: Some(80.0),
                capacity_kwh: 40.0,
            },
        )],
    )
    .with_store(store)
}

fn site(soc: f64, surplus_w: f64) -> Arc<SimulatedSite> {
    Arc::new(SimulatedSite::new(42).with_device("zappi-1", 40.0, Some(soc), surplus_w))
}

#[tokio::test]
async fn test_surplus_switches_to_fast_once() {
    let dir = TempDir::new().unwrap();
    let site = site(50.0, 3000.0);
    let control = build(site.clone(), Arc::new(FileStateStore::new(dir.path().join("state.json"))));

    let report = control.state_tick().await.unwrap();
    assert_eq!(report.synced, vec![zappi()]);
    assert_eq!(report.commands, vec![(zappi(), Mode::Fast)]);
    assert_eq!(site.device(&zappi()).unwrap().mode, Mode::Fast);

    // same decision on the next tick, nothing re-sent
    let report = control.state_tick().await.unwrap();
    assert!(report.commands.is_empty());
    assert_eq!(site.commands().len(), 1);
}

#[tokio::test]
async fn test_failed_device_survives_restart_until_reset() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("state.json");
    let site = site(50.0, 3000.0);

    {
        let control = build(site.clone(), Arc::new(FileStateStore::new(&path)));
        site.inject_failures(3);
        for _ in 0..3 {
            assert!(control.state_tick().await.is_err());
        }
        let status = control.status().await;
        assert_eq!(status.devices[&zappi()].health(), DeviceHealth::Failed);
    }

    let saved = FileStateStore::new(&path).load().await.unwrap();
    assert_eq!(saved.devices[&zappi()].health(), DeviceHealth::Failed);

    let control = build(site.clone(), Arc::new(FileStateStore::new(&path)));
    control.restore().await.unwrap();

    // polls succeed again, but a FAILED device stays uncommanded
    let report = control.state_tick().await.unwrap();
    assert!(report.commands.is_empty());
    assert!(site.commands().is_empty());

    assert!(control.reset_device(&zappi()).await);
    let report = control.state_tick().await.unwrap();
    assert_eq!(report.synced, vec![zappi()]);
    assert_eq!(report.commands, vec![(zappi(), Mode::Fast)]);
    assert_eq!(
        control.status().await.devices[&zappi()].health(),
        DeviceHealth::Synced
    );
}

#[tokio::test]
async fn test_boost_order_installs_cheapest_windows() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("state.json");
    let site = site(50.0, 0.0);
    let control = build(site.clone(), Arc::new(FileStateStore::new(&path)));
    let now = Local::now().fixed_offset();

    let order = BoostOrder {
        energy_kwh: Some(5.0),
        rate_kw: Some(3.6),
        ..Default::default()
    };
    let request = control.resolve_order(&zappi(), &order, now).await.unwrap();
    let preview = control.plan(&zappi(), &request, now).await.unwrap();
    assert!(preview.is_fulfilled());
    assert!(site.commands().is_empty());

    assert!(control.set_request(&zappi(), request).await);
    let report = control.reschedule_at(now).await.unwrap();
    assert_eq!(report.updated, vec![zappi()]);
    assert_eq!(report.plans[&zappi()].windows, preview.windows);

    let installed: Vec<_> = site
        .commands()
        .into_iter()
        .filter(|c| matches!(c, SiteCommand::Install(..)))
        .collect();
    assert_eq!(installed.len(), 1);

    control.persist().await.unwrap();
    let saved = FileStateStore::new(&path).load().await.unwrap();
    assert!(saved.pending.is_empty());
    assert_eq!(saved.devices[&zappi()].installed, preview.windows);

    // a second pass has nothing left to do
    let report = control.reschedule_at(now).await.unwrap();
    assert!(report.updated.is_empty());
}

#[tokio::test]
async fn test_run_until_stops_on_cancel() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("state.json");
    let control = Arc::new(build(site(50.0, 1500.0), Arc::new(FileStateStore::new(&path))));

    let cancel = tokio_util::sync::CancellationToken::new();
    let task = tokio::spawn(control.clone().run_until(cancel.clone()));
    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();

    let status = control.status().await;
    assert!(status.tasks.state_poll.run_count >= 1);
    assert!(path.exists());
}
