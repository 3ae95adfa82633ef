pub mod health;
pub mod ledger;
pub mod mode;
pub mod retry;
pub mod tasks;

use anyhow::Result;
use chrono::{DateTime, FixedOffset, Local, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use health::{DeviceHealth, HealthTracker};
pub use ledger::{DeviceRecord, Ledger, StandingProgress};
pub use mode::{Decision, DecisionRule, ModeDecisionEngine};
pub use retry::{Collaborator, RetryPolicy};
pub use tasks::{LoopTasks, TaskStatus};

use crate::domain::{
    BoostOrder, BoostPlan, BoostRequest, BoostTarget, BoostWindow, DeviceCommandSink, DeviceId,
    DeviceState, DeviceStateProvider, Mode, PartialFulfillment, PriceRegion,
    PriceScheduleProvider, PriceSlot, StandingBoost, Thresholds,
};
use crate::error::{OrderError, ProviderError};
use crate::optimizer::BoostScheduler;
use crate::repo::{PersistedState, StateStore};

#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub region: PriceRegion,
    pub poll_interval: StdDuration,
    pub boost_interval: StdDuration,
    /// Upper bound for one tick of either cadence
    pub tick_timeout: StdDuration,
    /// Upper bound for a single call to a collaborator
    pub call_timeout: StdDuration,
    pub failure_limit: u32,
    pub retry: RetryPolicy,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            region: PriceRegion::F,
            poll_interval: StdDuration::from_secs(60),
            boost_interval: StdDuration::from_secs(30 * 60),
            tick_timeout: StdDuration::from_secs(30),
            call_timeout: StdDuration::from_secs(10),
            failure_limit: 3,
            retry: RetryPolicy::default(),
        }
    }
}

/// A configured device and its static settings
#[derive(Debug, Clone)]
pub struct ManagedDevice {
    pub id: DeviceId,
    pub thresholds: Thresholds,
    pub standing_boost: Option<StandingBoost>,
    /// Lower values are decided first and claim site surplus first
    pub priority: u32,
    /// Power drawn in FAST mode, falls back to the scheduler's default rate
    pub fast_draw_kw: Option<f64>,
}

impl ManagedDevice {
    pub fn new(id: impl Into<String>, thresholds: Thresholds) -> Self {
        Self {
            id: DeviceId::new(id),
            thresholds,
            standing_boost: None,
            priority: 0,
            fast_draw_kw: None,
        }
    }

    pub fn with_standing_boost(mut self, standing: StandingBoost) -> Self {
        self.standing_boost = Some(standing);
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_fast_draw(mut self, kw: f64) -> Self {
        self.fast_draw_kw = Some(kw);
        self
    }
}

#[derive(Clone)]
pub struct Collaborators {
    pub states: Arc<dyn DeviceStateProvider>,
    pub commands: Arc<dyn DeviceCommandSink>,
    pub prices: Arc<dyn PriceScheduleProvider>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PollReport {
    pub synced: Vec<DeviceId>,
    pub stale: Vec<DeviceId>,
    pub newly_failed: Vec<DeviceId>,
    pub commands: Vec<(DeviceId, Mode)>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BoostReport {
    pub plans: BTreeMap<DeviceId, BoostPlan>,
    /// Devices whose installed windows changed
    pub updated: Vec<DeviceId>,
    /// On-demand requests dropped because their completion time passed
    pub expired: Vec<DeviceId>,
    pub errors: BTreeMap<DeviceId, String>,
}

#[derive(Debug)]
pub struct RunOnceReport {
    pub poll: Result<PollReport, ProviderError>,
    pub boost: Result<BoostReport, ProviderError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoopStatus {
    pub devices: BTreeMap<DeviceId, DeviceRecord>,
    pub pending: BTreeMap<DeviceId, BoostRequest>,
    pub tasks: LoopTasks,
    /// Collaborators whose credentials were rejected, with the reason
    pub disabled: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum RequestSource {
    OnDemand,
    Standing,
}

#[derive(Debug, Clone)]
struct BoostWork {
    device: DeviceId,
    request: BoostRequest,
    source: RequestSource,
    installed: Vec<BoostWindow>,
}

/// Drives the mode and boost cadences for every configured device.
///
/// The two cadences may overlap each other but never themselves. Both share the ledger,
/// which is only locked for bookkeeping and never across a collaborator call.
pub struct ControlLoop {
    collaborators: Collaborators,
    engine: ModeDecisionEngine,
    scheduler: BoostScheduler,
    settings: LoopSettings,
    devices: BTreeMap<DeviceId, ManagedDevice>,
    /// Device ids by ascending priority, then id
    decision_order: Vec<DeviceId>,
    state_guard: Collaborator,
    price_guard: Collaborator,
    command_guard: Collaborator,
    ledger: Mutex<Ledger>,
    store: Option<Arc<dyn StateStore>>,
    state_gate: Mutex<()>,
    boost_gate: Mutex<()>,
    tasks: parking_lot::Mutex<LoopTasks>,
}

impl ControlLoop {
    pub fn new(
        collaborators: Collaborators,
        engine: ModeDecisionEngine,
        scheduler: BoostScheduler,
        settings: LoopSettings,
        devices: Vec<ManagedDevice>,
    ) -> Self {
        let devices: BTreeMap<DeviceId, ManagedDevice> =
            devices.into_iter().map(|d| (d.id.clone(), d)).collect();
        let mut decision_order: Vec<&ManagedDevice> = devices.values().collect();
        decision_order.sort_by_key(|d| d.priority);
        let decision_order = decision_order.into_iter().map(|d| d.id.clone()).collect();
        let ledger = Ledger {
            devices: devices
                .keys()
                .map(|id| (id.clone(), DeviceRecord::default()))
                .collect(),
            pending: BTreeMap::new(),
        };

        Self {
            state_guard: Collaborator::new("device-state", settings.call_timeout, settings.retry),
            price_guard: Collaborator::new("prices", settings.call_timeout, settings.retry),
            command_guard: Collaborator::new("commands", settings.call_timeout, settings.retry),
            collaborators,
            engine,
            scheduler,
            settings,
            devices,
            decision_order,
            ledger: Mutex::new(ledger),
            store: None,
            state_gate: Mutex::new(()),
            boost_gate: Mutex::new(()),
            tasks: parking_lot::Mutex::new(LoopTasks::default()),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn settings(&self) -> &LoopSettings {
        &self.settings
    }

    pub fn is_managed(&self, device: &DeviceId) -> bool {
        self.devices.contains_key(device)
    }

    /// Load the saved ledger; records of devices no longer configured are dropped
    pub async fn restore(&self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let saved = store.load().await?;
        let mut ledger = self.ledger.lock().await;
        for (id, record) in saved.devices {
            match ledger.devices.get_mut(&id) {
                Some(slot) => *slot = record,
                None => debug!(device = %id, "dropping saved state of unconfigured device"),
            }
        }
        for (id, request) in saved.pending {
            if self.devices.contains_key(&id) {
                ledger.pending.insert(id, request);
            }
        }
        Ok(())
    }

    pub async fn persist(&self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let snapshot = {
            let ledger = self.ledger.lock().await;
            PersistedState {
                saved_at: Some(Utc::now()),
                devices: ledger.devices.clone(),
                pending: ledger.pending.clone(),
            }
        };
        store.save(&snapshot).await
    }

    async fn persist_logged(&self) {
        if let Err(e) = self.persist().await {
            error!(error = %e, "failed to persist controller state");
        }
    }

    /// One mode tick bounded by the tick timeout, recorded in the task status
    pub async fn state_tick(&self) -> Result<PollReport, ProviderError> {
        let fetched = AtomicBool::new(false);
        let (report, outcome) =
            match tokio::time::timeout(self.settings.tick_timeout, self.poll(&fetched)).await {
                Ok(polled) => polled,
                Err(_) => {
                    let e = ProviderError::Timeout(self.settings.tick_timeout);
                    let mut report = PollReport::default();
                    // The snapshot never arrived, which counts as a failed poll
                    if !fetched.load(Ordering::SeqCst) {
                        let mut ledger = self.ledger.lock().await;
                        for (id, record) in ledger.devices.iter_mut() {
                            self.record_poll_failure(id, record, e.to_string(), &mut report);
                        }
                    }
                    (report, Err(e))
                }
            };

        let newly_failed = !report.newly_failed.is_empty();
        let result = outcome.map(|()| report);
        {
            let mut tasks = self.tasks.lock();
            match &result {
                Ok(_) => tasks.state_poll.record_success(Utc::now()),
                Err(e) => tasks.state_poll.record_error(Utc::now(), e),
            }
        }
        if newly_failed {
            self.persist_logged().await;
        }
        result
    }

    /// One boost pass bounded by the tick timeout, recorded in the task status
    pub async fn boost_tick(&self) -> Result<BoostReport, ProviderError> {
        let now = Local::now().fixed_offset();
        let result =
            match tokio::time::timeout(self.settings.tick_timeout, self.reschedule_at(now)).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout(self.settings.tick_timeout)),
            };

        {
            let mut tasks = self.tasks.lock();
            match &result {
                Ok(_) => tasks.boost_schedule.record_success(Utc::now()),
                Err(e) => tasks.boost_schedule.record_error(Utc::now(), e),
            }
        }
        self.persist_logged().await;
        result
    }

    /// Poll device state, update health and issue mode changes. The report is
    /// returned even when the fetch failed so health transitions are not lost.
    async fn poll(&self, fetched: &AtomicBool) -> (PollReport, Result<(), ProviderError>) {
        let _gate = self.state_gate.lock().await;
        let snapshot = self
            .state_guard
            .call(|| self.collaborators.states.fetch())
            .await;
        fetched.store(true, Ordering::SeqCst);

        let now = Utc::now();
        let mut report = PollReport::default();
        let mut commands = Vec::new();
        {
            let mut ledger = self.ledger.lock().await;
            match &snapshot {
                Err(e) => {
                    for (id, record) in ledger.devices.iter_mut() {
                        self.record_poll_failure(id, record, e.to_string(), &mut report);
                    }
                }
                Ok(states) => {
                    let mut by_id: HashMap<&DeviceId, &DeviceState> =
                        states.iter().map(|s| (&s.device_id, s)).collect();
                    // Surplus taken by devices switched to FAST earlier in this tick,
                    // not yet visible in the readings
                    let mut claimed_w = 0.0;
                    for id in &self.decision_order {
                        let Some(record) = ledger.devices.get_mut(id) else {
                            continue;
                        };
                        let Some(state) = by_id.remove(id) else {
                            self.record_poll_failure(
                                id,
                                record,
                                "device missing from snapshot".to_string(),
                                &mut report,
                            );
                            continue;
                        };
                        record.last_state = Some(state.clone());
                        record.last_seen = Some(now);
                        if record.health.record_success() == DeviceHealth::Failed {
                            debug!(device = %id, "device is FAILED, not commanding");
                            continue;
                        }
                        record.last_error = None;
                        report.synced.push(id.clone());

                        let mut available = state.clone();
                        available.surplus_w -= claimed_w;
                        if let Some(mode) = self.next_mode(id, &available, record) {
                            if mode == Mode::Fast && state.current_mode != Mode::Fast {
                                claimed_w += self.fast_draw_w(id);
                            }
                            commands.push((id.clone(), mode));
                        }
                    }
                    for id in by_id.keys() {
                        debug!(device = %id, "ignoring unconfigured device");
                    }
                }
            }
        }

        for (id, mode) in commands {
            let result = self
                .command_guard
                .command(|| self.collaborators.commands.set_mode(&id, mode))
                .await;
            let mut ledger = self.ledger.lock().await;
            let Some(record) = ledger.devices.get_mut(&id) else {
                continue;
            };
            match result {
                Ok(()) => {
                    info!(device = %id, %mode, "mode applied");
                    record.last_applied = Some(mode);
                    report.commands.push((id, mode));
                }
                Err(e) => {
                    warn!(device = %id, %mode, error = %e, "mode change failed");
                    record.last_error = Some(e.to_string());
                }
            }
        }

        (report, snapshot.map(|_| ()))
    }

    fn record_poll_failure(
        &self,
        id: &DeviceId,
        record: &mut DeviceRecord,
        reason: String,
        report: &mut PollReport,
    ) {
        let before = record.health();
        let after = record.health.record_failure(self.settings.failure_limit);
        if after == DeviceHealth::Failed && before != DeviceHealth::Failed {
            error!(
                device = %id,
                failures = record.health.consecutive_failures,
                reason = %reason,
                "device marked FAILED, commands suspended until reset"
            );
            report.newly_failed.push(id.clone());
        } else if after != DeviceHealth::Failed {
            warn!(
                device = %id,
                health = %after,
                failures = record.health.consecutive_failures,
                reason = %reason,
                "poll failed"
            );
            report.stale.push(id.clone());
        }
        record.last_error = Some(reason);
    }

    fn fast_draw_w(&self, id: &DeviceId) -> f64 {
        let kw = self
            .devices
            .get(id)
            .and_then(|d| d.fast_draw_kw)
            .unwrap_or(self.scheduler.constraints.default_rate_kw);
        kw * 1000.0
    }

    /// Mode to command, if it differs from what was last applied
    fn next_mode(&self, id: &DeviceId, state: &DeviceState, record: &mut DeviceRecord) -> Option<Mode> {
        let device = self.devices.get(id)?;
        let decision = self.engine.evaluate(state, &device.thresholds);
        let last_applied = *record.last_applied.get_or_insert(state.current_mode);
        debug!(
            device = %id,
            reported = %state.current_mode,
            decided = %decision.mode,
            rule = ?decision.rule,
            surplus_w = state.surplus_w,
            soc_percent = ?state.soc_percent,
            "mode decision"
        );

        // A running boost window is only interrupted to protect the battery
        if state.current_mode == Mode::Boost {
            return (decision.mode == Mode::Stop).then_some(Mode::Stop);
        }
        (decision.mode != last_applied).then_some(decision.mode)
    }

    pub async fn reschedule(&self) -> Result<BoostReport, ProviderError> {
        self.reschedule_at(Local::now().fixed_offset()).await
    }

    /// Plan boost windows for every device with a request and bring the installed
    /// windows in line with the plans
    pub async fn reschedule_at(&self, now: DateTime<FixedOffset>) -> Result<BoostReport, ProviderError> {
        let _gate = self.boost_gate.lock().await;
        let mut report = BoostReport::default();

        let work = {
            let mut ledger = self.ledger.lock().await;
            for (id, record) in ledger.devices.iter_mut() {
                let finished = record.prune_windows(now);
                if finished.is_empty() {
                    continue;
                }
                debug!(device = %id, pruned = finished.len(), "dropped finished boost windows");
                let Some(standing) = self.devices.get(id).and_then(|d| d.standing_boost) else {
                    continue;
                };
                for window in &finished {
                    if let Some(deadline) = standing.deadline_after(window.start) {
                        record.credit_standing(deadline, window.energy_kwh());
                    }
                }
            }

            let expired: Vec<DeviceId> = ledger
                .pending
                .iter()
                .filter(|(_, r)| r.complete_by.is_some_and(|t| t <= now))
                .map(|(id, _)| id.clone())
                .collect();
            for id in expired {
                ledger.pending.remove(&id);
                warn!(device = %id, "boost request expired before it could be applied");
                report.expired.push(id);
            }

            self.collect_work(&ledger, now)
        };
        if work.is_empty() {
            return Ok(report);
        }

        let slots = if work.iter().all(|w| w.request.is_noop()) {
            Vec::new()
        } else {
            self.price_guard
                .call(|| self.collaborators.prices.fetch(self.settings.region))
                .await?
        };
        debug!(slots = slots.len(), requests = work.len(), "rescheduling boosts");

        for item in work {
            let plan = self.plan_for_device(&slots, &item.request, &item.installed, now);
            if let Some(shortfall) = &plan.shortfall {
                warn!(
                    device = %item.device,
                    target_kwh = shortfall.target_kwh,
                    delivered_kwh = shortfall.delivered_kwh,
                    shortfall_kwh = shortfall.shortfall_kwh,
                    "boost target cannot be fully met by the available slots"
                );
            }

            match self.apply_plan(&item, &plan).await {
                Ok(changed) => {
                    let mut ledger = self.ledger.lock().await;
                    if let Some(record) = ledger.devices.get_mut(&item.device) {
                        record.last_plan = Some(plan.clone());
                        if item.source == RequestSource::OnDemand {
                            record.standing_paused_until =
                                self.standing_pause(&item.device, &item.request, &record.installed, now);
                        }
                    }
                    // A newer request may have arrived while commands were in flight
                    if item.source == RequestSource::OnDemand
                        && ledger.pending.get(&item.device) == Some(&item.request)
                    {
                        ledger.pending.remove(&item.device);
                    }
                    if changed {
                        info!(
                            device = %item.device,
                            windows = plan.windows.len(),
                            delivered_kwh = plan.delivered_kwh,
                            estimated_cost = plan.estimated_cost,
                            "boost windows updated"
                        );
                        report.updated.push(item.device.clone());
                    }
                    report.plans.insert(item.device, plan);
                }
                Err(e) => {
                    warn!(device = %item.device, error = %e, "failed to apply boost plan");
                    let mut ledger = self.ledger.lock().await;
                    if let Some(record) = ledger.devices.get_mut(&item.device) {
                        record.last_error = Some(e.to_string());
                    }
                    report.errors.insert(item.device, e.to_string());
                }
            }
        }

        Ok(report)
    }

    /// On-demand requests take precedence over a device's standing boost
    fn collect_work(&self, ledger: &Ledger, now: DateTime<FixedOffset>) -> Vec<BoostWork> {
        let mut work = Vec::new();
        for (id, device) in &self.devices {
            let Some(record) = ledger.devices.get(id) else {
                continue;
            };
            let on_demand = ledger.pending.get(id);
            if !record.health.can_command() {
                if on_demand.is_some() || device.standing_boost.is_some() {
                    warn!(device = %id, "device is FAILED, boost deferred until reset");
                }
                continue;
            }

            if let Some(request) = on_demand {
                work.push(BoostWork {
                    device: id.clone(),
                    request: request.clone(),
                    source: RequestSource::OnDemand,
                    installed: record.installed.clone(),
                });
                continue;
            }

            let Some(standing) = &device.standing_boost else {
                continue;
            };
            if record.standing_paused_until.is_some_and(|t| now < t) {
                debug!(device = %id, "standing boost paused for an on-demand boost");
                continue;
            }
            let soc = record.last_state.as_ref().and_then(|s| s.soc_percent);
            let Some(mut request) = standing.resolve(now, &device.thresholds, soc) else {
                debug!(device = %id, "standing boost waiting for a vehicle SOC");
                continue;
            };
            // A SOC target already reflects energy delivered; an energy target does not
            if let (BoostTarget::EnergyKwh(_), Some(deadline)) = (standing.target, request.complete_by) {
                request.energy_target_kwh -= record.standing_delivered(deadline);
            }
            if request.is_noop() && (record.installed.is_empty() || !request.clear_existing) {
                debug!(device = %id, "standing boost already satisfied");
                continue;
            }
            work.push(BoostWork {
                device: id.clone(),
                source: RequestSource::Standing,
                request,
                installed: record.installed.clone(),
            });
        }
        work
    }

    /// Replacing keeps windows that are already charging and plans only the energy
    /// they will not deliver. Adding keeps every installed window and plans the full
    /// request around them.
    fn plan_for_device(
        &self,
        slots: &[PriceSlot],
        request: &BoostRequest,
        installed: &[BoostWindow],
        now: DateTime<FixedOffset>,
    ) -> BoostPlan {
        let kept: Vec<BoostWindow> = installed
            .iter()
            .filter(|w| w.end() > now)
            .filter(|w| !request.clear_existing || w.is_running(now))
            .cloned()
            .collect();
        if request.is_noop() || kept.is_empty() {
            return self.scheduler.schedule(slots, request, now);
        }
        if !request.clear_existing {
            return self.schedule_around(slots, request, &kept, now);
        }

        let target_kwh = request.energy_target_kwh;
        let committed_kwh: f64 = kept.iter().map(|w| w.remaining_energy_kwh(now)).sum();
        let remainder = BoostRequest {
            energy_target_kwh: target_kwh - committed_kwh,
            ..request.clone()
        };
        let mut plan = self.schedule_around(slots, &remainder, &kept, now);
        plan.windows.extend(kept);
        plan.windows.sort_by_key(|w| w.start);
        plan.delivered_kwh += committed_kwh;
        plan.replace_existing = true;
        let delivered_kwh = plan.delivered_kwh;
        plan.shortfall = plan.shortfall.map(|_| PartialFulfillment {
            target_kwh,
            delivered_kwh,
            shortfall_kwh: target_kwh - delivered_kwh,
        });
        plan
    }

    /// Plan into the slots and timers that `taken` leaves free
    fn schedule_around(
        &self,
        slots: &[PriceSlot],
        request: &BoostRequest,
        taken: &[BoostWindow],
        now: DateTime<FixedOffset>,
    ) -> BoostPlan {
        let free: Vec<PriceSlot> = slots
            .iter()
            .filter(|s| !taken.iter().any(|w| s.start < w.end() && w.start < s.end()))
            .cloned()
            .collect();
        let mut scheduler = self.scheduler.clone();
        scheduler.constraints.max_windows = scheduler
            .constraints
            .max_windows
            .map(|n| n.saturating_sub(taken.len()));
        scheduler.schedule(&free, request, now)
    }

    /// How long the standing boost should stay away after an on-demand request was
    /// applied: until its windows finish, or for the current cycle after a clear
    fn standing_pause(
        &self,
        device: &DeviceId,
        request: &BoostRequest,
        installed: &[BoostWindow],
        now: DateTime<FixedOffset>,
    ) -> Option<DateTime<FixedOffset>> {
        if let Some(last) = installed.iter().map(BoostWindow::end).max() {
            return Some(last);
        }
        if request.is_noop() {
            let standing = self.devices.get(device)?.standing_boost?;
            return standing.deadline_after(now);
        }
        None
    }

    /// Returns whether any command was issued. The ledger is updated after every
    /// acknowledged command so an interrupted pass never leaves it ahead of the device.
    async fn apply_plan(&self, item: &BoostWork, plan: &BoostPlan) -> Result<bool, ProviderError> {
        let device = &item.device;
        let sink = &self.collaborators.commands;

        if plan.replace_existing {
            let force_clear = item.request.is_noop();
            if !force_clear && plan.windows == item.installed {
                debug!(device = %device, "boost plan unchanged");
                return Ok(false);
            }
            // Clearing is only needed to drop a window; additions go on top
            let dropped = item.installed.iter().any(|w| !plan.windows.contains(w));
            if force_clear || dropped {
                self.command_guard
                    .command(|| sink.clear_windows(device))
                    .await?;
                self.set_installed(device, Vec::new()).await;
                if !plan.windows.is_empty() {
                    self.command_guard
                        .command(|| sink.install_windows(device, &plan.windows))
                        .await?;
                    self.set_installed(device, plan.windows.clone()).await;
                }
                return Ok(true);
            }
        }

        let added: Vec<BoostWindow> = plan
            .windows
            .iter()
            .filter(|w| !item.installed.contains(w))
            .cloned()
            .collect();
        if added.is_empty() {
            return Ok(false);
        }
        self.command_guard
            .command(|| sink.install_windows(device, &added))
            .await?;
        let mut all = item.installed.clone();
        all.extend(added);
        all.sort_by_key(|w| w.start);
        self.set_installed(device, all).await;
        Ok(true)
    }

    async fn set_installed(&self, device: &DeviceId, windows: Vec<BoostWindow>) {
        let mut ledger = self.ledger.lock().await;
        if let Some(record) = ledger.devices.get_mut(device) {
            record.installed = windows;
        }
    }

    /// Plan a request against current prices without commanding anything
    pub async fn plan(
        &self,
        device: &DeviceId,
        request: &BoostRequest,
        now: DateTime<FixedOffset>,
    ) -> Result<BoostPlan, ProviderError> {
        let installed = {
            let ledger = self.ledger.lock().await;
            ledger
                .devices
                .get(device)
                .map(|r| r.installed.clone())
                .unwrap_or_default()
        };
        let slots = if request.is_noop() {
            Vec::new()
        } else {
            self.price_guard
                .call(|| self.collaborators.prices.fetch(self.settings.region))
                .await?
        };
        Ok(self.plan_for_device(&slots, request, &installed, now))
    }

    /// Queue an on-demand boost for the next boost pass, replacing any queued one
    pub async fn set_request(&self, device: &DeviceId, request: BoostRequest) -> bool {
        if !self.is_managed(device) {
            return false;
        }
        info!(
            device = %device,
            energy_kwh = request.energy_target_kwh,
            complete_by = ?request.complete_by,
            clear_existing = request.clear_existing,
            "boost requested"
        );
        self.ledger
            .lock()
            .await
            .pending
            .insert(device.clone(), request);
        true
    }

    /// Resolve a user's order against the device's thresholds and last reported SOC
    pub async fn resolve_order(
        &self,
        device: &DeviceId,
        order: &BoostOrder,
        now: DateTime<FixedOffset>,
    ) -> Result<BoostRequest, OrderError> {
        let managed = self
            .devices
            .get(device)
            .ok_or_else(|| OrderError::UnknownDevice(device.clone()))?;
        let soc = {
            let ledger = self.ledger.lock().await;
            ledger
                .devices
                .get(device)
                .and_then(|r| r.last_state.as_ref())
                .and_then(|s| s.soc_percent)
        };
        order.resolve(now, &managed.thresholds, soc)
    }

    /// Administrative reset: FAILED back to UNKNOWN, collaborator auth latches cleared
    pub async fn reset_device(&self, device: &DeviceId) -> bool {
        {
            let mut ledger = self.ledger.lock().await;
            let Some(record) = ledger.devices.get_mut(device) else {
                return false;
            };
            info!(device = %device, previous = %record.health(), "device reset");
            record.reset();
        }
        for guard in [&self.state_guard, &self.price_guard, &self.command_guard] {
            guard.reset();
        }
        self.persist_logged().await;
        true
    }

    pub async fn status(&self) -> LoopStatus {
        let ledger = self.ledger.lock().await;
        let disabled = [&self.state_guard, &self.price_guard, &self.command_guard]
            .into_iter()
            .filter_map(|g| g.disabled_reason().map(|r| (g.name().to_string(), r)))
            .collect();
        LoopStatus {
            devices: ledger.devices.clone(),
            pending: ledger.pending.clone(),
            tasks: self.tasks.lock().clone(),
            disabled,
        }
    }

    /// Exactly one mode tick and one boost pass
    pub async fn run_once(&self) -> RunOnceReport {
        let poll = self.state_tick().await;
        let boost = self.boost_tick().await;
        RunOnceReport { poll, boost }
    }

    /// Run both cadences until `cancel` fires. In-flight ticks are allowed to finish
    /// within their timeout, then the ledger is persisted.
    pub async fn run_until(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            devices = self.devices.len(),
            poll_interval_s = self.settings.poll_interval.as_secs(),
            boost_interval_s = self.settings.boost_interval.as_secs(),
            "control loop started"
        );

        let state_task = {
            let this = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(this.settings.poll_interval);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = interval.tick() => {
                            if let Err(e) = this.state_tick().await {
                                warn!(error = %e, "state tick failed");
                            }
                        }
                    }
                }
            })
        };

        let boost_task = {
            let this = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(this.settings.boost_interval);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = interval.tick() => {
                            if let Err(e) = this.boost_tick().await {
                                warn!(error = %e, "boost tick failed");
                            }
                        }
                    }
                }
            })
        };

        let (state_result, boost_result) = tokio::join!(state_task, boost_task);
        for (name, result) in [("state", state_result), ("boost", boost_result)] {
            if let Err(e) = result {
                error!(task = name, error = %e, "control task aborted");
            }
        }

        self.persist_logged().await;
        info!("control loop stopped");
    }
}
