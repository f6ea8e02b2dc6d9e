//! Coordination of every configured recorder.
//!
//! Operations fan out to all engines concurrently and wait for every result;
//! one slow or failing recorder never short-circuits the others.

use futures::future::join_all;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Mutex;

use takesync_core::{Clip, DeviceEndpoint, DeviceId, ReconcilePlan};

use super::{EngineSettings, RecorderEngine};
use crate::error::{DeviceFailure, SyncError};
use crate::events::{ErrorSource, EventBus, SyncEvent};
use crate::util;

/// Clip name for one recorder of a multi-recorder take.
pub fn device_take_name(base: &str, device: DeviceId) -> String {
    format!("{}_deck{}", base, device)
}

pub struct RecorderFleet {
    /// Reconcile takes this for writing, fan-outs for reading, so the
    /// endpoint set never changes under a running fan-out.
    engines: tokio::sync::RwLock<BTreeMap<DeviceId, RecorderEngine>>,
    settings: EngineSettings,
    events: EventBus,
    recording: Mutex<bool>,
}

impl RecorderFleet {
    pub fn new(settings: EngineSettings, events: EventBus) -> Self {
        RecorderFleet {
            engines: tokio::sync::RwLock::new(BTreeMap::new()),
            settings,
            events,
            recording: Mutex::new(false),
        }
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// True iff at least one recorder is connected.
    pub async fn has_devices(&self) -> bool {
        self.engines.read().await.values().any(|e| e.is_connected())
    }

    /// Aggregate recording flag of the fleet.
    pub fn is_recording(&self) -> bool {
        *util::lock(&self.recording)
    }

    pub async fn engine(&self, id: DeviceId) -> Option<RecorderEngine> {
        self.engines.read().await.get(&id).cloned()
    }

    pub async fn endpoints(&self) -> Vec<DeviceEndpoint> {
        self.engines
            .read()
            .await
            .values()
            .map(|e| e.endpoint().clone())
            .collect()
    }

    pub async fn connected_devices(&self) -> BTreeMap<DeviceId, bool> {
        self.engines
            .read()
            .await
            .iter()
            .map(|(id, e)| (*id, e.is_connected()))
            .collect()
    }

    pub async fn recording_devices(&self) -> BTreeMap<DeviceId, bool> {
        self.engines
            .read()
            .await
            .iter()
            .map(|(id, e)| (*id, e.is_recording()))
            .collect()
    }

    // -------------------------------------------------------------------------
    // Configuration
    // -------------------------------------------------------------------------

    /// Bring the engine set in line with `desired`.
    ///
    /// Removed or disabled endpoints are disconnected, moved endpoints are
    /// disconnected and reopened, and new enabled endpoints are connected.
    /// Engines whose first connect fails are kept, so a later
    /// [`connect_all`](Self::connect_all) retries them.
    pub async fn reconcile(&self, desired: &[DeviceEndpoint]) -> Result<(), SyncError> {
        let mut engines = self.engines.write().await;

        let current: Vec<DeviceEndpoint> =
            engines.values().map(|e| e.endpoint().clone()).collect();
        let plan = ReconcilePlan::compute(&current, desired);
        if plan.is_empty() {
            log::debug!("recorder configuration unchanged");
            return Ok(());
        }
        log::info!(
            "reconciling recorders: {} removed, {} moved, {} added",
            plan.remove.len(),
            plan.restart.len(),
            plan.add.len()
        );

        let mut retired = Vec::new();
        for id in &plan.remove {
            retired.extend(engines.remove(id));
        }
        for endpoint in &plan.restart {
            retired.extend(engines.remove(&endpoint.id));
        }
        join_all(retired.iter().map(|e| e.disconnect())).await;

        let mut fresh = Vec::new();
        for endpoint in plan.restart.into_iter().chain(plan.add) {
            let engine = RecorderEngine::new(endpoint, self.settings, self.events.clone());
            engines.insert(engine.id(), engine.clone());
            fresh.push(engine);
        }

        let results = fan_out(&fresh, |e| async move { e.connect().await }).await;
        self.collect(results, "connect")
    }

    // -------------------------------------------------------------------------
    // Fan-out
    // -------------------------------------------------------------------------

    pub async fn connect_all(&self) -> Result<(), SyncError> {
        let engines = self.engines.read().await;
        let targets: Vec<RecorderEngine> = engines.values().cloned().collect();
        let results = fan_out(&targets, |e| async move { e.connect().await }).await;
        self.collect(results, "connect")
    }

    pub async fn disconnect_all(&self) -> Result<(), SyncError> {
        let engines = self.engines.read().await;
        let targets: Vec<RecorderEngine> = engines.values().cloned().collect();
        let results = fan_out(&targets, |e| async move { e.disconnect().await }).await;
        self.set_recording(false);
        self.collect(results, "disconnect")
    }

    /// Start every targeted recorder, or none.
    ///
    /// `devices` defaults to every connected recorder. With a base `name`,
    /// each recorder gets its own clip name (see [`device_take_name`]). If
    /// any start fails, the recorders that did start are stopped again and
    /// the failures are returned as [`SyncError::PartialFailure`].
    pub async fn start_recording(
        &self,
        devices: Option<&[DeviceId]>,
        name: Option<&str>,
    ) -> Result<(), SyncError> {
        let engines = self.engines.read().await;
        let (targets, mut failures) = select_targets(&engines, devices, true);
        if targets.is_empty() && failures.is_empty() {
            log::warn!("no connected recorders to start");
            return Ok(());
        }

        let results = fan_out(&targets, |e| {
            let clip = name.map(|n| device_take_name(n, e.id()));
            async move { e.start_recording(clip.as_deref()).await }
        })
        .await;

        let mut started = Vec::new();
        for (id, result) in results {
            match result {
                Ok(()) => started.push(id),
                Err(cause) => failures.push(DeviceFailure { device: id, cause }),
            }
        }

        if failures.is_empty() {
            log::info!("{} recorder(s) recording", started.len());
            self.set_recording(true);
            return Ok(());
        }

        for failure in &failures {
            self.events.error(
                ErrorSource::Device(failure.device),
                "start recording",
                &failure.cause,
            );
        }

        let rollback: Vec<RecorderEngine> = targets
            .into_iter()
            .filter(|e| started.contains(&e.id()))
            .collect();
        if !rollback.is_empty() {
            log::warn!(
                "start failed on {} recorder(s), stopping {} that started",
                failures.len(),
                rollback.len()
            );
        }
        for (id, result) in fan_out(&rollback, |e| async move { rollback_stop(&e).await }).await {
            if let Err(e) = result {
                self.events.error(ErrorSource::Device(id), "rollback stop", e);
            }
        }
        self.set_recording(false);
        Err(SyncError::PartialFailure(failures))
    }

    /// Stop the targeted recorders (default: all). The fleet is marked as not
    /// recording even when some stops fail.
    pub async fn stop_recording(&self, devices: Option<&[DeviceId]>) -> Result<(), SyncError> {
        let engines = self.engines.read().await;
        let (targets, failures) = select_targets(&engines, devices, false);
        let results = fan_out(&targets, |e| async move { e.stop_recording().await }).await;
        self.set_recording(false);

        let outcome = self.collect(results, "stop recording");
        merge_failures(outcome, failures)
    }

    /// Refresh transport status on every connected recorder.
    pub async fn update_all_status(&self) -> Result<(), SyncError> {
        let engines = self.engines.read().await;
        let (targets, _) = select_targets(&engines, None, true);
        let results = fan_out(&targets, |e| async move {
            e.query_transport_status().await.map(|_| ())
        })
        .await;
        self.collect(results, "status update")
    }

    /// Clip lists of every connected recorder that answered.
    pub async fn list_all_clips(&self) -> BTreeMap<DeviceId, Vec<Clip>> {
        let engines = self.engines.read().await;
        let (targets, _) = select_targets(&engines, None, true);
        let results = fan_out(&targets, |e| async move { e.list_clips().await }).await;

        let mut clips = BTreeMap::new();
        for (id, result) in results {
            match result {
                Ok(list) => {
                    clips.insert(id, list);
                }
                Err(e) => log::warn!("recorder {}: cannot list clips: {}", id, e),
            }
        }
        clips
    }

    fn set_recording(&self, recording: bool) {
        let changed = {
            let mut flag = util::lock(&self.recording);
            std::mem::replace(&mut *flag, recording) != recording
        };
        if changed {
            self.events.emit(SyncEvent::FleetRecording { recording });
        }
    }

    /// Turn per-device results into one outcome, reporting every failure.
    fn collect(
        &self,
        results: Vec<(DeviceId, Result<(), SyncError>)>,
        operation: &str,
    ) -> Result<(), SyncError> {
        let failures: Vec<DeviceFailure> = results
            .into_iter()
            .filter_map(|(device, r)| r.err().map(|cause| DeviceFailure { device, cause }))
            .collect();
        if failures.is_empty() {
            return Ok(());
        }
        for failure in &failures {
            self.events
                .error(ErrorSource::Device(failure.device), operation, &failure.cause);
        }
        Err(SyncError::PartialFailure(failures))
    }
}

/// Run `op` on every engine concurrently and pair each result with its device.
async fn fan_out<T, F, Fut>(
    engines: &[RecorderEngine],
    op: F,
) -> Vec<(DeviceId, Result<T, SyncError>)>
where
    F: Fn(RecorderEngine) -> Fut,
    Fut: Future<Output = Result<T, SyncError>>,
{
    let ids: Vec<DeviceId> = engines.iter().map(|e| e.id()).collect();
    let results = join_all(engines.iter().cloned().map(op)).await;
    ids.into_iter().zip(results).collect()
}

/// Pick the engines for an operation. Unknown ids become failures.
fn select_targets(
    engines: &BTreeMap<DeviceId, RecorderEngine>,
    devices: Option<&[DeviceId]>,
    connected_only: bool,
) -> (Vec<RecorderEngine>, Vec<DeviceFailure>) {
    match devices {
        None => (
            engines
                .values()
                .filter(|e| !connected_only || e.is_connected())
                .cloned()
                .collect(),
            Vec::new(),
        ),
        Some(ids) => {
            let mut targets = Vec::new();
            let mut failures = Vec::new();
            for id in ids {
                match engines.get(id) {
                    Some(engine) => targets.push(engine.clone()),
                    None => failures.push(DeviceFailure {
                        device: *id,
                        cause: SyncError::NoSuchDevice(*id),
                    }),
                }
            }
            (targets, failures)
        }
    }
}

fn merge_failures(
    outcome: Result<(), SyncError>,
    mut extra: Vec<DeviceFailure>,
) -> Result<(), SyncError> {
    if extra.is_empty() {
        return outcome;
    }
    if let Err(SyncError::PartialFailure(failures)) = outcome {
        extra.extend(failures);
    }
    Err(SyncError::PartialFailure(extra))
}

/// Compensating stop with one reconnect-and-retry.
async fn rollback_stop(engine: &RecorderEngine) -> Result<(), SyncError> {
    match engine.stop_recording().await {
        Ok(()) => Ok(()),
        Err(first) => {
            log::warn!("{}: rollback stop failed ({}), reconnecting", engine.key(), first);
            engine.reconnect().await?;
            engine.stop_recording().await
        }
    }
}

#[cfg(all(test, feature = "emulator"))]
mod tests {
    use super::*;
    use crate::emulator::{unused_port, RecorderEmulator};
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    fn settings() -> EngineSettings {
        EngineSettings {
            command_timeout: Duration::from_millis(500),
            poll_interval: Duration::from_secs(60),
            max_poll_interval: Duration::from_secs(60),
            ..EngineSettings::default()
        }
    }

    async fn emulators(n: usize) -> Vec<RecorderEmulator> {
        let mut emus = Vec::new();
        for i in 0..n {
            emus.push(
                RecorderEmulator::start(&format!("Deck {}", i + 1))
                    .await
                    .unwrap(),
            );
        }
        emus
    }

    #[test]
    fn test_device_take_name() {
        assert_eq!(device_take_name("Take_007", 2), "Take_007_deck2");
    }

    #[tokio::test]
    async fn test_unreachable_recorder_is_reported_alone() {
        let emus = emulators(2).await;
        let dead = DeviceEndpoint::new(2, "127.0.0.1", unused_port().await);
        let fleet = RecorderFleet::new(settings(), EventBus::new());
        let mut rx = fleet.events.subscribe();

        let err = fleet
            .reconcile(&[emus[0].endpoint(1), dead, emus[1].endpoint(3)])
            .await
            .unwrap_err();
        assert_eq!(err.failed_devices(), vec![2]);

        let connected = fleet.connected_devices().await;
        assert_eq!(
            connected.into_iter().collect::<Vec<_>>(),
            vec![(1, true), (2, false), (3, true)]
        );
        assert!(fleet.has_devices().await);

        let reported: Vec<ErrorSource> = crate::events::testing::drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                SyncEvent::Error(report) => Some(report.source),
                _ => None,
            })
            .collect();
        assert_eq!(reported, vec![ErrorSource::Device(2)]);

        // The failed engine is kept and retried
        let err = fleet.connect_all().await.unwrap_err();
        assert_eq!(err.failed_devices(), vec![2]);
    }

    #[tokio::test]
    async fn test_start_uses_per_device_names() {
        let emus = emulators(2).await;
        let fleet = RecorderFleet::new(settings(), EventBus::new());
        fleet
            .reconcile(&[emus[0].endpoint(1), emus[1].endpoint(2)])
            .await
            .unwrap();

        assert_ok!(fleet.start_recording(None, Some("Take_007")).await);
        assert!(fleet.is_recording());
        assert_eq!(emus[0].clips(), vec!["Take_007_deck1.mov".to_string()]);
        assert_eq!(emus[1].clips(), vec!["Take_007_deck2.mov".to_string()]);

        assert_ok!(fleet.stop_recording(None).await);
        assert!(!fleet.is_recording());
        assert!(emus.iter().all(|e| !e.is_recording()));
        assert!(fleet.recording_devices().await.values().all(|r| !r));
    }

    #[tokio::test]
    async fn test_start_is_all_or_nothing() {
        let emus = emulators(3).await;
        emus[2].set_reject_record(true);
        let fleet = RecorderFleet::new(settings(), EventBus::new());
        fleet
            .reconcile(&[emus[0].endpoint(1), emus[1].endpoint(2), emus[2].endpoint(3)])
            .await
            .unwrap();

        let err = assert_err!(fleet.start_recording(None, Some("Take")).await);
        assert_eq!(err.failed_devices(), vec![3]);
        assert!(!fleet.is_recording());
        assert!(emus.iter().all(|e| !e.is_recording()));
        assert_eq!(emus[0].count("stop"), 1);
        assert_eq!(emus[1].count("stop"), 1);
        assert_eq!(emus[2].count("stop"), 0);
        assert!(fleet.recording_devices().await.values().all(|r| !r));
    }

    #[tokio::test]
    async fn test_explicit_targets() {
        let emus = emulators(2).await;
        let fleet = RecorderFleet::new(settings(), EventBus::new());
        fleet
            .reconcile(&[emus[0].endpoint(1), emus[1].endpoint(2)])
            .await
            .unwrap();

        fleet.start_recording(Some(&[2]), None).await.unwrap();
        assert!(!emus[0].is_recording());
        assert!(emus[1].is_recording());

        let err = fleet.start_recording(Some(&[9]), None).await.unwrap_err();
        assert!(matches!(
            &err,
            SyncError::PartialFailure(f) if matches!(f[0].cause, SyncError::NoSuchDevice(9))
        ));

        // Stop is unconditional on the fleet flag
        let err = fleet.stop_recording(Some(&[2, 9])).await.unwrap_err();
        assert_eq!(err.failed_devices(), vec![9]);
        assert!(!emus[1].is_recording());
        assert!(!fleet.is_recording());
    }

    #[tokio::test]
    async fn test_reconcile_remove_move_add() {
        let emus = emulators(4).await;
        let fleet = RecorderFleet::new(settings(), EventBus::new());
        fleet
            .reconcile(&[emus[0].endpoint(1), emus[1].endpoint(2)])
            .await
            .unwrap();
        let before = fleet.engine(2).await.unwrap();

        // Unchanged set: nothing reconnects
        fleet
            .reconcile(&[emus[0].endpoint(1), emus[1].endpoint(2)])
            .await
            .unwrap();
        assert_eq!(emus[0].count("notify"), 1);

        fleet
            .reconcile(&[
                emus[0].endpoint(1).disabled(),
                emus[2].endpoint(2),
                emus[3].endpoint(4),
            ])
            .await
            .unwrap();

        let ids: Vec<DeviceId> = fleet.endpoints().await.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![2, 4]);
        let moved = fleet.engine(2).await.unwrap();
        assert_eq!(moved.endpoint().port, emus[2].addr().port());
        assert!(moved.is_connected());
        assert!(!before.is_connected());
        assert_eq!(emus[2].count("notify"), 1);
        assert_eq!(emus[3].count("notify"), 1);
        assert!(fleet.engine(1).await.is_none());
    }

    #[tokio::test]
    async fn test_status_and_clips() {
        let emus = emulators(2).await;
        let fleet = RecorderFleet::new(settings(), EventBus::new());
        fleet
            .reconcile(&[emus[0].endpoint(1), emus[1].endpoint(2)])
            .await
            .unwrap();
        fleet.start_recording(None, Some("A")).await.unwrap();
        fleet.stop_recording(None).await.unwrap();

        fleet.update_all_status().await.unwrap();
        assert_eq!(emus[0].count("transport info"), 2);

        let clips = fleet.list_all_clips().await;
        assert_eq!(clips.len(), 2);
        assert_eq!(clips[&1][0].name, "A_deck1.mov");
        assert_eq!(clips[&2][0].name, "A_deck2.mov");

        fleet.disconnect_all().await.unwrap();
        assert!(!fleet.has_devices().await);
    }
}
