use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, trace, warn};

use crate::config::NodeConfig;
use crate::error::NodeError;
use crate::gossip::{PeerTable, SelfStatus};
use crate::markers::{Markers, OperatorCommand};
use crate::network::{AliasManager, IpAliasManager};
use crate::power::PowerMonitor;
use crate::process::{
    Checkpointer, CriuCheckpointer, ProcessController, ProcessHost, SystemProcessHost,
};
use crate::selector::NodeSelector;
use crate::state_machine::{
    LifecycleState, NodeState, ProcessRecord, StateMachine, Transition, Trigger,
};
use crate::transfer::{
    ArtifactTransporter, ScpTransporter, TransferChannel, TransferOutcome, TransferRecord,
};

/// The orchestrator wired to the real system.
pub type SystemOrchestrator =
    NodeOrchestrator<CriuCheckpointer, SystemProcessHost, IpAliasManager, ScpTransporter>;

/// Owns the node state and drives the workload through it.
///
/// Everything happens on one task: each [`tick`](Self::tick) samples power,
/// evaluates triggers and then acts for the current state. The migration
/// pipeline runs inside a tick and blocks it until done.
pub struct NodeOrchestrator<C, H, N, T> {
    power: PowerMonitor,
    migrate_threshold: f64,
    shutdown_threshold: f64,
    controller: ProcessController<C, H, N>,
    channel: TransferChannel<T>,
    selector: NodeSelector,
    markers: Markers,
    status: watch::Sender<SelfStatus>,
    state: NodeState,
    record: Option<ProcessRecord>,
    tick_interval: Duration,
}

impl SystemOrchestrator {
    pub fn from_config(
        config: &NodeConfig,
        peers: watch::Receiver<PeerTable>,
        status: watch::Sender<SelfStatus>,
    ) -> Self {
        let controller = ProcessController::new(
            config.workload.clone(),
            CriuCheckpointer::default(),
            SystemProcessHost,
            IpAliasManager::new(&config.node.interface, config.workload.alias_prefix_len),
        );
        let markers = Markers::from_config(config);
        let channel = TransferChannel::new(
            ScpTransporter::from_config(&config.transfer),
            markers.handoff_path().to_path_buf(),
        );
        let selector = NodeSelector::new(peers, config.gossip.stale_after(), &config.selection);
        Self::new(
            config,
            PowerMonitor::from_config(&config.power),
            controller,
            channel,
            selector,
            status,
        )
    }
}

impl<C, H, N, T> NodeOrchestrator<C, H, N, T>
where
    C: Checkpointer,
    H: ProcessHost,
    N: AliasManager,
    T: ArtifactTransporter,
{
    pub fn new(
        config: &NodeConfig,
        power: PowerMonitor,
        controller: ProcessController<C, H, N>,
        channel: TransferChannel<T>,
        selector: NodeSelector,
        status: watch::Sender<SelfStatus>,
    ) -> Self {
        let manual = !power.is_enabled();
        status.send_modify(|s| {
            s.state = NodeState::Idle;
            s.manual = manual;
        });
        Self {
            power,
            migrate_threshold: config.power.migrate_threshold_volts,
            shutdown_threshold: config.power.shutdown_threshold_volts,
            controller,
            channel,
            selector,
            markers: Markers::from_config(config),
            status,
            state: NodeState::Idle,
            record: None,
            tick_interval: config.node.tick_interval(),
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> NodeState {
        self.state
    }

    #[cfg(test)]
    pub fn record(&self) -> Option<&ProcessRecord> {
        self.record.as_ref()
    }

    /// Tick until a fatal error.
    pub async fn run(&mut self) -> Result<(), NodeError> {
        info!("orchestrator running, state {}", self.state);
        loop {
            self.tick().await?;
            sleep(self.tick_interval).await;
        }
    }

    /// One pass of the control loop.
    pub async fn tick(&mut self) -> Result<(), NodeError> {
        let sample = self.power.sample();
        self.status.send_modify(|s| {
            s.voltage = sample.voltage;
            s.current = sample.current;
        });
        trace!("{:.3} V, state {}", sample.voltage, self.state);

        if matches!(self.state, NodeState::Idle | NodeState::Busy) {
            if let Some(trigger) = self.pending_trigger() {
                if trigger == Trigger::PowerCritical {
                    self.stop_workload().await?;
                }
                self.apply(trigger);
            }
        }

        match self.state {
            NodeState::Idle => self.on_idle().await?,
            NodeState::Busy => self.on_busy(),
            NodeState::Migrating => {
                self.migrate().await?;
                self.apply(Trigger::MigrationFinished);
            }
            NodeState::ShuttingDown => {
                if self.markers.take_command(OperatorCommand::ResumeIdle) {
                    self.apply(Trigger::ResumeIdleCommand);
                }
            }
        }
        Ok(())
    }

    /// Power loss first (critical before low), then the operator's migrate
    /// command. The command marker is left alone when power already decided.
    fn pending_trigger(&mut self) -> Option<Trigger> {
        if self.power.is_loss_of_power(self.shutdown_threshold) {
            warn!("power critical, shutting down without migrating");
            return Some(Trigger::PowerCritical);
        }
        if self.power.is_loss_of_power(self.migrate_threshold) {
            warn!("power low, migrating");
            return Some(Trigger::PowerLow);
        }
        if self.markers.take_command(OperatorCommand::Migrate) {
            self.status.send_modify(|s| s.migrate_requested = true);
            return Some(Trigger::MigrateCommand);
        }
        None
    }

    async fn on_idle(&mut self) -> Result<(), NodeError> {
        if let Some(kind) = self.markers.poll_work() {
            let mut record = ProcessRecord::new(self.controller.workload());
            self.controller.start(&mut record, kind).await?;
            self.record = Some(record);
            self.apply(Trigger::WorkloadStarted);
        } else if self.markers.take_command(OperatorCommand::Shutdown) {
            self.status.send_modify(|s| s.shutdown_requested = true);
            self.apply(Trigger::ShutdownCommand);
        }
        Ok(())
    }

    fn on_busy(&mut self) {
        let done = match self.record.as_mut() {
            Some(record) => {
                self.controller.refresh(record);
                record.lifecycle == LifecycleState::Completed
            }
            None => true,
        };
        if done {
            self.record = None;
            self.apply(Trigger::WorkloadCompleted);
        }
    }

    /// Kill the workload without a checkpoint and release its alias, so the
    /// node holds nothing once it leaves `ShuttingDown`.
    async fn stop_workload(&mut self) -> Result<(), NodeError> {
        let Some(mut record) = self.record.take() else {
            return Ok(());
        };
        self.controller.refresh(&mut record);
        if record.lifecycle == LifecycleState::Running {
            self.controller.terminate(&mut record)?;
            warn!("killed {record} without a checkpoint");
        }
        if let Err(e) = self
            .controller
            .aliases()
            .remove_alias(record.network_alias)
            .await
        {
            warn!("could not remove alias {}: {e}", record.network_alias);
        }
        Ok(())
    }

    /// Commit a transition and publish it right away, so peers see
    /// `MIGRATING` while the pipeline runs.
    fn apply(&mut self, trigger: Trigger) {
        let Transition::Next(next) = StateMachine::next(self.state, trigger) else {
            return;
        };
        info!("{} -> {next} ({trigger:?})", self.state);
        let previous = self.state;
        self.state = next;
        self.status.send_modify(|s| {
            s.state = next;
            if previous == NodeState::Migrating {
                s.migrate_requested = false;
            }
            if previous == NodeState::ShuttingDown {
                s.shutdown_requested = false;
            }
        });
    }

    /// Run the pipeline once and leave a timing report whatever the outcome.
    async fn migrate(&mut self) -> Result<(), NodeError> {
        let mut timing = TransferRecord::new();
        let result = self.migration_pipeline(&mut timing).await;
        if result.is_err() {
            timing.outcome = TransferOutcome::Failed;
        }

        match serde_json::to_string(&timing) {
            Ok(json) => debug!("migration record {json}"),
            Err(e) => warn!("could not serialise migration record: {e}"),
        }
        if let Err(e) = timing.write_report(self.markers.report_path()) {
            warn!(
                "could not write migration report {}: {e}",
                self.markers.report_path().display()
            );
        }
        result
    }

    /// dump, drop alias, pick a peer, then either hand off or save locally.
    /// The first failing step aborts the rest.
    async fn migration_pipeline(&mut self, timing: &mut TransferRecord) -> Result<(), NodeError> {
        let mut record = match self.record.take() {
            Some(record) => record,
            None => {
                info!("migrating without a tracked workload, looking for a live one");
                ProcessRecord::new(self.controller.workload())
            }
        };
        info!("migration {} of {}", timing.id, record.name);

        let started = Utc::now();
        self.controller.dump(&mut record).await?;
        timing.push("Dumping", started);

        let started = Utc::now();
        self.controller
            .aliases()
            .remove_alias(record.network_alias)
            .await?;
        timing.push("IP alias (rem)", started);

        let Some(target) = self.selector.select_target().await else {
            info!("no idle peer, keeping checkpoint for local resume");
            self.markers.write_resume_marker()?;
            timing.outcome = TransferOutcome::SavedLocally;
            return Ok(());
        };
        timing.target = Some(target);

        self.channel.send(&record, target, timing).await?;
        self.channel.send_completion_flag(target, timing).await?;

        let started = Utc::now();
        self.controller.delete_from_disk(&record).await?;
        timing.push("Deleting", started);

        timing.outcome = TransferOutcome::HandedOff;
        info!("{} handed off to {target}", record.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SelectionConfig;
    use crate::error::ProcessError;
    use crate::gossip::{MembershipTracker, StatusPacket};
    use crate::power::tests::ScriptedSensor;
    use crate::process::controller::tests::{
        CallLog, FakeAliases, FakeCheckpointer, FakeHost, calls, workload_in,
    };
    use crate::transfer::tests::FakeTransporter;
    use std::net::IpAddr;
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use std::time::Instant;
    use tempfile::TempDir;

    type TestOrchestrator =
        NodeOrchestrator<FakeCheckpointer, FakeHost, FakeAliases, FakeTransporter>;

    const LOCAL: IpAddr = IpAddr::V4(std::net::Ipv4Addr::new(10, 0, 0, 1));
    const PEER: IpAddr = IpAddr::V4(std::net::Ipv4Addr::new(10, 0, 0, 2));

    struct Node {
        tmp: TempDir,
        log: CallLog,
        transport: FakeTransporter,
        live_pid: Arc<Mutex<Option<u32>>>,
        peers: watch::Sender<PeerTable>,
        status: watch::Receiver<SelfStatus>,
        orchestrator: TestOrchestrator,
    }

    #[derive(Default)]
    struct Setup<'a> {
        dir: Option<TempDir>,
        volts: Option<&'a [f64]>,
        live_pid: Option<u32>,
        pid_on_launch: Option<u32>,
        fail_dump: bool,
    }

    fn config_in(dir: &Path) -> NodeConfig {
        let mut config = NodeConfig::default();
        config.node.state_dir = dir.to_path_buf();
        config.workload = workload_in(dir);
        config
    }

    fn node(setup: Setup<'_>) -> Node {
        let tmp = setup.dir.unwrap_or_else(|| TempDir::new().unwrap());
        let config = config_in(tmp.path());
        std::fs::create_dir_all(&config.workload.directory).unwrap();

        let power = match setup.volts {
            Some(volts) => PowerMonitor::new(Box::new(ScriptedSensor::volts(volts)), 5),
            None => PowerMonitor::disabled(),
        };
        let log = CallLog::default();
        let live_pid = Arc::new(Mutex::new(setup.live_pid));
        let controller = ProcessController::new(
            config.workload.clone(),
            FakeCheckpointer {
                log: log.clone(),
                fail_dump: setup.fail_dump,
            },
            FakeHost {
                log: log.clone(),
                live_pid: live_pid.clone(),
                pid_on_launch: setup.pid_on_launch,
            },
            FakeAliases {
                log: log.clone(),
                fail_add: false,
            },
        );
        let transport = FakeTransporter::default();
        let channel = TransferChannel::new(
            transport.clone(),
            Markers::from_config(&config).handoff_path().to_path_buf(),
        );
        let (peers, peers_rx) = watch::channel(PeerTable::default());
        let selection = SelectionConfig {
            confirm_liveness: false,
            ..Default::default()
        };
        let selector = NodeSelector::new(peers_rx, config.gossip.stale_after(), &selection);
        let (status_tx, status) = watch::channel(SelfStatus::new(LOCAL, false));

        let orchestrator =
            NodeOrchestrator::new(&config, power, controller, channel, selector, status_tx);
        Node {
            tmp,
            log,
            transport,
            live_pid,
            peers,
            status,
            orchestrator,
        }
    }

    impl Node {
        fn marker(&self, name: &str) -> std::path::PathBuf {
            self.tmp.path().join(name)
        }

        fn touch(&self, name: &str) {
            std::fs::write(self.marker(name), b"").unwrap();
        }

        fn workload_dir(&self) -> std::path::PathBuf {
            self.tmp.path().join("videoboard")
        }

        fn advertise_idle_peer(&self) {
            let mut tracker = MembershipTracker::new(LOCAL, 8, Duration::from_secs(10));
            tracker.observe(
                StatusPacket {
                    ip: Some(PEER),
                    state: Some(NodeState::Idle),
                    ..Default::default()
                },
                Instant::now(),
            );
            self.peers.send_replace(tracker.table().clone());
        }

        async fn ticks(&mut self, n: usize) {
            for _ in 0..n {
                self.orchestrator.tick().await.unwrap();
            }
        }

        fn transport_calls(&self) -> Vec<String> {
            self.transport.log.lock().unwrap().clone()
        }

        fn report(&self) -> String {
            std::fs::read_to_string(self.marker("migrate_stats.txt")).unwrap()
        }
    }

    #[tokio::test]
    async fn low_power_hands_workload_to_idle_peer() {
        let mut node = node(Setup {
            volts: Some(&[11.0]),
            live_pid: Some(300),
            ..Default::default()
        });
        node.advertise_idle_peer();

        node.ticks(4).await;
        assert_eq!(node.orchestrator.state(), NodeState::Idle);

        node.ticks(1).await;
        assert_eq!(node.orchestrator.state(), NodeState::ShuttingDown);

        assert_eq!(calls(&node.log), ["dump 300", "alias del 192.168.137.3"]);
        let workload = node.workload_dir();
        assert_eq!(
            node.transport_calls(),
            [
                format!("copy {} 10.0.0.2 {}", workload.display(), node.tmp.path().display()),
                format!("marker 10.0.0.2 {}", node.marker("cpflag.txt").display()),
            ]
        );
        assert!(!workload.exists());
        assert!(node.orchestrator.record().is_none());
        assert!(!node.marker("resume_on_boot.txt").exists());

        let report = node.report();
        assert!(report.contains("(10.0.0.2)"));
        assert!(report.contains("HandedOff"));
        for step in ["Dumping", "IP alias (rem)", "Transfer", "Finish flag", "Deleting"] {
            assert!(report.contains(step), "missing {step} in report");
        }
        assert_eq!(node.status.borrow().state, NodeState::ShuttingDown);
    }

    #[tokio::test]
    async fn no_peer_saves_checkpoint_locally() {
        let mut node = node(Setup {
            volts: Some(&[11.0]),
            live_pid: Some(300),
            ..Default::default()
        });

        node.ticks(5).await;

        assert_eq!(node.orchestrator.state(), NodeState::ShuttingDown);
        assert_eq!(calls(&node.log), ["dump 300", "alias del 192.168.137.3"]);
        assert!(node.transport_calls().is_empty());
        assert!(node.marker("resume_on_boot.txt").exists());
        assert!(node.workload_dir().join("checkpoint/pages-1.img").exists());
        assert!(node.report().contains("(local)"));
    }

    #[tokio::test]
    async fn local_checkpoint_is_restored_after_restart() {
        let mut first = node(Setup {
            volts: Some(&[11.0]),
            live_pid: Some(300),
            ..Default::default()
        });
        first.ticks(5).await;
        assert_eq!(first.orchestrator.state(), NodeState::ShuttingDown);

        // Same disk, new process.
        let Node { tmp, .. } = first;
        let mut second = node(Setup {
            dir: Some(tmp),
            live_pid: Some(301),
            ..Default::default()
        });
        second.ticks(1).await;

        assert_eq!(second.orchestrator.state(), NodeState::Busy);
        assert_eq!(calls(&second.log), ["alias add 192.168.137.3", "restore"]);
        assert!(second.transport_calls().is_empty());
        assert!(!second.marker("resume_on_boot.txt").exists());
        let record = second.orchestrator.record().unwrap();
        assert_eq!(record.lifecycle, LifecycleState::Running);
        assert_eq!(record.pid, Some(301));
    }

    #[tokio::test]
    async fn failed_dump_keeps_alias_and_is_fatal() {
        let mut node = node(Setup {
            volts: Some(&[11.0]),
            live_pid: Some(300),
            fail_dump: true,
            ..Default::default()
        });
        node.advertise_idle_peer();
        node.ticks(4).await;

        let err = node.orchestrator.tick().await.unwrap_err();

        assert!(matches!(
            err,
            NodeError::Process(ProcessError::Checkpoint { action: "dump", .. })
        ));
        assert_eq!(calls(&node.log), ["dump 300"]);
        assert!(node.transport_calls().is_empty());
        assert_eq!(node.orchestrator.state(), NodeState::Migrating);
        assert!(node.report().contains("Failed"));
    }

    #[tokio::test]
    async fn critical_power_skips_migration() {
        let mut node = node(Setup {
            volts: Some(&[3.0]),
            live_pid: Some(300),
            ..Default::default()
        });
        node.ticks(5).await;

        assert_eq!(node.orchestrator.state(), NodeState::ShuttingDown);
        assert!(calls(&node.log).is_empty());
        assert!(!node.marker("migrate_stats.txt").exists());
    }

    #[tokio::test]
    async fn critical_power_while_busy_kills_workload_before_new_work() {
        let mut node = node(Setup {
            pid_on_launch: Some(55),
            ..Default::default()
        });
        node.touch("startflag.txt");
        node.ticks(1).await;
        assert_eq!(node.orchestrator.state(), NodeState::Busy);

        node.orchestrator.power = PowerMonitor::new(Box::new(ScriptedSensor::volts(&[3.0])), 5);
        node.ticks(5).await;
        assert_eq!(node.orchestrator.state(), NodeState::ShuttingDown);
        assert!(node.orchestrator.record().is_none());
        assert!(node.live_pid.lock().unwrap().is_none());
        assert!(!node.marker("migrate_stats.txt").exists());

        node.orchestrator.power = PowerMonitor::disabled();
        node.touch("force_idle.txt");
        node.ticks(1).await;
        assert_eq!(node.orchestrator.state(), NodeState::Idle);
        assert_eq!(node.status.borrow().state, NodeState::Idle);

        node.touch("startflag.txt");
        node.ticks(1).await;
        assert_eq!(node.orchestrator.state(), NodeState::Busy);
        assert_eq!(
            calls(&node.log),
            [
                "alias add 192.168.137.3",
                "launch",
                "kill 55",
                "alias del 192.168.137.3",
                "alias add 192.168.137.3",
                "launch",
            ]
        );
    }

    #[tokio::test]
    async fn single_low_sample_does_not_migrate() {
        let mut node = node(Setup {
            volts: Some(&[14.0, 14.0, 14.0, 14.0, 9.0, 14.0]),
            live_pid: Some(300),
            ..Default::default()
        });
        node.ticks(10).await;
        assert_eq!(node.orchestrator.state(), NodeState::Idle);
    }

    #[tokio::test]
    async fn workload_runs_until_it_exits() {
        let mut node = node(Setup {
            pid_on_launch: Some(55),
            ..Default::default()
        });
        node.touch("startflag.txt");

        node.ticks(1).await;
        assert_eq!(node.orchestrator.state(), NodeState::Busy);
        assert_eq!(node.orchestrator.record().unwrap().pid, Some(55));
        assert_eq!(node.status.borrow().state, NodeState::Busy);

        node.ticks(3).await;
        assert_eq!(node.orchestrator.state(), NodeState::Busy);

        *node.live_pid.lock().unwrap() = None;
        node.ticks(1).await;
        assert_eq!(node.orchestrator.state(), NodeState::Idle);
        assert!(node.orchestrator.record().is_none());
    }

    #[tokio::test]
    async fn failed_start_is_fatal() {
        let mut node = node(Setup::default());
        node.touch("startflag.txt");

        let err = node.orchestrator.tick().await.unwrap_err();
        assert!(matches!(
            err,
            NodeError::Process(ProcessError::PidNotResolved { .. })
        ));
    }

    #[tokio::test]
    async fn operator_migrates_busy_node_without_sensing() {
        let mut node = node(Setup {
            pid_on_launch: Some(55),
            ..Default::default()
        });
        assert!(node.status.borrow().manual);
        node.advertise_idle_peer();
        node.touch("startflag.txt");
        node.ticks(1).await;
        assert_eq!(node.orchestrator.state(), NodeState::Busy);

        node.touch("force_migrate.txt");
        node.ticks(1).await;

        assert_eq!(node.orchestrator.state(), NodeState::ShuttingDown);
        assert_eq!(
            calls(&node.log),
            ["alias add 192.168.137.3", "launch", "dump 55", "alias del 192.168.137.3"]
        );
        assert_eq!(node.transport_calls().len(), 2);
        assert!(!node.marker("force_migrate.txt").exists());
        assert!(!node.status.borrow().migrate_requested);
    }

    #[tokio::test]
    async fn shutdown_and_resume_markers() {
        let mut node = node(Setup::default());

        node.touch("force_shutdown.txt");
        node.ticks(1).await;
        assert_eq!(node.orchestrator.state(), NodeState::ShuttingDown);
        assert!(node.status.borrow().shutdown_requested);

        // New work is not accepted while shut down.
        node.touch("startflag.txt");
        node.ticks(3).await;
        assert_eq!(node.orchestrator.state(), NodeState::ShuttingDown);
        assert!(calls(&node.log).is_empty());

        node.touch("force_idle.txt");
        node.ticks(1).await;
        assert_eq!(node.orchestrator.state(), NodeState::Idle);
        assert!(!node.status.borrow().shutdown_requested);
        assert!(!node.marker("force_idle.txt").exists());
    }

    #[tokio::test]
    async fn sensor_failure_never_triggers_migration() {
        let power = PowerMonitor::new(Box::new(ScriptedSensor::new(&[None])), 5);
        let mut node = node(Setup {
            live_pid: Some(300),
            ..Default::default()
        });
        node.orchestrator.power = power;

        node.ticks(10).await;

        assert_eq!(node.orchestrator.state(), NodeState::Idle);
        assert_eq!(node.status.borrow().voltage, 0.0);
    }
}
