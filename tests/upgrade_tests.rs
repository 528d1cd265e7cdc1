//! Live entity upgrades: compatibility gates, hooks, abort, and rollback

use std::sync::Arc;

use async_trait::async_trait;
use machina::{
    CompatibilityChecker, CompatibilityLevel, EntityConfig, EventLog, EventSourcedFsm,
    MachinaError, MachinaResult, MachineRegistry, MigrationContext, MigrationController,
    MigrationEventOutcome, MigrationHook, MigrationStrategy, State, StateMachine, Trigger,
    Version, VersionMetadata,
};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum OrderState {
    Pending,
    Processing,
    Shipped,
    Cancelled,
}

impl State for OrderState {
    fn name(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Processing => "Processing",
            Self::Shipped => "Shipped",
            Self::Cancelled => "Cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum OrderTrigger {
    Process,
    Ship,
    Cancel,
}

impl Trigger for OrderTrigger {
    fn name(&self) -> &'static str {
        match self {
            Self::Process => "Process",
            Self::Ship => "Ship",
            Self::Cancel => "Cancel",
        }
    }
}

fn order_v1() -> StateMachine<OrderState, OrderTrigger> {
    let mut m = StateMachine::new(OrderState::Pending);
    m.configure(OrderState::Pending)
        .permit(OrderTrigger::Process, OrderState::Processing);
    m.configure(OrderState::Processing)
        .permit(OrderTrigger::Ship, OrderState::Shipped);
    m
}

fn order_v1_1() -> StateMachine<OrderState, OrderTrigger> {
    let mut m = order_v1();
    m.configure(OrderState::Processing)
        .permit(OrderTrigger::Cancel, OrderState::Cancelled);
    m
}

struct Fixture {
    registry: Arc<MachineRegistry>,
    checker: Arc<CompatibilityChecker>,
    log: Arc<machina::InMemoryEventLog>,
}

async fn fixture() -> Fixture {
    let registry = Arc::new(MachineRegistry::new());
    registry
        .register("Order", Version::new(1, 0, 0), order_v1, VersionMetadata::default())
        .await
        .unwrap();
    registry
        .register(
            "Order",
            Version::new(1, 1, 0),
            order_v1_1,
            VersionMetadata::described("adds cancellation").with_feature("cancellation"),
        )
        .await
        .unwrap();
    Fixture {
        checker: Arc::new(CompatibilityChecker::new(registry.clone())),
        registry,
        log: Arc::new(machina::InMemoryEventLog::new()),
    }
}

/// Activate an entity pinned at 1.0.0: a fresh stream would bind the
/// latest registered version, so a snapshot simulates an entity created
/// before 1.1.0 shipped
async fn entity_at_v1(fx: &Fixture) -> EventSourcedFsm<OrderState, OrderTrigger> {
    fx.log
        .write_snapshot(
            "order-1",
            machina::StateSnapshot {
                state: "Pending".to_string(),
                seq: 0,
                fsm_version: Version::new(1, 0, 0),
                custom_state: None,
                taken_at: chrono::Utc::now(),
            },
        )
        .await
        .unwrap();
    EventSourcedFsm::activate(
        "order-1",
        "Order",
        fx.registry.clone(),
        fx.log.clone(),
        EntityConfig::default(),
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn test_minor_bump_upgrade_preserves_state() {
    let fx = fixture().await;
    let mut entity = entity_at_v1(&fx).await;
    assert_eq!(entity.version(), &Version::new(1, 0, 0));

    entity.fire(OrderTrigger::Process).await.unwrap();

    let result = fx
        .checker
        .check_compatibility::<OrderState, OrderTrigger>(
            "Order",
            &Version::new(1, 0, 0),
            &Version::new(1, 1, 0),
        )
        .await
        .unwrap();
    assert_eq!(result.level, CompatibilityLevel::BackwardCompatible);
    assert!(result.breaking_changes.is_empty());
    assert!(result.migration_path.is_none());
    assert!(result.is_compatible);

    let controller = MigrationController::new(fx.checker.clone(), fx.log.clone());
    let report = entity
        .upgrade_to(&controller, &Version::new(1, 1, 0), MigrationStrategy::Automatic)
        .await
        .unwrap();

    assert_eq!(report.outcome, MigrationEventOutcome::Committed);
    assert_eq!(entity.version(), &Version::new(1, 1, 0));
    assert_eq!(entity.state(), &OrderState::Processing);
    assert!(entity.can_fire(&OrderTrigger::Cancel));
}

struct VetoHook;

#[async_trait]
impl MigrationHook for VetoHook {
    fn name(&self) -> &str {
        "veto"
    }

    fn priority(&self) -> i32 {
        10
    }

    async fn before_migrate(&self, _ctx: &mut MigrationContext) -> MachinaResult<bool> {
        Ok(false)
    }
}

struct RollbackSpy {
    rollbacks: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl MigrationHook for RollbackSpy {
    fn name(&self) -> &str {
        "rollback-spy"
    }

    fn priority(&self) -> i32 {
        1
    }

    async fn on_rollback(&self, _ctx: &mut MigrationContext, cause: &MachinaError) {
        self.rollbacks.lock().await.push(cause.to_string());
    }
}

#[tokio::test]
async fn test_hook_abort_leaves_version_and_skips_rollback() {
    let fx = fixture().await;
    let mut entity = entity_at_v1(&fx).await;

    let rollbacks = Arc::new(Mutex::new(Vec::new()));
    let mut controller = MigrationController::new(fx.checker.clone(), fx.log.clone());
    controller.add_hook(Arc::new(RollbackSpy {
        rollbacks: rollbacks.clone(),
    }));
    controller.add_hook(Arc::new(VetoHook));

    let report = entity
        .upgrade_to(&controller, &Version::new(1, 1, 0), MigrationStrategy::Automatic)
        .await
        .unwrap();

    assert_eq!(report.outcome, MigrationEventOutcome::Aborted);
    assert_eq!(entity.version(), &Version::new(1, 0, 0));
    // An abort is not a rollback: no rollback hook ran
    assert!(rollbacks.lock().await.is_empty());

    // Exactly one migration event, outcome Aborted
    let events = fx.log.read("order-1", 0, 100).await.unwrap();
    let migrations: Vec<_> = events.iter().filter_map(|e| e.as_migration()).collect();
    assert_eq!(migrations.len(), 1);
    assert_eq!(migrations[0].outcome, MigrationEventOutcome::Aborted);
}

#[tokio::test]
async fn test_committed_migration_survives_replay() -> anyhow::Result<()> {
    let fx = fixture().await;
    let mut entity = entity_at_v1(&fx).await;
    entity.fire(OrderTrigger::Process).await?;

    let controller = MigrationController::new(fx.checker.clone(), fx.log.clone());
    entity
        .upgrade_to(&controller, &Version::new(1, 1, 0), MigrationStrategy::Automatic)
        .await?;
    drop(entity);

    // Reactivation replays the transition and the committed migration
    let replayed: EventSourcedFsm<OrderState, OrderTrigger> = EventSourcedFsm::activate(
        "order-1",
        "Order",
        fx.registry.clone(),
        fx.log.clone(),
        EntityConfig::default(),
    )
    .await?;
    assert_eq!(replayed.version(), &Version::new(1, 1, 0));
    assert_eq!(replayed.state(), &OrderState::Processing);
    assert!(replayed.can_fire(&OrderTrigger::Cancel));
    Ok(())
}

#[tokio::test]
async fn test_downgrade_rejected() {
    let fx = fixture().await;
    let log = fx.log.clone();
    // An entity already on 1.1.0
    let mut entity: EventSourcedFsm<OrderState, OrderTrigger> = EventSourcedFsm::activate(
        "order-2",
        "Order",
        fx.registry.clone(),
        log,
        EntityConfig::default(),
    )
    .await
    .unwrap();
    assert_eq!(entity.version(), &Version::new(1, 1, 0));

    let controller = MigrationController::new(fx.checker.clone(), fx.log.clone());
    let err = entity
        .upgrade_to(&controller, &Version::new(1, 0, 0), MigrationStrategy::Automatic)
        .await
        .unwrap_err();
    assert!(matches!(err, MachinaError::VersionIncompatible { .. }));
    assert_eq!(entity.version(), &Version::new(1, 1, 0));
}

#[tokio::test]
async fn test_dry_run_reports_and_restores() {
    let fx = fixture().await;
    let mut entity = entity_at_v1(&fx).await;

    let controller = MigrationController::new(fx.checker.clone(), fx.log.clone());
    let report = entity
        .upgrade_to(&controller, &Version::new(1, 1, 0), MigrationStrategy::DryRun)
        .await
        .unwrap();

    assert!(report.dry_run);
    assert_eq!(entity.version(), &Version::new(1, 0, 0));
    assert!(!entity.can_fire(&OrderTrigger::Cancel));
}
