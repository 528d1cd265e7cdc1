//! Shadow evaluation across registered versions, driven through the entity

use std::sync::Arc;

use machina::{
    ConsensusType, EntityConfig, EventSourcedFsm, MachineRegistry, State, StateMachine, Trigger,
    Version, VersionMetadata,
};

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

fn order_v2() -> StateMachine<OrderState, OrderTrigger> {
    let mut m = order_v1();
    m.configure(OrderState::Processing)
        .permit(OrderTrigger::Cancel, OrderState::Cancelled);
    m
}

async fn setup() -> (Arc<MachineRegistry>, Arc<machina::InMemoryEventLog>) {
    let registry = Arc::new(MachineRegistry::new());
    registry
        .register("Order", Version::new(1, 0, 0), order_v1, VersionMetadata::default())
        .await
        .unwrap();
    registry
        .register("Order", Version::new(1, 1, 0), order_v2, VersionMetadata::default())
        .await
        .unwrap();
    (registry, Arc::new(machina::InMemoryEventLog::new()))
}

#[tokio::test]
async fn test_shadow_divergence_between_versions() {
    let (registry, log) = setup().await;
    let mut entity: EventSourcedFsm<OrderState, OrderTrigger> =
        EventSourcedFsm::activate("order-1", "Order", registry, log, EntityConfig::default())
            .await
            .unwrap();

    // Activation binds the latest version; anchor the scenario at 1.0.0
    // semantics by comparing both versions explicitly
    entity.fire(OrderTrigger::Process).await.unwrap();
    assert_eq!(entity.state(), &OrderState::Processing);

    let comparison = entity
        .run_shadow(
            &OrderTrigger::Cancel,
            &[Version::new(1, 1, 0), Version::new(1, 0, 0)],
        )
        .await
        .unwrap();

    assert_eq!(comparison.consensus, ConsensusType::Mixed);
    assert!(comparison.has_divergent_behavior);
    assert!(comparison.consensus_prediction.is_none());
    assert_eq!(comparison.trigger, "Cancel");
    assert_eq!(comparison.current_state, OrderState::Processing);

    let old = comparison
        .results
        .iter()
        .find(|r| r.version == Version::new(1, 0, 0))
        .unwrap();
    assert!(!old.would_succeed);
    assert!(old.error.as_deref().unwrap().contains("not permitted"));

    let new = comparison
        .results
        .iter()
        .find(|r| r.version == Version::new(1, 1, 0))
        .unwrap();
    assert!(new.would_succeed);
    assert_eq!(new.predicted_state, Some(OrderState::Cancelled));

    // Shadow evaluation never mutates live state
    assert_eq!(entity.state(), &OrderState::Processing);
}

#[tokio::test]
async fn test_shadow_defaults_to_all_registered_versions() {
    let (registry, log) = setup().await;
    let mut entity: EventSourcedFsm<OrderState, OrderTrigger> =
        EventSourcedFsm::activate("order-1", "Order", registry, log, EntityConfig::default())
            .await
            .unwrap();
    entity.fire(OrderTrigger::Process).await.unwrap();

    let comparison = entity.run_shadow(&OrderTrigger::Cancel, &[]).await.unwrap();
    assert_eq!(comparison.results.len(), 2);
}

#[tokio::test]
async fn test_shadow_consensus_when_versions_agree() {
    let (registry, log) = setup().await;
    let entity: EventSourcedFsm<OrderState, OrderTrigger> =
        EventSourcedFsm::activate("order-1", "Order", registry, log, EntityConfig::default())
            .await
            .unwrap();

    let comparison = entity.run_shadow(&OrderTrigger::Process, &[]).await.unwrap();
    assert_eq!(comparison.consensus, ConsensusType::AllSuccess);
    assert_eq!(comparison.consensus_prediction, Some(OrderState::Processing));
    assert!(!comparison.has_divergent_behavior);
}
