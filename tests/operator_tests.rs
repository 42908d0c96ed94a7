//! # Operator Tests
//!
//! Controller registration through the configuration service, readiness and
//! shutdown.

mod common;

use common::{
    configuration, engine_config, wait_until, MemoryStore, RecordingController, CONTROLLER,
    FINALIZER, NAMESPACE,
};
use operator_engine::config::{
    ConfigurationError, ControllerConfiguration, StaticConfigurationService,
};
use operator_engine::error::EngineError;
use operator_engine::operator::Operator;
use operator_engine::retry::RetryConfiguration;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_register_uses_configuration_service() {
    let operator = common::operator();
    let store = MemoryStore::new();
    let controller = Arc::new(RecordingController::new());

    let handler = operator
        .register(Arc::clone(&controller), Arc::clone(&store) as _)
        .await
        .unwrap()
        .expect("configuration found");

    assert_eq!(handler.controller_name(), CONTROLLER);
    assert_eq!(operator.controller_names(), vec![CONTROLLER.to_string()]);
    assert!(operator.is_ready());
    store.create_widget(NAMESPACE, "alpha", 1, &[FINALIZER]);
    wait_until("reconcile", || controller.reconciles() == 1).await;
}

#[tokio::test]
async fn test_missing_configuration_skips_controller() {
    let operator = Operator::new(Arc::new(StaticConfigurationService::new()), engine_config());
    let store = MemoryStore::new();

    let handler = operator
        .register(Arc::new(RecordingController::new()), Arc::clone(&store) as _)
        .await
        .unwrap();

    assert!(handler.is_none());
    assert!(operator.controller_names().is_empty());
    assert_eq!(store.watch_opens(), 0);
    assert!(!operator.is_ready());
}

#[tokio::test]
async fn test_invalid_configuration_is_rejected() {
    let operator = common::operator();
    let store = MemoryStore::new();
    let invalid = configuration().with_retry(RetryConfiguration {
        initial_interval: Duration::from_millis(100),
        multiplier: 2.0,
        max_interval: None,
        max_attempts: 0,
    });

    let result = operator
        .register_with_configuration(
            Arc::new(RecordingController::new()),
            invalid,
            Arc::clone(&store) as _,
        )
        .await;

    assert!(matches!(
        result,
        Err(EngineError::InvalidConfiguration(ConfigurationError::Retry { .. }))
    ));
    assert_eq!(store.watch_opens(), 0);
}

#[tokio::test]
async fn test_empty_finalizer_is_rejected() {
    let operator = common::operator();

    let result = operator
        .register_with_configuration(
            Arc::new(RecordingController::new()),
            ControllerConfiguration::new(CONTROLLER, common::CRD).with_finalizer(" "),
            MemoryStore::new() as _,
        )
        .await;

    assert!(matches!(
        result,
        Err(EngineError::InvalidConfiguration(ConfigurationError::EmptyFinalizer(_)))
    ));
}

#[tokio::test]
async fn test_engine_default_retry_applies() {
    let mut engine = engine_config();
    engine.retry_initial_interval_ms = 10;
    engine.retry_max_attempts = 2;
    let operator = Operator::new(Arc::new(StaticConfigurationService::new()), engine);
    let controller = Arc::new(RecordingController::new().always_failing());

    operator
        .register_with_configuration(
            Arc::clone(&controller),
            ControllerConfiguration::new(CONTROLLER, common::CRD).generation_aware(false),
            {
                let store = MemoryStore::new();
                store.create_widget(NAMESPACE, "alpha", 1, &[FINALIZER]);
                store as _
            },
        )
        .await
        .unwrap();

    wait_until("two attempts", || controller.reconciles() == 2).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(controller.reconciles(), 2);
}

#[tokio::test]
async fn test_close_stops_processing_and_clears_readiness() {
    let operator = common::operator();
    let store = MemoryStore::new();
    let controller = Arc::new(RecordingController::new());
    let handler = operator
        .register(Arc::clone(&controller), Arc::clone(&store) as _)
        .await
        .unwrap()
        .expect("configuration found");
    assert!(operator.server_state().is_ready.load(std::sync::atomic::Ordering::SeqCst));

    operator.close().await;

    assert!(!operator.is_ready());
    assert!(handler.is_closed());
    assert!(operator.controller_names().is_empty());
    let uid = store
        .create_widget(NAMESPACE, "alpha", 1, &[FINALIZER])
        .metadata
        .uid
        .unwrap();
    handler.handle(operator_engine::event::Event::Timer(
        operator_engine::event::TimerEvent {
            uid,
            source_name: "late".to_string(),
        },
    ));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(controller.reconciles(), 0);
}
