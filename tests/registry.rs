mod common;

use std::sync::Arc;

use common::MockTransport;
use futures::future::join_all;
use tune_bridge::{
    registry::{Registry, SessionId},
    Error,
};

#[tokio::test]
async fn registered_transport_can_be_looked_up() {
    let registry = Registry::new();
    let transport = MockTransport::new();
    let session = SessionId::generate();

    registry.register(session.clone(), transport.handle()).await;

    let found = registry.lookup(session.as_str()).unwrap();
    assert!(Arc::ptr_eq(&found, &transport.handle()));
    assert_eq!(registry.len(), 1);
}

#[tokio::test]
async fn unknown_or_missing_ids_are_invalid_sessions() {
    let registry = Registry::new();
    registry.register("known".into(), MockTransport::new().handle()).await;

    assert!(matches!(registry.resolve(None), Err(Error::SessionInvalid)));
    assert!(matches!(registry.resolve(Some("")), Err(Error::SessionInvalid)));
    assert!(matches!(registry.resolve(Some("unknown")), Err(Error::SessionInvalid)));
    assert!(registry.resolve(Some("known")).is_ok());
    assert!(Error::SessionInvalid.requires_login());
}

#[tokio::test]
async fn replacing_an_entry_disconnects_the_old_transport() {
    let registry = Registry::new();
    let first = MockTransport::new();
    let second = MockTransport::new();

    registry.register("s".into(), first.handle()).await;
    registry.register("s".into(), second.handle()).await;

    assert_eq!(first.disconnects(), 1);
    assert_eq!(second.disconnects(), 0);
    assert!(Arc::ptr_eq(&registry.lookup("s").unwrap(), &second.handle()));
}

#[tokio::test]
async fn registering_the_same_handle_again_keeps_it_connected() {
    let registry = Registry::new();
    let transport = MockTransport::new();

    registry.register("s".into(), transport.handle()).await;
    registry.register("s".into(), transport.handle()).await;

    assert_eq!(transport.disconnects(), 0);
    assert_eq!(registry.len(), 1);
}

#[tokio::test]
async fn revoke_is_idempotent() {
    let registry = Registry::new();
    let transport = MockTransport::new();
    registry.register("s".into(), transport.handle()).await;

    assert!(registry.revoke("s").await);
    assert!(!registry.revoke("s").await);

    assert!(registry.lookup("s").is_none());
    assert!(registry.is_empty());
    assert_eq!(transport.disconnects(), 1);
}

#[tokio::test]
async fn clones_share_entries() {
    let registry = Registry::new();
    let clone = registry.clone();

    clone.register("s".into(), MockTransport::new().handle()).await;

    assert!(registry.lookup("s").is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_sessions_do_not_interfere() {
    let registry = Registry::new();
    let tasks = (0..32).map(|_| {
        let registry = registry.clone();
        tokio::spawn(async move {
            let session = SessionId::generate();
            let transport = MockTransport::new();
            registry.register(session.clone(), transport.handle()).await;
            assert!(registry.lookup(session.as_str()).is_some());
            assert!(registry.revoke(session.as_str()).await);
            assert_eq!(transport.disconnects(), 1);
        })
    });
    for result in join_all(tasks).await {
        result.unwrap();
    }

    assert!(registry.is_empty());
}

#[test]
fn generated_ids_are_unique() {
    let a = SessionId::generate();
    let b = SessionId::generate();
    assert_ne!(a, b);
    assert_eq!(a.as_str().len(), 36);
}
