//! Unit tests for reconcile_helpers module

use super::*;
use crate::test_utils::create_test_machine;
use crds::MACHINE_FINALIZER;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

fn meta_with_finalizers(finalizers: &[&str]) -> ObjectMeta {
    ObjectMeta {
        finalizers: Some(finalizers.iter().map(|f| (*f).to_string()).collect()),
        ..Default::default()
    }
}

#[test]
fn test_add_finalizer_to_empty_list() {
    let mut meta = ObjectMeta::default();
    assert!(add_finalizer(&mut meta, MACHINE_FINALIZER));
    assert_eq!(meta.finalizers, Some(vec![MACHINE_FINALIZER.to_string()]));
}

#[test]
fn test_add_finalizer_is_idempotent() {
    let mut meta = meta_with_finalizers(&[MACHINE_FINALIZER]);
    assert!(!add_finalizer(&mut meta, MACHINE_FINALIZER));
    assert_eq!(meta.finalizers.as_ref().map(Vec::len), Some(1));
}

#[test]
fn test_add_finalizer_keeps_foreign_tokens() {
    let mut meta = meta_with_finalizers(&["foregroundDeletion"]);
    assert!(add_finalizer(&mut meta, MACHINE_FINALIZER));
    assert_eq!(
        meta.finalizers,
        Some(vec!["foregroundDeletion".to_string(), MACHINE_FINALIZER.to_string()])
    );
}

#[test]
fn test_remove_finalizer_preserves_others() {
    let mut meta = meta_with_finalizers(&[MACHINE_FINALIZER, "foregroundDeletion"]);
    assert!(remove_finalizer(&mut meta, MACHINE_FINALIZER));
    assert_eq!(meta.finalizers, Some(vec!["foregroundDeletion".to_string()]));
}

#[test]
fn test_remove_missing_finalizer_is_noop() {
    let mut meta = meta_with_finalizers(&["foregroundDeletion"]);
    assert!(!remove_finalizer(&mut meta, MACHINE_FINALIZER));
    assert!(!remove_finalizer(&mut ObjectMeta::default(), MACHINE_FINALIZER));
}

#[test]
fn test_has_owner_references() {
    let mut meta = ObjectMeta::default();
    assert!(!has_owner_references(&meta));

    meta.owner_references = Some(vec![]);
    assert!(!has_owner_references(&meta));

    meta.owner_references = Some(vec![OwnerReference {
        api_version: "cluster.x-k8s.io/v1alpha3".to_string(),
        kind: "MachineSet".to_string(),
        name: "ms-1".to_string(),
        uid: "1234".to_string(),
        ..Default::default()
    }]);
    assert!(has_owner_references(&meta));
}

#[test]
fn test_external_references_order() {
    let machine = create_test_machine("machine-1", "default");
    let refs = external_references(&machine);
    assert_eq!(refs.len(), 2);
    assert_eq!(refs[0].kind, "BootstrapConfig");
    assert_eq!(refs[1].kind, "InfrastructureConfig");
}

#[test]
fn test_external_references_without_bootstrap_ref() {
    let mut machine = create_test_machine("machine-1", "default");
    machine.spec.bootstrap.config_ref = None;
    machine.spec.bootstrap.data = Some("#!/bin/bash".to_string());

    let refs = external_references(&machine);
    assert_eq!(refs.len(), 1);
    assert_eq!(refs[0].kind, "InfrastructureConfig");
}

#[test]
fn test_sooner() {
    let five = Some(Duration::from_secs(5));
    let ten = Some(Duration::from_secs(10));
    assert_eq!(sooner(five, ten), five);
    assert_eq!(sooner(ten, None), ten);
    assert_eq!(sooner(None, five), five);
    assert_eq!(sooner(None, None), None);
}
