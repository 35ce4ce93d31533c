use super::shared_store;
use crate::directory::{ContactDirectory, InMemoryDirectory};
use crate::error::CoreError;
use crate::ids::pseudo_contact_id;
use crate::resolver::IdentityResolver;
use crate::time::now_ms;
use std::sync::Arc;

fn resolver(label: &str) -> (IdentityResolver, ContactDirectory, InMemoryDirectory) {
    let contacts = ContactDirectory::new(shared_store(label));
    let directory = InMemoryDirectory::new();
    let resolver = IdentityResolver::new(contacts.clone(), Arc::new(directory.clone()), 600);
    (resolver, contacts, directory)
}

#[tokio::test]
async fn handles_pass_through_canonicalized() {
    let (resolver, _, _) = resolver("resolver-passthrough");
    let handle = resolver.resolve_to_handle(" @Bob").await.expect("resolve");
    assert_eq!(handle, "@bob");
}

#[tokio::test]
async fn contact_ids_resolve_through_the_address_book() {
    let (resolver, contacts, _) = resolver("resolver-contact");
    contacts
        .add_or_update_contact("@bob", "cid-1", None, now_ms())
        .await
        .expect("add");
    let handle = resolver.resolve_to_handle("cid-1").await.expect("resolve");
    assert_eq!(handle, "@bob");
}

#[tokio::test]
async fn unknown_contact_id_is_not_found() {
    let (resolver, _, _) = resolver("resolver-missing");
    let err = resolver.resolve_to_handle("cid-ghost").await.unwrap_err();
    assert!(matches!(err, CoreError::NotFound));
}

#[tokio::test]
async fn unresolved_handles_get_a_pseudo_identity_without_persistence() {
    let (resolver, contacts, _) = resolver("resolver-pseudo");
    let contact = resolver.resolve_to_contact("@ghost").await.expect("resolve");
    assert_eq!(contact.contact_id, pseudo_contact_id("@ghost"));
    // Fail closed: nothing unconfirmed enters the address book.
    assert!(contacts.get_by_handle("@ghost").await.is_none());

    let again = resolver.resolve_to_contact("@ghost").await.expect("resolve again");
    assert_eq!(contact.contact_id, again.contact_id);
}

#[tokio::test]
async fn directory_confirmed_identities_are_persisted() {
    let (resolver, contacts, directory) = resolver("resolver-confirmed");
    directory.add_identity("@bob", "@bob").await;

    let contact = resolver.resolve_to_contact("@bob").await.expect("resolve");
    let stored = contacts.get_by_handle("@bob").await.expect("persisted");
    assert_eq!(contact, stored);
}

#[tokio::test]
async fn storage_urn_is_stable_per_identity() {
    let (resolver, _, directory) = resolver("resolver-urn");
    directory.add_identity("@bob", "@bob").await;

    let urn_handle = resolver.storage_urn("@bob").await.expect("urn");
    let urn_again = resolver.storage_urn("@Bob").await.expect("urn again");
    assert_eq!(urn_handle, urn_again);

    let urn_local = resolver.storage_urn(&urn_handle).await.expect("urn local");
    assert_eq!(urn_local, urn_handle);
}
