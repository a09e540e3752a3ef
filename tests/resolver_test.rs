use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use waconsole::config::Config;
use waconsole::error::{ApiError, AuthWatch};
use waconsole::resolver::ContactResolver;
use waconsole::test_utils::{MockApi, contact_fixture};

fn resolver_for(api: &Arc<MockApi>) -> Arc<ContactResolver> {
    Arc::new(ContactResolver::new(
        api.clone(),
        Config::default(),
        AuthWatch::new(),
    ))
}

#[tokio::test]
async fn concurrent_resolutions_coalesce_into_one_lookup() {
    let _ = env_logger::builder().is_test(true).try_init();
    let api = Arc::new(MockApi::default());
    api.set_contact(contact_fixture("5215512345678", "Maria Lopez"));
    api.set_resolve_delay(Duration::from_millis(50));
    let resolver = resolver_for(&api);

    let lookups = (0..8).map(|_| {
        let resolver = resolver.clone();
        async move { resolver.resolve("5215512345678").await }
    });
    let outcomes = futures_util::future::join_all(lookups).await;

    for outcome in outcomes {
        let contact = outcome.unwrap().expect("contact should resolve");
        assert_eq!(contact.display_name.as_deref(), Some("Maria Lopez"));
    }
    assert_eq!(
        api.calls.resolve.load(Ordering::SeqCst),
        1,
        "followers must ride the leader's lookup"
    );

    // A later call hits the cache without another request.
    resolver.resolve("5215512345678").await.unwrap();
    assert_eq!(api.calls.resolve.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unknown_contacts_are_negatively_cached() {
    let api = Arc::new(MockApi::default());
    let resolver = resolver_for(&api);

    assert!(resolver.resolve("5215599999999").await.unwrap().is_none());
    assert!(resolver.resolve("5215599999999").await.unwrap().is_none());
    assert_eq!(
        api.calls.resolve.load(Ordering::SeqCst),
        1,
        "a cached miss must not be re-queried"
    );
    assert_eq!(resolver.peek("5215599999999"), Some(None));
}

#[tokio::test]
async fn lookup_keys_are_normalized_digits() {
    let api = Arc::new(MockApi::default());
    api.set_contact(contact_fixture("5215512345678", "Maria Lopez"));
    let resolver = resolver_for(&api);

    let contact = resolver
        .resolve("+52 1 55 1234-5678")
        .await
        .unwrap()
        .expect("formatting must not defeat the lookup");
    assert_eq!(contact.phone, "5215512345678");

    // Same identity through a different rendering: cache hit.
    resolver.resolve("52-1-55-1234-5678").await.unwrap();
    assert_eq!(api.calls.resolve.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn digitless_phone_is_rejected_before_the_wire() {
    let api = Arc::new(MockApi::default());
    let resolver = resolver_for(&api);

    let err = resolver.resolve("status@broadcast").await.unwrap_err();
    assert!(matches!(err, ApiError::Validation(_)));
    assert_eq!(api.calls.resolve.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn upsert_writes_through_to_the_cache() {
    let api = Arc::new(MockApi::default());
    let resolver = resolver_for(&api);

    let contact = resolver
        .upsert("+52 1 55 1234 5678", "Maria Lopez")
        .await
        .unwrap();
    assert_eq!(contact.phone, "5215512345678");

    // The authoritative response lands in the cache; no lookup needed.
    let cached = resolver.resolve("5215512345678").await.unwrap().unwrap();
    assert_eq!(cached.display_name.as_deref(), Some("Maria Lopez"));
    assert_eq!(api.calls.resolve.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn avatars_are_fetched_once_per_reference() {
    let api = Arc::new(MockApi::default());
    let resolver = resolver_for(&api);

    let first = resolver.avatar("media-ref-1").await.unwrap();
    let second = resolver.avatar("media-ref-1").await.unwrap();
    assert_eq!(first, second);
    assert_eq!(api.calls.avatar.load(Ordering::SeqCst), 1);

    resolver.avatar("media-ref-2").await.unwrap();
    assert_eq!(api.calls.avatar.load(Ordering::SeqCst), 2);
}
