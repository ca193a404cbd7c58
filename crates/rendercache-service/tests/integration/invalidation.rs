use rendercache_service::invalidation::InvalidationEvent;
use rendercache_service::types::{DependencyToken, EntityReference, WikiId};
use tokio::sync::mpsc;

use crate::{TestRenderer, depends_on_document, document, request, setup_services};

#[tokio::test]
async fn test_entity_invalidation() {
    let (services, _context) = setup_services(|_| {});
    let a = TestRenderer::new("a").with_dependency(depends_on_document("A"));
    let b = TestRenderer::new("b").with_dependency(depends_on_document("B"));
    let ab = TestRenderer::new("ab")
        .with_dependency(depends_on_document("A"))
        .with_dependency(depends_on_document("B"));

    for renderer in [&a, &b, &ab] {
        services.executor.execute(request(renderer)).await.unwrap();
    }
    assert_eq!(services.cache.len(), 3);

    let removed = services
        .invalidation
        .on_event(&InvalidationEvent::EntityChanged {
            reference: document("A"),
        });
    assert_eq!(removed, 2);
    assert_eq!(services.cache.len(), 1);

    // the index no longer knows about `A`, and only `b` depends on `B`
    let index = services.cache.dependencies();
    assert!(!index.contains(&depends_on_document("A")));
    assert_eq!(index.keys_for(&depends_on_document("B")).len(), 1);

    // invalidated outcomes are recomputed, the others are still cached
    for renderer in [&a, &b, &ab] {
        services.executor.execute(request(renderer)).await.unwrap();
    }
    assert_eq!(a.invocations(), 2);
    assert_eq!(b.invocations(), 1);
    assert_eq!(ab.invocations(), 2);

    // invalidating something nothing depends on is fine
    let removed = services
        .invalidation
        .on_event(&InvalidationEvent::EntityChanged {
            reference: document("C"),
        });
    assert_eq!(removed, 0);
}

#[tokio::test]
async fn test_wiki_deleted() {
    let (services, _context) = setup_services(|_| {});
    let dev_document = TestRenderer::new("dev-document")
        .with_dependency(EntityReference::document("dev", &["Main"], "WebHome"));
    let dev_preferences =
        TestRenderer::new("dev-preferences").with_dependency(WikiId::from("dev"));
    let other = TestRenderer::new("other").with_dependency(depends_on_document("WebHome"));

    for renderer in [&dev_document, &dev_preferences, &other] {
        services.executor.execute(request(renderer)).await.unwrap();
    }

    let removed = services.invalidation.on_event(&InvalidationEvent::WikiDeleted {
        wiki: WikiId::from("dev"),
    });
    assert_eq!(removed, 2);
    assert_eq!(services.cache.len(), 1);

    let index = services.cache.dependencies();
    assert!(
        index
            .tokens_matching(|token| token.wiki() == Some(&WikiId::from("dev")))
            .is_empty()
    );
    assert!(index.contains(&depends_on_document("WebHome")));
}

#[tokio::test]
async fn test_component_changed() {
    let (services, _context) = setup_services(|_| {});
    let all_macros = TestRenderer::new("all-macros")
        .with_dependency(DependencyToken::component("Macro", None));
    let info_macro = TestRenderer::new("info-macro")
        .with_dependency(DependencyToken::component("Macro", Some("info")));
    let code_macro = TestRenderer::new("code-macro")
        .with_dependency(DependencyToken::component("Macro", Some("code")));

    for renderer in [&all_macros, &info_macro, &code_macro] {
        services.executor.execute(request(renderer)).await.unwrap();
    }

    let removed = services
        .invalidation
        .on_event(&InvalidationEvent::ComponentChanged {
            role: "Macro".into(),
            hint: Some("info".into()),
        });
    assert_eq!(removed, 2);

    for renderer in [&all_macros, &info_macro, &code_macro] {
        services.executor.execute(request(renderer)).await.unwrap();
    }
    assert_eq!(all_macros.invocations(), 2);
    assert_eq!(info_macro.invocations(), 2);
    assert_eq!(code_macro.invocations(), 1);

    // without a hint, only outcomes depending on the role as a whole are affected
    let removed = services
        .invalidation
        .on_event(&InvalidationEvent::ComponentChanged {
            role: "Macro".into(),
            hint: None,
        });
    assert_eq!(removed, 1);
}

#[tokio::test]
async fn test_flush() {
    let (services, _context) = setup_services(|_| {});
    let a = TestRenderer::new("a").with_dependency(depends_on_document("A"));
    let b = TestRenderer::new("b").with_dependency(depends_on_document("B"));

    for renderer in [&a, &b] {
        services.executor.execute(request(renderer)).await.unwrap();
    }

    let removed = services.invalidation.on_event(&InvalidationEvent::Flush);
    assert_eq!(removed, 2);
    assert_eq!(services.cache.len(), 0);
    assert!(services.cache.dependencies().is_empty());
}

#[tokio::test]
async fn test_lru_eviction_cleans_index() {
    let (services, _context) = setup_services(|config| config.cache.capacity = 2);
    let a = TestRenderer::new("a").with_dependency(depends_on_document("A"));
    let b = TestRenderer::new("b").with_dependency(depends_on_document("B"));
    let c = TestRenderer::new("c").with_dependency(depends_on_document("C"));

    services.executor.execute(request(&a)).await.unwrap();
    services.executor.execute(request(&b)).await.unwrap();
    // `a` is now more recently accessed than `b`
    services.executor.execute(request(&a)).await.unwrap();
    services.executor.execute(request(&c)).await.unwrap();

    assert_eq!(services.cache.len(), 2);
    let index = services.cache.dependencies();
    assert!(index.contains(&depends_on_document("A")));
    assert!(!index.contains(&depends_on_document("B")));
    assert!(index.contains(&depends_on_document("C")));

    services.executor.execute(request(&b)).await.unwrap();
    assert_eq!(a.invocations(), 1);
    assert_eq!(b.invocations(), 2);
}

#[tokio::test]
async fn test_listen() {
    let (services, _context) = setup_services(|_| {});
    let a = TestRenderer::new("a").with_dependency(depends_on_document("A"));
    services.executor.execute(request(&a)).await.unwrap();

    let (sender, receiver) = mpsc::channel(8);
    let listener = tokio::spawn(services.invalidation.clone().listen(receiver));

    sender
        .send(InvalidationEvent::EntityChanged {
            reference: document("A"),
        })
        .await
        .unwrap();
    drop(sender);
    listener.await.unwrap();

    assert_eq!(services.cache.len(), 0);
    services.executor.execute(request(&a)).await.unwrap();
    assert_eq!(a.invocations(), 2);
}
