use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use rendercache_service::authorization::AuthorizationChecker;
use rendercache_service::config::Config;
use rendercache_service::context::{CaptureError, ContextSnapshot};
use rendercache_service::executor::RenderResponse;
use rendercache_service::jobs::{ExecutionError, JobIdentity};
use rendercache_service::services::SharedServices;
use rendercache_service::types::{EntityReference, Right};

use crate::{
    TestRenderer, depends_on_document, document, request, setup_services,
    setup_services_with_authorization,
};

#[tokio::test]
async fn test_single_flight() {
    let (services, _context) = setup_services(|_| {});
    let renderer = TestRenderer::new("doc")
        .with_dependency(depends_on_document("A"))
        .with_delay(Duration::from_millis(100));

    let executions = (0..10).map(|_| services.executor.execute(request(&renderer)));
    let outcomes = join_all(executions).await;

    assert_eq!(renderer.invocations(), 1);
    let first = outcomes[0].as_ref().unwrap();
    for outcome in &outcomes {
        let outcome = outcome.as_ref().unwrap();
        assert!(Arc::ptr_eq(first, outcome));
    }
    assert_eq!(first.value, "doc");
}

#[tokio::test]
async fn test_cache_hit() {
    let (services, _context) = setup_services(|_| {});
    let renderer = TestRenderer::new("doc").with_dependency(depends_on_document("A"));

    let first = services.executor.execute(request(&renderer)).await.unwrap();
    let second = services.executor.execute(request(&renderer)).await.unwrap();

    assert_eq!(renderer.invocations(), 1);
    assert_eq!(first, second);
    assert_eq!(services.cache.len(), 1);
    assert_eq!(services.runner.in_flight(), 0);
}

#[tokio::test]
async fn test_equal_identities_share_outcome() {
    let (services, _context) = setup_services(|_| {});
    // two distinct renderers with the same identity
    let first = TestRenderer::new("doc").with_id(&["doc", "xwiki:Main.WebHome"]);
    let second = TestRenderer::new("doc").with_id(&["doc", "xwiki:Main.WebHome"]);

    services.executor.execute(request(&first)).await.unwrap();
    services.executor.execute(request(&second)).await.unwrap();

    assert_eq!(first.invocations(), 1);
    assert_eq!(second.invocations(), 0);

    // a different renderer identity is rendered on its own
    let third = TestRenderer::new("doc").with_id(&["doc", "xwiki:Main.Other"]);
    services.executor.execute(request(&third)).await.unwrap();
    assert_eq!(third.invocations(), 1);
}

#[tokio::test]
async fn test_not_cacheable() {
    let (services, _context) = setup_services(|_| {});
    let renderer = TestRenderer::new("doc")
        .with_dependency(depends_on_document("A"))
        .not_cacheable();

    let outcome = services.executor.execute(request(&renderer)).await.unwrap();
    assert!(!outcome.cacheable);
    services.executor.execute(request(&renderer)).await.unwrap();

    assert_eq!(renderer.invocations(), 2);
    assert_eq!(services.cache.len(), 0);
    assert!(services.cache.dependencies().is_empty());
}

#[tokio::test]
async fn test_default_context_store() {
    let services = SharedServices::new(Config::default(), tokio::runtime::Handle::current());
    let context = services.context.clone().unwrap();
    let renderer = TestRenderer::new("doc");

    context.set("user", "Admin");
    let outcome = services
        .executor
        .execute(request(&renderer).with_context(["user"]))
        .await
        .unwrap();
    assert_eq!(outcome.value, "doc;user=Admin");
}

#[tokio::test]
async fn test_context_is_part_of_identity() {
    let (services, context) = setup_services(|_| {});
    let renderer = TestRenderer::new("doc");
    let request = || request(&renderer).with_context(["user"]);

    context.set("user", "Admin");
    let outcome = services.executor.execute(request()).await.unwrap();
    assert_eq!(outcome.value, "doc;user=Admin");

    context.set("user", "Guest");
    let outcome = services.executor.execute(request()).await.unwrap();
    assert_eq!(outcome.value, "doc;user=Guest");
    assert_eq!(renderer.invocations(), 2);

    context.set("user", "Admin");
    let outcome = services.executor.execute(request()).await.unwrap();
    assert_eq!(outcome.value, "doc;user=Admin");
    assert_eq!(renderer.invocations(), 2);
}

#[tokio::test]
async fn test_capture_failure() {
    let (services, context) = setup_services(|_| {});
    context.set("user", "Admin");
    let renderer = TestRenderer::new("doc");

    let result = services
        .executor
        .execute(request(&renderer).with_context(["user", "request"]))
        .await;

    assert_eq!(
        result,
        Err(ExecutionError::Capture(CaptureError::UnknownEntry(
            "request".into()
        )))
    );
    assert_eq!(renderer.invocations(), 0);
    assert_eq!(services.cache.len(), 0);
    assert_eq!(services.runner.in_flight(), 0);

    assert!(
        services
            .executor
            .submit(request(&renderer).with_context(["request"]))
            .is_err()
    );
    assert_eq!(renderer.invocations(), 0);
}

#[tokio::test]
async fn test_render_failure() {
    let (services, _context) = setup_services(|_| {});
    let renderer = TestRenderer::new("broken")
        .with_delay(Duration::from_millis(50))
        .failing();

    let executions = (0..5).map(|_| services.executor.execute(request(&renderer)));
    let results = join_all(executions).await;

    assert_eq!(renderer.invocations(), 1);
    for result in results {
        let err = result.unwrap_err();
        assert!(matches!(err, ExecutionError::Render(_)), "{err:?}");
    }

    // failures are not cached
    let result = services.executor.execute(request(&renderer)).await;
    assert!(result.is_err());
    assert_eq!(renderer.invocations(), 2);
    assert_eq!(services.cache.len(), 0);
}

#[tokio::test]
async fn test_disabled_cache_still_deduplicates() {
    let (services, _context) = setup_services(|config| config.cache.capacity = 0);
    let renderer = TestRenderer::new("doc")
        .with_dependency(depends_on_document("A"))
        .with_delay(Duration::from_millis(50));

    let executions = (0..5).map(|_| services.executor.execute(request(&renderer)));
    for outcome in join_all(executions).await {
        assert_eq!(outcome.unwrap().value, "doc");
    }
    assert_eq!(renderer.invocations(), 1);

    services.executor.execute(request(&renderer)).await.unwrap();
    assert_eq!(renderer.invocations(), 2);
    assert!(services.cache.dependencies().is_empty());
}

/// Only grants script rights to the `Admin` user.
struct ScriptRequiresAdmin;

impl AuthorizationChecker for ScriptRequiresAdmin {
    fn check_access(
        &self,
        right: Right,
        _entity: Option<&EntityReference>,
        context: &ContextSnapshot,
    ) -> bool {
        right != Right::Script || context.get("user") == Some("Admin")
    }
}

#[tokio::test]
async fn test_access_denied() {
    let (services, context) =
        setup_services_with_authorization(|_| {}, Arc::new(ScriptRequiresAdmin));
    let renderer = TestRenderer::new("script");
    let request = || {
        request(&renderer)
            .with_context(["user"])
            .with_right(Right::Script, Some(document("Script")))
    };

    context.set("user", "Guest");
    let result = services.executor.execute(request()).await;
    assert_eq!(
        result,
        Err(ExecutionError::AccessDenied {
            right: Right::Script,
            entity: Some(document("Script")),
        })
    );
    assert_eq!(renderer.invocations(), 0);
    assert_eq!(services.cache.len(), 0);

    context.set("user", "Admin");
    let outcome = services.executor.execute(request()).await.unwrap();
    assert_eq!(outcome.value, "script;user=Admin");

    // rights other than script are granted to everyone
    context.set("user", "Guest");
    let outcome = services
        .executor
        .execute(
            crate::request(&renderer)
                .with_context(["user"])
                .with_right(Right::View, Some(EntityReference::wiki("xwiki"))),
        )
        .await
        .unwrap();
    assert_eq!(outcome.value, "script;user=Guest");
}

#[tokio::test]
async fn test_submit_and_poll() {
    let (services, _context) = setup_services(|_| {});
    let renderer = TestRenderer::new("doc").with_delay(Duration::from_millis(100));

    let response = services.executor.submit(request(&renderer)).unwrap();
    let RenderResponse::Pending { identity } = response else {
        panic!("expected a pending response, got {response:?}");
    };

    // still running after a short wait
    let response = services
        .executor
        .poll(&identity, Some(Duration::from_millis(1)))
        .await;
    assert!(matches!(response, Some(RenderResponse::Pending { .. })));

    // we can poll repeatedly for the result
    for _ in 0..2 {
        let response = services.executor.poll(&identity, None).await;
        let Some(RenderResponse::Completed(outcome)) = response else {
            panic!("expected a completed response, got {response:?}");
        };
        assert_eq!(outcome.value, "doc");
    }

    // once cached, submitting completes right away
    let response = services.executor.submit(request(&renderer)).unwrap();
    assert!(matches!(response, RenderResponse::Completed(_)));
    assert_eq!(renderer.invocations(), 1);

    let unknown = JobIdentity::new(vec!["unknown".into()], &ContextSnapshot::new());
    assert!(services.executor.poll(&unknown, None).await.is_none());
}

#[tokio::test]
async fn test_poll_not_cacheable() {
    let (services, _context) = setup_services(|_| {});
    let renderer = TestRenderer::new("doc").not_cacheable();

    let RenderResponse::Pending { identity } = services.executor.submit(request(&renderer)).unwrap()
    else {
        panic!("a job that was never run cannot be completed");
    };

    // the result stays available for polling even though it is not cached
    for _ in 0..2 {
        let response = services.executor.poll(&identity, None).await;
        assert!(matches!(response, Some(RenderResponse::Completed(_))));
    }
    assert_eq!(renderer.invocations(), 1);
    assert_eq!(services.cache.len(), 0);
}
