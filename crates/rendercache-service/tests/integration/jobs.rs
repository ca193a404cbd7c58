use std::time::Duration;

use futures::future::join_all;
use rendercache_service::executor::RenderResponse;
use rendercache_service::jobs::ExecutionError;

use crate::{TestRenderer, request, setup_services};

#[tokio::test]
async fn test_timeout() {
    let (services, _context) = setup_services(|config| {
        config.jobs.timeout = Duration::from_millis(100);
    });
    let renderer = TestRenderer::new("slow").with_delay(Duration::from_secs(60 * 60));

    let executions = (0..3).map(|_| services.executor.execute(request(&renderer)));
    for result in join_all(executions).await {
        assert_eq!(
            result,
            Err(ExecutionError::Timeout(Duration::from_millis(100)))
        );
    }

    assert_eq!(renderer.invocations(), 1);
    assert_eq!(services.runner.in_flight(), 0);
    assert_eq!(services.cache.len(), 0);
}

#[tokio::test]
async fn test_shutdown() {
    let (services, _context) = setup_services(|_| {});
    let renderer = TestRenderer::new("slow").with_delay(Duration::from_secs(60 * 60));

    let response = services.executor.submit(request(&renderer)).unwrap();
    let RenderResponse::Pending { identity } = response else {
        panic!("expected a pending response, got {response:?}");
    };

    services.runner.shutdown();
    assert!(services.runner.is_shut_down());

    let response = services.executor.poll(&identity, None).await;
    assert!(
        matches!(response, Some(RenderResponse::Failed(ExecutionError::ShutDown))),
        "{response:?}"
    );

    let other = TestRenderer::new("other");
    let result = services.executor.execute(request(&other)).await;
    assert_eq!(result, Err(ExecutionError::ShutDown));
    assert_eq!(other.invocations(), 0);
}

async fn assert_shut_down_after_abort(retention: Duration) {
    let (services, _context) = setup_services(|config| {
        config.jobs.poll_retention = retention;
    });
    let renderer = TestRenderer::new("slow").with_delay(Duration::from_secs(60 * 60));

    let response = services.executor.submit(request(&renderer)).unwrap();
    let RenderResponse::Pending { identity } = response else {
        panic!("expected a pending response, got {response:?}");
    };

    services.runner.shutdown();

    // wait for the aborted job to leave the registry
    tokio::time::timeout(Duration::from_secs(5), async {
        while services.runner.in_flight() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert!(services.runner.current(&identity).is_none());

    let response = services.executor.poll(&identity, None).await;
    assert!(
        matches!(response, Some(RenderResponse::Failed(ExecutionError::ShutDown))),
        "{response:?}"
    );
}

#[tokio::test]
async fn test_poll_aborted_job() {
    assert_shut_down_after_abort(Duration::from_secs(90)).await;
}

#[tokio::test]
async fn test_poll_aborted_job_without_retention() {
    assert_shut_down_after_abort(Duration::ZERO).await;
}

#[tokio::test]
async fn test_panicking_renderer() {
    let (services, _context) = setup_services(|_| {});
    let renderer = TestRenderer::new("panics")
        .with_delay(Duration::from_millis(20))
        .panicking();

    let executions = (0..3).map(|_| services.executor.execute(request(&renderer)));
    for result in join_all(executions).await {
        assert_eq!(result, Err(ExecutionError::Canceled));
    }

    // the job left the registry, so it can be retried
    assert_eq!(services.runner.in_flight(), 0);
    let result = services.executor.execute(request(&renderer)).await;
    assert_eq!(result, Err(ExecutionError::Canceled));
    assert_eq!(renderer.invocations(), 2);
}

#[tokio::test]
async fn test_max_concurrent_jobs() {
    let (services, _context) = setup_services(|config| {
        config.jobs.max_concurrent_jobs = Some(2);
    });

    // Make three requests that never get resolved. Since the runner is configured to only accept
    // a maximum of two concurrent jobs, the first two should succeed and the third one should fail.
    let slow = |id| TestRenderer::new(id).with_delay(Duration::from_secs(60 * 60));
    let (first, second, third) = (slow("first"), slow("second"), slow("third"));

    assert!(services.executor.submit(request(&first)).is_ok());
    assert!(services.executor.submit(request(&second)).is_ok());
    assert_eq!(
        services.executor.submit(request(&third)).unwrap_err(),
        ExecutionError::TooManyJobs
    );

    // attaching to a running job is still possible
    let response = services.executor.submit(request(&first)).unwrap();
    assert!(matches!(response, RenderResponse::Pending { .. }));
    assert_eq!(services.runner.in_flight(), 2);
}

#[tokio::test]
async fn test_completed_results_expire() {
    let (services, _context) = setup_services(|config| {
        config.jobs.poll_retention = Duration::from_millis(50);
    });
    let renderer = TestRenderer::new("doc").not_cacheable();

    let RenderResponse::Pending { identity } = services.executor.submit(request(&renderer)).unwrap()
    else {
        panic!("a job that was never run cannot be completed");
    };
    let response = services.executor.poll(&identity, None).await;
    assert!(matches!(response, Some(RenderResponse::Completed(_))));
    assert!(services.runner.completed(&identity).is_some());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(services.runner.completed(&identity).is_none());
    assert!(services.executor.poll(&identity, None).await.is_none());
}
