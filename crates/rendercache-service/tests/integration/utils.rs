use std::sync::Arc;

use rendercache_service::authorization::{AllowAll, AuthorizationChecker};
use rendercache_service::config::Config;
use rendercache_service::context::ContextStore;
use rendercache_service::executor::RenderRequest;
use rendercache_service::services::SharedServices;
use rendercache_test as test;

pub use test::{TestRenderer, depends_on_document, document};

/// Setup tests and create the test services.
///
/// This function returns the services to test and the [`ContextStore`] they capture context
/// from. The `update_config` closure can modify any default configuration if needed before the
/// services are created.
pub fn setup_services(
    update_config: impl FnOnce(&mut Config),
) -> (SharedServices, Arc<ContextStore>) {
    setup_services_with_authorization(update_config, Arc::new(AllowAll))
}

/// Same as [`setup_services`], but with a custom [`AuthorizationChecker`].
pub fn setup_services_with_authorization(
    update_config: impl FnOnce(&mut Config),
    authorization: Arc<dyn AuthorizationChecker>,
) -> (SharedServices, Arc<ContextStore>) {
    test::setup();

    let mut config = Config::default();
    update_config(&mut config);

    let context = Arc::new(ContextStore::new());
    let handle = tokio::runtime::Handle::current();
    let services =
        SharedServices::with_collaborators(config, handle, context.clone(), authorization);

    (services, context)
}

/// Creates a request for the given renderer without any context or rights.
pub fn request(renderer: &TestRenderer) -> RenderRequest {
    RenderRequest::new(renderer.shared())
}
