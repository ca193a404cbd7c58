use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use rand::Rng;
use serde::{Deserialize, Serialize};

use rendercache_service::executor::{RenderExecutor, RenderRequest};
use rendercache_service::invalidation::InvalidationEvent;
use rendercache_service::jobs::ExecutionError;
use rendercache_service::render::{RenderContext, RenderError, Rendered, Renderer};
use rendercache_service::types::EntityReference;

const WIKI: &str = "stresstest";

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Workload {
    pub concurrency: usize,
    /// The number of distinct identities requests are spread over.
    #[serde(default = "default_identities")]
    pub identities: usize,
    /// The number of documents each rendering depends on.
    #[serde(default)]
    pub dependencies: usize,
    #[serde(default, with = "humantime_serde")]
    pub render_time: Duration,
    #[serde(default = "default_cacheable")]
    pub cacheable: bool,
    /// Sends an invalidation for a random document after this many requests.
    #[serde(default)]
    pub invalidate_every: Option<usize>,
}

fn default_identities() -> usize {
    1
}

fn default_cacheable() -> bool {
    true
}

/// Renders a fixed value after sleeping, depending on a window of the workload's documents.
#[derive(Debug)]
struct StressRenderer {
    workload: usize,
    identity: usize,
    documents: usize,
    dependencies: usize,
    render_time: Duration,
    cacheable: bool,
}

impl Renderer for StressRenderer {
    fn id(&self) -> Vec<String> {
        vec![
            "stress".into(),
            self.workload.to_string(),
            self.identity.to_string(),
        ]
    }

    fn is_cache_allowed(&self) -> bool {
        self.cacheable
    }

    fn render<'a>(
        &'a self,
        _ctx: &'a RenderContext,
    ) -> BoxFuture<'a, Result<Rendered, RenderError>> {
        Box::pin(async move {
            if !self.render_time.is_zero() {
                tokio::time::sleep(self.render_time).await;
            }

            let mut rendered = Rendered::new(format!("{}/{}", self.workload, self.identity));
            for offset in 0..self.dependencies {
                let document = (self.identity + offset) % self.documents;
                rendered = rendered.depends_on(document_reference(self.workload, document));
            }
            Ok(rendered)
        })
    }
}

fn document_reference(workload: usize, document: usize) -> EntityReference {
    EntityReference::document(
        WIKI,
        &[&format!("Workload{workload}")],
        &format!("Page{document}"),
    )
}

/// The renderers of a single workload, one per identity.
pub struct ParsedWorkload {
    index: usize,
    renderers: Vec<Arc<dyn Renderer>>,
    invalidate_every: Option<usize>,
}

impl ParsedWorkload {
    pub fn invalidate_every(&self) -> Option<usize> {
        self.invalidate_every.filter(|every| *every > 0)
    }

    /// An invalidation of a random document this workload depends on.
    pub fn random_invalidation(&self) -> InvalidationEvent {
        let document = rand::thread_rng().gen_range(0..self.renderers.len());
        InvalidationEvent::EntityChanged {
            reference: document_reference(self.index, document),
        }
    }

    fn random_renderer(&self) -> Arc<dyn Renderer> {
        let identity = rand::thread_rng().gen_range(0..self.renderers.len());
        Arc::clone(&self.renderers[identity])
    }

    /// Every renderer of this workload, used to warm up the cache.
    fn all_renderers(&self) -> impl Iterator<Item = Arc<dyn Renderer>> + '_ {
        self.renderers.iter().cloned()
    }
}

pub fn prepare_workload(index: usize, workload: &Workload) -> ParsedWorkload {
    let identities = workload.identities.max(1);
    let renderers = (0..identities)
        .map(|identity| {
            Arc::new(StressRenderer {
                workload: index,
                identity,
                documents: identities,
                dependencies: workload.dependencies,
                render_time: workload.render_time,
                cacheable: workload.cacheable,
            }) as Arc<dyn Renderer>
        })
        .collect();

    ParsedWorkload {
        index,
        renderers,
        invalidate_every: workload.invalidate_every,
    }
}

/// Renders one random identity of the workload.
pub async fn process_workload(
    executor: &RenderExecutor,
    workload: &ParsedWorkload,
) -> Result<(), ExecutionError> {
    let request = RenderRequest::new(workload.random_renderer());
    executor.execute(request).await.map(|_| ())
}

/// Renders every identity of the workload once.
pub async fn warmup_workload(
    executor: &RenderExecutor,
    workload: &ParsedWorkload,
) -> Result<(), ExecutionError> {
    let executions = workload
        .all_renderers()
        .map(|renderer| executor.execute(RenderRequest::new(renderer)));
    for result in futures::future::join_all(executions).await {
        result?;
    }
    Ok(())
}
