//! Request pipeline
//!
//! A core handler wrapped by a statically ordered list of behaviors. The first
//! behavior added is the outermost: it sees the request first and the result
//! last. Each behavior decides whether to call `next.run(request)`.

use std::any::type_name;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, warn};

/// The operation at the centre of a pipeline.
#[async_trait]
pub trait RequestHandler<Req, Resp, E>: Send + Sync + 'static {
    async fn handle(&self, request: Req) -> Result<Resp, E>;
}

/// A cross-cutting stage wrapped around the rest of the pipeline.
#[async_trait]
pub trait PipelineBehavior<Req, Resp, E>: Send + Sync + 'static {
    async fn handle(&self, request: Req, next: Next<'_, Req, Resp, E>) -> Result<Resp, E>;
}

/// The remainder of the pipeline after the current behavior.
pub struct Next<'a, Req, Resp, E> {
    behaviors: &'a [Arc<dyn PipelineBehavior<Req, Resp, E>>],
    handler: &'a dyn RequestHandler<Req, Resp, E>,
}

impl<Req, Resp, E> Next<'_, Req, Resp, E>
where
    Req: Send + 'static,
    Resp: Send + 'static,
    E: Send + 'static,
{
    pub async fn run(self, request: Req) -> Result<Resp, E> {
        match self.behaviors.split_first() {
            Some((behavior, rest)) => {
                let next = Next {
                    behaviors: rest,
                    handler: self.handler,
                };
                behavior.handle(request, next).await
            }
            None => self.handler.handle(request).await,
        }
    }
}

/// Adapter turning an async closure into a [`RequestHandler`].
pub struct HandlerFn<F> {
    f: F,
}

pub fn handler_fn<F>(f: F) -> HandlerFn<F> {
    HandlerFn { f }
}

#[async_trait]
impl<Req, Resp, E, F, Fut> RequestHandler<Req, Resp, E> for HandlerFn<F>
where
    F: Fn(Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp, E>> + Send,
    Req: Send + 'static,
    Resp: Send + 'static,
    E: Send + 'static,
{
    async fn handle(&self, request: Req) -> Result<Resp, E> {
        (self.f)(request).await
    }
}

/// A handler plus its ordered behaviors.
pub struct Pipeline<Req, Resp, E> {
    behaviors: Vec<Arc<dyn PipelineBehavior<Req, Resp, E>>>,
    handler: Arc<dyn RequestHandler<Req, Resp, E>>,
}

impl<Req, Resp, E> Clone for Pipeline<Req, Resp, E> {
    fn clone(&self) -> Self {
        Self {
            behaviors: self.behaviors.clone(),
            handler: Arc::clone(&self.handler),
        }
    }
}

impl<Req, Resp, E> Pipeline<Req, Resp, E>
where
    Req: Send + 'static,
    Resp: Send + 'static,
    E: Send + 'static,
{
    pub fn builder(handler: impl RequestHandler<Req, Resp, E>) -> PipelineBuilder<Req, Resp, E> {
        PipelineBuilder {
            behaviors: Vec::new(),
            handler: Arc::new(handler),
        }
    }

    pub async fn send(&self, request: Req) -> Result<Resp, E> {
        let next = Next {
            behaviors: &self.behaviors,
            handler: self.handler.as_ref(),
        };
        next.run(request).await
    }

    pub fn behavior_count(&self) -> usize {
        self.behaviors.len()
    }
}

#[async_trait]
impl<Req, Resp, E> RequestHandler<Req, Resp, E> for Pipeline<Req, Resp, E>
where
    Req: Send + 'static,
    Resp: Send + 'static,
    E: Send + 'static,
{
    async fn handle(&self, request: Req) -> Result<Resp, E> {
        self.send(request).await
    }
}

pub struct PipelineBuilder<Req, Resp, E> {
    behaviors: Vec<Arc<dyn PipelineBehavior<Req, Resp, E>>>,
    handler: Arc<dyn RequestHandler<Req, Resp, E>>,
}

impl<Req, Resp, E> PipelineBuilder<Req, Resp, E> {
    /// Append a behavior inside the ones already added.
    pub fn with(mut self, behavior: impl PipelineBehavior<Req, Resp, E>) -> Self {
        self.behaviors.push(Arc::new(behavior));
        self
    }

    pub fn with_shared(mut self, behavior: Arc<dyn PipelineBehavior<Req, Resp, E>>) -> Self {
        self.behaviors.push(behavior);
        self
    }

    pub fn build(self) -> Pipeline<Req, Resp, E> {
        Pipeline {
            behaviors: self.behaviors,
            handler: self.handler,
        }
    }
}

/// Logs each request with its elapsed time.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingBehavior;

#[async_trait]
impl<Req, Resp, E> PipelineBehavior<Req, Resp, E> for LoggingBehavior
where
    Req: Send + 'static,
    Resp: Send + 'static,
    E: Display + Send + 'static,
{
    async fn handle(&self, request: Req, next: Next<'_, Req, Resp, E>) -> Result<Resp, E> {
        let name = type_name::<Req>();
        let started = Instant::now();
        debug!("Handling {}", name);

        let result = next.run(request).await;
        match &result {
            Ok(_) => debug!("Handled {} in {:?}", name, started.elapsed()),
            Err(e) => warn!("{} failed after {:?}: {}", name, started.elapsed(), e),
        }
        result
    }
}
