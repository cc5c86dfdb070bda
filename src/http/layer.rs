//! Tower middleware that runs admission control in front of a service.
//!
//! The decision is made before the inner service is polled, so a denial
//! never reaches business logic and there is no risk of writing a 429
//! into a response that has already started streaming.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{Request, Response};
use chrono::Utc;
use tower::{Layer, Service};

use crate::admission::{AdmissionEngine, Decision, InMemoryWindowStore, WindowStore};
use crate::config::TurnstileConfig;
use crate::identity::ClientIdentifier;

use super::reject::ResponseAnnotator;

/// A [`tower::Layer`] that wraps services with [`AdmissionService`].
pub struct AdmissionLayer<S = InMemoryWindowStore> {
    engine: Arc<AdmissionEngine<S>>,
    identifier: Arc<ClientIdentifier>,
    annotator: ResponseAnnotator,
}

impl AdmissionLayer<InMemoryWindowStore> {
    /// Build a layer backed by a fresh in-memory window store.
    pub fn new(config: Arc<TurnstileConfig>) -> Self {
        Self::with_store(config, Arc::new(InMemoryWindowStore::new()))
    }
}

impl<S: WindowStore> AdmissionLayer<S> {
    /// Build a layer over an explicit store, e.g. one shared with a
    /// background eviction task.
    pub fn with_store(config: Arc<TurnstileConfig>, store: Arc<S>) -> Self {
        let identifier = Arc::new(ClientIdentifier::new(config.address.clone()));
        let annotator = ResponseAnnotator::new(config.environment);
        let engine = Arc::new(AdmissionEngine::new(config, store));
        Self {
            engine,
            identifier,
            annotator,
        }
    }
}

impl<S> Clone for AdmissionLayer<S> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            identifier: self.identifier.clone(),
            annotator: self.annotator.clone(),
        }
    }
}

impl<S, T> Layer<T> for AdmissionLayer<S> {
    type Service = AdmissionService<T, S>;

    fn layer(&self, inner: T) -> Self::Service {
        AdmissionService {
            inner,
            engine: self.engine.clone(),
            identifier: self.identifier.clone(),
            annotator: self.annotator.clone(),
        }
    }
}

/// The middleware service produced by [`AdmissionLayer`].
pub struct AdmissionService<T, S = InMemoryWindowStore> {
    inner: T,
    engine: Arc<AdmissionEngine<S>>,
    identifier: Arc<ClientIdentifier>,
    annotator: ResponseAnnotator,
}

impl<T: Clone, S> Clone for AdmissionService<T, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            engine: self.engine.clone(),
            identifier: self.identifier.clone(),
            annotator: self.annotator.clone(),
        }
    }
}

impl<T, S> Service<Request<Body>> for AdmissionService<T, S>
where
    T: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    T::Future: Send + 'static,
    S: WindowStore + 'static,
{
    type Response = T::Response;
    type Error = T::Error;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let engine = self.engine.clone();
        let identifier = self.identifier.clone();
        let annotator = self.annotator.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let identity = identifier.identify(&req);
            let decision = engine
                .evaluate(
                    req.method().as_str(),
                    req.uri().path(),
                    &identity,
                    Utc::now(),
                )
                .await;

            match decision {
                Decision::Bypassed => inner.call(req).await,
                Decision::Denied(result) => Ok(annotator.reject(&result)),
                Decision::Admitted(result) => {
                    let mut response = inner.call(req).await?;
                    annotator.annotate(response.headers_mut(), &result);
                    Ok(response)
                }
            }
        })
    }
}
