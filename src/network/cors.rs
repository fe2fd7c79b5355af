use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderValue, Method, Request, StatusCode},
    response::{IntoResponse, Response},
};
use tower::Service;
use tower_layer::Layer;

pub const NO_CACHE: &str = "no-store, no-cache, must-revalidate";

/// Answers preflight requests and marks every response as readable from any
/// origin.
#[derive(Debug, Clone, Default)]
pub struct OpenCorsLayer;

impl<S> Layer<S> for OpenCorsLayer {
    type Service = OpenCors<S>;

    fn layer(&self, inner: S) -> Self::Service {
        OpenCors { inner }
    }
}

#[derive(Debug, Clone)]
pub struct OpenCors<S> {
    inner: S,
}

impl<S> Service<Request<Body>> for OpenCors<S>
where
    S: Service<Request<Body>, Response = Response> + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        if request.method() == Method::OPTIONS {
            let mut response = StatusCode::NO_CONTENT.into_response();
            allow_any_origin(response.headers_mut());
            allow_preflight(response.headers_mut(), request.headers());
            return Box::pin(async move { Ok(response) });
        }
        let future = self.inner.call(request);
        Box::pin(async move {
            let mut response = future.await?;
            allow_any_origin(response.headers_mut());
            Ok(response)
        })
    }
}

fn allow_any_origin(headers: &mut HeaderMap) {
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
}

fn allow_preflight(headers: &mut HeaderMap, request_headers: &HeaderMap) {
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    let requested = request_headers
        .get(header::ACCESS_CONTROL_REQUEST_HEADERS)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("*"));
    headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, requested);
    headers.insert(header::ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static("600"));
}
