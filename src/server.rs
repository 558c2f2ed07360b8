//! HTTP front end for the stub engine.

use crate::config::{GlobalSettings, MockServerConfig, StubDefinition};
use crate::dispatcher::{
    Dispatch, DispatchLogging, DispatchStats, RequestDispatcher, RequestProcessor, TokioScheduler,
};
use crate::registry::StubRegistry;
use crate::request::{parse_query_string, Request};
use crate::stub::Response;
use crate::template::TemplateEngine;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Mock HTTP server.
///
/// Every request is handed to the [`RequestDispatcher`]; the connection
/// task waits on a oneshot channel for the rendered response.
pub struct MockServer {
    settings: GlobalSettings,
    registry: Arc<StubRegistry>,
    templates: Arc<TemplateEngine>,
    dispatcher: Arc<RequestDispatcher>,
}

impl MockServer {
    /// Build the server and register the configured stubs in order.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: MockServerConfig) -> anyhow::Result<Self> {
        config.validate()?;

        let settings = config.settings;
        let templates = Arc::new(TemplateEngine::new());
        let registry = Arc::new(StubRegistry::new());
        for definition in &config.stubs {
            registry.add(definition.to_stub(Arc::clone(&templates), &settings)?)?;
        }

        let mut processor = RequestProcessor::new(Arc::clone(&registry));
        if let Some(response) = &config.default_response {
            processor = processor
                .with_unhandled_response(response.to_static_response(&settings.default_content_type)?);
        }

        let scheduler = TokioScheduler::current(settings.max_in_flight, settings.process_timeout())?;
        let dispatcher = RequestDispatcher::new(processor, Arc::new(scheduler)).with_logging(DispatchLogging {
            log_matches: settings.log_matches,
            log_unmatched: settings.log_unmatched,
        });

        info!(
            stubs = registry.len(),
            max_in_flight = settings.max_in_flight,
            "Mock server initialized"
        );

        Ok(Self {
            settings,
            registry,
            templates,
            dispatcher: Arc::new(dispatcher),
        })
    }

    /// Live stub registry; changes apply to the next request.
    pub fn registry(&self) -> &Arc<StubRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &GlobalSettings {
        &self.settings
    }

    pub fn stats(&self) -> &DispatchStats {
        self.dispatcher.stats()
    }

    /// Compile a stub definition and append it to the registry.
    pub fn add_stub(&self, definition: &StubDefinition) -> anyhow::Result<()> {
        definition.validate()?;
        self.registry
            .add(definition.to_stub(Arc::clone(&self.templates), &self.settings)?)?;
        Ok(())
    }

    /// Handle one request end to end.
    pub async fn handle(&self, request: Request) -> Response {
        let (tx, rx) = oneshot::channel();
        match self.dispatcher.dispatch(request, Box::new(tx)) {
            Dispatch::Immediate(response) => response,
            Dispatch::InProgress => rx
                .await
                .unwrap_or_else(|_| Response::text(500, "Request processing failed")),
        }
    }

    /// Bind `settings.listen` and serve until Ctrl-C.
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = bind(&self.settings)?;
        let server = Arc::new(self);
        tokio::select! {
            result = server.serve(listener) => result,
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down mock server");
                Ok(())
            }
        }
    }

    /// Accept connections on `listener` forever.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        info!("Mock server listening on http://{}", listener.local_addr()?);

        loop {
            let Some((stream, peer)) = accepted(listener.accept().await) else {
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                continue;
            };
            let io = TokioIo::new(stream);
            let server = Arc::clone(&self);

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let server = Arc::clone(&server);
                    async move { server.serve_http(req, peer).await }
                });

                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    debug!("Connection error: {}", e);
                }
            });
        }
    }

    async fn serve_http(
        &self,
        req: hyper::Request<Incoming>,
        peer: SocketAddr,
    ) -> Result<hyper::Response<Full<Bytes>>, Infallible> {
        let request = match convert_request(req).await {
            Ok(request) => request,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Failed to read request body");
                return Ok(to_hyper_response(Response::text(400, "Failed to read request body")));
            }
        };
        Ok(to_hyper_response(self.handle(request).await))
    }
}

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Accept failures are usually transient (fd exhaustion, aborted
/// handshakes) and never stop the accept loop.
fn accepted(result: std::io::Result<(TcpStream, SocketAddr)>) -> Option<(TcpStream, SocketAddr)> {
    match result {
        Ok(conn) => Some(conn),
        Err(e) => {
            warn!(error = %e, "Failed to accept connection");
            None
        }
    }
}

/// Bind a listener on `settings.listen` with `settings.backlog`.
pub fn bind(settings: &GlobalSettings) -> std::io::Result<TcpListener> {
    let socket = match settings.listen {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    socket.bind(settings.listen)?;
    socket.listen(settings.backlog)
}

async fn convert_request(req: hyper::Request<Incoming>) -> Result<Request, hyper::Error> {
    let (parts, body) = req.into_parts();

    let mut headers = HashMap::new();
    for (name, value) in &parts.headers {
        if let Ok(value) = value.to_str() {
            headers
                .entry(name.as_str().to_string())
                .or_insert_with(|| value.to_string());
        }
    }

    let body = body.collect().await?.to_bytes();

    Ok(Request {
        method: parts.method.as_str().to_string(),
        path: parts.uri.path().to_string(),
        query: parts.uri.query().map(parse_query_string).unwrap_or_default(),
        headers,
        body: body.to_vec(),
    })
}

fn to_hyper_response(response: Response) -> hyper::Response<Full<Bytes>> {
    let mut builder = hyper::Response::builder().status(response.status);
    for (name, value) in &response.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder
        .body(Full::new(Bytes::from(response.body)))
        .unwrap_or_else(|e| {
            warn!(error = %e, "Stub produced an invalid response");
            let mut fallback = hyper::Response::new(Full::new(Bytes::from(format!(
                "Invalid response: {}",
                e
            ))));
            *fallback.status_mut() = hyper::StatusCode::INTERNAL_SERVER_ERROR;
            fallback
        })
}
