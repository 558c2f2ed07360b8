//! Mock Web Server
//!
//! An HTTP mock server that answers requests from an ordered registry of
//! stubs. Each stub pairs request matchers with a render function; the
//! first stub whose matchers all pass handles the request.
//!
//! # Features
//!
//! - **Placeholder patterns**: `/users/{id}` and `{}` captures over paths and query parameters
//! - **Ordered registry**: add, insert, replace and remove stubs while serving
//! - **Non-blocking dispatch**: matching runs on a bounded worker pool with a deadline
//! - **Dynamic templates**: Handlebars bodies fed by the extracted captures
//!
//! # Example Configuration
//!
//! ```yaml
//! stubs:
//!   - id: get-user
//!     request:
//!       method: GET
//!       path:
//!         pattern: /users/{id}
//!     response:
//!       status: 200
//!       template: true
//!       body:
//!         type: json
//!         content:
//!           id: "{{captures.id}}"
//! ```

pub mod config;
pub mod dispatcher;
pub mod extractor;
pub mod matcher;
pub mod registry;
pub mod request;
pub mod server;
pub mod stub;
pub mod template;

pub use config::MockServerConfig;
pub use dispatcher::{Dispatch, RequestDispatcher, RequestProcessor, TokioScheduler};
pub use extractor::{Extract, Extractor, PathExtractor, PatternOptions, QueryExtractor};
pub use matcher::{Matcher, MethodMatcher, PathMatcher, QueryMatcher};
pub use registry::{RegistryError, StubRegistry};
pub use request::{Method, Request};
pub use server::MockServer;
pub use stub::{ExtractedData, Response, Stub};
