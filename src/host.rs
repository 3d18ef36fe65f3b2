//! Capabilities the host runtime exposes to the engine for a single request.
//!
//! Readers return `Ok(None)` when the attribute is absent and `Err` when it
//! exists but cannot be read. The matcher treats both the same way; the
//! identity builder does not.

use crate::error::HostError;
use std::collections::HashMap;

pub type HostResult<T> = Result<T, HostError>;

/// Read access to the request attributes rules can match against.
pub trait RequestAccessors {
    fn header(&self, name: &str) -> HostResult<Option<String>>;
    fn query_arg(&self, name: &str) -> HostResult<Option<String>>;
    fn raw_body(&self) -> HostResult<Option<String>>;
}

/// Who is calling, and through which service and route.
pub trait CallerContext {
    fn consumer_id(&self) -> HostResult<Option<String>>;
    fn service_id(&self) -> HostResult<Option<String>>;
    fn route_id(&self) -> HostResult<Option<String>>;
}

/// Mutations the engine may apply to the response.
pub trait ResponseWriter {
    fn set_header(&mut self, name: &str, value: &str) -> HostResult<()>;

    /// Terminate the request with `status` and `body`; nothing downstream runs.
    fn exit(&mut self, status: u16, body: &str);
}

/// Plain in-memory request, handy for embedding hosts and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticRequest {
    pub headers: HashMap<String, String>,
    pub query: HashMap<String, String>,
    pub body: Option<String>,
    pub consumer: Option<String>,
    pub service: Option<String>,
    pub route: Option<String>,
}

impl StaticRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_lowercase(), value.to_string());
        self
    }

    pub fn with_query(mut self, name: &str, value: &str) -> Self {
        self.query.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_body(mut self, body: &str) -> Self {
        self.body = Some(body.to_string());
        self
    }

    pub fn with_consumer(mut self, id: &str) -> Self {
        self.consumer = Some(id.to_string());
        self
    }

    pub fn with_service(mut self, id: &str) -> Self {
        self.service = Some(id.to_string());
        self
    }

    pub fn with_route(mut self, id: &str) -> Self {
        self.route = Some(id.to_string());
        self
    }
}

impl RequestAccessors for StaticRequest {
    fn header(&self, name: &str) -> HostResult<Option<String>> {
        Ok(self.headers.get(&name.to_lowercase()).cloned())
    }

    fn query_arg(&self, name: &str) -> HostResult<Option<String>> {
        Ok(self.query.get(name).cloned())
    }

    fn raw_body(&self) -> HostResult<Option<String>> {
        Ok(self.body.clone())
    }
}

impl CallerContext for StaticRequest {
    fn consumer_id(&self) -> HostResult<Option<String>> {
        Ok(self.consumer.clone())
    }

    fn service_id(&self) -> HostResult<Option<String>> {
        Ok(self.service.clone())
    }

    fn route_id(&self) -> HostResult<Option<String>> {
        Ok(self.route.clone())
    }
}

/// Response sink that records what the engine asked for.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordedResponse {
    pub headers: Vec<(String, String)>,
    pub exit: Option<(u16, String)>,
}

impl RecordedResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

impl ResponseWriter for RecordedResponse {
    fn set_header(&mut self, name: &str, value: &str) -> HostResult<()> {
        self.headers.push((name.to_string(), value.to_string()));
        Ok(())
    }

    fn exit(&mut self, status: u16, body: &str) {
        self.exit = Some((status, body.to_string()));
    }
}
