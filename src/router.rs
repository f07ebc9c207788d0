// src/router.rs
use std::time::Duration;

use crate::session::Session;

/// Route handlers run to completion on the event-loop thread and must not
/// block; they populate the reply through the [`Session`] API.
pub type Handler = fn(&mut Session);

const METRIC_SHIFT_THRESHOLD: u64 = 1 << 30;

/// Fixed-point running counters for one route.
#[derive(Debug, Default)]
pub(crate) struct RouteMetrics {
    pub request_count: u64,
    pub total_time: Duration,
    request_count_metric: u64,
    data_sent_metric: u64,
}

impl RouteMetrics {
    /// Record one fully-flushed reply.
    pub fn record(&mut self, elapsed: Duration, body_bytes: u64) {
        self.request_count += 1;
        self.total_time += elapsed;
        self.request_count_metric += 1;
        self.data_sent_metric += body_bytes;
        // Halve both counters together so their ratio survives
        if self.request_count_metric > METRIC_SHIFT_THRESHOLD
            || self.data_sent_metric > METRIC_SHIFT_THRESHOLD
        {
            self.request_count_metric >>= 1;
            self.data_sent_metric >>= 1;
        }
    }

    /// Seed size for the next reply body buffer on this route.
    pub fn body_size_hint(&self) -> usize {
        if self.request_count_metric == 0 {
            return 0;
        }
        (self.data_sent_metric / self.request_count_metric + 64) as usize
    }
}

pub(crate) struct Route {
    pub method: String,
    pub prefix: String,
    pub suffix: Option<String>,
    pub handler: Handler,
    pub metrics: RouteMetrics,
}

impl Route {
    /// Match `path` (already query-trimmed) and report the wildcard capture.
    /// A wildcarded route requires at least one captured character.
    fn matches(&self, path: &str) -> Option<Option<String>> {
        match &self.suffix {
            None => {
                if path == self.prefix {
                    Some(None)
                } else {
                    None
                }
            }
            Some(suffix) => {
                if path.len() <= self.prefix.len() + suffix.len() {
                    return None;
                }
                if !path.starts_with(self.prefix.as_str()) || !path.ends_with(suffix.as_str()) {
                    return None;
                }
                let capture = &path[self.prefix.len()..path.len() - suffix.len()];
                Some(Some(capture.to_owned()))
            }
        }
    }

    pub fn pattern(&self) -> String {
        match &self.suffix {
            None => self.prefix.clone(),
            Some(suffix) => format!("{}*{}", self.prefix, suffix),
        }
    }
}

/// Registered routes in registration order; the first match wins.
#[derive(Default)]
pub(crate) struct Registry {
    routes: Vec<Route>,
}

impl Registry {
    pub fn new() -> Self {
        Self { routes: Vec::new() }
    }

    /// Split `pattern` at its first `*` and store the route.
    pub fn register(&mut self, method: &str, pattern: &str, handler: Handler) {
        let (prefix, suffix) = match pattern.find('*') {
            Some(star) => (&pattern[..star], Some(pattern[star + 1..].to_owned())),
            None => (pattern, None),
        };
        self.routes.push(Route {
            method: method.to_owned(),
            prefix: prefix.to_owned(),
            suffix,
            handler,
            metrics: RouteMetrics::default(),
        });
    }

    /// Resolve `(method, url)` to a route index plus its wildcard capture.
    /// The query string never participates in matching.
    pub fn resolve(&self, method: &str, url: &str, protocol: &str) -> Option<(usize, Option<String>)> {
        if protocol != "HTTP/1.1" && protocol != "HTTP/1.0" {
            return None;
        }
        let path = match url.find('?') {
            Some(query) => &url[..query],
            None => url,
        };
        self.routes.iter().enumerate().find_map(|(idx, route)| {
            if route.method != method {
                return None;
            }
            route.matches(path).map(|capture| (idx, capture))
        })
    }

    pub fn route(&self, idx: usize) -> &Route {
        &self.routes[idx]
    }

    pub fn route_mut(&mut self, idx: usize) -> &mut Route {
        &mut self.routes[idx]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Route> {
        self.routes.iter()
    }

    pub fn clear(&mut self) {
        self.routes.clear();
    }
}

/// Per-route counters exposed by `Server::route_stats`.
#[derive(Debug, Clone)]
pub struct RouteStats {
    pub method: String,
    pub pattern: String,
    pub request_count: u64,
    pub total_time: Duration,
}
