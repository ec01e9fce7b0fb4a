//! Route matching and specificity ranking.
//!
//! A route matches a request when the protocol and method filters accept it
//! and its url is either equal to the target path (`only_full_path`) or a
//! plain string prefix of it. Among matches, specificity is the pair
//! (segment depth, url length); the single-best resolution picks the
//! maximum, the fallback chain walks them in ascending order.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::envelope::{Protocol, Request};

/// Routing attributes shared by local handlers and advertised services.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub url: String,
    /// `None` accepts any protocol.
    #[serde(rename = "protocol")]
    pub protocols: Option<Vec<Protocol>>,
    /// `None` accepts any method. Stored uppercased.
    pub methods: Option<Vec<String>>,
    #[serde(default)]
    pub only_full_path: bool,
}

impl Route {
    /// Build a route, normalizing empty filters to "any".
    pub fn new(url: impl Into<String>, protocols: Vec<Protocol>, methods: Vec<String>, only_full_path: bool) -> Self {
        let methods: Vec<String> = methods
            .into_iter()
            .filter(|m| !m.is_empty())
            .map(|m| m.to_ascii_uppercase())
            .collect();
        Self {
            url: url.into(),
            protocols: (!protocols.is_empty()).then_some(protocols),
            methods: (!methods.is_empty()).then_some(methods),
            only_full_path,
        }
    }

    pub fn matches(&self, protocol: Protocol, method: &str, path: &str) -> bool {
        let path_ok = if self.only_full_path {
            self.url == path
        } else {
            path.starts_with(self.url.as_str())
        };
        path_ok
            && self.protocols.as_ref().map_or(true, |p| p.contains(&protocol))
            && self
                .methods
                .as_ref()
                .map_or(true, |m| m.iter().any(|allowed| allowed.eq_ignore_ascii_case(method)))
    }

    pub fn matches_request(&self, request: &Request) -> bool {
        self.matches(request.protocol, &request.method, &request.event)
    }

    /// Specificity key: (segment depth, url length).
    pub fn rank(&self) -> (usize, usize) {
        rank_url(&self.url)
    }
}

/// Specificity key of a url.
pub fn rank_url(url: &str) -> (usize, usize) {
    (segment_depth(url), url.len())
}

/// Number of non-empty `/`-separated segments.
pub fn segment_depth(url: &str) -> usize {
    url.split('/').filter(|s| !s.is_empty()).count()
}

/// Compare two urls by specificity, most specific first.
pub fn most_specific_first(a: &str, b: &str) -> Ordering {
    rank_url(b).cmp(&rank_url(a))
}
