//! RPC method path matching.
//!
//! # Responsibilities
//! - Reduce a request path to its `/package.Service/Method` form
//! - Match paths against the set of endpoints the gateway serves
//!
//! # Design Decisions
//! - Path matching is case-sensitive
//! - Non-root prefixes (`/api/v1/pkg.Svc/Method`) are only stripped when
//!   explicitly allowed
//! - The endpoint list is fetched on every match so registries can change

use std::fmt;

use crate::handler::EndpointLister;

/// Reduce `path` to its last two segments when `allow_non_root` is set.
///
/// `/api/v1/pkg.Svc/Method` becomes `/pkg.Svc/Method`. Paths with fewer
/// than two segments are returned unchanged.
pub fn method_path(path: &str, allow_non_root: bool) -> &str {
    if !allow_non_root {
        return path;
    }
    let Some(last) = path.rfind('/') else {
        return path;
    };
    match path[..last].rfind('/') {
        Some(start) => &path[start..],
        None => path,
    }
}

/// Trait for deciding whether a request path names a served method.
pub trait Matcher: Send + Sync + fmt::Debug {
    fn matches(&self, path: &str) -> bool;
}

/// Matches request paths against an injected endpoint list.
#[derive(Clone)]
pub struct EndpointMatcher {
    endpoints: EndpointLister,
    allow_non_root: bool,
}

impl EndpointMatcher {
    pub fn new(endpoints: EndpointLister, allow_non_root: bool) -> Self {
        Self {
            endpoints,
            allow_non_root,
        }
    }
}

impl fmt::Debug for EndpointMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointMatcher")
            .field("allow_non_root", &self.allow_non_root)
            .finish_non_exhaustive()
    }
}

impl Matcher for EndpointMatcher {
    fn matches(&self, path: &str) -> bool {
        let method = method_path(path, self.allow_non_root);
        (self.endpoints)().iter().any(|e| e == method)
    }
}
