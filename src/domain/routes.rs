//! Static destination routing.
//!
//! A route redirects SEND frames addressed to an application destination
//! (e.g. `/app/tube`) to the broker destination its subscribers listen on
//! (e.g. `/topic/messages`). Destinations without a route deliver to
//! themselves.

use std::collections::HashMap;
use std::str::FromStr;

use crate::error::ConfigError;

/// Route table, fixed at start-up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DestinationRoutes {
    routes: HashMap<String, String>,
}

impl DestinationRoutes {
    /// Creates an empty table: every destination delivers to itself.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a route from `from` to `to`, replacing any previous target.
    #[must_use]
    pub fn with_route(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.routes.insert(from.into(), to.into());
        self
    }

    /// Returns the destination a SEND to `destination` fans out to.
    ///
    /// Routes are not chained: the target of a route is used as-is.
    #[must_use]
    pub fn resolve<'a>(&'a self, destination: &'a str) -> &'a str {
        self.routes
            .get(destination)
            .map_or(destination, String::as_str)
    }

    /// Returns the number of routes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Returns `true` if no route is configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl FromStr for DestinationRoutes {
    type Err = ConfigError;

    /// Parses `from=to` pairs separated by commas. Blank entries are skipped.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut routes = Self::new();
        for entry in s.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let Some((from, to)) = entry.split_once('=') else {
                return Err(ConfigError::InvalidRoute(entry.to_string()));
            };
            let (from, to) = (from.trim(), to.trim());
            if from.is_empty() || to.is_empty() {
                return Err(ConfigError::InvalidRoute(entry.to_string()));
            }
            routes = routes.with_route(from, to);
        }
        Ok(routes)
    }
}
