//! Replication sites and the site manager contract.

use crate::error::{ReplError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of remote system a site runs; selects the node adapter factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SiteType {
    /// DDF catalog.
    Ddf,
    /// Ion store.
    Ion,
    /// Unrecognized type; never scheduled.
    #[serde(other)]
    Unknown,
}

impl fmt::Display for SiteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SiteType::Ddf => "DDF",
            SiteType::Ion => "ION",
            SiteType::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

/// Deployment role of a site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SiteKind {
    /// Forward-deployed site.
    Tactical,
    /// Regional hub.
    Regional,
    /// Unrecognized kind; never scheduled.
    #[serde(other)]
    Unknown,
}

/// A replication endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Site {
    /// Unique site identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Base URL of the site's remote system.
    pub url: String,
    /// Adapter kind.
    #[serde(rename = "type")]
    pub site_type: SiteType,
    /// Deployment role.
    pub kind: SiteKind,
    /// How many concurrent transfers the site claims to support.
    #[serde(default)]
    pub parallelism_factor: Option<u32>,
}

impl Site {
    /// Create a site with no parallelism hint.
    pub fn new(id: &str, url: &str, site_type: SiteType, kind: SiteKind) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            url: url.to_string(),
            site_type,
            kind,
            parallelism_factor: None,
        }
    }

    /// Builder-style setter for the parallelism hint.
    pub fn with_parallelism(mut self, factor: u32) -> Self {
        self.parallelism_factor = Some(factor);
        self
    }

    /// Parallelism hint, defaulting to 1 and never below 1.
    pub fn parallelism(&self) -> u32 {
        self.parallelism_factor.unwrap_or(1).max(1)
    }

    /// Whether this site can be given workers at all.
    pub fn is_schedulable(&self) -> bool {
        self.site_type != SiteType::Unknown && self.kind != SiteKind::Unknown
    }
}

/// Read access to the sites known to this node.
#[async_trait]
pub trait SiteManager: Send + Sync {
    /// Look up a site by id, failing with `NotFound` when absent.
    async fn get(&self, id: &str) -> Result<Site>;

    /// All known sites.
    async fn objects(&self) -> Result<Vec<Site>>;
}

/// Site manager held entirely in memory.
#[derive(Debug, Default)]
pub struct InMemorySiteManager {
    sites: DashMap<String, Site>,
}

impl InMemorySiteManager {
    /// Create an empty site manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a site.
    pub fn save(&self, site: Site) {
        self.sites.insert(site.id.clone(), site);
    }

    /// Remove a site, returning it when present.
    pub fn remove(&self, id: &str) -> Option<Site> {
        self.sites.remove(id).map(|(_, site)| site)
    }
}

#[async_trait]
impl SiteManager for InMemorySiteManager {
    async fn get(&self, id: &str) -> Result<Site> {
        self.sites
            .get(id)
            .map(|site| site.clone())
            .ok_or_else(|| ReplError::NotFound {
                kind: "site",
                id: id.to_string(),
            })
    }

    async fn objects(&self) -> Result<Vec<Site>> {
        let mut sites: Vec<Site> = self.sites.iter().map(|e| e.value().clone()).collect();
        sites.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(sites)
    }
}
