#![forbid(unsafe_code)]

//! Restaurant floor layout and the static robot fleet, loaded from YAML.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

pub trait TravelCost: Send + Sync {
    /// Estimated cost of driving from `from` to `to`.
    fn estimate(&self, from: &str, to: &str) -> f64;

    /// Whether a robot standing at `from` can get to `to` at all.
    fn reachable(&self, from: &str, to: &str) -> bool;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Location {
    pub id: String,
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FleetEntry {
    pub id: String,
    pub location: String,
    #[serde(default = "full_battery")]
    pub battery: u8,
}

fn full_battery() -> u8 {
    100
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SiteFile {
    #[serde(default)]
    pub locations: Vec<Location>,
    #[serde(default)]
    pub robots: Vec<FleetEntry>,
}

impl SiteFile {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let site: Self = serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse YAML in {}", path.display()))?;
        Ok(site)
    }

    /// Missing file means an empty site.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load(path)
    }
}

/// Euclidean distance between known locations.
#[derive(Debug, Clone, Default)]
pub struct SiteMap {
    points: BTreeMap<String, (f64, f64)>,
    unknown_cost: f64,
}

impl SiteMap {
    #[must_use]
    pub fn new(locations: &[Location], unknown_cost: f64) -> Self {
        Self {
            points: locations
                .iter()
                .map(|l| (l.id.clone(), (l.x, l.y)))
                .collect(),
            unknown_cost,
        }
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.points.contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

impl TravelCost for SiteMap {
    fn estimate(&self, from: &str, to: &str) -> f64 {
        if from == to {
            return 0.0;
        }
        match (self.points.get(from), self.points.get(to)) {
            (Some((x1, y1)), Some((x2, y2))) => (x2 - x1).hypot(y2 - y1),
            _ => self.unknown_cost,
        }
    }

    fn reachable(&self, from: &str, to: &str) -> bool {
        from == to || (self.contains(from) && self.contains(to))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SITE: &str = r"
locations:
  - { id: Kitchen, x: 50, y: 50, kind: kitchen }
  - { id: Reception, x: 300, y: 50 }
  - { id: Table 3, x: 200, y: 300 }
robots:
  - { id: R1, location: Kitchen, battery: 85 }
  - { id: R2, location: Reception }
";

    #[test]
    fn parses_site_yaml() {
        let site: SiteFile = serde_yaml::from_str(SITE).unwrap();
        assert_eq!(site.locations.len(), 3);
        assert_eq!(site.locations[0].kind.as_deref(), Some("kitchen"));
        assert_eq!(site.robots[1].battery, 100);
    }

    #[test]
    fn estimates_distance_and_reachability() {
        let site: SiteFile = serde_yaml::from_str(SITE).unwrap();
        let map = SiteMap::new(&site.locations, 1000.0);
        assert!((map.estimate("Kitchen", "Reception") - 250.0).abs() < f64::EPSILON);
        assert!(map.estimate("Kitchen", "Kitchen").abs() < f64::EPSILON);
        assert!((map.estimate("Kitchen", "Patio") - 1000.0).abs() < f64::EPSILON);

        assert!(map.reachable("Kitchen", "Table 3"));
        assert!(map.reachable("Patio", "Patio"));
        assert!(!map.reachable("Patio", "Kitchen"));
    }

    #[test]
    fn missing_site_file_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let site = SiteFile::load_or_default(&dir.path().join("site.yaml")).unwrap();
        assert!(site.locations.is_empty());
    }
}
