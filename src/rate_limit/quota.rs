//! Tier quotas and route-class mapping.
//!
//! Tier syntax: `name=capacity/window_secs+burst`, comma separated.
//! Route classes: `/prefix=tier`, comma separated; the longest matching prefix wins.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

/// Name of the tier used when no route class matches or a tier is unknown.
pub const DEFAULT_TIER: &str = "default";

/// Token bucket parameters for one tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierQuota {
    /// Tokens refilled over one `window`.
    pub capacity: u32,
    /// Time to refill the whole capacity.
    pub window: Duration,
    /// Extra tokens a fresh bucket holds on top of `capacity`.
    pub burst: u32,
}

impl TierQuota {
    pub fn new(capacity: u32, window: Duration, burst: u32) -> Self {
        Self {
            capacity,
            window,
            burst,
        }
    }

    /// Maximum tokens a bucket can hold (`capacity + burst`).
    pub fn max_tokens(&self) -> u32 {
        self.capacity.saturating_add(self.burst)
    }

    /// Time to replenish a single token.
    pub fn refill_interval(&self) -> Duration {
        self.window / self.capacity.max(1)
    }

    /// Seconds until a bucket drained to zero is full again.
    pub fn full_reset_secs(&self) -> u64 {
        secs_ceil(self.refill_interval().saturating_mul(self.max_tokens()))
    }
}

impl FromStr for TierQuota {
    type Err = String;

    /// Parse `capacity/window_secs+burst` (burst optional, defaults to 0).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (rate, burst) = match s.split_once('+') {
            Some((rate, burst)) => (rate, burst.trim()),
            None => (s, "0"),
        };
        let (capacity, window) = rate
            .split_once('/')
            .ok_or_else(|| format!("expected capacity/window_secs, got '{s}'"))?;

        let capacity: u32 = capacity
            .trim()
            .parse()
            .map_err(|e| format!("invalid capacity in '{s}': {e}"))?;
        let window_secs: u64 = window
            .trim()
            .parse()
            .map_err(|e| format!("invalid window in '{s}': {e}"))?;
        let burst: u32 = burst
            .parse()
            .map_err(|e| format!("invalid burst in '{s}': {e}"))?;

        if capacity == 0 {
            return Err(format!("capacity must be greater than 0 in '{s}'"));
        }
        if window_secs == 0 {
            return Err(format!("window must be greater than 0 in '{s}'"));
        }

        let quota = Self::new(capacity, Duration::from_secs(window_secs), burst);
        if quota.refill_interval().is_zero() {
            return Err(format!(
                "capacity {capacity} is too large for a {window_secs}s window in '{s}'"
            ));
        }
        Ok(quota)
    }
}

/// Round a duration up to whole seconds, never below 1.
pub fn secs_ceil(d: Duration) -> u64 {
    let secs = d.as_secs() + u64::from(d.subsec_nanos() > 0);
    secs.max(1)
}

/// All configured tiers. Always contains [`DEFAULT_TIER`].
#[derive(Debug, Clone, PartialEq)]
pub struct TierTable {
    tiers: HashMap<String, TierQuota>,
}

impl Default for TierTable {
    fn default() -> Self {
        let mut tiers = HashMap::new();
        tiers.insert(
            DEFAULT_TIER.to_string(),
            TierQuota::new(120, Duration::from_secs(60), 30),
        );
        tiers.insert(
            "auth".to_string(),
            TierQuota::new(10, Duration::from_secs(60), 5),
        );
        tiers.insert(
            "write".to_string(),
            TierQuota::new(30, Duration::from_secs(60), 10),
        );
        Self { tiers }
    }
}

impl TierTable {
    /// Build a table; a missing `default` tier is filled from the built-in table.
    pub fn new(mut tiers: HashMap<String, TierQuota>) -> Self {
        if !tiers.contains_key(DEFAULT_TIER)
            && let Some(default) = Self::default().tiers.remove(DEFAULT_TIER)
        {
            tiers.insert(DEFAULT_TIER.to_string(), default);
        }
        Self { tiers }
    }

    /// Resolve a tier by name, falling back to the default tier.
    ///
    /// Returns the name actually used alongside its quota.
    pub fn resolve<'a>(&'a self, name: &'a str) -> (&'a str, TierQuota) {
        match self.tiers.get(name) {
            Some(quota) => (name, *quota),
            None => (DEFAULT_TIER, self.default_quota()),
        }
    }

    fn default_quota(&self) -> TierQuota {
        self.tiers
            .get(DEFAULT_TIER)
            .copied()
            .unwrap_or_else(|| TierQuota::new(120, Duration::from_secs(60), 30))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &TierQuota)> {
        self.tiers.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.tiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }
}

impl FromStr for TierTable {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut tiers = HashMap::new();
        for entry in s.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (name, quota) = entry
                .split_once('=')
                .ok_or_else(|| format!("expected name=quota, got '{entry}'"))?;
            let name = name.trim();
            if name.is_empty() {
                return Err(format!("empty tier name in '{entry}'"));
            }
            tiers.insert(name.to_string(), quota.trim().parse()?);
        }
        Ok(Self::new(tiers))
    }
}

/// Path prefix → tier mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteClasses {
    /// Sorted by prefix length, longest first.
    entries: Vec<(String, String)>,
}

impl RouteClasses {
    pub fn new(entries: impl IntoIterator<Item = (String, String)>) -> Self {
        let mut entries: Vec<_> = entries.into_iter().collect();
        entries.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        Self { entries }
    }

    /// Tier name for `path` (segment-aware prefix match), or `default`.
    pub fn tier_for(&self, path: &str) -> &str {
        self.entries
            .iter()
            .find(|(prefix, _)| prefix_matches(prefix, path))
            .map(|(_, tier)| tier.as_str())
            .unwrap_or(DEFAULT_TIER)
    }

    pub fn tiers(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(_, tier)| tier.as_str())
    }
}

fn prefix_matches(prefix: &str, path: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || prefix.ends_with('/'),
        None => false,
    }
}

impl FromStr for RouteClasses {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut entries = Vec::new();
        for entry in s.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (prefix, tier) = entry
                .split_once('=')
                .ok_or_else(|| format!("expected /prefix=tier, got '{entry}'"))?;
            let prefix = prefix.trim();
            if !prefix.starts_with('/') {
                return Err(format!("route prefix must start with '/', got '{prefix}'"));
            }
            entries.push((prefix.to_string(), tier.trim().to_string()));
        }
        Ok(Self::new(entries))
    }
}
