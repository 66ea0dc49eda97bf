use std::str::FromStr;

use ahash::AHashSet;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Inclusive port range, written as `start..end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    start: u16,
    end: u16,
}

impl PortRange {
    pub fn start(&self) -> u16 {
        self.start
    }

    pub fn end(&self) -> u16 {
        self.end
    }

    pub fn size(&self) -> usize {
        (self.end - self.start) as usize + 1
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }
}

impl From<std::ops::RangeInclusive<u16>> for PortRange {
    fn from(range: std::ops::RangeInclusive<u16>) -> Self {
        assert!(range.start() <= range.end());

        Self {
            start: *range.start(),
            end: *range.end(),
        }
    }
}

impl std::fmt::Display for PortRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

#[derive(Debug)]
pub struct PortRangeParseError(String);

impl std::error::Error for PortRangeParseError {}

impl std::fmt::Display for PortRangeParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<std::num::ParseIntError> for PortRangeParseError {
    fn from(error: std::num::ParseIntError) -> Self {
        PortRangeParseError(error.to_string())
    }
}

impl FromStr for PortRange {
    type Err = PortRangeParseError;

    /// ```
    /// use tunnel_service::ports::PortRange;
    ///
    /// let range: PortRange = "20000..20100".parse().unwrap();
    ///
    /// assert!(range.contains(20000));
    /// assert!(range.contains(20100));
    /// assert!(!range.contains(20101));
    ///
    /// // A single port is its own range.
    /// let single: PortRange = "7000".parse().unwrap();
    /// assert_eq!(single.size(), 1);
    /// ```
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = match s.split_once("..") {
            Some((start, end)) => (start.parse()?, end.parse()?),
            None => {
                let port: u16 = s.parse()?;
                (port, port)
            }
        };

        if start > end {
            return Err(PortRangeParseError(s.to_string()));
        }

        Ok(Self { start, end })
    }
}

#[cfg(feature = "serde")]
impl Serialize for PortRange {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(feature = "serde")]
impl<'de> Deserialize<'de> for PortRange {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).map_err(|e| serde::de::Error::custom(e.0))
    }
}

/// The allowed-ports policy of one broker: a list of ranges a service may
/// claim its public port from.
///
/// An empty policy permits any non-privileged port on explicit request but
/// leaves nothing for automatic assignment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct PortPolicy(Vec<PortRange>);

impl PortPolicy {
    pub fn new(ranges: Vec<PortRange>) -> Self {
        Self(ranges)
    }

    pub fn allows(&self, port: u16) -> bool {
        if self.0.is_empty() {
            port >= 1024
        } else {
            self.0.iter().any(|range| range.contains(port))
        }
    }

    pub fn ranges(&self) -> &[PortRange] {
        &self.0
    }

    pub fn capacity(&self) -> usize {
        self.0.iter().map(|range| range.size()).sum()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum PortError {
    /// Requested port is outside the allowed-ports policy.
    NotAllowed(u16),
    /// Requested port is already bound to another service.
    InUse(u16),
    /// No free port left for automatic assignment.
    Exhausted,
}

impl std::error::Error for PortError {}

impl std::fmt::Display for PortError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotAllowed(port) => write!(f, "port {} not allowed by policy", port),
            Self::InUse(port) => write!(f, "port {} already in use", port),
            Self::Exhausted => write!(f, "no free port in the allowed ranges"),
        }
    }
}

/// Hands out remote ports for dynamic services.
///
/// A requested port wins if the policy allows it and nothing holds it;
/// without a request the first free port of the policy is assigned, which
/// keeps handouts predictable for operators reading the ranges.
///
/// # Example
///
/// ```
/// use tunnel_service::ports::{PortAllocator, PortError, PortPolicy};
///
/// let policy = PortPolicy::new(vec!["20000..20002".parse().unwrap()]);
/// let mut ports = PortAllocator::new(policy);
///
/// assert_eq!(ports.acquire(None), Ok(20000));
/// assert_eq!(ports.acquire(Some(20002)), Ok(20002));
/// assert_eq!(ports.acquire(Some(20002)), Err(PortError::InUse(20002)));
/// assert_eq!(ports.acquire(None), Ok(20001));
/// assert_eq!(ports.acquire(None), Err(PortError::Exhausted));
///
/// ports.release(20001);
/// assert_eq!(ports.acquire(None), Ok(20001));
/// ```
#[derive(Debug, Default)]
pub struct PortAllocator {
    policy: PortPolicy,
    allocated: AHashSet<u16>,
}

impl PortAllocator {
    pub fn new(policy: PortPolicy) -> Self {
        let capacity = policy.capacity().min(1024);

        Self {
            policy,
            allocated: AHashSet::with_capacity(capacity),
        }
    }

    pub fn policy(&self) -> &PortPolicy {
        &self.policy
    }

    pub fn acquire(&mut self, requested: Option<u16>) -> Result<u16, PortError> {
        if let Some(port) = requested {
            if !self.policy.allows(port) {
                return Err(PortError::NotAllowed(port));
            }

            if !self.allocated.insert(port) {
                return Err(PortError::InUse(port));
            }

            return Ok(port);
        }

        for range in self.policy.ranges() {
            for port in range.iter() {
                if self.allocated.insert(port) {
                    return Ok(port);
                }
            }
        }

        Err(PortError::Exhausted)
    }

    /// Returns whether the port was actually held.
    pub fn release(&mut self, port: u16) -> bool {
        self.allocated.remove(&port)
    }

    pub fn in_use(&self, port: u16) -> bool {
        self.allocated.contains(&port)
    }

    pub fn len(&self) -> usize {
        self.allocated.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allocated.is_empty()
    }
}
