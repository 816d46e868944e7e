use core::fmt;

/// Direction of a TBF or RLC engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Uplink, MS to network
    Up,
    /// Downlink, network to MS
    Down,
}

impl Direction {
    /// Index into two-element per-direction tables.
    #[inline]
    pub fn index(self) -> usize {
        match self {
            Direction::Up => 0,
            Direction::Down => 1,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Up => write!(f, "up"),
            Direction::Down => write!(f, "down"),
        }
    }
}

/// Direction filter for operations that may apply to one or both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirFilter {
    Up,
    Down,
    Either,
}

impl DirFilter {
    #[inline]
    pub fn matches(self, dir: Direction) -> bool {
        match self {
            DirFilter::Up => dir == Direction::Up,
            DirFilter::Down => dir == Direction::Down,
            DirFilter::Either => true,
        }
    }
}

impl From<Direction> for DirFilter {
    fn from(d: Direction) -> DirFilter {
        match d {
            Direction::Up => DirFilter::Up,
            Direction::Down => DirFilter::Down,
        }
    }
}
