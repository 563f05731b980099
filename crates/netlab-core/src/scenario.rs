//! Link-state mutation plans.
//!
//! A plan is a compact description ("fail over from A to B at 3 s") that
//! expands into the concrete up/down events the driver schedules. Random plans
//! draw from a seeded [`StdRng`], so the same seed and run index always give
//! the same timeline.

use crate::time::{SimDuration, SimTime};
use rand::RngExt as _;
use rand::SeedableRng;
use rand::rngs::StdRng;

/// Which link an event toggles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkTarget {
    Link(String),
    /// Interface `index` of `node`; index 0 is loopback.
    Interface { node: String, index: u32 },
}

/// One scheduled link-state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEventSpec {
    pub at: SimTime,
    pub target: LinkTarget,
    pub up: bool,
}

impl LinkEventSpec {
    fn link(at: SimTime, name: &str, up: bool) -> Self {
        LinkEventSpec {
            at,
            target: LinkTarget::Link(name.to_string()),
            up,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkPlan {
    /// Bring `to` up at `at`, take `from` down `overlap` later.
    MakeBeforeBreak {
        from: String,
        to: String,
        at: SimTime,
        overlap: SimDuration,
    },
    /// Take `from` down at `at`, bring `to` up `gap` later.
    BreakBeforeMake {
        from: String,
        to: String,
        at: SimTime,
        gap: SimDuration,
    },
    /// `link` is down during `[at, at + duration)`.
    Outage {
        link: String,
        at: SimTime,
        duration: SimDuration,
    },
    /// Periodic short outages: down for `down_for` at the start of every
    /// `period`, from `start` until `until`.
    Pulse {
        link: String,
        start: SimTime,
        period: SimDuration,
        down_for: SimDuration,
        until: SimTime,
    },
    /// Exponentially distributed up and down periods between `start` and
    /// `end`. The link is left up at `end`.
    Flapping {
        link: String,
        start: SimTime,
        end: SimTime,
        mean_up: SimDuration,
        mean_down: SimDuration,
    },
}

impl LinkPlan {
    /// Link names the plan refers to.
    pub fn links(&self) -> Vec<&str> {
        match self {
            LinkPlan::MakeBeforeBreak { from, to, .. }
            | LinkPlan::BreakBeforeMake { from, to, .. } => vec![from.as_str(), to.as_str()],
            LinkPlan::Outage { link, .. }
            | LinkPlan::Pulse { link, .. }
            | LinkPlan::Flapping { link, .. } => vec![link.as_str()],
        }
    }

    /// Concrete events in the order they must be applied. Events sharing a
    /// timestamp keep the order listed here.
    pub fn expand(&self, rng: &mut StdRng) -> Vec<LinkEventSpec> {
        match self {
            LinkPlan::MakeBeforeBreak {
                from,
                to,
                at,
                overlap,
            } => vec![
                LinkEventSpec::link(*at, to, true),
                LinkEventSpec::link(*at + *overlap, from, false),
            ],
            LinkPlan::BreakBeforeMake { from, to, at, gap } => vec![
                LinkEventSpec::link(*at, from, false),
                LinkEventSpec::link(*at + *gap, to, true),
            ],
            LinkPlan::Outage { link, at, duration } => vec![
                LinkEventSpec::link(*at, link, false),
                LinkEventSpec::link(*at + *duration, link, true),
            ],
            LinkPlan::Pulse {
                link,
                start,
                period,
                down_for,
                until,
            } => {
                let mut events = Vec::new();
                if !period.is_positive() {
                    return events;
                }
                let mut t = *start;
                while t < *until {
                    let back_up = (t + *down_for).min(*until);
                    events.push(LinkEventSpec::link(t, link, false));
                    events.push(LinkEventSpec::link(back_up, link, true));
                    t += *period;
                }
                events
            }
            LinkPlan::Flapping {
                link,
                start,
                end,
                mean_up,
                mean_down,
            } => {
                let mut events = Vec::new();
                let mut t = *start;
                let mut up = true;
                loop {
                    let mean = if up { *mean_up } else { *mean_down };
                    t += exponential(rng, mean);
                    if t >= *end {
                        break;
                    }
                    up = !up;
                    events.push(LinkEventSpec::link(t, link, up));
                }
                if !up {
                    events.push(LinkEventSpec::link(*end, link, true));
                }
                events
            }
        }
    }
}

/// Expands every plan with one RNG and merges the result by time. The sort is
/// stable, so ties keep plan order.
pub fn expand_plans(plans: &[LinkPlan], seed: u64) -> Vec<LinkEventSpec> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut events: Vec<LinkEventSpec> = plans.iter().flat_map(|p| p.expand(&mut rng)).collect();
    events.sort_by_key(|e| e.at);
    events
}

/// Seed for an independent random stream of run `run`.
pub fn stream_seed(seed: u64, run: u32, stream: u64) -> u64 {
    seed ^ (u64::from(run) + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ stream.rotate_left(32)
}

/// Exponential draw with the given mean, at least 1 ns so time advances.
fn exponential(rng: &mut StdRng, mean: SimDuration) -> SimDuration {
    if !mean.is_positive() {
        return SimDuration::from_nanos(1);
    }
    let u: f64 = rng.random::<f64>();
    let d = mean.mul_f64(-(1.0 - u).ln());
    if d.is_positive() {
        d
    } else {
        SimDuration::from_nanos(1)
    }
}
