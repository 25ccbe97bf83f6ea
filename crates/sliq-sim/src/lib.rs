//! Deterministic in-memory network simulation for SLIQ integration
//! testing: seeded Bernoulli loss, fixed one-way delay, and a virtual
//! microsecond clock driving two connection endpoints.

pub mod harness;
pub mod netsim;

pub mod test_util;
