//! DNS resolver, hosts tree, and fake-IP pool — external collaborators.
//!
//! The concrete resolver (upstream queries, DNS-over-whatever transports,
//! real fake-IP allocation) sits outside the dispatch core; these traits are
//! its contract, plus a small in-memory stand-in used by tests and by the
//! default build when no real resolver is wired in.

mod hosts;
mod resolver;

pub use hosts::{HostsTree, StaticHostsTree};
pub use resolver::{FakeIpPool, NullFakeIpPool, Resolver, StaticResolver};
