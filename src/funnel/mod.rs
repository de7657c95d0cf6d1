//! Funnel core — domain model, correlation identity, and the state resolver.

pub mod correlation;
pub mod model;
pub mod resolver;

pub use model::{ConversionEvent, ConversionKind, DepositProgress, FunnelState, Screen, Tenant};
pub use resolver::{Resolution, ResolveInput, StateDelta, resolve};
