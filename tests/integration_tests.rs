//! Integration tests for the monitoring engine

#[path = "integration/helpers.rs"]
mod helpers;

#[path = "integration/presence_lifecycle.rs"]
mod presence_lifecycle;

#[path = "integration/identity.rs"]
mod identity;

#[path = "integration/isolation.rs"]
mod isolation;

#[path = "integration/cycles.rs"]
mod cycles;

#[path = "integration/actor.rs"]
mod actor;

#[path = "integration/collect.rs"]
mod collect;
