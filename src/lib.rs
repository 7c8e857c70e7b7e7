#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod config;
mod core;
mod engine;
pub mod error;
pub mod fs;
mod graph;
mod invalidation;
mod params;
mod registry;
mod rules;

#[cfg(feature = "logging")]
pub mod logging;
#[cfg(feature = "process")]
pub mod process;

pub use crate::config::EngineConfig;
pub use crate::core::{Hash32, TypeKey};
pub use crate::engine::{
    CancelHandle, Context, Diagnostics, Execution, ExecutionRequest, Get, MultiGet, Outcome, Scheduler, Session,
};
pub use crate::error::{EngineError, Failure, GraphError, RegistryError, RequestError};
pub use crate::graph::RuleGraph;
pub use crate::invalidation::{Fact, FactVersion};
pub use crate::params::{IntoParams, Param, ParamList, ParamTypes, Params, Product, Value};
pub use crate::registry::{RuleRegistry, UnionMembership};
pub use crate::rules::{DependencyKey, Inputs, Query, Rule, RuleBuilder, RuleId, rule};
