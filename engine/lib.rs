#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

pub mod arguments;
pub mod ccd;
pub mod columns;
pub mod data;
pub mod io;
pub mod model;
pub mod prior;
pub mod stats;

// Hyperparameter search drivers
#[path = "../search/mod.rs"]
pub mod search;

// Posterior sampling
#[path = "../mcmc/mod.rs"]
pub mod mcmc;
