//! Quasi-static simulation of an accordion-folded elastic strip pressed by a
//! rigid plate, producing its force-displacement curve.

pub mod air;
pub mod builder;
pub mod config;
pub mod controller;
pub mod datatypes;
pub mod error;
pub mod experiment;
pub mod logging;
pub mod mesh;
pub mod post_processor;
pub mod solver;
