//! Knoux Studio: a layered raster pipeline with tone/color and neighborhood
//! filters, blend-mode compositing, undo history, cancellable background
//! jobs and a batch command-line front end.

pub mod canvas;
pub mod cli;
pub mod components;
pub mod config;
pub mod error;
pub mod io;
pub mod logger;
pub mod ops;
pub mod project;
pub mod worker;

pub use canvas::{BlendMode, CanvasState, Layer};
pub use error::{Result, StudioError};
pub use ops::{Filter, JobContext, Recipe};
