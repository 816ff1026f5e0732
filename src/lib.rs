pub mod app;
pub mod config;
pub mod crs;
pub mod domain;
pub mod error;
pub mod fire;
pub mod fs_util;
pub mod grid;
pub mod output;
pub mod raster;
pub mod regrid;
pub mod sources;
pub mod store;
pub mod tabular;
pub mod temporal;
