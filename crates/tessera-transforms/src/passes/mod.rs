//! Transformation passes built on the rewrite machinery.

mod tile_maps;

pub use tile_maps::TileAndFuseMapsPass;
