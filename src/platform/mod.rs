//! Boundary adapter for the remote geospatial compute platform.
//!
//! All raster work (mosaicking, zonal reduction, tiling) happens on the
//! platform. This module only describes requests, sends them and turns
//! whatever comes back into typed results.

pub mod earth_engine;
pub mod error;
pub mod expression;

pub use earth_engine::{EarthEngineClient, EarthEngineConfig};
pub use error::PlatformError;

use crate::models::{AggregationRequest, ResultTable};

/// A platform able to run zonal reductions over a raster.
#[allow(async_fn_in_trait)]
pub trait ComputePlatform {
    /// Reduce the request's raster over every polygon of its collection.
    ///
    /// Blocks (asynchronously) until the platform returns a table or an error.
    async fn reduce_regions(
        &self,
        request: &AggregationRequest<'_>,
    ) -> Result<ResultTable, PlatformError>;
}
