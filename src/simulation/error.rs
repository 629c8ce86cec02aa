use std::collections::TryReserveError;

use thiserror::Error;

/// Everything that can go wrong while setting up or configuring a simulation.
///
/// Stepping itself never fails: numerical degeneracies are floored inside the
/// kernels and a session that is not ready simply skips the step.
#[derive(Debug, Error)]
pub enum SimulationError {
    #[error("invalid occupancy mask: {0}")]
    InvalidMask(String),

    #[error("invalid simulation parameters: {0}")]
    InvalidParameters(String),

    #[error("failed to allocate {what}: {source}")]
    Allocation {
        what: &'static str,
        #[source]
        source: TryReserveError,
    },

    #[error("failed reading mask image: {0}")]
    MaskIo(#[from] std::io::Error),

    #[error("failed decoding mask image: {0}")]
    MaskDecode(#[from] png::DecodingError),

    #[error("failed parsing config: {0}")]
    Config(#[from] serde_yaml::Error),

    #[error("failed building worker thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("failed exporting frame: {0}")]
    Export(String),
}

impl SimulationError {
    pub(crate) fn allocation(what: &'static str) -> impl FnOnce(TryReserveError) -> SimulationError {
        move |source| SimulationError::Allocation { what, source }
    }
}

/// Reserve exactly `len` elements up front so that an oversized request is
/// reported instead of aborting the process.
pub(crate) fn try_vec_from_fn<T>(
    len: usize,
    what: &'static str,
    f: impl FnMut(usize) -> T,
) -> Result<Vec<T>, SimulationError> {
    let mut v = Vec::new();
    v.try_reserve_exact(len).map_err(SimulationError::allocation(what))?;
    v.extend((0..len).map(f));
    Ok(v)
}
