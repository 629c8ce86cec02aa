use std::{fs::File, path::Path};

use log::{info, warn};

use crate::{
    error::SimulationError,
    floating_type_mod::{FT, TAU},
};

/// Smallest accepted mask edge length (in pixels).
pub const MIN_MASK_SIZE: usize = 4;

/// Tiling mismatch (fraction of rows) above which a reset warns.
pub const TILE_MISMATCH_WARN_FRACTION: FT = 0.02;

/// Luma at or above which a mask image pixel counts as fluid.
pub const DEFAULT_MASK_THRESHOLD: FT = 0.5;

pub const DEFAULT_MASK_WIDTH: usize = 512;
pub const DEFAULT_MASK_HEIGHT: usize = 256;

/// Row-major binary obstacle map. `true` means fluid, `false` means solid.
///
/// Row `y` of the mask covers world heights `[y, y + 1) * Ly / height`.
#[derive(Debug, Clone, PartialEq)]
pub struct OccupancyMask {
    width: usize,
    height: usize,
    fluid: Vec<bool>,
}

impl OccupancyMask {
    pub fn new(width: usize, height: usize, fluid: Vec<bool>) -> Result<Self, SimulationError> {
        if width < MIN_MASK_SIZE || height < MIN_MASK_SIZE {
            return Err(SimulationError::InvalidMask(format!(
                "mask is {}x{} but needs at least {}x{} pixels",
                width, height, MIN_MASK_SIZE, MIN_MASK_SIZE
            )));
        }
        if fluid.len() != width * height {
            return Err(SimulationError::InvalidMask(format!(
                "expected {} cells for a {}x{} mask, got {}",
                width * height,
                width,
                height,
                fluid.len()
            )));
        }
        if !fluid.iter().any(|&f| f) {
            return Err(SimulationError::InvalidMask("mask contains no fluid cell".into()));
        }

        Ok(OccupancyMask { width, height, fluid })
    }

    pub fn from_fn(width: usize, height: usize, f: impl Fn(usize, usize) -> bool) -> Result<Self, SimulationError> {
        let fluid = (0..width * height).map(|i| f(i % width, i / width)).collect();
        Self::new(width, height, fluid)
    }

    /// Fluid rows `y_min..=y_max` spanning the whole width, solid elsewhere.
    pub fn straight_channel(width: usize, height: usize, y_min: usize, y_max: usize) -> Result<Self, SimulationError> {
        Self::from_fn(width, height, |_, y| y >= y_min && y <= y_max)
    }

    /// Procedural meandering channel that tiles seamlessly in x. This is what a
    /// session falls back to when no mask image can be loaded.
    pub fn default_channel(width: usize, height: usize) -> Self {
        let w = width.max(MIN_MASK_SIZE);
        let h = height.max(MIN_MASK_SIZE);
        let hf = h as f64;

        let fluid = (0..w * h)
            .map(|i| {
                let (x, y) = (i % w, i / w);
                let t = TAU as f64 * x as f64 / w as f64;
                let center = 0.5 * hf + t.sin() * 0.05 * hf;
                let half = 0.28 * hf + (t * 2.0 + 1.3).sin() * 0.06 * hf;
                let y = y as f64;
                y >= center - half && y <= center + half
            })
            .collect();

        OccupancyMask { width: w, height: h, fluid }
    }

    /// Decode a PNG and threshold its luma: pixels with luma >= `threshold`
    /// (in [0, 1]) are fluid.
    pub fn from_png(path: impl AsRef<Path>, threshold: FT) -> Result<Self, SimulationError> {
        let mut decoder = png::Decoder::new(File::open(path.as_ref())?);
        decoder.set_transformations(png::Transformations::EXPAND | png::Transformations::STRIP_16);
        let mut reader = decoder.read_info()?;
        let mut buf = vec![0; reader.output_buffer_size()];
        let frame = reader.next_frame(&mut buf)?;
        let bytes = &buf[..frame.buffer_size()];

        let channels = match frame.color_type {
            png::ColorType::Grayscale => 1,
            png::ColorType::GrayscaleAlpha => 2,
            png::ColorType::Rgb => 3,
            png::ColorType::Rgba => 4,
            png::ColorType::Indexed => {
                return Err(SimulationError::InvalidMask(
                    "indexed PNG was not expanded to RGB".into(),
                ))
            }
        };

        let width = frame.width as usize;
        let height = frame.height as usize;
        let fluid = (0..width * height)
            .map(|i| {
                let y = i / width;
                let x = i % width;
                let px = &bytes[y * frame.line_size + x * channels..];
                let luma = if channels < 3 {
                    px[0] as FT / 255.
                } else {
                    (0.299 * px[0] as FT + 0.587 * px[1] as FT + 0.114 * px[2] as FT) / 255.
                };
                luma >= threshold
            })
            .collect();

        Self::new(width, height, fluid)
    }

    /// Load `path` if given; on any failure log it and use `default_channel`.
    pub fn load_or_default(path: Option<&Path>, threshold: FT) -> Self {
        match path {
            Some(path) => match Self::from_png(path, threshold) {
                Ok(mask) => {
                    info!("loaded {}x{} mask from {}", mask.width, mask.height, path.display());
                    mask
                }
                Err(err) => {
                    warn!(
                        "mask {} unusable ({}); using procedural default mask",
                        path.display(),
                        err
                    );
                    Self::default_channel(DEFAULT_MASK_WIDTH, DEFAULT_MASK_HEIGHT)
                }
            },
            None => {
                info!("no mask given; using procedural default mask");
                Self::default_channel(DEFAULT_MASK_WIDTH, DEFAULT_MASK_HEIGHT)
            }
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    #[inline(always)]
    pub fn is_fluid(&self, x: usize, y: usize) -> bool {
        self.fluid[y * self.width + x]
    }

    pub fn fluid_fraction(&self) -> FT {
        let fluid_count = self.fluid.iter().filter(|&&f| f).count();
        fluid_count as FT / (self.width * self.height) as FT
    }

    /// Fraction of rows whose leftmost and rightmost pixel disagree.
    pub fn tile_mismatch_x(&self) -> FT {
        let mismatched = (0..self.height)
            .filter(|&y| self.is_fluid(0, y) != self.is_fluid(self.width - 1, y))
            .count();
        mismatched as FT / self.height as FT
    }

    /// A solid pixel that touches fluid through one of its four neighbors
    /// (x wraps around, y is clamped).
    pub fn is_interface_solid(&self, x: usize, y: usize) -> bool {
        if self.is_fluid(x, y) {
            return false;
        }
        let xm = (x + self.width - 1) % self.width;
        let xp = (x + 1) % self.width;
        let ym = y.saturating_sub(1);
        let yp = usize::min(self.height - 1, y + 1);

        self.is_fluid(xm, y) || self.is_fluid(xp, y) || self.is_fluid(x, ym) || self.is_fluid(x, yp)
    }
}
