//! Image inputs and the patch encoder that turns them into soft tokens.
//!
//! An image is split into a `grid x grid` patch grid (`grid² == image_tokens`).
//! Each patch is summarised as `[mean_r, mean_g, mean_b, 1.0]` (channels
//! scaled to `[0, 1]`), projected to `d_model` by a `[4, d]` matrix and then
//! optionally passed through a `[d, d]` adapter.

use std::path::Path;

use crate::artifact::{ArtifactFile, ArtifactKind};
use crate::config::ArchitectureConfig;
use crate::ops::matvec;
use crate::weights::{ModelWeights, PATCH_FEATURES, VISION_PROJECTION};
use crate::{ModelError, ModelResult};

pub const VISION_ADAPTER: &str = "vision.adapter";

/// An RGB8 image, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl Image {
    /// Wrap raw RGB8 pixels. The buffer must hold exactly `width * height * 3` bytes.
    pub fn from_rgb8(width: u32, height: u32, pixels: Vec<u8>) -> ModelResult<Self> {
        if width == 0 || height == 0 {
            return Err(ModelError::InvalidImage(format!(
                "image must be non-empty, got {width}x{height}"
            )));
        }
        let expected = width as usize * height as usize * 3;
        if pixels.len() != expected {
            return Err(ModelError::InvalidImage(format!(
                "{width}x{height} RGB8 needs {expected} bytes, got {}",
                pixels.len()
            )));
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    /// Single-colour image.
    pub fn solid(width: u32, height: u32, rgb: [u8; 3]) -> ModelResult<Self> {
        let pixels = rgb
            .iter()
            .copied()
            .cycle()
            .take(width as usize * height as usize * 3)
            .collect();
        Self::from_rgb8(width, height, pixels)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    fn pixel(&self, x: usize, y: usize) -> [u8; 3] {
        let idx = (y * self.width as usize + x) * 3;
        [self.pixels[idx], self.pixels[idx + 1], self.pixels[idx + 2]]
    }
}

/// Projects image patches into the model's embedding space.
#[derive(Debug, Clone)]
pub struct VisionEncoder {
    d_model: usize,
    grid: usize,
    projection: Vec<f32>,      // [PATCH_FEATURES, d]
    adapter: Option<Vec<f32>>, // [d, d]
}

impl VisionEncoder {
    /// Assemble the encoder for a model.
    ///
    /// The projection comes from `encoder_path` when given, otherwise from the
    /// model's own `vision.projection` tensor. Returns `Ok(None)` when neither
    /// exists: the model is text-only.
    pub fn assemble(
        config: &ArchitectureConfig,
        weights: &ModelWeights,
        encoder_path: Option<&Path>,
        adapter_path: Option<&Path>,
    ) -> ModelResult<Option<Self>> {
        let d = config.d_model;

        let projection = match encoder_path {
            Some(path) => {
                let file = ArtifactFile::open_kind(path, ArtifactKind::VisionEncoder)?;
                Some(file.tensor_with_shape(VISION_PROJECTION, &[PATCH_FEATURES, d])?)
            }
            None => weights.vision_projection.clone(),
        };

        let adapter = adapter_path
            .map(|path| {
                let file = ArtifactFile::open_kind(path, ArtifactKind::VisionAdapter)?;
                file.tensor_with_shape(VISION_ADAPTER, &[d, d])
            })
            .transpose()?;

        let Some(projection) = projection else {
            if adapter.is_some() {
                return Err(ModelError::MissingTensor(format!(
                    "{VISION_PROJECTION} (a vision adapter needs an encoder)"
                )));
            }
            return Ok(None);
        };

        Ok(Some(Self {
            d_model: d,
            grid: config.patch_grid(),
            projection,
            adapter,
        }))
    }

    /// Soft tokens produced per image.
    pub fn tokens_per_image(&self) -> usize {
        self.grid * self.grid
    }

    pub fn has_adapter(&self) -> bool {
        self.adapter.is_some()
    }

    /// Encode an image into `tokens_per_image()` embeddings of width `d_model`.
    pub fn encode(&self, image: &Image) -> ModelResult<Vec<Vec<f32>>> {
        let (w, h) = (image.width as usize, image.height as usize);
        if w < self.grid || h < self.grid {
            return Err(ModelError::InvalidImage(format!(
                "{w}x{h} image is smaller than the {g}x{g} patch grid",
                g = self.grid
            )));
        }

        let mut embeddings = Vec::with_capacity(self.tokens_per_image());
        for row in 0..self.grid {
            let (y0, y1) = (row * h / self.grid, (row + 1) * h / self.grid);
            for col in 0..self.grid {
                let (x0, x1) = (col * w / self.grid, (col + 1) * w / self.grid);

                let mut sums = [0.0f32; 3];
                for y in y0..y1 {
                    for x in x0..x1 {
                        for (sum, channel) in sums.iter_mut().zip(image.pixel(x, y)) {
                            *sum += channel as f32;
                        }
                    }
                }
                let count = ((y1 - y0) * (x1 - x0)) as f32 * 255.0;
                let features = [sums[0] / count, sums[1] / count, sums[2] / count, 1.0];

                let mut embedding = matvec(&features, &self.projection, PATCH_FEATURES, self.d_model)?;
                if let Some(adapter) = &self.adapter {
                    embedding = matvec(&embedding, adapter, self.d_model, self.d_model)?;
                }
                embeddings.push(embedding);
            }
        }

        Ok(embeddings)
    }
}
