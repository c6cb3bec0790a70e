#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use ndarray::Array3;
use tilescale_core::{
    Image, ModelCache, ModelLoader, Precision, ProgressEvent, ProgressSink, UpscaleEngine,
    UpscaleError, Upsampler,
};

/// Behaviour of one fake model.
#[derive(Debug, Clone, Copy)]
pub struct FakeModel {
    pub scale: u32,
    /// Tiles with a side longer than this fail with `ResourceExhausted`.
    pub max_tile_side: Option<u32>,
    /// Every tile fails with `PrecisionUnsupported` while loaded reduced.
    pub rejects_reduced: bool,
    /// Every tile fails with `PrecisionUnsupported` in full precision too.
    pub rejects_full: bool,
    /// Every tile fails with a plain inference error.
    pub broken: bool,
}

impl FakeModel {
    pub fn nearest(scale: u32) -> Self {
        Self {
            scale,
            max_tile_side: None,
            rejects_reduced: false,
            rejects_full: false,
            broken: false,
        }
    }
}

/// Nearest-neighbour upscaling, the reference the tiled output is compared to.
pub fn nearest_upscale(image: &Image, scale: u32) -> Image {
    let s = scale as usize;
    let src = image.data();
    let (channels, h, w) = src.dim();
    let data = Array3::from_shape_fn((channels, h * s, w * s), |(c, y, x)| src[[c, y / s, x / s]]);
    Image::new(data, image.precision()).unwrap()
}

pub struct FakeUpsampler {
    model: FakeModel,
    precision: Precision,
}

impl Upsampler for FakeUpsampler {
    fn scale(&self) -> u32 {
        self.model.scale
    }

    fn precision(&self) -> Precision {
        self.precision
    }

    fn upsample(&mut self, tile: &Image) -> tilescale_core::Result<Image> {
        let side = tile.width().max(tile.height());
        if self.model.max_tile_side.is_some_and(|max| side > max) {
            return Err(UpscaleError::exhausted(side, "CUDA failure 2: out of memory"));
        }
        if self.model.rejects_reduced && self.precision == Precision::Reduced {
            return Err(UpscaleError::precision("no float16 kernel for Conv"));
        }
        if self.model.rejects_full && self.precision == Precision::Full {
            return Err(UpscaleError::precision("no float kernel for Conv"));
        }
        if self.model.broken {
            return Err(UpscaleError::inference("invalid output name"));
        }
        Ok(nearest_upscale(tile, self.model.scale))
    }
}

#[derive(Default)]
pub struct FakeLoader {
    models: HashMap<String, FakeModel>,
    pub loads: Mutex<Vec<(String, Precision)>>,
    pub releases: Mutex<Vec<String>>,
}

impl FakeLoader {
    pub fn with(models: &[(&str, FakeModel)]) -> Arc<Self> {
        Arc::new(Self {
            models: models
                .iter()
                .map(|(id, model)| (id.to_string(), *model))
                .collect(),
            ..Self::default()
        })
    }

    pub fn load_count(&self) -> usize {
        self.loads.lock().unwrap().len()
    }
}

impl ModelLoader for FakeLoader {
    fn contains(&self, model_id: &str) -> bool {
        self.models.contains_key(model_id)
    }

    fn load(&self, model_id: &str, precision: Precision) -> tilescale_core::Result<Box<dyn Upsampler>> {
        let model = self.models[model_id];
        self.loads
            .lock()
            .unwrap()
            .push((model_id.to_string(), precision));
        Ok(Box::new(FakeUpsampler { model, precision }))
    }

    fn release(&self, model_id: &str) {
        self.releases.lock().unwrap().push(model_id.to_string());
    }
}

/// Records every event it sees.
pub fn record_events(sink: &ProgressSink) -> Arc<Mutex<Vec<ProgressEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let captured = Arc::clone(&events);
    sink.subscribe(move |event| captured.lock().unwrap().push(event.clone()));
    events
}

pub fn engine(loader: Arc<FakeLoader>, capacity: usize, reduced_precision: bool) -> UpscaleEngine {
    let cache = ModelCache::new(
        loader,
        Arc::new(ProgressSink::new()),
        capacity,
        reduced_precision,
    )
    .unwrap();
    UpscaleEngine::new(Arc::new(cache))
}

/// Deterministic non-constant test image.
pub fn pattern(width: u32, height: u32) -> Image {
    let data = Array3::from_shape_fn((3, height as usize, width as usize), |(c, y, x)| {
        ((x * 31 + y * 17 + c * 7) % 97) as f32 / 96.0
    });
    Image::new(data, Precision::Full).unwrap()
}

pub fn max_abs_diff(a: &Image, b: &Image) -> f32 {
    assert_eq!((a.width(), a.height()), (b.width(), b.height()));
    a.data()
        .iter()
        .zip(b.data().iter())
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f32::max)
}
