use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::canvas::{CanvasState, Layer};
use crate::components::history::{CanvasSnapshotCommand, HistoryManager, LayerSnapshotCommand};
use crate::config::StudioSettings;
use crate::error::{Result, StudioError};
use crate::io::{self, SaveOptions};
use crate::ops::mask::Region;
use crate::ops::transform::transform_canvas;
use crate::ops::{Filter, JobContext, apply_filter, apply_filters};

/// Explicit service object handed to anything that needs configuration.
#[derive(Debug, Default)]
pub struct StudioContext {
    pub settings: StudioSettings,
    untitled_counter: usize,
}

impl StudioContext {
    pub fn new(settings: StudioSettings) -> Self {
        Self {
            settings,
            untitled_counter: 0,
        }
    }

    /// Settings from `config` if given, else from the platform settings path.
    pub fn from_config(config: Option<&Path>) -> Self {
        let settings = match config {
            Some(path) => StudioSettings::load_from(path),
            None => StudioSettings::load(),
        };
        Self::new(settings)
    }

    /// A fresh undo stack sized from the settings.
    pub fn history(&self) -> HistoryManager {
        HistoryManager::new(self.settings.max_undo_steps).with_memory_limit(self.settings.history_memory_limit())
    }

    /// Encoder options for `path`, using the configured quality and TIFF mode.
    pub fn save_options_for(&self, path: &Path) -> SaveOptions {
        SaveOptions {
            quality: self.settings.jpeg_quality,
            tiff_compression: self.settings.tiff_compression,
            ..SaveOptions::for_path(path)
        }
    }

    pub fn new_document(&mut self, width: u32, height: u32) -> Document {
        self.untitled_counter += 1;
        let mut canvas = CanvasState::new(width, height);
        canvas.layers.push(Layer::new(
            "Background",
            width,
            height,
            image::Rgba([255, 255, 255, 255]),
        ));
        Document {
            id: Uuid::new_v4(),
            canvas,
            history: self.history(),
            path: None,
            dirty: false,
            name: format!("Untitled-{}", self.untitled_counter),
        }
    }

    pub fn open_document(&self, path: &Path) -> Result<Document> {
        let canvas = io::load_image(path)?;
        tracing::info!(path = %path.display(), layers = canvas.layers.len(), "document opened");
        Ok(Document {
            id: Uuid::new_v4(),
            canvas,
            history: self.history(),
            path: Some(path.to_path_buf()),
            dirty: false,
            name: file_name(path),
        })
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "Unknown".to_string())
}

/// Single open document.
pub struct Document {
    pub id: Uuid,
    pub canvas: CanvasState,
    pub history: HistoryManager,
    /// `None` for unsaved/untitled files.
    pub path: Option<PathBuf>,
    pub dirty: bool,
    /// Display name (derived from path or "Untitled-X")
    pub name: String,
}

impl Document {
    /// Wrap an existing canvas as an untitled document.
    pub fn from_canvas(name: impl Into<String>, canvas: CanvasState, history: HistoryManager) -> Self {
        Self {
            id: Uuid::new_v4(),
            canvas,
            history,
            path: None,
            dirty: false,
            name: name.into(),
        }
    }

    /// Display title, with `*` when there are unsaved changes.
    pub fn title(&self) -> String {
        if self.dirty {
            format!("{}*", self.name)
        } else {
            self.name.clone()
        }
    }

    /// Apply one filter. Pixel filters touch only the active layer, inside
    /// `region` when given; transforms resize every layer and cannot take a
    /// region. Nothing changes unless the filter succeeds.
    pub fn apply_filter(&mut self, filter: &Filter, region: Option<&Region>, ctx: &JobContext) -> Result<()> {
        self.apply_chain(std::slice::from_ref(filter), region, ctx)
    }

    /// Apply a chain as a single undo step.
    pub fn apply_chain(&mut self, filters: &[Filter], region: Option<&Region>, ctx: &JobContext) -> Result<()> {
        if filters.is_empty() {
            return Ok(());
        }
        let description = filters.iter().map(|f| f.to_string()).collect::<Vec<_>>().join(", ");

        if filters.iter().any(Filter::is_transform) {
            if region.is_some() {
                return Err(StudioError::invalid(
                    description,
                    "transforms apply to the whole canvas and cannot be restricted to a region",
                ));
            }
            self.apply_with_transforms(filters, description, ctx)
        } else {
            self.apply_to_active_layer(filters, region, description, ctx)
        }
    }

    fn active_index(&self) -> Result<usize> {
        let index = self.canvas.active_layer_index;
        if index >= self.canvas.layers.len() {
            return Err(StudioError::LayerIndex {
                index,
                count: self.canvas.layers.len(),
            });
        }
        Ok(index)
    }

    fn apply_to_active_layer(
        &mut self,
        filters: &[Filter],
        region: Option<&Region>,
        description: String,
        ctx: &JobContext,
    ) -> Result<()> {
        let index = self.active_index()?;
        let mask = region.map(|r| r.to_mask(self.canvas.width, self.canvas.height));
        let filtered = apply_filters(&self.canvas.layers[index].pixels, filters, mask.as_ref(), ctx)?;

        let mut cmd = LayerSnapshotCommand::new_for_layer(description, &self.canvas, index);
        self.canvas.set_layer_pixels(index, filtered)?;
        cmd.set_after(&self.canvas);
        self.history.push(Box::new(cmd));
        self.dirty = true;
        Ok(())
    }

    fn apply_with_transforms(&mut self, filters: &[Filter], description: String, ctx: &JobContext) -> Result<()> {
        let index = self.active_index()?;
        let mut work = self.canvas.clone();
        let steps = filters.len() as f32;

        for (i, filter) in filters.iter().enumerate() {
            let step = ctx.span(i as f32 / steps, (i + 1) as f32 / steps);
            if filter.is_transform() {
                transform_canvas(&mut work, |img| apply_filter(img, filter, None, &step))?;
            } else {
                let filtered = apply_filter(&work.layers[index].pixels, filter, None, &step)?;
                work.set_layer_pixels(index, filtered)?;
            }
        }

        let mut cmd = CanvasSnapshotCommand::new(description, &self.canvas);
        self.canvas = work;
        cmd.set_after(&self.canvas);
        self.history.push(Box::new(cmd));
        self.dirty = true;
        Ok(())
    }

    /// Undo the last step; returns its description.
    pub fn undo(&mut self) -> Option<String> {
        let done = self.history.undo(&mut self.canvas);
        if done.is_some() {
            self.dirty = true;
        }
        done
    }

    pub fn redo(&mut self) -> Option<String> {
        let done = self.history.redo(&mut self.canvas);
        if done.is_some() {
            self.dirty = true;
        }
        done
    }

    /// Write to the document's own path.
    pub fn save(&mut self, options: &SaveOptions) -> Result<()> {
        let path = self
            .path
            .clone()
            .ok_or_else(|| StudioError::invalid("save", "document has no file path yet; use save_as"))?;
        self.save_as(&path, options)
    }

    /// Write to `path` and adopt it as the document's path.
    pub fn save_as(&mut self, path: &Path, options: &SaveOptions) -> Result<()> {
        io::save_canvas(&self.canvas, path, options)?;
        self.path = Some(path.to_path_buf());
        self.name = file_name(path);
        self.dirty = false;
        tracing::info!(path = %path.display(), "document saved");
        Ok(())
    }
}
