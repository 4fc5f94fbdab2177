use std::collections::VecDeque;
use std::fmt;

use crate::canvas::{BlendMode, CanvasState, Layer};
use image::RgbaImage;

/// Undo depth used when nothing else is configured.
pub const DEFAULT_MAX_HISTORY: usize = 50;

/// Memory cap for the history stacks when nothing else is configured.
pub const DEFAULT_MAX_MEMORY_BYTES: usize = 512 * 1024 * 1024;

// ============================================================================
// COMMAND TRAIT
// ============================================================================

/// Trait for undoable/redoable commands.
pub trait Command: Send + Sync {
    fn undo(&self, canvas: &mut CanvasState);
    fn redo(&self, canvas: &mut CanvasState);
    fn description(&self) -> String;
    fn memory_size(&self) -> usize;
}

// ============================================================================
// HISTORY MANAGER - Manages undo/redo stacks with memory limits
// ============================================================================

/// Undo/redo history manager with memory limits.
pub struct HistoryManager {
    undo_stack: VecDeque<Box<dyn Command>>,
    redo_stack: VecDeque<Box<dyn Command>>,
    max_history_size: usize,
    /// Optional memory cap in bytes.
    max_memory_bytes: Option<usize>,
    /// Running memory total across both stacks.
    total_memory: usize,
}

impl Default for HistoryManager {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HISTORY)
    }
}

impl fmt::Debug for HistoryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HistoryManager")
            .field("undo", &self.undo_stack.len())
            .field("redo", &self.redo_stack.len())
            .field("max_history_size", &self.max_history_size)
            .field("max_memory_bytes", &self.max_memory_bytes)
            .field("total_memory", &self.total_memory)
            .finish()
    }
}

impl HistoryManager {
    pub fn new(max_history_size: usize) -> Self {
        Self {
            undo_stack: VecDeque::new(),
            redo_stack: VecDeque::new(),
            max_history_size: max_history_size.max(1),
            max_memory_bytes: Some(DEFAULT_MAX_MEMORY_BYTES),
            total_memory: 0,
        }
    }

    /// Replace the memory cap (`None` = unlimited).
    pub fn with_memory_limit(mut self, max_bytes: Option<usize>) -> Self {
        self.max_memory_bytes = max_bytes;
        self.prune();
        self
    }

    pub fn max_history_size(&self) -> usize {
        self.max_history_size
    }

    pub fn push(&mut self, command: Box<dyn Command>) {
        // Clear redo stack when a new action is performed
        for cmd in self.redo_stack.drain(..) {
            self.total_memory = self.total_memory.saturating_sub(cmd.memory_size());
        }

        self.total_memory += command.memory_size();
        tracing::debug!(action = %command.description(), bytes = command.memory_size(), "history push");
        self.undo_stack.push_back(command);

        self.prune();
    }

    pub fn undo(&mut self, canvas: &mut CanvasState) -> Option<String> {
        let command = self.undo_stack.pop_back()?;
        let description = command.description();
        command.undo(canvas);
        self.redo_stack.push_back(command);
        Some(description)
    }

    pub fn redo(&mut self, canvas: &mut CanvasState) -> Option<String> {
        let command = self.redo_stack.pop_back()?;
        let description = command.description();
        command.redo(canvas);
        self.undo_stack.push_back(command);
        Some(description)
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    pub fn undo_description(&self) -> Option<String> {
        self.undo_stack.back().map(|c| c.description())
    }

    pub fn redo_description(&self) -> Option<String> {
        self.redo_stack.back().map(|c| c.description())
    }

    /// Get all undo descriptions (most recent first)
    pub fn undo_history(&self) -> Vec<String> {
        self.undo_stack.iter().rev().map(|c| c.description()).collect()
    }

    /// Current memory usage of both stacks (cached running total).
    pub fn memory_usage(&self) -> usize {
        self.total_memory
    }

    /// Drop the oldest entries until both the count and memory limits hold.
    /// The newest entry is always kept.
    fn prune(&mut self) {
        while self.undo_stack.len() > self.max_history_size {
            if let Some(removed) = self.undo_stack.pop_front() {
                self.total_memory = self.total_memory.saturating_sub(removed.memory_size());
            }
        }

        if let Some(max_bytes) = self.max_memory_bytes {
            while self.total_memory > max_bytes && self.undo_stack.len() > 1 {
                if let Some(removed) = self.undo_stack.pop_front() {
                    self.total_memory = self.total_memory.saturating_sub(removed.memory_size());
                    tracing::debug!(action = %removed.description(), "history entry evicted for memory");
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
        self.total_memory = 0;
    }

    /// Undo `index` steps, i.e. back to position `index` in `undo_history()`
    /// (0 = most recent, no change).
    pub fn undo_to(&mut self, index: usize, canvas: &mut CanvasState) {
        for _ in 0..index {
            if self.undo(canvas).is_none() {
                break;
            }
        }
    }

    pub fn undo_count(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn redo_count(&self) -> usize {
        self.redo_stack.len()
    }
}

// ============================================================================
// CANVAS SNAPSHOT: full-canvas undo for resize, rotate, crop, flatten
// ============================================================================

/// The full layer stack plus dimensions.
#[derive(Clone, Debug)]
pub struct CanvasSnapshot {
    pub width: u32,
    pub height: u32,
    pub layers: Vec<Layer>,
    pub active_layer_index: usize,
}

impl CanvasSnapshot {
    pub fn capture(state: &CanvasState) -> Self {
        Self {
            width: state.width,
            height: state.height,
            layers: state.layers.clone(),
            active_layer_index: state.active_layer_index,
        }
    }

    pub fn restore_into(&self, state: &mut CanvasState) {
        state.width = self.width;
        state.height = self.height;
        state.layers = self.layers.clone();
        state.active_layer_index = self.active_layer_index;
    }

    fn memory_bytes(&self) -> usize {
        self.layers.iter().map(Layer::memory_bytes).sum()
    }
}

/// Stores a complete canvas snapshot for undo/redo of destructive operations.
pub struct CanvasSnapshotCommand {
    description: String,
    before: CanvasSnapshot,
    after: Option<CanvasSnapshot>,
}

impl CanvasSnapshotCommand {
    /// Create before performing the operation, then call `set_after()`.
    pub fn new(description: impl Into<String>, state: &CanvasState) -> Self {
        Self {
            description: description.into(),
            before: CanvasSnapshot::capture(state),
            after: None,
        }
    }

    pub fn set_after(&mut self, state: &CanvasState) {
        self.after = Some(CanvasSnapshot::capture(state));
    }
}

impl Command for CanvasSnapshotCommand {
    fn undo(&self, canvas: &mut CanvasState) {
        self.before.restore_into(canvas);
    }

    fn redo(&self, canvas: &mut CanvasState) {
        if let Some(after) = &self.after {
            after.restore_into(canvas);
        }
    }

    fn description(&self) -> String {
        self.description.clone()
    }

    fn memory_size(&self) -> usize {
        self.before.memory_bytes() + self.after.as_ref().map_or(0, |a| a.memory_bytes())
    }
}

// ============================================================================
// LAYER SNAPSHOT: undo for operations that touch one layer
// ============================================================================

/// Captures one layer's pixels and blend settings before and after an
/// operation. Filters use this so a 5-layer document stores one layer, not five.
pub struct LayerSnapshotCommand {
    description: String,
    layer_index: usize,
    before_pixels: RgbaImage,
    after_pixels: Option<RgbaImage>,
    before_opacity: f32,
    after_opacity: f32,
    before_blend_mode: BlendMode,
    after_blend_mode: BlendMode,
}

impl LayerSnapshotCommand {
    /// Snapshot the active layer. Call `set_after()` when done.
    pub fn new(description: impl Into<String>, state: &CanvasState) -> Self {
        Self::new_for_layer(description, state, state.active_layer_index)
    }

    pub fn new_for_layer(description: impl Into<String>, state: &CanvasState, layer_idx: usize) -> Self {
        let safe_idx = layer_idx.min(state.layers.len().saturating_sub(1));
        let (before_pixels, before_opacity, before_blend_mode) = match state.layers.get(safe_idx) {
            Some(layer) => (layer.pixels.clone(), layer.opacity, layer.blend_mode),
            None => (RgbaImage::new(0, 0), 1.0, BlendMode::Normal),
        };
        Self {
            description: description.into(),
            layer_index: safe_idx,
            before_pixels,
            after_pixels: None,
            before_opacity,
            after_opacity: before_opacity,
            before_blend_mode,
            after_blend_mode: before_blend_mode,
        }
    }

    pub fn layer_index(&self) -> usize {
        self.layer_index
    }

    /// Capture the layer's state after the operation.
    pub fn set_after(&mut self, state: &CanvasState) {
        if let Some(layer) = state.layers.get(self.layer_index) {
            self.after_pixels = Some(layer.pixels.clone());
            self.after_opacity = layer.opacity;
            self.after_blend_mode = layer.blend_mode;
        }
    }
}

impl Command for LayerSnapshotCommand {
    fn undo(&self, canvas: &mut CanvasState) {
        if let Some(layer) = canvas.layers.get_mut(self.layer_index) {
            layer.pixels = self.before_pixels.clone();
            layer.opacity = self.before_opacity;
            layer.blend_mode = self.before_blend_mode;
        }
    }

    fn redo(&self, canvas: &mut CanvasState) {
        if let Some(after) = &self.after_pixels
            && let Some(layer) = canvas.layers.get_mut(self.layer_index)
        {
            layer.pixels = after.clone();
            layer.opacity = self.after_opacity;
            layer.blend_mode = self.after_blend_mode;
        }
    }

    fn description(&self) -> String {
        self.description.clone()
    }

    fn memory_size(&self) -> usize {
        self.before_pixels.as_raw().len() + self.after_pixels.as_ref().map_or(0, |p| p.as_raw().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn canvas(v: u8) -> CanvasState {
        CanvasState::from_image(RgbaImage::from_pixel(4, 4, Rgba([v, v, v, 255])))
    }

    /// Record a single-layer fill of `v` as a history step.
    fn fill(history: &mut HistoryManager, state: &mut CanvasState, v: u8) {
        let mut cmd = LayerSnapshotCommand::new(format!("fill {v}"), state);
        state.layers[0].pixels = RgbaImage::from_pixel(4, 4, Rgba([v, v, v, 255]));
        cmd.set_after(state);
        history.push(Box::new(cmd));
    }

    fn value(state: &CanvasState) -> u8 {
        state.layers[0].pixels.get_pixel(0, 0)[0]
    }

    #[test]
    fn undo_redo_restores_pixels() {
        let mut state = canvas(0);
        let mut history = HistoryManager::default();
        fill(&mut history, &mut state, 10);
        fill(&mut history, &mut state, 20);

        assert_eq!(history.undo(&mut state).as_deref(), Some("fill 20"));
        assert_eq!(value(&state), 10);
        assert_eq!(history.undo(&mut state).as_deref(), Some("fill 10"));
        assert_eq!(value(&state), 0);
        assert!(history.undo(&mut state).is_none());

        assert_eq!(history.redo(&mut state).as_deref(), Some("fill 10"));
        assert_eq!(value(&state), 10);
    }

    #[test]
    fn push_clears_redo() {
        let mut state = canvas(0);
        let mut history = HistoryManager::default();
        fill(&mut history, &mut state, 1);
        history.undo(&mut state);
        assert!(history.can_redo());
        fill(&mut history, &mut state, 2);
        assert!(!history.can_redo());
        assert_eq!(history.undo_history(), vec!["fill 2".to_string()]);
    }

    /// The stack never grows past its depth; the oldest entries go first.
    #[test]
    fn depth_is_bounded() {
        let mut state = canvas(0);
        let mut history = HistoryManager::new(3);
        for v in 1..=5 {
            fill(&mut history, &mut state, v);
        }
        assert_eq!(history.undo_count(), 3);
        assert_eq!(history.undo_history(), vec!["fill 5", "fill 4", "fill 3"]);
        history.undo_to(10, &mut state);
        assert_eq!(value(&state), 2);
    }

    #[test]
    fn memory_cap_evicts_but_keeps_newest() {
        let mut state = canvas(0);
        // Each step holds 2 * 64 bytes of pixels.
        let mut history = HistoryManager::new(50).with_memory_limit(Some(300));
        for v in 1..=4 {
            fill(&mut history, &mut state, v);
        }
        assert_eq!(history.undo_count(), 2);
        assert!(history.memory_usage() <= 300);

        let mut tiny = HistoryManager::new(50).with_memory_limit(Some(1));
        fill(&mut tiny, &mut state, 9);
        assert_eq!(tiny.undo_count(), 1);
    }

    #[test]
    fn undo_to_walks_back() {
        let mut state = canvas(0);
        let mut history = HistoryManager::default();
        for v in [5, 6, 7] {
            fill(&mut history, &mut state, v);
        }
        history.undo_to(2, &mut state);
        assert_eq!(value(&state), 5);
        assert_eq!(history.redo_count(), 2);
        assert_eq!(history.redo_description().as_deref(), Some("fill 6"));
    }

    #[test]
    fn canvas_snapshot_restores_size_and_layers() {
        let mut state = canvas(3);
        let mut cmd = CanvasSnapshotCommand::new("Rotate", &state);
        state.width = 2;
        state.height = 8;
        state.layers[0].pixels = RgbaImage::new(2, 8);
        state.add_layer(Layer::new("extra", 2, 8, Rgba([0, 0, 0, 0]))).unwrap();
        cmd.set_after(&state);

        let mut history = HistoryManager::default();
        history.push(Box::new(cmd));
        history.undo(&mut state);
        assert_eq!((state.width, state.height), (4, 4));
        assert_eq!(state.layers.len(), 1);
        history.redo(&mut state);
        assert_eq!((state.width, state.height), (2, 8));
        assert_eq!(state.layers.len(), 2);
    }
}
