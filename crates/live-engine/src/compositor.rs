//! Foreground/background presentation of the active track.
//!
//! The foreground surface shows the track as-is.  On desktop viewports a
//! duplicate of the track is rendered on a background surface with a
//! blur/darken/scale treatment.  The duplicate is owned here and never
//! outlives the foreground track.
//!
//! Media runtimes like to write explicit width/height back onto surfaces,
//! which breaks aspect-fit.  A reconcile loop re-asserts the desired
//! presentation on a short interval; reconciling an already-correct surface
//! is a no-op.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use live_proto::protocol::FitMode;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tracing::debug;

use crate::transport::SharedTrack;

#[derive(Debug, Clone, PartialEq)]
pub struct Treatment {
    pub blur_px: u32,
    /// 0.0 = black, 1.0 = untouched.
    pub brightness: f32,
    pub scale: f32,
}

impl Default for Treatment {
    fn default() -> Self {
        Self {
            blur_px: 40,
            brightness: 0.45,
            scale: 1.15,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Presentation {
    pub fit: FitMode,
    /// Explicit sizes set by the runtime; always stripped.
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub treatment: Option<Treatment>,
}

impl Presentation {
    pub fn foreground(fit: FitMode) -> Self {
        Self {
            fit,
            ..Self::default()
        }
    }

    pub fn background(treatment: Treatment) -> Self {
        Self {
            fit: FitMode::Cover,
            treatment: Some(treatment),
            ..Self::default()
        }
    }
}

/// A render target.  `presentation` reports what the surface currently has,
/// which may differ from what was last applied.
#[async_trait]
pub trait Surface: Send {
    async fn show(&mut self, track: Option<SharedTrack>);
    async fn presentation(&mut self) -> Presentation;
    async fn apply(&mut self, presentation: &Presentation);
}

/// Bring `surface` to `desired`.  Returns whether anything had to change.
pub async fn reconcile(surface: &mut dyn Surface, desired: &Presentation) -> bool {
    let current = surface.presentation().await;
    if current == *desired {
        return false;
    }
    debug!("compositor: reasserting {:?} (was {:?})", desired, current);
    surface.apply(desired).await;
    true
}

#[derive(Debug, Clone)]
pub struct CompositorOptions {
    pub fit: FitMode,
    pub mobile: bool,
    pub reconcile_interval: Duration,
    pub treatment: Treatment,
}

impl Default for CompositorOptions {
    fn default() -> Self {
        Self {
            fit: FitMode::Contain,
            mobile: false,
            reconcile_interval: Duration::from_millis(500),
            treatment: Treatment::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MediaTrackPair {
    pub foreground: SharedTrack,
    pub background: Option<SharedTrack>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompositorStats {
    pub attaches: u64,
    pub detaches: u64,
}

struct Layers {
    foreground: Box<dyn Surface>,
    background: Option<Box<dyn Surface>>,
}

pub struct Compositor {
    layers: Arc<Mutex<Layers>>,
    options: CompositorOptions,
    pair: Option<MediaTrackPair>,
    reconcile_task: Option<AbortHandle>,
    stats: CompositorStats,
}

impl Compositor {
    pub fn new(
        foreground: Box<dyn Surface>,
        background: Option<Box<dyn Surface>>,
        options: CompositorOptions,
    ) -> Self {
        Self {
            layers: Arc::new(Mutex::new(Layers {
                foreground,
                background,
            })),
            options,
            pair: None,
            reconcile_task: None,
            stats: CompositorStats::default(),
        }
    }

    pub fn pair(&self) -> Option<&MediaTrackPair> {
        self.pair.as_ref()
    }

    pub fn stats(&self) -> CompositorStats {
        self.stats
    }

    /// Render `track`.  Replacing a different track re-derives the duplicate.
    pub async fn attach(&mut self, track: SharedTrack) {
        if let Some(pair) = &self.pair {
            if pair.foreground.id() == track.id() {
                return;
            }
        }
        self.detach().await;

        let fg_desired = Presentation::foreground(self.options.fit);
        let bg_desired = Presentation::background(self.options.treatment.clone());

        let background = {
            let mut layers = self.layers.lock().await;
            layers.foreground.show(Some(Arc::clone(&track))).await;
            reconcile(layers.foreground.as_mut(), &fg_desired).await;

            let clone = match (&layers.background, self.options.mobile) {
                (Some(_), false) => track.duplicate(),
                _ => None,
            };
            if let (Some(bg), Some(clone)) = (layers.background.as_mut(), clone.as_ref()) {
                bg.show(Some(Arc::clone(clone))).await;
                reconcile(bg.as_mut(), &bg_desired).await;
            }
            clone
        };

        debug!(
            "compositor: attached {} (background: {})",
            track.id(),
            background.is_some()
        );
        self.pair = Some(MediaTrackPair {
            foreground: Arc::clone(&track),
            background: background.clone(),
        });
        self.stats.attaches += 1;

        let layers = Arc::clone(&self.layers);
        let interval = self.options.reconcile_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            let mut background = background;
            loop {
                ticker.tick().await;
                let mut layers = layers.lock().await;
                reconcile(layers.foreground.as_mut(), &fg_desired).await;

                // Source destroyed under us: the duplicate goes with it.
                if track.is_stopped() {
                    if let Some(clone) = background.take() {
                        debug!("compositor: source {} stopped, dropping duplicate", track.id());
                        clone.stop();
                        if let Some(bg) = layers.background.as_mut() {
                            bg.show(None).await;
                        }
                    }
                    continue;
                }
                if background.is_some() {
                    if let Some(bg) = layers.background.as_mut() {
                        reconcile(bg.as_mut(), &bg_desired).await;
                    }
                }
            }
        });
        self.reconcile_task = Some(task.abort_handle());
    }

    /// Stop rendering and destroy the duplicate.  No-op when nothing is attached.
    pub async fn detach(&mut self) {
        let Some(pair) = self.pair.take() else {
            return;
        };
        if let Some(task) = self.reconcile_task.take() {
            task.abort();
        }
        if let Some(clone) = &pair.background {
            clone.stop();
        }
        let mut layers = self.layers.lock().await;
        layers.foreground.show(None).await;
        if let Some(bg) = layers.background.as_mut() {
            bg.show(None).await;
        }
        self.stats.detaches += 1;
        debug!("compositor: detached {}", pair.foreground.id());
    }
}

impl Drop for Compositor {
    fn drop(&mut self) {
        if let Some(task) = self.reconcile_task.take() {
            task.abort();
        }
        if let Some(clone) = self.pair.as_ref().and_then(|p| p.background.as_ref()) {
            clone.stop();
        }
    }
}

/// Surface with no output.  Used when the engine runs without a display
/// (previews, tests of the orchestration layer).
#[derive(Debug, Default)]
pub struct HeadlessSurface {
    track: Option<SharedTrack>,
    presentation: Presentation,
}

impl HeadlessSurface {
    pub fn track(&self) -> Option<&SharedTrack> {
        self.track.as_ref()
    }
}

#[async_trait]
impl Surface for HeadlessSurface {
    async fn show(&mut self, track: Option<SharedTrack>) {
        self.track = track;
    }

    async fn presentation(&mut self) -> Presentation {
        self.presentation.clone()
    }

    async fn apply(&mut self, presentation: &Presentation) {
        self.presentation = presentation.clone();
    }
}
