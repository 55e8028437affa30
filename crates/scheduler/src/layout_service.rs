//! Background pagination
//!
//! The render surface submits a new [`LayoutRequest`] whenever chapter
//! content, viewport size or typography changes. Passes run on one worker
//! thread; only the newest request's result is ever published, so the page
//! list the renderer reads from [`LayoutService::latest`] is always a
//! complete layout.

use std::sync::Arc;

use reader_layout::{
    ChapterContent, HeuristicMeasurer, PageLayout, TextMeasurer, TextPaginationEngine,
    TypographyConfig, Viewport,
};

use crate::worker::{GenerationWorker, Outcome, Ticket, WorkerConfig};
use crate::SchedulerError;

pub type LayoutOutcome = Outcome<PageLayout>;
pub type LayoutTicket = Ticket<PageLayout>;

/// Everything one layout pass depends on
#[derive(Debug, Clone)]
pub struct LayoutRequest {
    pub chapter: Arc<ChapterContent>,
    pub viewport: Viewport,
    pub typography: TypographyConfig,
}

impl LayoutRequest {
    pub fn new(chapter: Arc<ChapterContent>, viewport: Viewport, typography: TypographyConfig) -> Self {
        Self {
            chapter,
            viewport,
            typography,
        }
    }
}

/// Paginates chapters off the render thread
pub struct LayoutService {
    worker: GenerationWorker<LayoutRequest, PageLayout>,
}

impl LayoutService {
    /// Start the service with the heuristic glyph-width measurer
    pub fn new() -> Result<Self, SchedulerError> {
        Self::with_measurer(Arc::new(HeuristicMeasurer))
    }

    pub fn with_measurer(measurer: Arc<dyn TextMeasurer>) -> Result<Self, SchedulerError> {
        let worker = GenerationWorker::new(
            Arc::new(move |request: LayoutRequest, token: &crate::CancellationToken| {
                if token.is_cancelled() {
                    return PageLayout::default();
                }
                TextPaginationEngine::with_measurer(request.typography, Arc::clone(&measurer))
                    .paginate(&request.chapter, request.viewport)
            }),
            WorkerConfig::new("reader-layout"),
        )?;
        Ok(Self { worker })
    }

    /// Queue a layout pass, superseding any pass not yet published
    pub fn submit(&self, request: LayoutRequest) -> Result<LayoutTicket, SchedulerError> {
        self.worker.submit(request)
    }

    /// The most recently published layout
    pub fn latest(&self) -> Option<Arc<PageLayout>> {
        self.worker.latest()
    }

    /// Generation of the published layout; 0 if none yet
    pub fn latest_generation(&self) -> u64 {
        self.worker.latest_generation()
    }

    /// Stop the worker after it drains queued requests
    pub fn shutdown(self) -> Result<(), SchedulerError> {
        self.worker.shutdown()
    }
}

impl std::fmt::Debug for LayoutService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayoutService")
            .field("latest_generation", &self.latest_generation())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reader_layout::{ContentBlock, Margins, MonospaceMeasurer, TextBlock};

    fn request(paragraphs: usize, height: f32) -> LayoutRequest {
        let text = (0..paragraphs)
            .map(|i| format!("paragraph {i}"))
            .collect::<Vec<_>>()
            .join("\n");
        let chapter = ChapterContent::new(0, None, vec![ContentBlock::Text(TextBlock::new(text))]);
        let typography = TypographyConfig::default()
            .with_text_size(20.0)
            .with_line_spacing(1.0)
            .with_paragraph_spacing(0.0)
            .with_margins(Margins::uniform(0.0));
        LayoutRequest::new(Arc::new(chapter), Viewport::new(400.0, height), typography)
    }

    fn service() -> LayoutService {
        LayoutService::with_measurer(Arc::new(MonospaceMeasurer::new(0.5))).unwrap()
    }

    #[test]
    fn test_publishes_complete_layout() {
        let service = service();
        assert!(service.latest().is_none());

        let outcome = service.submit(request(10, 100.0)).unwrap().wait().unwrap();
        let layout = outcome.published().expect("sole request publishes");
        assert_eq!(layout.len(), 2);
        assert_eq!(service.latest().unwrap().len(), 2);
        assert_eq!(service.latest_generation(), 1);
        service.shutdown().unwrap();
    }

    #[test]
    fn test_last_request_wins() {
        let service = service();
        let tickets: Vec<_> = [100.0, 200.0, 1000.0]
            .into_iter()
            .map(|height| service.submit(request(10, height)).unwrap())
            .collect();

        let mut last = None;
        for ticket in tickets {
            last = Some(ticket.wait().unwrap());
        }
        let last = last.and_then(|outcome| outcome.published());
        assert_eq!(last.map(|layout| layout.len()), Some(1));
        assert_eq!(service.latest().unwrap().len(), 1);
        assert_eq!(service.latest_generation(), 3);
    }

    #[test]
    fn test_empty_chapter_publishes_empty_layout() {
        let service = service();
        let outcome = service.submit(request(0, 100.0)).unwrap().wait().unwrap();
        assert!(outcome.published().unwrap().is_empty());
    }
}
