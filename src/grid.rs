//! Grid frame extraction: cut a rendered storyboard page into its panels and
//! re-attach each panel to the shot drawn in it.
//!
//! The grid is a uniform partition of the page in row-major order. Panel `i`
//! sits at column `i % cols`, row `i / cols`. Pixel edges are computed as
//! `floor(k * size / n)` so adjacent cells share an edge exactly: no overlap
//! and no gaps for any source size.

use crate::api::ImageSource;
use crate::error::{Result, StoryboardError};
use crate::model::{CroppedFrame, GeneratedPage, ParsedScript};
use crate::{logi, logw};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use image::{DynamicImage, ImageFormat};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridGeometry {
    pub cols: u32,
    pub rows: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl GridGeometry {
    /// Two columns by three rows: six panels per page.
    pub const STORYBOARD: GridGeometry = GridGeometry { cols: 2, rows: 3 };

    pub fn new(cols: u32, rows: u32) -> Result<Self> {
        if cols == 0 || rows == 0 {
            return Err(StoryboardError::Config(format!(
                "grid must have at least one column and row (got {}x{})",
                cols, rows
            )));
        }
        if cols.checked_mul(rows).is_none() {
            return Err(StoryboardError::Config(format!(
                "grid {}x{} has too many cells",
                cols, rows
            )));
        }
        Ok(Self { cols, rows })
    }

    pub fn cells(&self) -> usize {
        self.cols as usize * self.rows as usize
    }

    /// Layout phrase used in page prompts. Pages of three or more panels name
    /// this geometry. Pages of one or two panels always get the fixed
    /// "1x2 or 2x1 layout" phrase, which does not match a larger crop grid;
    /// see [`GridGeometry::hint_mismatch`].
    pub fn layout_hint(&self, panel_count: usize) -> String {
        if panel_count <= 2 {
            "1x2 or 2x1 layout".to_string()
        } else {
            format!("{}x{} grid layout", self.cols, self.rows)
        }
    }

    /// True when the prompt for a page of `panel_count` panels asks for a
    /// layout other than the grid the extractor will cut.
    pub fn hint_mismatch(&self, panel_count: usize) -> bool {
        panel_count <= 2 && !matches!((self.cols, self.rows), (1, 2) | (2, 1))
    }

    /// Pixel rectangle of cell `index` within a `width` x `height` source.
    pub fn cell_rect(&self, index: usize, width: u32, height: u32) -> Option<CellRect> {
        if index >= self.cells() {
            return None;
        }
        let col = index as u64 % self.cols as u64;
        let row = index as u64 / self.cols as u64;
        let edge = |k: u64, size: u32, n: u32| (k * size as u64 / n as u64) as u32;

        let x0 = edge(col, width, self.cols);
        let x1 = edge(col + 1, width, self.cols);
        let y0 = edge(row, height, self.rows);
        let y1 = edge(row + 1, height, self.rows);
        Some(CellRect {
            x: x0,
            y: y0,
            width: x1 - x0,
            height: y1 - y0,
        })
    }
}

impl Default for GridGeometry {
    fn default() -> Self {
        Self::STORYBOARD
    }
}

/// Cuts `image` into `geometry.cells()` sub-images in row-major order.
pub fn crop_cells(image: &DynamicImage, geometry: GridGeometry) -> Result<Vec<DynamicImage>> {
    let (width, height) = (image.width(), image.height());
    if width < geometry.cols || height < geometry.rows {
        return Err(StoryboardError::Image(image::ImageError::Parameter(
            image::error::ParameterError::from_kind(
                image::error::ParameterErrorKind::DimensionMismatch,
            ),
        )));
    }

    (0..geometry.cells())
        .map(|index| {
            let rect = geometry
                .cell_rect(index, width, height)
                .ok_or_else(|| StoryboardError::PlanningInvariant(format!("cell {} out of range", index)))?;
            Ok(image.crop_imm(rect.x, rect.y, rect.width, rect.height))
        })
        .collect()
}

fn encode_png_base64(image: &DynamicImage) -> Result<String> {
    let mut buf = Vec::new();
    image.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)?;
    Ok(STANDARD.encode(&buf))
}

/// Frames kept for one page plus the panels that had no shot.
#[derive(Debug, Clone, PartialEq)]
pub struct PageExtraction {
    pub page_number: u32,
    pub scene_number: u32,
    pub frames: Vec<CroppedFrame>,
    /// Grid indices beyond `shots_included`. Expected on a scene's last page.
    pub dropped_panels: Vec<usize>,
}

#[derive(Debug, Default)]
pub struct ExtractionReport {
    pub pages: Vec<PageExtraction>,
    /// Pages whose raster could not be fetched or cut. Each is an
    /// `StoryboardError::Extraction`.
    pub failures: Vec<StoryboardError>,
}

impl ExtractionReport {
    pub fn frames(&self) -> impl Iterator<Item = &CroppedFrame> {
        self.pages.iter().flat_map(|p| p.frames.iter())
    }

    pub fn into_frames(self) -> Vec<CroppedFrame> {
        self.pages.into_iter().flat_map(|p| p.frames).collect()
    }

    pub fn failed_pages(&self) -> Vec<u32> {
        self.failures
            .iter()
            .filter_map(|e| match e {
                StoryboardError::Extraction { page_number, .. } => Some(*page_number),
                _ => None,
            })
            .collect()
    }
}

/// Pairs cropped cells with the page's shots. Cell `i` belongs to
/// `shots_included[i]`; cells past the end of that list are dropped.
pub fn associate_cells(
    page: &GeneratedPage,
    cells: Vec<String>,
    script: &ParsedScript,
) -> Result<PageExtraction> {
    if page.shots_included.len() > cells.len() {
        return Err(StoryboardError::PlanningInvariant(format!(
            "page {} lists {} shots but the grid has {} panels",
            page.page_number,
            page.shots_included.len(),
            cells.len()
        )));
    }

    let mut frames = Vec::with_capacity(page.shots_included.len());
    let mut dropped_panels = Vec::new();

    for (frame_index, base64) in cells.into_iter().enumerate() {
        let Some(&shot_number) = page.shots_included.get(frame_index) else {
            dropped_panels.push(frame_index);
            continue;
        };
        let shot = script.find_shot(shot_number).ok_or_else(|| {
            StoryboardError::PlanningInvariant(format!(
                "page {} panel {} refers to unknown shot {}",
                page.page_number, frame_index, shot_number
            ))
        })?;
        frames.push(CroppedFrame {
            frame_index,
            page_number: page.page_number,
            shot_number,
            base64,
            shot_data: shot.clone(),
        });
    }

    Ok(PageExtraction {
        page_number: page.page_number,
        scene_number: page.scene_number,
        frames,
        dropped_panels,
    })
}

pub struct FrameExtractor<S> {
    source: S,
    geometry: GridGeometry,
}

impl<S: ImageSource> FrameExtractor<S> {
    pub fn new(source: S, geometry: GridGeometry) -> Self {
        Self { source, geometry }
    }

    pub fn geometry(&self) -> GridGeometry {
        self.geometry
    }

    /// Extracts one page. Fetch/decode/crop problems come back as
    /// `StoryboardError::Extraction`; a broken panel-to-shot mapping as
    /// `StoryboardError::PlanningInvariant`.
    pub async fn extract(
        &self,
        page: &GeneratedPage,
        script: &ParsedScript,
    ) -> Result<PageExtraction> {
        if page.shots_included.len() > self.geometry.cells() {
            return Err(StoryboardError::PlanningInvariant(format!(
                "page {} lists {} shots but the grid has {} panels",
                page.page_number,
                page.shots_included.len(),
                self.geometry.cells()
            )));
        }

        let extraction_failure = |cause: String| StoryboardError::Extraction {
            page_number: page.page_number,
            cause,
        };

        let bytes = self
            .source
            .fetch(&page.image_url)
            .await
            .map_err(|e| extraction_failure(format!("fetch failed: {}", e)))?;
        let image = image::load_from_memory(&bytes)
            .map_err(|e| extraction_failure(format!("decode failed: {}", e)))?;
        let cells = crop_cells(&image, self.geometry)
            .map_err(|e| extraction_failure(format!("crop failed for {}x{} page: {}", image.width(), image.height(), e)))?;
        let encoded = cells
            .iter()
            .map(encode_png_base64)
            .collect::<Result<Vec<_>>>()
            .map_err(|e| extraction_failure(format!("encode failed: {}", e)))?;

        let extraction = associate_cells(page, encoded, script)?;
        logi(format!(
            "Page {}: {} frames extracted ({} empty panels)",
            page.page_number,
            extraction.frames.len(),
            extraction.dropped_panels.len()
        ));
        Ok(extraction)
    }

    /// Extracts every page. A page that fails extraction is recorded and
    /// skipped; planning invariant violations abort the whole call.
    pub async fn extract_all(
        &self,
        pages: &[GeneratedPage],
        script: &ParsedScript,
    ) -> Result<ExtractionReport> {
        let mut report = ExtractionReport::default();
        for page in pages {
            match self.extract(page, script).await {
                Ok(extraction) => report.pages.push(extraction),
                Err(err @ StoryboardError::Extraction { .. }) => {
                    logw(format!("{}", err));
                    report.failures.push(err);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Scene, Shot, ShotType};
    use async_trait::async_trait;
    use image::{Rgba, RgbaImage};
    use std::collections::HashMap;

    /// Each cell of a 2x3 page gets a distinct red channel value.
    fn painted_page(width: u32, height: u32, geometry: GridGeometry) -> Vec<u8> {
        let mut img = RgbaImage::new(width, height);
        for i in 0..geometry.cells() {
            let rect = geometry.cell_rect(i, width, height).unwrap();
            for y in rect.y..rect.y + rect.height {
                for x in rect.x..rect.x + rect.width {
                    img.put_pixel(x, y, Rgba([(i as u8 + 1) * 30, 0, 0, 255]));
                }
            }
        }
        let mut buf = Vec::new();
        DynamicImage::ImageRgba8(img)
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        buf
    }

    fn shot(n: u32) -> Shot {
        Shot {
            shot_number: n,
            shot_type: ShotType::Medium,
            camera_movement: "static".into(),
            composition: String::new(),
            lighting: String::new(),
            action: format!("beat {}", n),
            dialogue: None,
            style_notes: String::new(),
        }
    }

    fn script_with(numbers: &[u32]) -> ParsedScript {
        ParsedScript {
            title: "t".into(),
            total_scenes: 1,
            scenes: vec![Scene {
                scene_number: 1,
                location: "here".into(),
                scene_description: "here".into(),
                shots: numbers.iter().copied().map(shot).collect(),
            }],
        }
    }

    fn page(page_number: u32, url: &str, shots: Vec<u32>) -> GeneratedPage {
        GeneratedPage {
            page_number,
            scene_number: 1,
            image_url: url.to_string(),
            shots_included: shots,
            generation_prompt: "p".into(),
        }
    }

    struct MapSource(HashMap<String, Vec<u8>>);

    #[async_trait]
    impl ImageSource for MapSource {
        async fn fetch(&self, location: &str) -> Result<Vec<u8>> {
            self.0
                .get(location)
                .cloned()
                .ok_or_else(|| StoryboardError::Generation(format!("404 {}", location)))
        }
    }

    fn red_of(frame: &CroppedFrame) -> u8 {
        let bytes = STANDARD.decode(&frame.base64).unwrap();
        image::load_from_memory(&bytes).unwrap().to_rgba8().get_pixel(0, 0)[0]
    }

    #[test]
    fn cells_partition_any_size_without_gaps_or_overlap() {
        let g = GridGeometry::STORYBOARD;
        for (w, h) in [(1024u32, 1536u32), (1001, 997), (7, 3)] {
            let rects: Vec<CellRect> = (0..6).map(|i| g.cell_rect(i, w, h).unwrap()).collect();
            let area: u64 = rects.iter().map(|r| r.width as u64 * r.height as u64).sum();
            assert_eq!(area, w as u64 * h as u64);
            // Row-major: index 1 is right of index 0, index 2 is below index 0.
            assert_eq!(rects[1].x, rects[0].width);
            assert_eq!(rects[1].y, 0);
            assert_eq!(rects[2].x, 0);
            assert_eq!(rects[2].y, rects[0].height);
            assert_eq!(rects[5].x + rects[5].width, w);
            assert_eq!(rects[5].y + rects[5].height, h);
        }
        assert!(g.cell_rect(6, 100, 100).is_none());
    }

    #[test]
    fn layout_hint_follows_panel_count() {
        let g = GridGeometry::STORYBOARD;
        assert_eq!(g.layout_hint(1), "1x2 or 2x1 layout");
        assert_eq!(g.layout_hint(2), "1x2 or 2x1 layout");
        assert_eq!(g.layout_hint(3), "2x3 grid layout");
        assert_eq!(g.layout_hint(6), "2x3 grid layout");
    }

    #[test]
    fn short_pages_on_a_large_grid_flag_the_hint() {
        let g = GridGeometry::STORYBOARD;
        assert!(g.hint_mismatch(1));
        assert!(g.hint_mismatch(2));
        assert!(!g.hint_mismatch(3));
        assert!(!GridGeometry { cols: 1, rows: 2 }.hint_mismatch(2));
        assert!(!GridGeometry { cols: 2, rows: 1 }.hint_mismatch(1));
    }

    #[test]
    fn zero_sized_grid_is_rejected() {
        assert!(matches!(GridGeometry::new(0, 3), Err(StoryboardError::Config(_))));
    }

    #[test]
    fn huge_grid_is_rejected_without_overflow() {
        assert!(matches!(
            GridGeometry::new(70_000, 70_000),
            Err(StoryboardError::Config(_))
        ));
        let g = GridGeometry {
            cols: 70_000,
            rows: 70_000,
        };
        assert_eq!(g.cells() as u64, 4_900_000_000);
    }

    #[tokio::test]
    async fn full_page_yields_six_frames_in_row_major_order() {
        let g = GridGeometry::STORYBOARD;
        for (w, h) in [(600u32, 900u32), (1001, 1499)] {
            let url = format!("mem://{}x{}", w, h);
            let source = MapSource(HashMap::from([(url.clone(), painted_page(w, h, g))]));
            let extractor = FrameExtractor::new(source, g);
            let script = script_with(&[1, 2, 3, 4, 5, 6]);

            let out = extractor
                .extract(&page(1, &url, vec![1, 2, 3, 4, 5, 6]), &script)
                .await
                .unwrap();
            assert_eq!(out.frames.len(), 6);
            assert!(out.dropped_panels.is_empty());
            for (i, frame) in out.frames.iter().enumerate() {
                assert_eq!(frame.frame_index, i);
                assert_eq!(frame.shot_number, i as u32 + 1);
                assert_eq!(red_of(frame), (i as u8 + 1) * 30);
            }
        }
    }

    #[tokio::test]
    async fn underfull_page_drops_empty_panels() {
        let g = GridGeometry::STORYBOARD;
        let source = MapSource(HashMap::from([("p".to_string(), painted_page(300, 450, g))]));
        let extractor = FrameExtractor::new(source, g);
        let script = script_with(&[11, 12, 13, 14]);

        let out = extractor
            .extract(&page(3, "p", vec![11, 12, 13, 14]), &script)
            .await
            .unwrap();
        let shots: Vec<(usize, u32)> = out.frames.iter().map(|f| (f.frame_index, f.shot_number)).collect();
        assert_eq!(shots, vec![(0, 11), (1, 12), (2, 13), (3, 14)]);
        assert_eq!(out.dropped_panels, vec![4, 5]);
        assert_eq!(out.frames[2].shot_data.action, "beat 13");
        assert_eq!(out.frames[3].page_number, 3);
    }

    #[tokio::test]
    async fn fetch_failure_is_isolated_to_its_page() {
        let g = GridGeometry::STORYBOARD;
        let source = MapSource(HashMap::from([("ok".to_string(), painted_page(60, 90, g))]));
        let extractor = FrameExtractor::new(source, g);
        let script = script_with(&[1, 2, 3, 4]);
        let pages = vec![page(1, "missing", vec![1, 2]), page(2, "ok", vec![3, 4])];

        let report = extractor.extract_all(&pages, &script).await.unwrap();
        assert_eq!(report.failed_pages(), vec![1]);
        assert_eq!(report.pages.len(), 1);
        assert_eq!(report.frames().count(), 2);
        assert_eq!(report.pages[0].dropped_panels, vec![2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn undecodable_raster_is_an_extraction_failure() {
        let source = MapSource(HashMap::from([("junk".to_string(), b"not an image".to_vec())]));
        let extractor = FrameExtractor::new(source, GridGeometry::STORYBOARD);
        let err = extractor
            .extract(&page(9, "junk", vec![1]), &script_with(&[1]))
            .await
            .unwrap_err();
        assert!(matches!(err, StoryboardError::Extraction { page_number: 9, .. }));
    }

    #[tokio::test]
    async fn unknown_shot_aborts_instead_of_isolating() {
        let g = GridGeometry::STORYBOARD;
        let source = MapSource(HashMap::from([("p".to_string(), painted_page(60, 90, g))]));
        let extractor = FrameExtractor::new(source, g);
        let pages = vec![page(1, "p", vec![1, 99])];

        let err = extractor
            .extract_all(&pages, &script_with(&[1]))
            .await
            .unwrap_err();
        assert!(matches!(err, StoryboardError::PlanningInvariant(_)));
    }

    #[test]
    fn more_shots_than_panels_is_an_invariant_violation() {
        let cells = vec![String::new(); 6];
        let err = associate_cells(&page(1, "p", (1..=7).collect()), cells, &script_with(&[1])).unwrap_err();
        assert!(matches!(err, StoryboardError::PlanningInvariant(_)));
    }

    #[test]
    fn tiny_page_cannot_be_cropped() {
        let img = DynamicImage::ImageRgba8(RgbaImage::new(1, 1));
        assert!(crop_cells(&img, GridGeometry::STORYBOARD).is_err());
    }
}
