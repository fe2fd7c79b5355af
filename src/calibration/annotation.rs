use std::{
    future::Future,
    io::Cursor,
    path::{Path, PathBuf},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use ab_glyph::{FontVec, PxScale};
use image::{codecs::jpeg::JpegEncoder, Rgb, RgbImage};
use imageproc::{
    drawing::{
        draw_filled_circle_mut, draw_filled_rect_mut, draw_hollow_circle_mut,
        draw_line_segment_mut, draw_text_mut,
    },
    rect::Rect,
};
use tower::Service;
use tracing::{debug, info, warn};

use crate::calibration::points::CalibrationPoints;
use crate::error::{CalibrationError, PipelineError, StorageError};

const MARKER_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const LINE_OFFSETS: [(f32, f32); 5] = [(0.0, 0.0), (1.0, 0.0), (-1.0, 0.0), (0.0, 1.0), (0.0, -1.0)];
const RING_RADIUS: i32 = 10;
const RING_WIDTH: i32 = 3;
const DOT_RADIUS: i32 = 3;
const LABEL_OFFSET: (i32, i32) = (12, -14);
const LABEL_SIZE: f32 = 22.0;
const BITMAP_SCALE: i32 = 3;

const SYSTEM_FONTS: [&str; 3] = [
    "arial.ttf",
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans.ttf",
];

// 3x5 digit glyphs, one row per entry, high bit on the left.
const DIGITS: [[u8; 5]; 10] = [
    [0b111, 0b101, 0b101, 0b101, 0b111],
    [0b010, 0b110, 0b010, 0b010, 0b111],
    [0b111, 0b001, 0b111, 0b100, 0b111],
    [0b111, 0b001, 0b111, 0b001, 0b111],
    [0b101, 0b101, 0b111, 0b001, 0b001],
    [0b111, 0b100, 0b111, 0b001, 0b111],
    [0b111, 0b100, 0b111, 0b101, 0b111],
    [0b111, 0b001, 0b010, 0b010, 0b010],
    [0b111, 0b101, 0b111, 0b101, 0b111],
    [0b111, 0b101, 0b111, 0b001, 0b111],
];

/// Font used for point labels. Falls back to a built-in digit bitmap so a
/// missing font file never fails a render.
pub enum LabelFont {
    TrueType(FontVec),
    Bitmap,
}

impl LabelFont {
    pub fn load(preferred: Option<&Path>) -> Self {
        let candidates = preferred
            .into_iter()
            .map(Path::to_path_buf)
            .chain(SYSTEM_FONTS.iter().map(PathBuf::from));
        for path in candidates {
            let Ok(data) = std::fs::read(&path) else {
                debug!("Label font {:?} not readable", path);
                continue;
            };
            match FontVec::try_from_vec(data) {
                Ok(font) => {
                    info!("Using label font {:?}", path);
                    return LabelFont::TrueType(font);
                }
                Err(e) => warn!("Ignoring label font {:?}: {}", path, e),
            }
        }
        info!("No label font found, using built-in digits");
        LabelFont::Bitmap
    }

    fn draw(&self, canvas: &mut RgbImage, x: i32, y: i32, text: &str) {
        match self {
            LabelFont::TrueType(font) => {
                draw_text_mut(canvas, MARKER_COLOR, x, y, PxScale::from(LABEL_SIZE), font, text)
            }
            LabelFont::Bitmap => draw_bitmap_text(canvas, x, y, text),
        }
    }
}

fn draw_bitmap_text(canvas: &mut RgbImage, x: i32, y: i32, text: &str) {
    let advance = 4 * BITMAP_SCALE;
    for (n, digit) in text.chars().filter_map(|c| c.to_digit(10)).enumerate() {
        let origin_x = x + n as i32 * advance;
        for (row, bits) in DIGITS[digit as usize].iter().enumerate() {
            for col in 0..3 {
                if bits & (0b100 >> col) == 0 {
                    continue;
                }
                let rect = Rect::at(
                    origin_x + col * BITMAP_SCALE,
                    y + row as i32 * BITMAP_SCALE,
                )
                .of_size(BITMAP_SCALE as u32, BITMAP_SCALE as u32);
                draw_filled_rect_mut(canvas, rect, MARKER_COLOR);
            }
        }
    }
}

/// Draws the calibration overlay onto `canvas` in place.
pub fn draw_overlay(canvas: &mut RgbImage, points: &CalibrationPoints, font: &LabelFont) {
    let (width, height) = canvas.dimensions();
    let pixels = points.to_pixels(width, height);

    if pixels.len() >= 2 {
        let closing = pixels.iter().skip(1).chain(pixels.first());
        for (&(x0, y0), &(x1, y1)) in pixels.iter().zip(closing) {
            for (dx, dy) in LINE_OFFSETS {
                draw_line_segment_mut(
                    canvas,
                    (x0 as f32 + dx, y0 as f32 + dy),
                    (x1 as f32 + dx, y1 as f32 + dy),
                    MARKER_COLOR,
                );
            }
        }
    }

    for (i, &(x, y)) in pixels.iter().enumerate() {
        for inset in 0..RING_WIDTH {
            draw_hollow_circle_mut(canvas, (x, y), RING_RADIUS - inset, MARKER_COLOR);
        }
        draw_filled_circle_mut(canvas, (x, y), DOT_RADIUS, MARKER_COLOR);
        font.draw(
            canvas,
            x + LABEL_OFFSET.0,
            y + LABEL_OFFSET.1,
            &(i + 1).to_string(),
        );
    }
}

/// Decodes `frame`, draws the overlay on an RGB copy and returns JPEG bytes.
pub fn render_annotation(
    frame: &[u8],
    points: &CalibrationPoints,
    font: &LabelFont,
    jpeg_quality: u8,
) -> Result<Vec<u8>, CalibrationError> {
    let mut canvas = image::load_from_memory(frame)?.to_rgb8();
    draw_overlay(&mut canvas, points, font);

    let mut buffer = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut buffer, jpeg_quality).encode_image(&canvas)?;
    Ok(buffer.into_inner())
}

pub struct RenderRequest {
    pub frame_path: PathBuf,
    pub points: CalibrationPoints,
}

/// Reads a stored frame and renders the annotated JPEG. Work runs inline on
/// the calling task.
#[derive(Clone)]
pub struct AnnotationService {
    font: Arc<LabelFont>,
    jpeg_quality: u8,
}

impl AnnotationService {
    pub fn new(font: LabelFont, jpeg_quality: u8) -> Self {
        Self {
            font: Arc::new(font),
            jpeg_quality,
        }
    }
}

impl Service<RenderRequest> for AnnotationService {
    type Response = Vec<u8>;
    type Error = PipelineError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: RenderRequest) -> Self::Future {
        let font = Arc::clone(&self.font);
        let jpeg_quality = self.jpeg_quality;
        Box::pin(async move {
            let frame = match tokio::fs::read(&request.frame_path).await {
                Ok(frame) => frame,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(CalibrationError::NotFound("snapshot not found".into()).into())
                }
                Err(e) => return Err(StorageError::Read(request.frame_path, e).into()),
            };
            Ok(render_annotation(&frame, &request.points, &font, jpeg_quality)?)
        })
    }
}
