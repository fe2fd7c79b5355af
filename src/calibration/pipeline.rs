use base64::{engine::general_purpose::STANDARD, Engine};
use serde_json::Value;
use tower::ServiceExt;
use tracing::{debug, info, instrument};

use crate::calibration::{
    annotation::{AnnotationService, RenderRequest},
    locks::{FrameKey, LockRegistry},
    points::CalibrationPoints,
    snapshot::{timestamp_id, write_new_frame, DecodedSnapshot},
};
use crate::error::{CalibrationError, PipelineError};
use crate::storage::{Sid, StorageLayout};

#[derive(Debug, Clone)]
pub struct UploadedSnapshot {
    pub id: String,
    pub locator_path: String,
}

#[derive(Debug, Clone)]
pub struct SavedCalibration {
    pub id: String,
    pub points: CalibrationPoints,
    pub zoomf: String,
    pub annotated_data_url: String,
}

/// Upload and save stages of the calibration flow.
#[derive(Clone)]
pub struct CalibrationPipeline {
    layout: StorageLayout,
    locks: LockRegistry,
    annotation: AnnotationService,
    default_sid: String,
}

impl CalibrationPipeline {
    pub fn new(
        layout: StorageLayout,
        locks: LockRegistry,
        annotation: AnnotationService,
        default_sid: impl Into<String>,
    ) -> Self {
        Self {
            layout,
            locks,
            annotation,
            default_sid: default_sid.into(),
        }
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    pub fn locks(&self) -> &LockRegistry {
        &self.locks
    }

    pub fn sid(&self, raw: Option<&str>) -> Sid {
        Sid::sanitize(raw, &self.default_sid)
    }

    #[instrument(skip(self, sid, data_url), fields(sid = %sid))]
    pub async fn upload_snapshot(
        &self,
        sid: &Sid,
        data_url: &str,
    ) -> Result<UploadedSnapshot, PipelineError> {
        let snapshot = DecodedSnapshot::from_data_url(data_url)?;
        let dirs = self.layout.resolve(sid).await?;
        let base_id = timestamp_id();

        // Serialize id allocation per (sid, second) so same-second uploads
        // cannot race for the same file name.
        let _guard = self
            .locks
            .acquire(FrameKey::new(sid.clone(), base_id.clone()))
            .await;
        let (id, path) = write_new_frame(&dirs, &base_id, snapshot.format, &snapshot.bytes).await?;

        let file_name = format!("{}.{}", id, snapshot.format.extension());
        info!(
            "Stored snapshot {} ({} bytes) at {:?}",
            id,
            snapshot.bytes.len(),
            path
        );
        Ok(UploadedSnapshot {
            locator_path: self.layout.locator_path(sid, &file_name),
            id,
        })
    }

    #[instrument(skip(self, sid, raw_points, zoomf), fields(sid = %sid))]
    pub async fn save_calibration(
        &self,
        sid: &Sid,
        frame_id: &str,
        raw_points: &[Value],
        zoomf: &str,
    ) -> Result<SavedCalibration, PipelineError> {
        let points = CalibrationPoints::parse(raw_points)?;

        self.layout.resolve(sid).await?;
        let frame_path = self
            .layout
            .find_frame(sid, frame_id)
            .await
            .ok_or_else(|| CalibrationError::NotFound("snapshot not found".into()))?;

        let guard = self
            .locks
            .acquire(FrameKey::new(sid.clone(), frame_id))
            .await;
        let jpeg = self
            .annotation
            .clone()
            .oneshot(RenderRequest {
                frame_path,
                points: points.clone(),
            })
            .await?;
        drop(guard);

        debug!("Rendered annotation for {} ({} bytes)", frame_id, jpeg.len());
        Ok(SavedCalibration {
            id: frame_id.to_string(),
            points,
            zoomf: zoomf.to_string(),
            annotated_data_url: format!("data:image/jpeg;base64,{}", STANDARD.encode(&jpeg)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::annotation::LabelFont;
    use image::{DynamicImage, ImageBuffer, ImageFormat, Rgb};
    use serde_json::json;
    use std::io::Cursor;
    use std::sync::Arc;
    use uuid::Uuid;

    fn pipeline() -> CalibrationPipeline {
        let root = std::env::temp_dir().join(format!("fieldcal-{}", Uuid::new_v4()));
        CalibrationPipeline::new(
            StorageLayout::new(root),
            LockRegistry::new(),
            AnnotationService::new(LabelFont::Bitmap, 90),
            "public",
        )
    }

    fn red_png_data_url(width: u32, height: u32) -> (Vec<u8>, String) {
        let image =
            DynamicImage::ImageRgb8(ImageBuffer::from_pixel(width, height, Rgb([255, 0, 0])));
        let mut buffer = Cursor::new(Vec::new());
        image.write_to(&mut buffer, ImageFormat::Png).unwrap();
        let bytes = buffer.into_inner();
        let url = format!("data:image/png;base64,{}", STANDARD.encode(&bytes));
        (bytes, url)
    }

    fn border_points() -> Vec<Value> {
        vec![
            json!([0.0, 0.0]),
            json!([0.5, 0.0]),
            json!([1.0, 0.0]),
            json!([1.0, 0.5]),
            json!([1.0, 1.0]),
            json!([0.75, 1.0]),
            json!([0.5, 1.0]),
            json!([0.0, 1.0]),
            json!([0.0, 0.75]),
            json!([0.0, 0.5]),
        ]
    }

    fn is_frame_id(id: &str) -> bool {
        let bytes = id.as_bytes();
        bytes.len() == 15
            && bytes[8] == b'_'
            && bytes
                .iter()
                .enumerate()
                .all(|(i, b)| i == 8 || b.is_ascii_digit())
    }

    #[tokio::test]
    async fn test_upload_round_trip() {
        let pipeline = pipeline();
        let sid = pipeline.sid(Some("team-a"));
        let (bytes, url) = red_png_data_url(100, 100);

        let uploaded = pipeline.upload_snapshot(&sid, &url).await.unwrap();

        assert!(is_frame_id(&uploaded.id));
        assert!(uploaded.locator_path.ends_with(".png"));
        assert!(uploaded.locator_path.starts_with("/calib/team-a/snapshots/"));
        let path = pipeline.layout().find_frame(&sid, &uploaded.id).await.unwrap();
        assert_eq!(std::fs::read(path).unwrap(), bytes);
        assert!(pipeline.locks().is_empty());

        let _ = std::fs::remove_dir_all(pipeline.layout().root());
    }

    #[tokio::test]
    async fn test_upload_then_save_scenario() {
        let pipeline = pipeline();
        let sid = pipeline.sid(Some("team-a"));
        let (_, url) = red_png_data_url(100, 100);
        let uploaded = pipeline.upload_snapshot(&sid, &url).await.unwrap();

        let saved = pipeline
            .save_calibration(&sid, &uploaded.id, &border_points(), "1.0:1.0")
            .await
            .unwrap();

        assert_eq!(saved.id, uploaded.id);
        assert_eq!(saved.zoomf, "1.0:1.0");
        assert_eq!(saved.points.as_slice().len(), 10);
        assert!(saved
            .points
            .as_slice()
            .iter()
            .flatten()
            .all(|v| (0.0..=1.0).contains(v)));
        let encoded = saved
            .annotated_data_url
            .strip_prefix("data:image/jpeg;base64,")
            .unwrap();
        assert!(!encoded.is_empty());
        let jpeg = STANDARD.decode(encoded).unwrap();
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (100, 100));

        let _ = std::fs::remove_dir_all(pipeline.layout().root());
    }

    #[tokio::test]
    async fn test_save_with_nine_points_fails_before_lookup() {
        let pipeline = pipeline();
        let sid = pipeline.sid(None);
        let nine = vec![json!([0.5, 0.5]); 9];

        let err = pipeline
            .save_calibration(&sid, "does_not_matter", &nine, "1:1")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Calibration(CalibrationError::Validation(ref m)) if m == "need 10 points"
        ));
        assert!(pipeline.locks().is_empty());
    }

    #[tokio::test]
    async fn test_save_unknown_frame() {
        let pipeline = pipeline();
        let sid = pipeline.sid(Some("team-a"));

        let err = pipeline
            .save_calibration(&sid, "20000101_000000", &border_points(), "1:1")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "snapshot not found");

        let _ = std::fs::remove_dir_all(pipeline.layout().root());
    }

    #[tokio::test]
    async fn test_repeated_save_is_idempotent() {
        let pipeline = pipeline();
        let sid = pipeline.sid(Some("s"));
        let (_, url) = red_png_data_url(64, 48);
        let uploaded = pipeline.upload_snapshot(&sid, &url).await.unwrap();

        let first = pipeline
            .save_calibration(&sid, &uploaded.id, &border_points(), "2:2")
            .await
            .unwrap();
        let second = pipeline
            .save_calibration(&sid, &uploaded.id, &border_points(), "2:2")
            .await
            .unwrap();
        assert_eq!(first.annotated_data_url, second.annotated_data_url);
        assert_eq!(first.points, second.points);

        let _ = std::fs::remove_dir_all(pipeline.layout().root());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_saves_on_one_frame() {
        let pipeline = Arc::new(pipeline());
        let sid = pipeline.sid(Some("s"));
        let (_, url) = red_png_data_url(80, 80);
        let uploaded = pipeline.upload_snapshot(&sid, &url).await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..6 {
            let pipeline = Arc::clone(&pipeline);
            let sid = sid.clone();
            let id = uploaded.id.clone();
            tasks.push(tokio::spawn(async move {
                pipeline
                    .save_calibration(&sid, &id, &border_points(), "1:1")
                    .await
                    .map(|saved| saved.annotated_data_url)
            }));
        }
        let mut outputs = Vec::new();
        for task in tasks {
            outputs.push(task.await.unwrap().unwrap());
        }

        assert!(outputs.windows(2).all(|w| w[0] == w[1]));
        assert!(pipeline.locks().is_empty());

        let _ = std::fs::remove_dir_all(pipeline.layout().root());
    }
}
