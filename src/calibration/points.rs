use serde::Serialize;
use serde_json::Value;

use crate::error::CalibrationError;

pub const POINT_COUNT: usize = 10;

/// Ten ordered points in normalized frame coordinates, each clamped into [0,1].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct CalibrationPoints(Vec<[f64; 2]>);

impl CalibrationPoints {
    /// Validates shape and clamps coordinates. Rejects anything but exactly
    /// ten `[x, y]` numeric pairs.
    pub fn parse(raw: &[Value]) -> Result<Self, CalibrationError> {
        if raw.len() != POINT_COUNT {
            return Err(CalibrationError::Validation("need 10 points".to_string()));
        }
        let points = raw
            .iter()
            .enumerate()
            .map(|(i, entry)| parse_point(entry).ok_or_else(|| invalid_point(i)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self(points))
    }

    pub fn as_slice(&self) -> &[[f64; 2]] {
        &self.0
    }

    /// Maps each point to pixel space of a `width` x `height` image.
    pub fn to_pixels(&self, width: u32, height: u32) -> Vec<(i32, i32)> {
        self.0
            .iter()
            .map(|[x, y]| to_pixel(*x, *y, width, height))
            .collect()
    }
}

pub fn clamp_unit(v: f64) -> f64 {
    v.clamp(0.0, 1.0)
}

pub fn to_pixel(x: f64, y: f64, width: u32, height: u32) -> (i32, i32) {
    (
        (x * width as f64).floor() as i32,
        (y * height as f64).floor() as i32,
    )
}

fn parse_point(entry: &Value) -> Option<[f64; 2]> {
    match entry.as_array()?.as_slice() {
        [x, y] => Some([clamp_unit(coordinate(x)?), clamp_unit(coordinate(y)?)]),
        _ => None,
    }
}

fn coordinate(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
        _ => None,
    }
}

fn invalid_point(index: usize) -> CalibrationError {
    CalibrationError::Validation(format!("point[{}] invalid", index))
}
