//! Affine coordinate transformation

use super::source::ImportError;
use crate::types::Coordinate;

/// Smallest absolute determinant accepted for the linear part
const SINGULARITY_EPSILON: f64 = 1e-12;

/// 3x4 affine transformation `p' = M * p + t`
#[derive(Debug, Clone, PartialEq)]
pub struct AffineTransformer {
    linear: [[f64; 3]; 3],
    translation: [f64; 3],
}

impl AffineTransformer {
    /// Build from a row-major 3x4 matrix. Fails if the linear part is singular.
    pub fn new(matrix: &[f64; 12]) -> Result<Self, ImportError> {
        if matrix.iter().any(|v| !v.is_finite()) {
            return Err(ImportError::Transformation(
                "matrix contains non-finite values".to_string(),
            ));
        }

        let row = |r: usize| [matrix[r * 4], matrix[r * 4 + 1], matrix[r * 4 + 2]];
        let linear = [row(0), row(1), row(2)];
        let translation = [matrix[3], matrix[7], matrix[11]];

        let det = determinant(&linear);
        if det.abs() < SINGULARITY_EPSILON {
            return Err(ImportError::Transformation(format!(
                "matrix is singular (determinant {})",
                det
            )));
        }

        Ok(Self {
            linear,
            translation,
        })
    }

    pub fn transform(&self, p: &Coordinate) -> Coordinate {
        let m = &self.linear;
        let t = &self.translation;
        [
            m[0][0] * p[0] + m[0][1] * p[1] + m[0][2] * p[2] + t[0],
            m[1][0] * p[0] + m[1][1] * p[1] + m[1][2] * p[2] + t[1],
            m[2][0] * p[0] + m[2][1] * p[1] + m[2][2] * p[2] + t[2],
        ]
    }

    pub fn transform_all(&self, coordinates: &mut [Coordinate]) {
        for c in coordinates.iter_mut() {
            *c = self.transform(c);
        }
    }
}

fn determinant(m: &[[f64; 3]; 3]) -> f64 {
    m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
        - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
}
