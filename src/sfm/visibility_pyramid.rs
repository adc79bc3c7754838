//! Multi-level occupancy grid over an image.
//!
//! Level `l` splits the image into `2^(l+1) x 2^(l+1)` cells. A cell that
//! becomes occupied at level `l` adds the number of cells of that level to the
//! score, so well-distributed points score higher than clustered ones.

use nalgebra::DMatrix;

/// Number of levels used for next-image selection.
pub const NUM_VISIBILITY_PYRAMID_LEVELS: usize = 6;

#[derive(Debug, Clone, PartialEq)]
pub struct VisibilityPyramid {
    width: usize,
    height: usize,
    score: usize,
    max_score: usize,
    /// Occupancy counts, coarsest level first.
    levels: Vec<DMatrix<u32>>,
}

impl VisibilityPyramid {
    pub fn new(num_levels: usize, width: usize, height: usize) -> Self {
        let mut levels = Vec::with_capacity(num_levels);
        let mut max_score = 0;
        for level in 0..num_levels {
            let dim = 1usize << (level + 1);
            levels.push(DMatrix::zeros(dim, dim));
            max_score += dim * dim * dim * dim;
        }
        Self {
            width,
            height,
            score: 0,
            max_score,
            levels,
        }
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn score(&self) -> usize {
        self.score
    }

    /// Score with every cell of every level occupied.
    pub fn max_score(&self) -> usize {
        self.max_score
    }

    /// Mark one point at pixel `(x, y)`.
    pub fn set_point(&mut self, x: f64, y: f64) {
        let Some((mut cx, mut cy)) = self.cell_for_point(x, y) else {
            return;
        };
        for level in self.levels.iter_mut().rev() {
            let count = &mut level[(cy, cx)];
            *count += 1;
            if *count == 1 {
                self.score += level.len();
            }
            cx >>= 1;
            cy >>= 1;
        }
    }

    /// Remove one point previously added at pixel `(x, y)`.
    pub fn reset_point(&mut self, x: f64, y: f64) {
        let Some((mut cx, mut cy)) = self.cell_for_point(x, y) else {
            return;
        };
        for level in self.levels.iter_mut().rev() {
            let count = &mut level[(cy, cx)];
            if *count > 0 {
                *count -= 1;
                if *count == 0 {
                    self.score -= level.len();
                }
            }
            cx >>= 1;
            cy >>= 1;
        }
    }

    /// Cell at the finest level, clamped to the grid.
    fn cell_for_point(&self, x: f64, y: f64) -> Option<(usize, usize)> {
        if self.levels.is_empty() || self.width == 0 || self.height == 0 {
            return None;
        }
        let max_dim = 1usize << self.levels.len();
        let to_cell = |v: f64, size: usize| -> usize {
            let cell = (max_dim as f64 * v / size as f64).floor();
            cell.clamp(0.0, (max_dim - 1) as f64) as usize
        };
        Some((to_cell(x, self.width), to_cell(y, self.height)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_score() {
        let pyramid = VisibilityPyramid::new(2, 100, 100);
        // 2x2 and 4x4 grids: 4*4 + 16*16
        assert_eq!(pyramid.max_score(), 16 + 256);
        assert_eq!(pyramid.score(), 0);
    }

    #[test]
    fn test_spread_points_score_higher() {
        let mut clustered = VisibilityPyramid::new(3, 640, 480);
        let mut spread = VisibilityPyramid::new(3, 640, 480);
        for i in 0..4 {
            clustered.set_point(10.0 + i as f64, 10.0);
        }
        for (x, y) in [(10.0, 10.0), (630.0, 10.0), (10.0, 470.0), (630.0, 470.0)] {
            spread.set_point(x, y);
        }
        assert!(spread.score() > clustered.score());
    }

    #[test]
    fn test_set_reset_restores_score() {
        let mut pyramid = VisibilityPyramid::new(NUM_VISIBILITY_PYRAMID_LEVELS, 640, 480);
        pyramid.set_point(100.0, 100.0);
        let single = pyramid.score();
        pyramid.set_point(100.5, 100.5);
        assert_eq!(pyramid.score(), single);
        pyramid.set_point(500.0, 400.0);
        assert!(pyramid.score() > single);

        pyramid.reset_point(500.0, 400.0);
        assert_eq!(pyramid.score(), single);
        pyramid.reset_point(100.5, 100.5);
        pyramid.reset_point(100.0, 100.0);
        assert_eq!(pyramid.score(), 0);
    }

    #[test]
    fn test_out_of_bounds_points_are_clamped() {
        let mut pyramid = VisibilityPyramid::new(2, 100, 100);
        pyramid.set_point(-5.0, 200.0);
        assert!(pyramid.score() > 0);
        pyramid.reset_point(-5.0, 200.0);
        assert_eq!(pyramid.score(), 0);
    }
}
