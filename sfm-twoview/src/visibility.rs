use nalgebra::Point2;

/// An occupancy pyramid over the image used to score how well spread out a
/// set of observations is. The coarsest level is a 2x2 grid and each level
/// doubles the resolution. Each level contributes the number of occupied
/// cells weighted by the total number of cells in that level, so good
/// spatial distribution at fine resolutions dominates the score.
#[derive(Debug, Clone)]
pub struct VisibilityPyramid {
    width: f64,
    height: f64,
    max_cells_in_dimension: usize,
    pyramid: Vec<Vec<u32>>,
}

impl VisibilityPyramid {
    /// Creates a pyramid over an image of the given dimensions with
    /// `num_levels` levels. Dimensions and level count must be nonzero.
    pub fn new(width: u32, height: u32, num_levels: usize) -> Self {
        assert!(width > 0 && height > 0 && num_levels > 0);
        let pyramid = (0..num_levels)
            .map(|level| {
                let cells_per_dimension = 1usize << (1 + level);
                vec![0u32; cells_per_dimension * cells_per_dimension]
            })
            .collect();
        Self {
            width: width as f64,
            height: height as f64,
            max_cells_in_dimension: 1 << num_levels,
            pyramid,
        }
    }

    /// Adds an observation at a pixel location to every level of the pyramid.
    pub fn add_point(&mut self, point: Point2<f64>) {
        let clamp = |cell: i64| cell.clamp(0, self.max_cells_in_dimension as i64 - 1) as usize;
        let mut cell_x =
            clamp((self.max_cells_in_dimension as f64 * point.x / self.width) as i64);
        let mut cell_y =
            clamp((self.max_cells_in_dimension as f64 * point.y / self.height) as i64);

        // Go from the finest level to the coarsest; each coarser level has
        // half the cells per dimension so a bitshift moves between them.
        for level in (0..self.pyramid.len()).rev() {
            let cells_per_dimension = 1usize << (1 + level);
            self.pyramid[level][cell_y * cells_per_dimension + cell_x] += 1;
            cell_x >>= 1;
            cell_y >>= 1;
        }
    }

    /// The number of occupied cells in each level weighted by the total
    /// number of cells in that level.
    pub fn score(&self) -> u64 {
        self.pyramid
            .iter()
            .map(|level| {
                let occupied = level.iter().filter(|&&count| count > 0).count() as u64;
                occupied * level.len() as u64
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_is_monotonic_in_observations() {
        let mut pyramid = VisibilityPyramid::new(640, 480, 6);
        let mut last = 0;
        for i in 0..32 {
            pyramid.add_point(Point2::new((i * 20) as f64, (i * 15) as f64));
            let score = pyramid.score();
            assert!(score >= last);
            last = score;
        }
    }

    #[test]
    fn clustered_points_score_below_spread_points() {
        let mut clustered = VisibilityPyramid::new(1024, 1024, 6);
        let mut spread = VisibilityPyramid::new(1024, 1024, 6);
        for i in 0..16 {
            clustered.add_point(Point2::new(10.0 + i as f64, 10.0));
            spread.add_point(Point2::new((i * 64) as f64, (i * 64) as f64));
        }
        assert!(spread.score() > clustered.score());
    }

    #[test]
    fn out_of_bounds_points_clamp_to_the_border() {
        let mut pyramid = VisibilityPyramid::new(100, 100, 3);
        pyramid.add_point(Point2::new(-50.0, 1000.0));
        // One cell occupied per level: 4 + 16 + 64.
        assert_eq!(pyramid.score(), 84);
    }
}
