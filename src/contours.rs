//! Polygon outlines of binary masks.

use image::ImageBuffer;
use imageproc::contours::{BorderType, find_contours};
use imageproc::geometry::{approximate_polygon_dp, arc_length};
use imageproc::point::Point;
use ndarray::ArrayView2;

use crate::volume::GrayImage;

/// Closed outline of a mask region in pixel coordinates.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Border {
    pub points: Vec<Point<i32>>,
    /// `true` for the inner border of a hole.
    pub is_hole: bool,
}

/// Outer borders of the foreground (non-zero) regions of `mask`.
///
/// Borders with fewer than `min_points` points are dropped; the others are
/// simplified with Douglas-Peucker using `epsilon_coeff` times the closed
/// border length as tolerance.
pub fn find_polygons(mask: &GrayImage, epsilon_coeff: f64, min_points: usize) -> Vec<Vec<Point<i32>>> {
    find_contours::<i32>(mask)
        .into_iter()
        .filter(|contour| contour.border_type == BorderType::Outer && contour.parent.is_none())
        .filter(|contour| contour.points.len() >= min_points)
        .map(|contour| simplify(&contour.points, epsilon_coeff))
        .collect()
}

/// Outer and hole borders of `mask`, simplified like [`find_polygons`].
pub fn find_all_borders(mask: &GrayImage, epsilon_coeff: f64, min_points: usize) -> Vec<Border> {
    find_contours::<i32>(mask)
        .into_iter()
        .filter(|contour| contour.points.len() >= min_points)
        .map(|contour| Border {
            points: simplify(&contour.points, epsilon_coeff),
            is_hole: contour.border_type == BorderType::Hole,
        })
        .collect()
}

fn simplify(points: &[Point<i32>], epsilon_coeff: f64) -> Vec<Point<i32>> {
    if epsilon_coeff <= 0.0 {
        return points.to_vec();
    }
    let epsilon = epsilon_coeff * arc_length(points, true);
    approximate_polygon_dp(points, epsilon, true)
}

/// 0/255 image of the non-zero entries of a 2D mask.
pub fn mask_to_image(mask: ArrayView2<'_, u8>) -> GrayImage {
    let (height, width) = mask.dim();
    ImageBuffer::from_fn(width as u32, height as u32, |x, y| {
        image::Luma([if mask[[y as usize, x as usize]] != 0 { 255 } else { 0 }])
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn square_with_hole() -> GrayImage {
        let mut mask = Array2::<u8>::zeros((20, 20));
        mask.slice_mut(ndarray::s![2..18, 2..18]).fill(1);
        mask.slice_mut(ndarray::s![8..12, 8..12]).fill(0);
        mask_to_image(mask.view())
    }

    #[test]
    fn square_simplifies_to_corners() {
        let polygons = find_polygons(&square_with_hole(), 0.01, 5);
        assert_eq!(polygons.len(), 1);
        assert!((4..=5).contains(&polygons[0].len()), "{:?}", polygons[0]);
        for point in &polygons[0] {
            assert!(point.x == 2 || point.x == 17);
            assert!(point.y == 2 || point.y == 17);
        }
    }

    #[test]
    fn all_borders_include_holes() {
        let borders = find_all_borders(&square_with_hole(), 0.0, 3);
        assert_eq!(borders.len(), 2);
        assert_eq!(borders.iter().filter(|b| b.is_hole).count(), 1);
    }

    #[test]
    fn tiny_regions_are_dropped() {
        let mut mask = Array2::<u8>::zeros((10, 10));
        mask[[4, 4]] = 1;
        assert!(find_polygons(&mask_to_image(mask.view()), 0.01, 5).is_empty());
    }
}
