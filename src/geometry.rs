//! Bounding boxes of sources and the mapping between box and image pixels.

use std::ops::Range;

use ndarray::{Array2, ArrayView2, ArrayView3, ArrayViewMut3};

use crate::Float;

/// Integer pixel extent of a source, `[bottom, top) x [left, right)`.
///
/// The box may extend beyond the image; [`BoundingBox::overlap`] clamps it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BoundingBox {
    /// First row.
    pub bottom: isize,
    /// One past the last row.
    pub top: isize,
    /// First column.
    pub left: isize,
    /// One past the last column.
    pub right: isize,
}

/// The part of a box that lies inside an image, in both frames.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Overlap {
    /// Rows in the image frame.
    pub image_rows: Range<usize>,
    /// Columns in the image frame.
    pub image_cols: Range<usize>,
    /// Rows in the box frame.
    pub box_rows: Range<usize>,
    /// Columns in the box frame.
    pub box_cols: Range<usize>,
}

impl BoundingBox {
    /// Box of odd size around an integer center `(y, x)`.
    ///
    /// Even sizes are rounded up to the next odd size.
    pub fn centered(center: (isize, isize), size: (usize, usize)) -> Self {
        let half_y = (size.0 / 2) as isize;
        let half_x = (size.1 / 2) as isize;
        Self {
            bottom: center.0 - half_y,
            top: center.0 + half_y + 1,
            left: center.1 - half_x,
            right: center.1 + half_x + 1,
        }
    }

    /// Number of rows.
    pub fn height(&self) -> usize {
        (self.top - self.bottom) as usize
    }

    /// Number of columns.
    pub fn width(&self) -> usize {
        (self.right - self.left) as usize
    }

    /// `(height, width)`.
    pub fn shape(&self) -> (usize, usize) {
        (self.height(), self.width())
    }

    /// Number of pixels.
    pub fn len(&self) -> usize {
        self.height() * self.width()
    }

    /// Whether the box has no pixels.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clamp the box against an image of `(height, width)`.
    ///
    /// Returns `None` if the box does not touch the image.
    pub fn overlap(&self, height: usize, width: usize) -> Option<Overlap> {
        let (height, width) = (height as isize, width as isize);
        let image_bottom = self.bottom.max(0);
        let image_top = self.top.min(height);
        let image_left = self.left.max(0);
        let image_right = self.right.min(width);
        if image_bottom >= image_top || image_left >= image_right {
            return None;
        }

        let to_range = |start: isize, end: isize| start as usize..end as usize;
        Some(Overlap {
            image_rows: to_range(image_bottom, image_top),
            image_cols: to_range(image_left, image_right),
            box_rows: to_range(image_bottom - self.bottom, image_top - self.bottom),
            box_cols: to_range(image_left - self.left, image_right - self.left),
        })
    }

    /// Whether the image pixel `(y, x)` lies inside the box.
    pub fn contains(&self, y: isize, x: isize) -> bool {
        y >= self.bottom && y < self.top && x >= self.left && x < self.right
    }

    /// Cut the box out of a `(bands, height, width)` cube.
    ///
    /// Returns a `(bands, box pixels)` matrix, zero where the box leaves the image.
    pub fn extract<F: Float>(&self, cube: ArrayView3<F>) -> Array2<F> {
        let (bands, height, width) = cube.dim();
        let box_width = self.width();
        let mut cutout = Array2::zeros((bands, self.len()));
        if let Some(overlap) = self.overlap(height, width) {
            for (mut row, band) in cutout.outer_iter_mut().zip(cube.outer_iter()) {
                for (by, iy) in overlap.box_rows.clone().zip(overlap.image_rows.clone()) {
                    for (bx, ix) in overlap.box_cols.clone().zip(overlap.image_cols.clone()) {
                        row[by * box_width + bx] = band[[iy, ix]];
                    }
                }
            }
        }
        cutout
    }

    /// Add a `(bands, box pixels)` matrix into a `(bands, height, width)` cube.
    ///
    /// Pixels outside the image are dropped.
    pub fn add_into<F: Float>(&self, model: ArrayView2<F>, mut cube: ArrayViewMut3<F>) {
        let (_, height, width) = cube.dim();
        let box_width = self.width();
        let Some(overlap) = self.overlap(height, width) else {
            return;
        };
        for (row, mut band) in model.outer_iter().zip(cube.outer_iter_mut()) {
            for (by, iy) in overlap.box_rows.clone().zip(overlap.image_rows.clone()) {
                for (bx, ix) in overlap.box_cols.clone().zip(overlap.image_cols.clone()) {
                    band[[iy, ix]] += row[by * box_width + bx];
                }
            }
        }
    }

    /// Flat box indices of the pixels inside an image of `(height, width)`.
    pub fn inside_pixels(&self, height: usize, width: usize) -> Vec<usize> {
        let box_width = self.width();
        self.overlap(height, width)
            .map(|overlap| {
                overlap
                    .box_rows
                    .clone()
                    .flat_map(|by| overlap.box_cols.clone().map(move |bx| by * box_width + bx))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Flatten a 2D view in row-major order.
pub(crate) fn flatten<F: Float>(image: ArrayView2<F>) -> ndarray::Array1<F> {
    image.iter().copied().collect()
}

#[cfg(test)]
mod tests {
    use ndarray::{Array3, array};

    use super::*;

    #[test]
    fn odd_window() {
        let bbox = BoundingBox::centered((5, 7), (4, 3));
        assert_eq!(bbox.shape(), (5, 3));
        assert_eq!((bbox.bottom, bbox.top), (3, 8));
        assert_eq!((bbox.left, bbox.right), (6, 9));
    }

    #[test]
    fn clamped_overlap() {
        let bbox = BoundingBox::centered((1, 8), (5, 5));
        let overlap = bbox.overlap(10, 10).unwrap();

        assert_eq!(overlap.image_rows, 0..4);
        assert_eq!(overlap.box_rows, 1..5);
        assert_eq!(overlap.image_cols, 6..10);
        assert_eq!(overlap.box_cols, 0..4);
        assert!(BoundingBox::centered((-10, -10), (3, 3)).overlap(10, 10).is_none());
    }

    #[test]
    fn extract_and_add() {
        let mut cube = Array3::<f64>::zeros((2, 4, 4));
        for ((b, y, x), v) in cube.indexed_iter_mut() {
            *v = (b * 100 + y * 10 + x) as f64;
        }
        let bbox = BoundingBox::centered((0, 0), (3, 3));
        let cutout = bbox.extract(cube.view());

        assert_eq!(
            cutout.row(1),
            array![0., 0., 0., 0., 100., 101., 0., 110., 111.]
        );

        let mut target = Array3::zeros((2, 4, 4));
        bbox.add_into(cutout.view(), target.view_mut());
        assert_eq!(target[[1, 1, 1]], 111.);
        assert_eq!(target[[1, 2, 2]], 0.);
        assert_eq!(bbox.inside_pixels(4, 4), vec![4, 5, 7, 8]);
    }
}
