use crate::error::{Error, Result};
use crate::shape::Shape;

// Layout: shape + strides + offset
//
// The Layout decouples the logical shape of a tensor from how its data is
// arranged in storage. Transpose, select and broadcasting only rewrite the
// layout; the storage is shared with the source tensor.
//
//   contiguous [2,3]   strides [3,1]  offset 0
//   transpose(0,1)     shape [3,2]    strides [1,3]
//   select(0, 1)       shape [3]      strides [1]    offset 3
//   broadcast_as [4,3] from [3]       strides [0,1]

/// Layout describes how a tensor's logical shape maps to flat storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    shape: Shape,
    strides: Vec<usize>,
    offset: usize,
}

impl Layout {
    /// Create a new contiguous layout for the given shape.
    pub fn contiguous(shape: Shape) -> Self {
        let strides = shape.stride_contiguous();
        Layout {
            shape,
            strides,
            offset: 0,
        }
    }

    /// Create a layout with explicit strides and offset (for views).
    pub fn new(shape: Shape, strides: Vec<usize>, offset: usize) -> Self {
        Layout {
            shape,
            strides,
            offset,
        }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn elem_count(&self) -> usize {
        self.shape.elem_count()
    }

    /// Row-major strides and zero offset.
    pub fn is_contiguous(&self) -> bool {
        self.offset == 0 && self.strides == self.shape.stride_contiguous()
    }

    /// Swap two dimensions without moving data.
    pub fn transpose(&self, dim0: usize, dim1: usize) -> Result<Layout> {
        let rank = self.rank();
        if dim0 >= rank || dim1 >= rank {
            return Err(Error::DimOutOfRange {
                dim: dim0.max(dim1) as i64,
                rank,
            });
        }
        let mut new_dims = self.shape.dims().to_vec();
        let mut new_strides = self.strides.clone();
        new_dims.swap(dim0, dim1);
        new_strides.swap(dim0, dim1);
        Ok(Layout::new(Shape::new(new_dims), new_strides, self.offset))
    }

    /// Pick one index along `dim`, dropping that dimension.
    pub fn select(&self, dim: usize, index: usize) -> Result<Layout> {
        let rank = self.rank();
        if dim >= rank {
            return Err(Error::DimOutOfRange {
                dim: dim as i64,
                rank,
            });
        }
        let size = self.dims()[dim];
        if index >= size {
            return Err(Error::IndexOutOfBounds {
                index: index as i64,
                size,
            });
        }
        let mut dims = self.dims().to_vec();
        let mut strides = self.strides.clone();
        let offset = self.offset + index * strides[dim];
        dims.remove(dim);
        strides.remove(dim);
        Ok(Layout::new(Shape::new(dims), strides, offset))
    }

    /// View this layout as `target` using zero strides for broadcast dims.
    pub fn broadcast_as(&self, target: &Shape) -> Result<Layout> {
        let dims = self.dims();
        let target_dims = target.dims();
        if dims.len() > target_dims.len() {
            return Err(Error::BroadcastMismatch {
                lhs: self.shape.clone(),
                rhs: target.clone(),
            });
        }
        let lead = target_dims.len() - dims.len();
        let mut strides = vec![0usize; target_dims.len()];
        for (i, &d) in dims.iter().enumerate() {
            if d == target_dims[i + lead] {
                strides[i + lead] = self.strides[i];
            } else if d != 1 {
                return Err(Error::BroadcastMismatch {
                    lhs: self.shape.clone(),
                    rhs: target.clone(),
                });
            }
        }
        Ok(Layout::new(target.clone(), strides, self.offset))
    }

    /// Flat storage index for a multi-dimensional index.
    pub fn flat_index(&self, index: &[usize]) -> usize {
        let mut flat = self.offset;
        for (i, &idx) in index.iter().enumerate() {
            flat += idx * self.strides[i];
        }
        flat
    }

    /// Iterator over all flat storage indices of this layout, in logical order.
    pub fn strided_indices(&self) -> StridedIter {
        StridedIter::new(self)
    }
}

/// Iterator that yields flat storage indices for each element of a Layout.
pub struct StridedIter {
    current: Vec<usize>,
    dims: Vec<usize>,
    strides: Vec<usize>,
    offset: usize,
    remaining: usize,
    started: bool,
}

impl StridedIter {
    fn new(layout: &Layout) -> Self {
        StridedIter {
            current: vec![0; layout.rank()],
            dims: layout.dims().to_vec(),
            strides: layout.strides().to_vec(),
            offset: layout.offset(),
            remaining: layout.elem_count(),
            started: false,
        }
    }

    fn flat_index(&self) -> usize {
        self.current
            .iter()
            .zip(&self.strides)
            .fold(self.offset, |acc, (i, s)| acc + i * s)
    }

    // Rightmost dimension moves fastest.
    fn advance(&mut self) {
        for i in (0..self.dims.len()).rev() {
            self.current[i] += 1;
            if self.current[i] < self.dims[i] {
                return;
            }
            self.current[i] = 0;
        }
    }
}

impl Iterator for StridedIter {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.remaining == 0 {
            return None;
        }
        if self.started {
            self.advance();
        }
        self.started = true;
        self.remaining -= 1;
        Some(self.flat_index())
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for StridedIter {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contiguous_indices() {
        let layout = Layout::contiguous(Shape::from((2, 3)));
        let indices: Vec<usize> = layout.strided_indices().collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_transpose_indices() {
        let layout = Layout::contiguous(Shape::from((2, 3)));
        let transposed = layout.transpose(0, 1).unwrap();
        assert!(!transposed.is_contiguous());
        let indices: Vec<usize> = transposed.strided_indices().collect();
        assert_eq!(indices, vec![0, 3, 1, 4, 2, 5]);
    }

    #[test]
    fn test_select_drops_dim() {
        let layout = Layout::contiguous(Shape::from((2, 3)));
        let row = layout.select(0, 1).unwrap();
        assert_eq!(row.dims(), &[3]);
        assert_eq!(row.strided_indices().collect::<Vec<_>>(), vec![3, 4, 5]);
        assert!(layout.select(0, 2).is_err());
    }

    #[test]
    fn test_broadcast_zero_strides() {
        let layout = Layout::contiguous(Shape::from(3));
        let b = layout.broadcast_as(&Shape::from((2, 3))).unwrap();
        assert_eq!(b.strides(), &[0, 1]);
        assert_eq!(b.strided_indices().collect::<Vec<_>>(), vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_scalar_layout_yields_offset() {
        let layout = Layout::new(Shape::from(()), vec![], 4);
        assert_eq!(layout.strided_indices().collect::<Vec<_>>(), vec![4]);
    }
}
