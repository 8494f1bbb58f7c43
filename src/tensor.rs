//! Weight tensors and signal reshaping helpers
//!
//! A [`WeightTensor`] is a sequence of equally shaped 3-D arrays ("cubes"). A layer
//! keeps one cube per filter or per unit for its weights and another tensor for its
//! biases. Signals flowing between layers are plain `Array3<f32>` indexed as
//! `[row, col, slice]`.
//!
//! Flattening follows column-major order inside each slice, slice after slice, so
//! `vectorise` and `unvectorise` are exact inverses and the binary cube records
//! written by [`write_cube`] keep the same element order.

use crate::error::{NetError, NetResult};
use crate::utils::rng::SimpleRng;
use ndarray::{Array2, Array3};
use std::io::{BufRead, Write};

const CUBE_MAGIC: &str = "CNN_CUBE_F32";

/// Four-dimensional weight buffer: `count` cubes of `height × width × depth`.
///
/// `count == 0` means the owning layer has no trainable parameters.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WeightTensor {
    data: Vec<Array3<f32>>,
    height: usize,
    width: usize,
    depth: usize,
}

impl WeightTensor {
    /// Create a zero-filled tensor of `count` cubes.
    pub fn new(height: usize, width: usize, depth: usize, count: usize) -> Self {
        let data = (0..count)
            .map(|_| Array3::zeros((height, width, depth)))
            .collect();
        Self {
            data,
            height,
            width,
            depth,
        }
    }

    /// Tensor with no entries, used by layers without parameters.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Shape of every entry as `(height, width, depth)`.
    pub fn entry_shape(&self) -> (usize, usize, usize) {
        (self.height, self.width, self.depth)
    }

    /// Total number of scalar parameters across all entries.
    pub fn element_count(&self) -> usize {
        self.data.len() * self.height * self.width * self.depth
    }

    pub fn get(&self, index: usize) -> &Array3<f32> {
        &self.data[index]
    }

    pub fn get_mut(&mut self, index: usize) -> &mut Array3<f32> {
        &mut self.data[index]
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Array3<f32>> {
        self.data.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Array3<f32>> {
        self.data.iter_mut()
    }

    /// Replace entry `index`, which must have the declared shape.
    pub fn set(&mut self, index: usize, cube: Array3<f32>) -> NetResult<()> {
        if cube.dim() != self.entry_shape() {
            return Err(NetError::ShapeMismatch(format!(
                "entry shape {:?} does not match tensor shape {:?}",
                cube.dim(),
                self.entry_shape()
            )));
        }
        self.data[index] = cube;
        Ok(())
    }

    /// True when both tensors have the same entry count and entry shape.
    pub fn same_layout(&self, other: &WeightTensor) -> bool {
        self.count() == other.count() && self.entry_shape() == other.entry_shape()
    }

    fn check_layout(&self, other: &WeightTensor) -> NetResult<()> {
        if self.same_layout(other) {
            Ok(())
        } else {
            Err(NetError::ShapeMismatch(format!(
                "tensor layout {}x{:?} does not match {}x{:?}",
                self.count(),
                self.entry_shape(),
                other.count(),
                other.entry_shape()
            )))
        }
    }

    /// Element-wise `self += other`.
    pub fn add_assign(&mut self, other: &WeightTensor) -> NetResult<()> {
        self.check_layout(other)?;
        for (dst, src) in self.data.iter_mut().zip(other.data.iter()) {
            *dst += src;
        }
        Ok(())
    }

    /// Multiply every element by `factor`.
    pub fn scale(&mut self, factor: f32) {
        for cube in &mut self.data {
            cube.mapv_inplace(|v| v * factor);
        }
    }

    /// Element-wise `self = f(self, other)`.
    pub fn zip_apply<F>(&mut self, other: &WeightTensor, mut f: F) -> NetResult<()>
    where
        F: FnMut(f32, f32) -> f32,
    {
        self.check_layout(other)?;
        for (dst, src) in self.data.iter_mut().zip(other.data.iter()) {
            ndarray::Zip::from(dst).and(src).for_each(|d, &s| *d = f(*d, s));
        }
        Ok(())
    }

    /// Fill every entry with `N(0, std²)` samples.
    pub fn fill_gaussian(&mut self, rng: &mut SimpleRng, std: f32) {
        for cube in &mut self.data {
            cube.mapv_inplace(|_| std * rng.next_gaussian());
        }
    }
}

/// True when the signal is a column vector embedded in 3-D: `(n, 1, 1)`.
pub fn is_vector_shaped(signal: &Array3<f32>) -> bool {
    let (_, cols, slices) = signal.dim();
    cols == 1 && slices == 1
}

/// Flatten a cube into an `(n, 1, 1)` column, column-major within each slice.
pub fn vectorise(src: &Array3<f32>) -> Array3<f32> {
    let (rows, cols, slices) = src.dim();
    let mut dst = Array3::zeros((rows * cols * slices, 1, 1));
    let mut idx = 0;
    for s in 0..slices {
        for c in 0..cols {
            for r in 0..rows {
                dst[[idx, 0, 0]] = src[[r, c, s]];
                idx += 1;
            }
        }
    }
    dst
}

/// Inverse of [`vectorise`].
pub fn unvectorise(
    src: &Array3<f32>,
    height: usize,
    width: usize,
    depth: usize,
) -> NetResult<Array3<f32>> {
    if height == 0 || width == 0 || depth == 0 || height * width * depth != src.len() {
        return Err(NetError::ShapeMismatch(format!(
            "cannot reshape {} elements into {}x{}x{}",
            src.len(),
            height,
            width,
            depth
        )));
    }
    let mut dst = Array3::zeros((height, width, depth));
    for (idx, value) in column_major_iter(src).enumerate() {
        let s = idx / (height * width);
        let rem = idx % (height * width);
        dst[[rem % height, rem / height, s]] = value;
    }
    Ok(dst)
}

fn column_major_iter(src: &Array3<f32>) -> impl Iterator<Item = f32> + '_ {
    let (rows, cols, slices) = src.dim();
    (0..slices).flat_map(move |s| {
        (0..cols).flat_map(move |c| (0..rows).map(move |r| src[[r, c, s]]))
    })
}

/// Unroll the `kh × kw` patches of `src` into an im2col matrix.
///
/// The result is `(kh·kw·depth) × (out_height·out_width)`. Patch elements are
/// ordered column-major inside each channel block and output positions are
/// ordered column-major as well (`col · out_height + row`), so multiplying the
/// [`kernel2col`] matrix by this one yields every filter response at every output
/// position in a single product.
pub fn im2col(
    src: &Array3<f32>,
    kh: usize,
    kw: usize,
    stride: usize,
    out_height: usize,
    out_width: usize,
) -> NetResult<Array2<f32>> {
    let (rows, cols, depth) = src.dim();
    if stride == 0
        || kh == 0
        || kw == 0
        || (out_height > 0 && (out_height - 1) * stride + kh > rows)
        || (out_width > 0 && (out_width - 1) * stride + kw > cols)
    {
        return Err(NetError::InvalidGeometry(format!(
            "{}x{} output with {}x{} kernel and stride {} exceeds {}x{} input",
            out_height, out_width, kh, kw, stride, rows, cols
        )));
    }

    let patch = kh * kw;
    let mut data = Array2::zeros((patch * depth, out_height * out_width));
    for c in 0..depth {
        for col in 0..out_width {
            for row in 0..out_height {
                let position = col * out_height + row;
                for kc in 0..kw {
                    for kr in 0..kh {
                        data[[c * patch + kc * kh + kr, position]] =
                            src[[row * stride + kr, col * stride + kc, c]];
                    }
                }
            }
        }
    }
    Ok(data)
}

/// Unroll every kernel into one row: `count × (kh·kw·depth)`, matching [`im2col`].
pub fn kernel2col(kernels: &WeightTensor) -> Array2<f32> {
    let (kh, kw, depth) = kernels.entry_shape();
    let patch = kh * kw;
    let mut kernel = Array2::zeros((kernels.count(), patch * depth));
    for (k, cube) in kernels.iter().enumerate() {
        for c in 0..depth {
            for kc in 0..kw {
                for kr in 0..kh {
                    kernel[[k, c * patch + kc * kh + kr]] = cube[[kr, kc, c]];
                }
            }
        }
    }
    kernel
}

/// Write one cube as a self-describing binary record.
pub fn write_cube<W: Write + ?Sized>(out: &mut W, cube: &Array3<f32>) -> NetResult<()> {
    let (rows, cols, slices) = cube.dim();
    write!(out, "{}\n{} {} {}\n", CUBE_MAGIC, rows, cols, slices)?;
    let mut bytes = Vec::with_capacity(cube.len() * 4);
    for value in column_major_iter(cube) {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    out.write_all(&bytes)?;
    Ok(())
}

/// Read one cube record written by [`write_cube`]. The header must announce
/// `expected`; nothing is allocated for a record of any other shape.
pub fn read_cube<R: BufRead + ?Sized>(
    input: &mut R,
    expected: (usize, usize, usize),
) -> NetResult<Array3<f32>> {
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Err(NetError::CorruptWeights("unexpected end of stream".into()));
    }
    if line.trim_end() != CUBE_MAGIC {
        return Err(NetError::CorruptWeights(format!(
            "bad record header '{}'",
            line.trim_end()
        )));
    }
    line.clear();
    input.read_line(&mut line)?;
    let dims: Vec<usize> = line
        .split_whitespace()
        .map(|token| token.parse::<usize>())
        .collect::<Result<_, _>>()
        .map_err(|e| NetError::CorruptWeights(format!("bad record dimensions: {e}")))?;
    if dims.len() != 3 {
        return Err(NetError::CorruptWeights(format!(
            "expected 3 dimensions, found {}",
            dims.len()
        )));
    }
    let (rows, cols, slices) = (dims[0], dims[1], dims[2]);
    if (rows, cols, slices) != expected {
        return Err(NetError::CorruptWeights(format!(
            "record shape {:?} does not match expected {:?}",
            (rows, cols, slices),
            expected
        )));
    }

    let mut bytes = vec![0u8; rows * cols * slices * 4];
    input.read_exact(&mut bytes)?;
    let mut cube = Array3::zeros((rows, cols, slices));
    let mut chunks = bytes.chunks_exact(4);
    for s in 0..slices {
        for c in 0..cols {
            for r in 0..rows {
                if let Some(chunk) = chunks.next() {
                    cube[[r, c, s]] = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                }
            }
        }
    }
    Ok(cube)
}
