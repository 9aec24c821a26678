// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use num_traits::Zero;

use crate::element::ElementwiseOperation;
use crate::types::{AccType, DataType};

/// Partial results of one output tile, held in the accumulator type.
///
/// Owned by exactly one execution group from pipeline start until it is written out.
#[derive(Debug, Clone, PartialEq)]
pub struct AccumulationTile<A> {
    rows: usize,
    cols: usize,
    data: Vec<A>,
}

impl<A: AccType> AccumulationTile<A> {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self::filled(rows, cols, A::zero())
    }

    pub fn filled(rows: usize, cols: usize, value: A) -> Self {
        Self {
            rows,
            cols,
            data: vec![value; rows * cols],
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> A {
        self.data[row * self.cols + col]
    }

    #[inline]
    pub fn get_mut(&mut self, row: usize, col: usize) -> &mut A {
        &mut self.data[row * self.cols + col]
    }

    pub fn row(&self, row: usize) -> &[A] {
        &self.data[row * self.cols..(row + 1) * self.cols]
    }

    pub fn row_mut(&mut self, row: usize) -> &mut [A] {
        &mut self.data[row * self.cols..(row + 1) * self.cols]
    }

    pub fn as_slice(&self) -> &[A] {
        &self.data
    }

    pub fn fill(&mut self, value: A) {
        self.data.fill(value);
    }

    /// Apply an elementwise operator in place.
    pub fn apply<Op: ElementwiseOperation<A>>(&mut self, op: &Op) {
        for v in self.data.iter_mut() {
            *v = op.apply(*v);
        }
    }

    /// Narrow every element to `T` into the row-major staging tile `out`.
    ///
    /// This is the only place an accumulated value is rounded to storage precision.
    pub fn shuffle_into<T, Op>(&self, op: &Op, out: &mut [T])
    where
        T: DataType<Acc = A>,
        Op: ElementwiseOperation<A>,
    {
        for (dst, v) in out.iter_mut().zip(&self.data) {
            *dst = T::from_acc(op.apply(*v));
        }
    }
}

/// `acc[m][n] += Σ_k a[m][k] · b[n][k]` for row-major tiles `a: M x K`, `b: N x K`.
pub fn gemm_tile_nk<T, Opa, Opb>(
    acc: &mut AccumulationTile<T::Acc>,
    a: &[T],
    b: &[T],
    k: usize,
    a_op: &Opa,
    b_op: &Opb,
) where
    T: DataType,
    Opa: ElementwiseOperation<T::Acc>,
    Opb: ElementwiseOperation<T::Acc>,
{
    let cols = acc.cols();
    for m in 0..acc.rows() {
        let a_row = &a[m * k..(m + 1) * k];
        for n in 0..cols {
            let b_row = &b[n * k..(n + 1) * k];
            let mut sum = T::Acc::zero();
            for (x, y) in a_row.iter().zip(b_row) {
                sum += a_op.apply(x.to_acc()) * b_op.apply(y.to_acc());
            }
            *acc.get_mut(m, n) += sum;
        }
    }
}

/// `acc[m][n] += Σ_k a[m][k] · b[k][n]` for an accumulator-typed `a: M x K` and a
/// row-major `b: K x N`.
pub fn gemm_tile_kn<T, Opb>(
    acc: &mut AccumulationTile<T::Acc>,
    a: &AccumulationTile<T::Acc>,
    b: &[T],
    b_op: &Opb,
) where
    T: DataType,
    Opb: ElementwiseOperation<T::Acc>,
{
    let n_cols = acc.cols();
    for m in 0..acc.rows() {
        for k in 0..a.cols() {
            let p = a.get(m, k);
            if p == T::Acc::zero() {
                continue;
            }
            let b_row = &b[k * n_cols..(k + 1) * n_cols];
            for (out, y) in acc.row_mut(m).iter_mut().zip(b_row) {
                *out += p * b_op.apply(y.to_acc());
            }
        }
    }
}

/// `acc[n][o] += Σ_m a[m][n] · b[m][o]` for an accumulator-typed `a: M x N` and a
/// row-major `b: M x O`.
pub fn gemm_tile_tn<T, Opb>(
    acc: &mut AccumulationTile<T::Acc>,
    a: &AccumulationTile<T::Acc>,
    b: &[T],
    b_op: &Opb,
) where
    T: DataType,
    Opb: ElementwiseOperation<T::Acc>,
{
    let o_cols = acc.cols();
    for m in 0..a.rows() {
        let b_row = &b[m * o_cols..(m + 1) * o_cols];
        for n in 0..a.cols() {
            let p = a.get(m, n);
            if p == T::Acc::zero() {
                continue;
            }
            for (out, y) in acc.row_mut(n).iter_mut().zip(b_row) {
                *out += p * b_op.apply(y.to_acc());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::{ElementOp, PassThrough};
    use half::f16;

    #[test]
    fn test_gemm_tile_nk() {
        // a = [[1, 2], [3, 4]], b = [[1, 0], [0, 1], [1, 1]]
        let a = [1.0f32, 2.0, 3.0, 4.0];
        let b = [1.0f32, 0.0, 0.0, 1.0, 1.0, 1.0];
        let mut acc = AccumulationTile::<f64>::new(2, 3);
        gemm_tile_nk(&mut acc, &a, &b, 2, &PassThrough, &PassThrough);
        assert_eq!(acc.as_slice(), &[1.0, 2.0, 3.0, 3.0, 4.0, 7.0]);

        gemm_tile_nk(&mut acc, &a, &b, 2, &ElementOp::Scale(2.0), &PassThrough);
        assert_eq!(acc.row(1), &[9.0, 12.0, 21.0]);
    }

    #[test]
    fn test_gemm_tile_kn() {
        let p = AccumulationTile {
            rows: 1,
            cols: 2,
            data: vec![0.25f32, 0.75],
        };
        let v = [f16::from_f32(4.0), f16::from_f32(8.0), f16::from_f32(0.0), f16::from_f32(4.0)];
        let mut acc = AccumulationTile::<f32>::new(1, 2);
        gemm_tile_kn(&mut acc, &p, &v, &PassThrough);
        assert_eq!(acc.as_slice(), &[1.0, 5.0]);
    }

    #[test]
    fn test_gemm_tile_tn() {
        // a = [[1, 2]] (1 x 2), b = [[3, 4, 5]] (1 x 3)
        let a = AccumulationTile {
            rows: 1,
            cols: 2,
            data: vec![1.0f64, 2.0],
        };
        let b = [3.0f32, 4.0, 5.0];
        let mut acc = AccumulationTile::<f64>::new(2, 3);
        gemm_tile_tn(&mut acc, &a, &b, &PassThrough);
        assert_eq!(acc.as_slice(), &[3.0, 4.0, 5.0, 6.0, 8.0, 10.0]);
    }

    #[test]
    fn test_shuffle_narrows_once() {
        let mut acc = AccumulationTile::<f32>::filled(2, 2, 1.0 / 3.0);
        acc.apply(&ElementOp::Scale(3.0));
        let mut out = [f16::ZERO; 4];
        acc.shuffle_into(&ElementOp::Relu, &mut out);
        assert!(out.iter().all(|v| *v == f16::ONE));
    }
}
