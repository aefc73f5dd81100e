//! The public BLAS entry points, generic over the element type.
//!
//! Every function validates its arguments per the BLAS contract, fills
//! a [`BlasKargs`] block and hands it to the dispatch pipeline. The
//! returned event completes when the device work does; calls are
//! asynchronous and ordered by the queue and the wait list.

use super::funcs::BlasFunctionID;
use super::validate::{check_buffer, check_matrix, check_vector};
use crate::compute::{Event, Mem, Queue};
use crate::dispatch::make_solution_seq;
use crate::error::Result;
use crate::library::Library;
use crate::types::{BlasKargs, BlasPrm, DataType, Diag, Order, Side, Transpose, Uplo};

/// Stored dimensions of an operand used as op(X) with logical size
/// `rows` x `cols`.
fn op_dims(trans: Transpose, rows: usize, cols: usize) -> (usize, usize) {
    match trans {
        Transpose::NoTrans => (rows, cols),
        _ => (cols, rows),
    }
}

fn scalar_size(dtype: DataType) -> usize {
    if dtype.is_double_based() {
        8
    } else {
        4
    }
}

impl Library {
    /// C = alpha * op(A) * op(B) + beta * C
    #[allow(clippy::too_many_arguments)]
    pub fn gemm<E: BlasPrm>(
        &self,
        order: Order,
        trans_a: Transpose,
        trans_b: Transpose,
        m: usize,
        n: usize,
        k: usize,
        alpha: E,
        a: &Mem,
        off_a: usize,
        lda: usize,
        b: &Mem,
        off_b: usize,
        ldb: usize,
        beta: E,
        c: &Mem,
        off_c: usize,
        ldc: usize,
        queues: &[Queue],
        event_wait_list: &[Event],
    ) -> Result<Event> {
        let dtype = E::DTYPE;
        let (ar, ac) = op_dims(trans_a, m, k);
        check_matrix("A", dtype, order, ar, ac, a, off_a, lda)?;
        let (br, bc) = op_dims(trans_b, k, n);
        check_matrix("B", dtype, order, br, bc, b, off_b, ldb)?;
        check_matrix("C", dtype, order, m, n, c, off_c, ldc)?;

        let mut kargs = BlasKargs::new(dtype);
        kargs.order = order;
        kargs.trans_a = trans_a;
        kargs.trans_b = trans_b;
        kargs.m = m;
        kargs.n = n;
        kargs.k = k;
        kargs.alpha = alpha.to_multiplier();
        kargs.beta = beta.to_multiplier();
        kargs.a = Some(a.clone());
        kargs.b = Some(b.clone());
        kargs.c = Some(c.clone());
        kargs.lda = lda;
        kargs.ldb = ldb;
        kargs.ldc = ldc;
        kargs.off_a = off_a;
        kargs.off_bx = off_b;
        kargs.off_cy = off_c;

        make_solution_seq(self, BlasFunctionID::Gemm, kargs, queues, event_wait_list)
    }

    /// B = alpha * op(A) * B (left) or alpha * B * op(A) (right), A
    /// triangular.
    #[allow(clippy::too_many_arguments)]
    pub fn trmm<E: BlasPrm>(
        &self,
        order: Order,
        side: Side,
        uplo: Uplo,
        trans_a: Transpose,
        diag: Diag,
        m: usize,
        n: usize,
        alpha: E,
        a: &Mem,
        off_a: usize,
        lda: usize,
        b: &Mem,
        off_b: usize,
        ldb: usize,
        queues: &[Queue],
        event_wait_list: &[Event],
    ) -> Result<Event> {
        self.trxm::<E>(
            BlasFunctionID::Trmm,
            order, side, uplo, trans_a, diag, m, n, alpha, a, off_a, lda, b, off_b, ldb,
            queues, event_wait_list,
        )
    }

    /// Solves op(A) * X = alpha * B (left) or X * op(A) = alpha * B
    /// (right) in place of B, A triangular.
    #[allow(clippy::too_many_arguments)]
    pub fn trsm<E: BlasPrm>(
        &self,
        order: Order,
        side: Side,
        uplo: Uplo,
        trans_a: Transpose,
        diag: Diag,
        m: usize,
        n: usize,
        alpha: E,
        a: &Mem,
        off_a: usize,
        lda: usize,
        b: &Mem,
        off_b: usize,
        ldb: usize,
        queues: &[Queue],
        event_wait_list: &[Event],
    ) -> Result<Event> {
        self.trxm::<E>(
            BlasFunctionID::Trsm,
            order, side, uplo, trans_a, diag, m, n, alpha, a, off_a, lda, b, off_b, ldb,
            queues, event_wait_list,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn trxm<E: BlasPrm>(
        &self,
        func: BlasFunctionID,
        order: Order,
        side: Side,
        uplo: Uplo,
        trans_a: Transpose,
        diag: Diag,
        m: usize,
        n: usize,
        alpha: E,
        a: &Mem,
        off_a: usize,
        lda: usize,
        b: &Mem,
        off_b: usize,
        ldb: usize,
        queues: &[Queue],
        event_wait_list: &[Event],
    ) -> Result<Event> {
        let dtype = E::DTYPE;
        let tri = match side {
            Side::Left => m,
            Side::Right => n,
        };
        check_matrix("A", dtype, order, tri, tri, a, off_a, lda)?;
        check_matrix("B", dtype, order, m, n, b, off_b, ldb)?;

        let mut kargs = BlasKargs::new(dtype);
        kargs.order = order;
        kargs.side = side;
        kargs.uplo = uplo;
        kargs.trans_a = trans_a;
        kargs.diag = diag;
        kargs.m = m;
        kargs.n = n;
        kargs.alpha = alpha.to_multiplier();
        kargs.a = Some(a.clone());
        kargs.b = Some(b.clone());
        kargs.lda = lda;
        kargs.ldb = ldb;
        kargs.off_a = off_a;
        kargs.off_bx = off_b;

        make_solution_seq(self, func, kargs, queues, event_wait_list)
    }

    /// C = alpha * op(A) * op(A)^T + beta * C, C symmetric.
    #[allow(clippy::too_many_arguments)]
    pub fn syrk<E: BlasPrm>(
        &self,
        order: Order,
        uplo: Uplo,
        trans: Transpose,
        n: usize,
        k: usize,
        alpha: E,
        a: &Mem,
        off_a: usize,
        lda: usize,
        beta: E,
        c: &Mem,
        off_c: usize,
        ldc: usize,
        queues: &[Queue],
        event_wait_list: &[Event],
    ) -> Result<Event> {
        let dtype = E::DTYPE;
        let (ar, ac) = op_dims(trans, n, k);
        check_matrix("A", dtype, order, ar, ac, a, off_a, lda)?;
        check_matrix("C", dtype, order, n, n, c, off_c, ldc)?;

        let mut kargs = BlasKargs::new(dtype);
        kargs.order = order;
        kargs.uplo = uplo;
        kargs.trans_a = trans;
        kargs.n = n;
        kargs.k = k;
        kargs.alpha = alpha.to_multiplier();
        kargs.beta = beta.to_multiplier();
        kargs.a = Some(a.clone());
        kargs.c = Some(c.clone());
        kargs.lda = lda;
        kargs.ldc = ldc;
        kargs.off_a = off_a;
        kargs.off_cy = off_c;

        make_solution_seq(self, BlasFunctionID::Syrk, kargs, queues, event_wait_list)
    }

    /// C = alpha * (op(A) * op(B)^T + op(B) * op(A)^T) + beta * C.
    #[allow(clippy::too_many_arguments)]
    pub fn syr2k<E: BlasPrm>(
        &self,
        order: Order,
        uplo: Uplo,
        trans: Transpose,
        n: usize,
        k: usize,
        alpha: E,
        a: &Mem,
        off_a: usize,
        lda: usize,
        b: &Mem,
        off_b: usize,
        ldb: usize,
        beta: E,
        c: &Mem,
        off_c: usize,
        ldc: usize,
        queues: &[Queue],
        event_wait_list: &[Event],
    ) -> Result<Event> {
        let dtype = E::DTYPE;
        let (ar, ac) = op_dims(trans, n, k);
        check_matrix("A", dtype, order, ar, ac, a, off_a, lda)?;
        check_matrix("B", dtype, order, ar, ac, b, off_b, ldb)?;
        check_matrix("C", dtype, order, n, n, c, off_c, ldc)?;

        let mut kargs = BlasKargs::new(dtype);
        kargs.order = order;
        kargs.uplo = uplo;
        kargs.trans_a = trans;
        kargs.n = n;
        kargs.k = k;
        kargs.alpha = alpha.to_multiplier();
        kargs.beta = beta.to_multiplier();
        kargs.a = Some(a.clone());
        kargs.b = Some(b.clone());
        kargs.c = Some(c.clone());
        kargs.lda = lda;
        kargs.ldb = ldb;
        kargs.ldc = ldc;
        kargs.off_a = off_a;
        kargs.off_bx = off_b;
        kargs.off_cy = off_c;

        make_solution_seq(self, BlasFunctionID::Syr2k, kargs, queues, event_wait_list)
    }

    /// y = alpha * op(A) * x + beta * y.
    #[allow(clippy::too_many_arguments)]
    pub fn gemv<E: BlasPrm>(
        &self,
        order: Order,
        trans: Transpose,
        m: usize,
        n: usize,
        alpha: E,
        a: &Mem,
        off_a: usize,
        lda: usize,
        x: &Mem,
        off_x: usize,
        incx: isize,
        beta: E,
        y: &Mem,
        off_y: usize,
        incy: isize,
        queues: &[Queue],
        event_wait_list: &[Event],
    ) -> Result<Event> {
        let dtype = E::DTYPE;
        check_matrix("A", dtype, order, m, n, a, off_a, lda)?;
        let (x_len, y_len) = match trans {
            Transpose::NoTrans => (n, m),
            _ => (m, n),
        };
        check_vector("x", dtype, x_len, x, off_x, incx)?;
        check_vector("y", dtype, y_len, y, off_y, incy)?;

        let mut kargs = BlasKargs::new(dtype);
        kargs.order = order;
        kargs.trans_a = trans;
        kargs.m = m;
        kargs.n = n;
        kargs.alpha = alpha.to_multiplier();
        kargs.beta = beta.to_multiplier();
        kargs.a = Some(a.clone());
        kargs.b = Some(x.clone());
        kargs.c = Some(y.clone());
        kargs.lda = lda;
        kargs.incx = incx;
        kargs.incy = incy;
        kargs.off_a = off_a;
        kargs.off_bx = off_x;
        kargs.off_cy = off_y;

        make_solution_seq(self, BlasFunctionID::Gemv, kargs, queues, event_wait_list)
    }

    /// y = alpha * A * x + beta * y, A symmetric with one stored
    /// triangle.
    #[allow(clippy::too_many_arguments)]
    pub fn symv<E: BlasPrm>(
        &self,
        order: Order,
        uplo: Uplo,
        n: usize,
        alpha: E,
        a: &Mem,
        off_a: usize,
        lda: usize,
        x: &Mem,
        off_x: usize,
        incx: isize,
        beta: E,
        y: &Mem,
        off_y: usize,
        incy: isize,
        queues: &[Queue],
        event_wait_list: &[Event],
    ) -> Result<Event> {
        let dtype = E::DTYPE;
        check_matrix("A", dtype, order, n, n, a, off_a, lda)?;
        check_vector("x", dtype, n, x, off_x, incx)?;
        check_vector("y", dtype, n, y, off_y, incy)?;

        let mut kargs = BlasKargs::new(dtype);
        kargs.order = order;
        kargs.uplo = uplo;
        kargs.n = n;
        kargs.alpha = alpha.to_multiplier();
        kargs.beta = beta.to_multiplier();
        kargs.a = Some(a.clone());
        kargs.b = Some(x.clone());
        kargs.c = Some(y.clone());
        kargs.lda = lda;
        kargs.incx = incx;
        kargs.incy = incy;
        kargs.off_a = off_a;
        kargs.off_bx = off_x;
        kargs.off_cy = off_y;

        make_solution_seq(self, BlasFunctionID::Symv, kargs, queues, event_wait_list)
    }

    /// Exchanges x and y.
    #[allow(clippy::too_many_arguments)]
    pub fn swap<E: BlasPrm>(
        &self,
        n: usize,
        x: &Mem,
        off_x: usize,
        incx: isize,
        y: &Mem,
        off_y: usize,
        incy: isize,
        queues: &[Queue],
        event_wait_list: &[Event],
    ) -> Result<Event> {
        let dtype = E::DTYPE;
        check_vector("x", dtype, n, x, off_x, incx)?;
        check_vector("y", dtype, n, y, off_y, incy)?;

        let mut kargs = BlasKargs::new(dtype);
        kargs.n = n;
        kargs.b = Some(x.clone());
        kargs.c = Some(y.clone());
        kargs.incx = incx;
        kargs.incy = incy;
        kargs.off_bx = off_x;
        kargs.off_cy = off_y;

        make_solution_seq(self, BlasFunctionID::Swap, kargs, queues, event_wait_list)
    }

    /// x = alpha * x.
    #[allow(clippy::too_many_arguments)]
    pub fn scal<E: BlasPrm>(
        &self,
        n: usize,
        alpha: E,
        x: &Mem,
        off_x: usize,
        incx: isize,
        queues: &[Queue],
        event_wait_list: &[Event],
    ) -> Result<Event> {
        let dtype = E::DTYPE;
        check_vector("x", dtype, n, x, off_x, incx)?;

        let mut kargs = BlasKargs::new(dtype);
        kargs.n = n;
        kargs.alpha = alpha.to_multiplier();
        kargs.b = Some(x.clone());
        kargs.incx = incx;
        kargs.off_bx = off_x;

        make_solution_seq(self, BlasFunctionID::Scal, kargs, queues, event_wait_list)
    }

    /// y = x.
    #[allow(clippy::too_many_arguments)]
    pub fn copy<E: BlasPrm>(
        &self,
        n: usize,
        x: &Mem,
        off_x: usize,
        incx: isize,
        y: &Mem,
        off_y: usize,
        incy: isize,
        queues: &[Queue],
        event_wait_list: &[Event],
    ) -> Result<Event> {
        let dtype = E::DTYPE;
        check_vector("x", dtype, n, x, off_x, incx)?;
        check_vector("y", dtype, n, y, off_y, incy)?;

        let mut kargs = BlasKargs::new(dtype);
        kargs.n = n;
        kargs.b = Some(x.clone());
        kargs.c = Some(y.clone());
        kargs.incx = incx;
        kargs.incy = incy;
        kargs.off_bx = off_x;
        kargs.off_cy = off_y;

        make_solution_seq(self, BlasFunctionID::Copy, kargs, queues, event_wait_list)
    }

    /// y = alpha * x + y.
    #[allow(clippy::too_many_arguments)]
    pub fn axpy<E: BlasPrm>(
        &self,
        n: usize,
        alpha: E,
        x: &Mem,
        off_x: usize,
        incx: isize,
        y: &Mem,
        off_y: usize,
        incy: isize,
        queues: &[Queue],
        event_wait_list: &[Event],
    ) -> Result<Event> {
        let dtype = E::DTYPE;
        check_vector("x", dtype, n, x, off_x, incx)?;
        check_vector("y", dtype, n, y, off_y, incy)?;

        let mut kargs = BlasKargs::new(dtype);
        kargs.n = n;
        kargs.alpha = alpha.to_multiplier();
        kargs.b = Some(x.clone());
        kargs.c = Some(y.clone());
        kargs.incx = incx;
        kargs.incy = incy;
        kargs.off_bx = off_x;
        kargs.off_cy = off_y;

        make_solution_seq(self, BlasFunctionID::Axpy, kargs, queues, event_wait_list)
    }

    /// dotProduct = x . y, conjugating x on request (the `dotc`
    /// flavor for complex elements).
    #[allow(clippy::too_many_arguments)]
    pub fn dot<E: BlasPrm>(
        &self,
        n: usize,
        dot_product: &Mem,
        off_dp: usize,
        x: &Mem,
        off_x: usize,
        incx: isize,
        y: &Mem,
        off_y: usize,
        incy: isize,
        conjugate: bool,
        queues: &[Queue],
        event_wait_list: &[Event],
    ) -> Result<Event> {
        let dtype = E::DTYPE;
        check_vector("x", dtype, n, x, off_x, incx)?;
        check_vector("y", dtype, n, y, off_y, incy)?;
        check_buffer("dotProduct", dtype.size(), 1, dot_product, off_dp)?;

        let mut kargs = BlasKargs::new(dtype);
        kargs.n = n;
        kargs.a = Some(dot_product.clone());
        kargs.b = Some(x.clone());
        kargs.c = Some(y.clone());
        kargs.incx = incx;
        kargs.incy = incy;
        kargs.off_a = off_dp;
        kargs.off_bx = off_x;
        kargs.off_cy = off_y;
        kargs.conj_x = conjugate && dtype.is_complex();

        make_solution_seq(self, BlasFunctionID::Dot, kargs, queues, event_wait_list)
    }

    /// result = ||x||_2.
    #[allow(clippy::too_many_arguments)]
    pub fn nrm2<E: BlasPrm>(
        &self,
        n: usize,
        result: &Mem,
        off_r: usize,
        x: &Mem,
        off_x: usize,
        incx: isize,
        queues: &[Queue],
        event_wait_list: &[Event],
    ) -> Result<Event> {
        self.scalar_reduction::<E>(BlasFunctionID::Nrm2, n, result, off_r,
            scalar_size(E::DTYPE), x, off_x, incx, queues, event_wait_list)
    }

    /// result = sum(|x_i|) (for complex elements, |re| + |im|).
    #[allow(clippy::too_many_arguments)]
    pub fn asum<E: BlasPrm>(
        &self,
        n: usize,
        result: &Mem,
        off_r: usize,
        x: &Mem,
        off_x: usize,
        incx: isize,
        queues: &[Queue],
        event_wait_list: &[Event],
    ) -> Result<Event> {
        self.scalar_reduction::<E>(BlasFunctionID::Asum, n, result, off_r,
            scalar_size(E::DTYPE), x, off_x, incx, queues, event_wait_list)
    }

    /// result = 1-based index of the element with the largest absolute
    /// value.
    #[allow(clippy::too_many_arguments)]
    pub fn iamax<E: BlasPrm>(
        &self,
        n: usize,
        result: &Mem,
        off_r: usize,
        x: &Mem,
        off_x: usize,
        incx: isize,
        queues: &[Queue],
        event_wait_list: &[Event],
    ) -> Result<Event> {
        self.scalar_reduction::<E>(BlasFunctionID::Iamax, n, result, off_r,
            DataType::UnsignedInt.size(), x, off_x, incx, queues, event_wait_list)
    }

    #[allow(clippy::too_many_arguments)]
    fn scalar_reduction<E: BlasPrm>(
        &self,
        func: BlasFunctionID,
        n: usize,
        result: &Mem,
        off_r: usize,
        result_size: usize,
        x: &Mem,
        off_x: usize,
        incx: isize,
        queues: &[Queue],
        event_wait_list: &[Event],
    ) -> Result<Event> {
        let dtype = E::DTYPE;
        check_vector("x", dtype, n, x, off_x, incx)?;
        check_buffer("result", result_size, 1, result, off_r)?;

        let mut kargs = BlasKargs::new(dtype);
        kargs.n = n;
        kargs.a = Some(result.clone());
        kargs.b = Some(x.clone());
        kargs.incx = incx;
        kargs.off_a = off_r;
        kargs.off_bx = off_x;

        make_solution_seq(self, func, kargs, queues, event_wait_list)
    }
}
