//! Parameter validation per the BLAS contract. All checks run before
//! any device work is started.

use crate::compute::Mem;
use crate::error::{Error, Result};
use crate::types::{DataType, Order};

/// Validates a stored `rows` x `cols` matrix operand: positive
/// dimensions, a leading dimension covering the contiguous extent, and
/// an offset region within the buffer.
pub fn check_matrix(
    name: &'static str,
    dtype: DataType,
    order: Order,
    rows: usize,
    cols: usize,
    mem: &Mem,
    offset: usize,
    ld: usize,
) -> Result<()> {
    if rows == 0 || cols == 0 {
        return Err(Error::InvalidValue(name));
    }

    let min_ld = match order {
        Order::RowMajor => cols,
        Order::ColumnMajor => rows,
    };
    if ld < min_ld {
        return Err(Error::InvalidLeadingDim { name, ld, min: min_ld });
    }

    let span = match order {
        Order::RowMajor => (rows - 1) * ld + cols,
        Order::ColumnMajor => (cols - 1) * ld + rows,
    };
    let buf_len = mem.len() / dtype.size();
    if offset + span > buf_len {
        return Err(Error::InvalidOffset { name, offset, len: span, buf_len });
    }

    Ok(())
}

/// Validates a strided vector operand of `n` elements.
pub fn check_vector(
    name: &'static str,
    dtype: DataType,
    n: usize,
    mem: &Mem,
    offset: usize,
    inc: isize,
) -> Result<()> {
    if n == 0 {
        return Err(Error::InvalidValue(name));
    }
    if inc == 0 {
        return Err(Error::InvalidIncrement(name));
    }

    let span = (n - 1) * inc.unsigned_abs() + 1;
    let buf_len = mem.len() / dtype.size();
    if offset + span > buf_len {
        return Err(Error::InvalidOffset { name, offset, len: span, buf_len });
    }

    Ok(())
}

/// Validates a plain output buffer of `n` elements at `offset`.
pub fn check_buffer(
    name: &'static str,
    elem_size: usize,
    n: usize,
    mem: &Mem,
    offset: usize,
) -> Result<()> {
    let buf_len = mem.len() / elem_size;
    if offset + n > buf_len {
        return Err(Error::InvalidOffset { name, offset, len: n, buf_len });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::MemApi;
    use std::sync::Arc;

    #[derive(Debug)]
    struct StubMem(usize);

    impl MemApi for StubMem {
        fn len(&self) -> usize {
            self.0
        }
    }

    fn mem(bytes: usize) -> Mem {
        Mem::new(Arc::new(StubMem(bytes)))
    }

    #[test]
    fn leading_dim_depends_on_order() {
        let buf = mem(64 * 64 * 4);
        assert!(check_matrix("A", DataType::Float, Order::RowMajor, 64, 32, &buf, 0, 32)
            .is_ok());
        assert!(matches!(
            check_matrix("A", DataType::Float, Order::RowMajor, 64, 32, &buf, 0, 31),
            Err(Error::InvalidLeadingDim { min: 32, .. })
        ));
        assert!(matches!(
            check_matrix("A", DataType::Float, Order::ColumnMajor, 64, 32, &buf, 0, 32),
            Err(Error::InvalidLeadingDim { min: 64, .. })
        ));
    }

    #[test]
    fn offsets_are_bounded() {
        let buf = mem(16 * 16 * 4);
        assert!(check_matrix("A", DataType::Float, Order::RowMajor, 16, 16, &buf, 0, 16)
            .is_ok());
        assert!(matches!(
            check_matrix("A", DataType::Float, Order::RowMajor, 16, 16, &buf, 1, 16),
            Err(Error::InvalidOffset { .. })
        ));
    }

    #[test]
    fn zero_dims_are_invalid() {
        let buf = mem(1024);
        assert!(matches!(
            check_matrix("A", DataType::Float, Order::RowMajor, 0, 4, &buf, 0, 4),
            Err(Error::InvalidValue("A"))
        ));
    }

    #[test]
    fn vector_increments() {
        let buf = mem(100 * 4);
        assert!(check_vector("x", DataType::Float, 50, &buf, 0, 2).is_ok());
        assert!(check_vector("x", DataType::Float, 50, &buf, 0, -2).is_ok());
        assert!(matches!(
            check_vector("x", DataType::Float, 50, &buf, 0, 0),
            Err(Error::InvalidIncrement("x"))
        ));
        assert!(matches!(
            check_vector("x", DataType::Float, 51, &buf, 0, 2),
            Err(Error::InvalidOffset { .. })
        ));
    }

    #[test]
    fn double_elements_halve_capacity() {
        let buf = mem(100 * 4);
        assert!(matches!(
            check_vector("x", DataType::Double, 51, &buf, 0, 1),
            Err(Error::InvalidOffset { .. })
        ));
    }
}
