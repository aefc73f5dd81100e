//! Translation between BLAS call arguments and subproblem dimensions,
//! plus block pitch/size helpers used by the LDS capacity checks.

use super::funcs::BlasFunctionID;
use crate::granulation::SubproblemDim;
use crate::types::{fl4_row_width, BlasKargs, DataType, MatrixRole, Side, Transpose,
    FLOAT4_VECLEN};

fn is_right_side(func: BlasFunctionID, side: Side) -> bool {
    func.has_triang_matrix() && side == Side::Right
}

/// Swaps the X and Y extents of a subproblem.
pub fn swap_dim_xy(dim: &mut SubproblemDim) {
    std::mem::swap(&mut dim.item_x, &mut dim.item_y);
    std::mem::swap(&mut dim.x, &mut dim.y);
}

/// Row pitch of a matrix block in elements, padded out to whole float4
/// words.
pub fn matr_block_pitch(
    dim: &SubproblemDim,
    mrole: MatrixRole,
    dtype: DataType,
    side: Side,
) -> usize {
    let tsize = dtype.size();
    let nfloats = tsize / 4;
    let row_len = match mrole {
        MatrixRole::A | MatrixRole::B => dim.bwidth,
        MatrixRole::C => {
            if side == Side::Left {
                dim.x
            } else {
                dim.y
            }
        }
    };

    fl4_row_width(row_len, tsize) * FLOAT4_VECLEN / nfloats
}

pub fn matr_block_height(dim: &SubproblemDim, mrole: MatrixRole, side: Side) -> usize {
    match mrole {
        MatrixRole::A => dim.y,
        MatrixRole::B => dim.x,
        MatrixRole::C => {
            if side == Side::Left {
                dim.y
            } else {
                dim.x
            }
        }
    }
}

/// Size of a matrix block in elements, pitch padding included.
pub fn matr_block_size(
    dim: &SubproblemDim,
    mrole: MatrixRole,
    dtype: DataType,
    side: Side,
) -> u64 {
    let pitch = matr_block_pitch(dim, mrole, dtype, side);
    let height = matr_block_height(dim, mrole, side);
    height as u64 * pitch as u64
}

/// Maps call arguments onto problem dimensions. With `offset` set, the
/// offsets rather than the sizes are mapped.
pub fn kargs_to_prob_dims(
    kargs: &BlasKargs,
    func: BlasFunctionID,
    offset: bool,
) -> SubproblemDim {
    let mut dim = SubproblemDim::default();

    if func == BlasFunctionID::Symv {
        if offset {
            dim.y = kargs.off_cy;
        } else {
            dim.y = kargs.n;
            dim.x = kargs.n;
            dim.bwidth = kargs.k;
        }
        return dim;
    }

    if offset {
        dim.y = kargs.off_a;
        dim.x = kargs.off_bx;
    } else {
        dim.y = kargs.m;
        dim.x = kargs.n;
    }

    if is_right_side(func, kargs.side) {
        swap_dim_xy(&mut dim);
    }
    if func == BlasFunctionID::Gemv {
        if kargs.trans_a != Transpose::NoTrans {
            swap_dim_xy(&mut dim);
        }
        dim.bwidth = if offset { 0 } else { dim.x };
    } else {
        dim.bwidth = if offset { 0 } else { kargs.k };
    }

    dim
}

/// The inverse of [`kargs_to_prob_dims`].
pub fn prob_dims_to_kargs(
    kargs: &mut BlasKargs,
    func: BlasFunctionID,
    prob_dim: &SubproblemDim,
    offset: bool,
) {
    let mut tmp = *prob_dim;

    if is_right_side(func, kargs.side) {
        swap_dim_xy(&mut tmp);
    }
    if func == BlasFunctionID::Gemv && kargs.trans_a != Transpose::NoTrans {
        swap_dim_xy(&mut tmp);
    }

    if offset {
        kargs.off_a = tmp.y;
        kargs.off_bx = tmp.x;
    } else {
        kargs.m = tmp.y;
        kargs.n = tmp.x;
        kargs.k = prob_dim.bwidth;
    }
}
