//! Element types, BLAS call conventions and the argument block passed
//! through the dispatch pipeline.

use std::fmt;

use num_complex::Complex;
use num_traits::Num;

use crate::compute::Mem;

/// Complex number type compatible with a kernel-side `float2`.
pub type FloatComplex = Complex<f32>;
/// Complex number type compatible with a kernel-side `double2`.
pub type DoubleComplex = Complex<f64>;

pub const FLOAT4_VECLEN: usize = 4;

/// Logical element types the kernels are generated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Float,
    Double,
    ComplexFloat,
    ComplexDouble,
    /// Unsigned int, for the output buffer of the iAMAX routine.
    UnsignedInt,
}

impl DataType {
    /// Element width in bytes.
    pub fn size(self) -> usize {
        match self {
            DataType::Float | DataType::UnsignedInt => 4,
            DataType::Double | DataType::ComplexFloat => 8,
            DataType::ComplexDouble => 16,
        }
    }

    /// Base vector width: the number of elements filling a 16-byte
    /// (float4-sized) word, the widest load the generators emit.
    pub fn vec_len(self) -> u32 {
        (16 / self.size()) as u32
    }

    pub fn is_complex(self) -> bool {
        matches!(self, DataType::ComplexFloat | DataType::ComplexDouble)
    }

    /// Whether the type needs native double support on the device.
    pub fn is_double_based(self) -> bool {
        matches!(self, DataType::Double | DataType::ComplexDouble)
    }
}

/// Width of a matrix block row in float4 words.
pub fn fl4_row_width(width: usize, type_size: usize) -> usize {
    let bytes = width * type_size;
    (bytes + FLOAT4_VECLEN * 4 - 1) / (FLOAT4_VECLEN * 4)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Order {
    RowMajor,
    ColumnMajor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transpose {
    NoTrans,
    Trans,
    ConjTrans,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Uplo {
    Upper,
    Lower,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Diag {
    Unit,
    NonUnit,
}

/// Distinguishes the operand a helper is asked about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatrixRole {
    A,
    B,
    C,
}

/// A scalar multiplier (alpha or beta) in any of the supported numeric
/// forms.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ArgMultiplier {
    Float(f32),
    Double(f64),
    ComplexFloat(FloatComplex),
    ComplexDouble(DoubleComplex),
}

impl ArgMultiplier {
    pub fn dtype(&self) -> DataType {
        match *self {
            ArgMultiplier::Float(_) => DataType::Float,
            ArgMultiplier::Double(_) => DataType::Double,
            ArgMultiplier::ComplexFloat(_) => DataType::ComplexFloat,
            ArgMultiplier::ComplexDouble(_) => DataType::ComplexDouble,
        }
    }

    /// Little-endian byte image as passed to the kernel; `len` matches
    /// the element width of the corresponding [`DataType`].
    pub fn to_bytes(&self) -> ([u8; 16], usize) {
        let mut buf = [0u8; 16];
        let len;
        match *self {
            ArgMultiplier::Float(v) => {
                buf[..4].copy_from_slice(&v.to_le_bytes());
                len = 4;
            }
            ArgMultiplier::Double(v) => {
                buf[..8].copy_from_slice(&v.to_le_bytes());
                len = 8;
            }
            ArgMultiplier::ComplexFloat(v) => {
                buf[..4].copy_from_slice(&v.re.to_le_bytes());
                buf[4..8].copy_from_slice(&v.im.to_le_bytes());
                len = 8;
            }
            ArgMultiplier::ComplexDouble(v) => {
                buf[..8].copy_from_slice(&v.re.to_le_bytes());
                buf[8..16].copy_from_slice(&v.im.to_le_bytes());
                len = 16;
            }
        }
        (buf, len)
    }

    /// True when this multiplier equals zero, used to gate `BETA_ZERO`
    /// kernel flavors.
    pub fn is_zero(&self) -> bool {
        match *self {
            ArgMultiplier::Float(v) => v == 0.0,
            ArgMultiplier::Double(v) => v == 0.0,
            ArgMultiplier::ComplexFloat(v) => v == FloatComplex::new(0.0, 0.0),
            ArgMultiplier::ComplexDouble(v) => v == DoubleComplex::new(0.0, 0.0),
        }
    }
}

/// An element type usable with the generic BLAS entry points.
pub trait BlasPrm:
    Num + Copy + Clone + Default + PartialEq + fmt::Debug + Send + Sync + 'static
{
    const DTYPE: DataType;

    fn to_multiplier(self) -> ArgMultiplier;
}

impl BlasPrm for f32 {
    const DTYPE: DataType = DataType::Float;

    fn to_multiplier(self) -> ArgMultiplier {
        ArgMultiplier::Float(self)
    }
}

impl BlasPrm for f64 {
    const DTYPE: DataType = DataType::Double;

    fn to_multiplier(self) -> ArgMultiplier {
        ArgMultiplier::Double(self)
    }
}

impl BlasPrm for FloatComplex {
    const DTYPE: DataType = DataType::ComplexFloat;

    fn to_multiplier(self) -> ArgMultiplier {
        ArgMultiplier::ComplexFloat(self)
    }
}

impl BlasPrm for DoubleComplex {
    const DTYPE: DataType = DataType::ComplexDouble;

    fn to_multiplier(self) -> ArgMultiplier {
        ArgMultiplier::ComplexDouble(self)
    }
}

/// The full argument block of a BLAS call as it travels through pattern
/// selection, kernel generation and argument assignment.
///
/// Fields which a given function does not use stay at their defaults.
/// Solvers must not mutate the API-visible values outside `fixup_args`.
#[derive(Debug, Clone)]
pub struct BlasKargs {
    pub dtype: DataType,
    pub order: Order,
    pub side: Side,
    pub uplo: Uplo,
    pub trans_a: Transpose,
    pub trans_b: Transpose,
    pub diag: Diag,
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub kl: usize,
    pub ku: usize,
    pub alpha: ArgMultiplier,
    pub beta: ArgMultiplier,
    pub a: Option<Mem>,
    pub b: Option<Mem>,
    pub c: Option<Mem>,
    pub lda: usize,
    pub ldb: usize,
    pub ldc: usize,
    pub incx: isize,
    pub incy: isize,
    pub off_a: usize,
    pub off_bx: usize,
    pub off_cy: usize,
    /// Conjugate the X operand (the `dotc` flavor).
    pub conj_x: bool,
    /// Scratch image claimed for this call, if the pattern packs
    /// operands into an image.
    pub scimage: Option<Mem>,
    /// Address width of the target device, for kernels caring about
    /// 32/64-bit size arithmetic.
    pub addr_bits: u32,
}

impl BlasKargs {
    pub fn new(dtype: DataType) -> BlasKargs {
        let zero = match dtype {
            DataType::Float | DataType::UnsignedInt => ArgMultiplier::Float(0.0),
            DataType::Double => ArgMultiplier::Double(0.0),
            DataType::ComplexFloat => ArgMultiplier::ComplexFloat(FloatComplex::new(0.0, 0.0)),
            DataType::ComplexDouble => {
                ArgMultiplier::ComplexDouble(DoubleComplex::new(0.0, 0.0))
            }
        };

        BlasKargs {
            dtype,
            order: Order::ColumnMajor,
            side: Side::Left,
            uplo: Uplo::Upper,
            trans_a: Transpose::NoTrans,
            trans_b: Transpose::NoTrans,
            diag: Diag::NonUnit,
            m: 0,
            n: 0,
            k: 0,
            kl: 0,
            ku: 0,
            alpha: zero,
            beta: zero,
            a: None,
            b: None,
            c: None,
            lda: 0,
            ldb: 0,
            ldc: 0,
            incx: 0,
            incy: 0,
            off_a: 0,
            off_bx: 0,
            off_cy: 0,
            conj_x: false,
            scimage: None,
            addr_bits: 32,
        }
    }
}
