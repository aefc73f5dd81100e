//! The kernel-source template engine.
//!
//! A template is ordinary kernel text with `%`-prefixed keys. Simple keys
//! substitute recorded text; function-like keys (`%MUL(c, a, b)`) expand
//! to type-aware statements. The engine knows the element type, its
//! effective vector width and the derived narrower types, so one template
//! serves every precision.
//!
//! Kernel writers use `%TYPE` and `%TYPE%V` for arguments and locals;
//! when loading through `%VLOAD` the pointer is cast to `%PTYPE *`
//! because vector loads impose the base-scalar pointer form.
//!
//! Unknown keys expand to nothing; the resulting source then fails to
//! compile and the build log is surfaced by the program builder.

use std::cell::Cell;

use super::{KgenError, Result};
use crate::types::DataType;

/// Work-group reduction flavors of the reduction framework.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReductionType {
    Sum,
    Max,
    Min,
    Hypot,
    Ssq,
}

impl ReductionType {
    /// The template key (without the leading `%`) selecting this flavor.
    pub fn key(self) -> &'static str {
        match self {
            ReductionType::Sum => "REDUCTION_BY_SUM",
            ReductionType::Max => "REDUCTION_BY_MAX",
            ReductionType::Min => "REDUCTION_BY_MIN",
            ReductionType::Hypot => "REDUCTION_BY_HYPOT",
            ReductionType::Ssq => "REDUCTION_BY_SSQ",
        }
    }

    fn combine(self, a: &str, b: &str) -> String {
        match self {
            ReductionType::Sum | ReductionType::Ssq => format!("{} + {}", a, b),
            ReductionType::Max => format!("fmax({}, {})", a, b),
            ReductionType::Min => format!("fmin({}, {})", a, b),
            ReductionType::Hypot => format!("hypot({}, {})", a, b),
        }
    }
}

const REDUCTIONS: [ReductionType; 5] = [
    ReductionType::Sum,
    ReductionType::Max,
    ReductionType::Min,
    ReductionType::Hypot,
    ReductionType::Ssq,
];

#[derive(Debug)]
pub struct TemplateEngine {
    dtype: DataType,
    /// Effective element vector width; complex elements are not
    /// vectorized further, their two base lanes are the vector.
    vec: u32,
    vload: bool,
    vstore: bool,
    wg_size: u32,
    wf_size: u32,
    subs: Vec<(String, String)>,
    used_mul: Cell<bool>,
    used_div: Cell<bool>,
}

impl TemplateEngine {
    pub fn new(
        dtype: DataType,
        vec_width: u32,
        vload: bool,
        vstore: bool,
        wg_size: u32,
        wf_size: u32,
    ) -> TemplateEngine {
        let vec = if dtype.is_complex() { 1 } else { vec_width.max(1) };

        let mut engine = TemplateEngine {
            dtype,
            vec,
            vload,
            vstore,
            wg_size: wg_size.max(1),
            wf_size: wf_size.max(1),
            subs: Vec::with_capacity(16),
            used_mul: Cell::new(false),
            used_div: Cell::new(false),
        };
        engine.register_types();
        engine
    }

    /// Records a textual substitution for `key` (with or without the
    /// leading `%`). Later entries shadow earlier ones.
    pub fn put(&mut self, key: &str, value: &str) {
        let key = key.trim_start_matches('%');
        if let Some(entry) = self.subs.iter_mut().find(|(k, _)| k == key) {
            entry.1 = value.to_string();
        } else {
            self.subs.push((key.to_string(), value.to_string()));
        }
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    /// Effective element vector width.
    pub fn vec_width(&self) -> u32 {
        self.vec
    }

    fn register_types(&mut self) {
        let base = scalar_base(self.dtype);
        let lanes = self.base_lanes();

        self.put("TYPE", &element_name(self.dtype));
        self.put("V", &vec_suffix(self.vec));
        self.put("PTYPE", base);
        self.put("HALFWORD", &base_vec_name(base, (lanes / 2).max(1)));
        self.put("QUARTERWORD", &base_vec_name(base, (lanes / 4).max(1)));
        self.put("HALFQUARTERWORD", &base_vec_name(base, (lanes / 8).max(1)));
    }

    /// Total base-scalar lanes of the working vector type.
    fn base_lanes(&self) -> u32 {
        if self.dtype.is_complex() {
            2 * self.vec
        } else {
            self.vec
        }
    }

    fn element(&self) -> String {
        element_name(self.dtype)
    }

    fn vec_type(&self) -> String {
        format!("{}{}", self.element(), vec_suffix(self.vec))
    }

    fn zero_literal(&self) -> &'static str {
        if self.dtype.is_double_based() {
            "0.0"
        } else {
            "0.0f"
        }
    }

    fn mul_helper(&self) -> &'static str {
        if self.dtype == DataType::ComplexDouble {
            "mulComplexD"
        } else {
            "mulComplexF"
        }
    }

    fn div_helper(&self) -> &'static str {
        if self.dtype == DataType::ComplexDouble {
            "divComplexD"
        } else {
            "divComplexF"
        }
    }

    /// Definitions of the complex `mul`/`div` helper functions referenced
    /// by the last expansion, to be prepended to the program source.
    pub fn helper_preamble(&self) -> String {
        if !self.dtype.is_complex() {
            return String::new();
        }

        let ty = self.element();
        let base = scalar_base(self.dtype);
        let mut out = String::new();

        if self.used_mul.get() {
            out.push_str(&format!(
                "{ty} {name}({ty} a, {ty} b)\n\
                 {{\n\
                 \x20   return ({ty})(a.x * b.x - a.y * b.y, a.x * b.y + a.y * b.x);\n\
                 }}\n\n",
                ty = ty,
                name = self.mul_helper(),
            ));
        }
        if self.used_div.get() {
            out.push_str(&format!(
                "{ty} {name}({ty} a, {ty} b)\n\
                 {{\n\
                 \x20   {base} denom = b.x * b.x + b.y * b.y;\n\
                 \x20   return ({ty})((a.x * b.x + a.y * b.y) / denom,\n\
                 \x20                 (a.y * b.x - a.x * b.y) / denom);\n\
                 }}\n\n",
                ty = ty,
                base = base,
                name = self.div_helper(),
            ));
        }
        out
    }

    /// Expands `src`, resolving every recorded and built-in key.
    pub fn expand(&self, src: &str) -> Result<String> {
        let mut out = String::with_capacity(src.len() * 2);
        let bytes = src.as_bytes();
        let mut i = 0;

        while i < bytes.len() {
            if bytes[i] != b'%' {
                let start = i;
                while i < bytes.len() && bytes[i] != b'%' {
                    i += 1;
                }
                out.push_str(&src[start..i]);
                continue;
            }

            let rest = &src[i + 1..];

            // Function-like keys first; longest name wins.
            if let Some((name, consumed, args)) = self.match_operator(rest)? {
                out.push_str(&self.expand_operator(name, &args)?);
                i += 1 + consumed;
                continue;
            }

            if let Some((klen, value)) = self.match_simple(rest) {
                out.push_str(&value);
                i += 1 + klen;
                continue;
            }

            // Unknown key: swallow the identifier, substitute nothing.
            let id_len = ident_len(rest);
            if id_len == 0 {
                out.push('%');
                i += 1;
            } else {
                i += 1 + id_len;
            }
        }

        Ok(out)
    }

    /// Longest recorded simple key matching the head of `rest`.
    fn match_simple(&self, rest: &str) -> Option<(usize, String)> {
        let mut best: Option<&(String, String)> = None;
        for entry in &self.subs {
            if rest.starts_with(entry.0.as_str())
                && best.map_or(true, |b| entry.0.len() > b.0.len())
            {
                best = Some(entry);
            }
        }
        best.map(|(k, v)| (k.len(), v.clone()))
    }

    /// Matches a function-like key with its parenthesized argument list.
    /// Returns (name, consumed bytes, expanded args).
    fn match_operator<'a>(&self, rest: &'a str)
            -> Result<Option<(&'a str, usize, Vec<String>)>> {
        const OPERATORS: [&str; 18] = [
            "VSTORE_WITH_INCX",
            "VLOAD_WITH_INCX",
            "VMAD_AND_REDUCE",
            "MAD_AND_REDUCE",
            "ALIGNED_VSTORE",
            "ALIGNED_VLOAD",
            "CLEAR_IMAGINARY",
            "COMPLEX_JOIN",
            "CONJUGATE",
            "VSTORE",
            "VLOAD",
            "VMUL",
            "VMAD",
            "VDIV",
            "MUL",
            "MAD",
            "DIV",
            "ADD",
        ];

        let mut name = None;
        for op in OPERATORS.iter() {
            if rest.starts_with(op) && rest[op.len()..].starts_with('(') {
                name = Some(*op);
                break;
            }
        }
        if name.is_none() {
            for red in REDUCTIONS.iter() {
                let key = red.key();
                if rest.starts_with(key) && rest[key.len()..].starts_with('(') {
                    name = Some(key);
                    break;
                }
            }
        }
        if name.is_none() && rest.starts_with("SUB") && rest["SUB".len()..].starts_with('(') {
            name = Some("SUB");
        }

        let name = match name {
            Some(name) => name,
            None => return Ok(None),
        };

        let args_start = name.len() + 1;
        let mut depth = 1usize;
        let mut arg_begin = args_start;
        let mut args = Vec::with_capacity(4);
        let bytes = rest.as_bytes();
        let mut i = args_start;

        while i < bytes.len() {
            match bytes[i] {
                b'(' => depth += 1,
                b')' => {
                    depth -= 1;
                    if depth == 0 {
                        args.push(self.expand(rest[arg_begin..i].trim())?);
                        return Ok(Some((name, i + 1, args)));
                    }
                }
                b',' if depth == 1 => {
                    args.push(self.expand(rest[arg_begin..i].trim())?);
                    arg_begin = i + 1;
                }
                _ => {}
            }
            i += 1;
        }

        Err(KgenError::InvalidArg)
    }

    fn expand_operator(&self, name: &str, args: &[String]) -> Result<String> {
        let complex = self.dtype.is_complex();
        let v = self.vec as usize;

        let expect = |n: usize| -> Result<()> {
            if args.len() == n {
                Ok(())
            } else {
                Err(KgenError::InvalidArg)
            }
        };

        let text = match name {
            "MUL" | "VMUL" => {
                expect(3)?;
                if complex {
                    self.used_mul.set(true);
                    format!("{} = {}({}, {})", args[0], self.mul_helper(), args[1], args[2])
                } else {
                    format!("{} = ({}) * ({})", args[0], args[1], args[2])
                }
            }
            "MAD" | "VMAD" => {
                expect(3)?;
                if complex {
                    self.used_mul.set(true);
                    format!(
                        "{0} = {0} + {1}({2}, {3})",
                        args[0],
                        self.mul_helper(),
                        args[1],
                        args[2]
                    )
                } else {
                    format!("{0} = mad({1}, {2}, {0})", args[0], args[1], args[2])
                }
            }
            "DIV" | "VDIV" => {
                expect(3)?;
                if complex {
                    self.used_div.set(true);
                    format!("{} = {}({}, {})", args[0], self.div_helper(), args[1], args[2])
                } else {
                    format!("{} = ({}) / ({})", args[0], args[1], args[2])
                }
            }
            "ADD" => {
                expect(3)?;
                format!("{} = ({}) + ({})", args[0], args[1], args[2])
            }
            "SUB" => {
                expect(3)?;
                format!("{} = ({}) - ({})", args[0], args[1], args[2])
            }
            "VLOAD" => {
                expect(2)?;
                if self.vload && v > 1 {
                    format!(
                        "{} = vload{}(0, (__global {} *)({}))",
                        args[0],
                        v,
                        scalar_base(self.dtype),
                        args[1]
                    )
                } else {
                    format!("{} = *({})", args[0], args[1])
                }
            }
            "VSTORE" => {
                expect(2)?;
                if self.vstore && v > 1 {
                    format!(
                        "vstore{}({}, 0, (__global {} *)({}))",
                        v,
                        args[1],
                        scalar_base(self.dtype),
                        args[0]
                    )
                } else {
                    format!("*({}) = {}", args[0], args[1])
                }
            }
            "ALIGNED_VLOAD" => {
                expect(2)?;
                format!("{} = *((__global {} *)({}))", args[0], self.vec_type(), args[1])
            }
            "ALIGNED_VSTORE" => {
                expect(2)?;
                format!("*((__global {} *)({})) = {}", self.vec_type(), args[0], args[1])
            }
            "VLOAD_WITH_INCX" => {
                expect(3)?;
                if v > 1 {
                    let lanes = (0..v)
                        .map(|k| match k {
                            0 => format!("({})[0]", args[1]),
                            1 => format!("({})[{}]", args[1], args[2]),
                            _ => format!("({})[{} * ({})]", args[1], k, args[2]),
                        })
                        .collect::<Vec<_>>()
                        .join(", ");
                    format!("{} = ({})({})", args[0], self.vec_type(), lanes)
                } else {
                    format!("{} = *({})", args[0], args[1])
                }
            }
            "VSTORE_WITH_INCX" => {
                expect(3)?;
                if v > 1 {
                    (0..v)
                        .map(|k| {
                            let idx = match k {
                                0 => "0".to_string(),
                                1 => format!("{}", args[2]),
                                _ => format!("{} * ({})", k, args[2]),
                            };
                            format!(
                                "({})[{}] = ({}).s{:x}",
                                args[0], idx, args[1], k
                            )
                        })
                        .collect::<Vec<_>>()
                        .join(";\n")
                } else {
                    format!("*({}) = {}", args[0], args[1])
                }
            }
            "CONJUGATE" => {
                expect(1)?;
                if complex {
                    format!("({0}).y = -({0}).y", args[0])
                } else {
                    String::new()
                }
            }
            "CLEAR_IMAGINARY" => {
                expect(1)?;
                if complex {
                    format!("({}).y = {}", args[0], self.zero_literal())
                } else {
                    String::new()
                }
            }
            "COMPLEX_JOIN" => {
                expect(3)?;
                if complex {
                    format!("{} = ({})(({}), ({}))", args[0], self.element(), args[1], args[2])
                } else {
                    format!("{} = ({})", args[0], args[1])
                }
            }
            "MAD_AND_REDUCE" => {
                expect(3)?;
                self.mad_and_reduce(args, 1)
            }
            "VMAD_AND_REDUCE" => {
                expect(3)?;
                self.mad_and_reduce(args, v)
            }
            key => {
                expect(1)?;
                let red = REDUCTIONS
                    .iter()
                    .find(|r| r.key() == key)
                    .ok_or(KgenError::InvalidArg)?;
                self.reduction_framework(*red, &args[0])
            }
        };

        Ok(text)
    }

    /// Accumulate the lane products of two vectors into a scalar.
    fn mad_and_reduce(&self, args: &[String], v: usize) -> String {
        if self.dtype.is_complex() {
            self.used_mul.set(true);
            return format!(
                "{0} = {0} + {1}({2}, {3})",
                args[0],
                self.mul_helper(),
                args[1],
                args[2]
            );
        }
        if v == 1 {
            return format!("{0} = mad({1}, {2}, {0})", args[0], args[1], args[2]);
        }
        let terms = (0..v)
            .map(|k| format!("({1}).s{0:x} * ({2}).s{0:x}", k, args[1], args[2]))
            .collect::<Vec<_>>()
            .join(" + ");
        format!("{} += {}", args[0], terms)
    }

    /// Emits a work-group-wide tree reduction over `buf`, leaving the
    /// result in `buf[0]`. Strides above the wavefront width need a full
    /// barrier; within a wavefront a local fence keeps lanes coherent.
    fn reduction_framework(&self, red: ReductionType, buf: &str) -> String {
        let wg = self.wg_size;
        let wf = self.wf_size;
        let elem = |idx: &str| format!("({})[{}]", buf, idx);
        let combine = red.combine(
            &elem("get_local_id(0)"),
            &elem("get_local_id(0) + _red"),
        );

        let mut out = String::new();
        out.push_str("barrier(CLK_LOCAL_MEM_FENCE);\n");
        if wg / 2 >= wf {
            out.push_str(&format!(
                "for (uint _red = {}u; _red >= {}u; _red >>= 1) {{\n\
                 \x20   if (get_local_id(0) < _red) {{\n\
                 \x20       ({})[get_local_id(0)] = {};\n\
                 \x20   }}\n\
                 \x20   barrier(CLK_LOCAL_MEM_FENCE);\n\
                 }}\n",
                wg / 2,
                wf,
                buf,
                combine
            ));
        }
        let tail_start = (wg / 2).min(wf / 2).max(if wg >= 2 { 1 } else { 0 });
        if tail_start >= 1 {
            out.push_str(&format!(
                "for (uint _red = {}u; _red > 0u; _red >>= 1) {{\n\
                 \x20   if (get_local_id(0) < _red) {{\n\
                 \x20       ({})[get_local_id(0)] = {};\n\
                 \x20   }}\n\
                 \x20   mem_fence(CLK_LOCAL_MEM_FENCE);\n\
                 }}\n",
                tail_start, buf, combine
            ));
        }
        out
    }
}

fn scalar_base(dtype: DataType) -> &'static str {
    match dtype {
        DataType::Float | DataType::ComplexFloat => "float",
        DataType::Double | DataType::ComplexDouble => "double",
        DataType::UnsignedInt => "uint",
    }
}

fn element_name(dtype: DataType) -> String {
    match dtype {
        DataType::Float => "float".to_string(),
        DataType::Double => "double".to_string(),
        DataType::ComplexFloat => "float2".to_string(),
        DataType::ComplexDouble => "double2".to_string(),
        DataType::UnsignedInt => "uint".to_string(),
    }
}

fn vec_suffix(vec: u32) -> String {
    if vec > 1 {
        vec.to_string()
    } else {
        String::new()
    }
}

fn base_vec_name(base: &str, lanes: u32) -> String {
    format!("{}{}", base, vec_suffix(lanes))
}

fn ident_len(s: &str) -> usize {
    s.bytes()
        .take_while(|b| b.is_ascii_alphanumeric() || *b == b'_')
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_float_types() {
        let eng = TemplateEngine::new(DataType::Float, 4, true, false, 64, 64);
        assert_eq!(eng.expand("%TYPE x;").unwrap(), "float x;");
        assert_eq!(eng.expand("%TYPE%V acc;").unwrap(), "float4 acc;");
        assert_eq!(eng.expand("%HALFWORD h;").unwrap(), "float2 h;");
        assert_eq!(eng.expand("%QUARTERWORD q;").unwrap(), "float q;");
    }

    #[test]
    fn vec_width_one_disables_suffix() {
        let eng = TemplateEngine::new(DataType::Double, 1, false, false, 64, 64);
        assert_eq!(eng.expand("%TYPE%V acc;").unwrap(), "double acc;");
    }

    #[test]
    fn user_keys_substitute() {
        let mut eng = TemplateEngine::new(DataType::Float, 1, false, false, 64, 64);
        eng.put("%NAME", "gemmBlock");
        eng.put("TILE", "8");
        assert_eq!(
            eng.expand("__kernel void %NAME(void) { /* %TILE */ }").unwrap(),
            "__kernel void gemmBlock(void) { /* 8 */ }"
        );
    }

    #[test]
    fn unknown_key_is_empty() {
        let eng = TemplateEngine::new(DataType::Float, 1, false, false, 64, 64);
        assert_eq!(eng.expand("a %NO_SUCH_KEY b").unwrap(), "a  b");
    }

    #[test]
    fn real_mul_and_mad() {
        let eng = TemplateEngine::new(DataType::Float, 4, true, true, 64, 64);
        assert_eq!(eng.expand("%MUL(c, a, b);").unwrap(), "c = (a) * (b);");
        assert_eq!(eng.expand("%MAD(c, a, b);").unwrap(), "c = mad(a, b, c);");
        assert!(eng.helper_preamble().is_empty());
    }

    #[test]
    fn complex_mul_uses_helper() {
        let eng = TemplateEngine::new(DataType::ComplexFloat, 1, false, false, 64, 64);
        assert_eq!(eng.expand("%MUL(c, a, b);").unwrap(), "c = mulComplexF(a, b);");
        let pre = eng.helper_preamble();
        assert!(pre.contains("float2 mulComplexF(float2 a, float2 b)"));
        assert!(pre.contains("a.x * b.x - a.y * b.y"));
        assert!(!pre.contains("divComplexF"));
    }

    #[test]
    fn complex_div_helper_form() {
        let eng = TemplateEngine::new(DataType::ComplexDouble, 1, false, false, 64, 64);
        assert_eq!(eng.expand("%DIV(c, a, b);").unwrap(), "c = divComplexD(a, b);");
        let pre = eng.helper_preamble();
        assert!(pre.contains("double denom = b.x * b.x + b.y * b.y"));
    }

    #[test]
    fn conjugate_and_imaginary() {
        let c = TemplateEngine::new(DataType::ComplexFloat, 1, false, false, 64, 64);
        assert_eq!(c.expand("%CONJUGATE(a);").unwrap(), "(a).y = -(a).y;");
        assert_eq!(c.expand("%CLEAR_IMAGINARY(a);").unwrap(), "(a).y = 0.0f;");

        let r = TemplateEngine::new(DataType::Float, 1, false, false, 64, 64);
        assert_eq!(r.expand("%CONJUGATE(a);").unwrap(), ";");
    }

    #[test]
    fn vload_gating() {
        let on = TemplateEngine::new(DataType::Float, 4, true, false, 64, 64);
        assert_eq!(
            on.expand("%VLOAD(a0, A + k);").unwrap(),
            "a0 = vload4(0, (__global float *)(A + k));"
        );

        let off = TemplateEngine::new(DataType::Float, 4, false, false, 64, 64);
        assert_eq!(off.expand("%VLOAD(a0, A + k);").unwrap(), "a0 = *(A + k);");
    }

    #[test]
    fn strided_vector_access() {
        let eng = TemplateEngine::new(DataType::Float, 4, true, true, 64, 64);
        assert_eq!(
            eng.expand("%VLOAD_WITH_INCX(x0, X, incx);").unwrap(),
            "x0 = (float4)((X)[0], (X)[incx], (X)[2 * (incx)], (X)[3 * (incx)]);"
        );
        let stored = eng.expand("%VSTORE_WITH_INCX(Y, y0, incy);").unwrap();
        assert!(stored.contains("(Y)[0] = (y0).s0"));
        assert!(stored.contains("(Y)[3 * (incy)] = (y0).s3"));
    }

    #[test]
    fn vmad_and_reduce_lanes() {
        let eng = TemplateEngine::new(DataType::Float, 2, true, false, 64, 64);
        assert_eq!(
            eng.expand("%VMAD_AND_REDUCE(acc, a, b);").unwrap(),
            "acc += (a).s0 * (b).s0 + (a).s1 * (b).s1;"
        );
    }

    #[test]
    fn reduction_framework_emission() {
        let eng = TemplateEngine::new(DataType::Float, 1, false, false, 256, 64);
        let src = eng.expand("%REDUCTION_BY_SUM(red);").unwrap();
        assert!(src.contains("barrier(CLK_LOCAL_MEM_FENCE);"));
        assert!(src.contains("for (uint _red = 128u; _red >= 64u; _red >>= 1)"));
        assert!(src.contains("(red)[get_local_id(0)]"));

        let max = eng.expand("%REDUCTION_BY_MAX(red);").unwrap();
        assert!(max.contains("fmax("));
    }

    #[test]
    fn operator_args_are_expanded() {
        let eng = TemplateEngine::new(DataType::Float, 1, false, false, 64, 64);
        assert_eq!(
            eng.expand("%MUL(c, (%TYPE)a, b);").unwrap(),
            "c = ((float)a) * (b);"
        );
    }

    #[test]
    fn unbalanced_operator_fails() {
        let eng = TemplateEngine::new(DataType::Float, 1, false, false, 64, 64);
        assert_eq!(eng.expand("%MUL(c, a"), Err(KgenError::InvalidArg));
    }
}
