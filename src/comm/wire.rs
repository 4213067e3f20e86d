//! Fixed, versioned, little-endian wire types for the DOF protocols.
//!
//! All multi-byte integers in these structs are **little-endian** on the
//! wire. We store them pre-LE with `.to_le()` and decode with `from_le()`.
//! Floating-point coefficients travel as their IEEE-754 bit patterns in a
//! `u64` field, so every record is `Pod` and can be cast to and from raw
//! byte slices without a serializer in the inner loops.

use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;

pub fn cast_slice<T: Pod>(v: &[T]) -> &[u8] {
    bytemuck::cast_slice(v)
}

pub fn cast_slice_mut<T: Pod>(v: &mut [T]) -> &mut [u8] {
    bytemuck::cast_slice_mut(v)
}

/// Bump when the layout or semantics change in incompatible ways.
pub const WIRE_VERSION: u16 = 1;

/// Count of following records (or a byte length) in a size-exchange header.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct WireCount {
    pub n_le: u32,
}

impl WireCount {
    pub fn new(n: usize) -> Self {
        Self {
            n_le: (n as u32).to_le(),
        }
    }
    pub fn get(&self) -> usize {
        u32::from_le(self.n_le) as usize
    }
}

/// Header of one per-group block in the true-DOF broadcast.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct WireGroupBlock {
    pub group_le: u32,
    pub ndofs_le: u32,
}

impl WireGroupBlock {
    pub fn new(group: u32, ndofs: usize) -> Self {
        Self {
            group_le: group.to_le(),
            ndofs_le: (ndofs as u32).to_le(),
        }
    }
    pub fn group(&self) -> u32 {
        u32::from_le(self.group_le)
    }
    pub fn ndofs(&self) -> usize {
        u32::from_le(self.ndofs_le) as usize
    }
}

/// One owned DOF in a true-DOF broadcast: master-local true index plus the
/// canonical sign recorded by the master.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct WireTrueDof {
    pub ltdof_le: u64,
    pub sign_le: i32,
    pub _pad: u32,
}

impl WireTrueDof {
    pub fn new(ltdof: u64, sign: i8) -> Self {
        Self {
            ltdof_le: ltdof.to_le(),
            sign_le: (sign as i32).to_le(),
            _pad: 0,
        }
    }
    pub fn ltdof(&self) -> u64 {
        u64::from_le(self.ltdof_le)
    }
    pub fn sign(&self) -> i32 {
        i32::from_le(self.sign_le)
    }
}

/// Header of one row in a neighbor-row message. `origin` names the rank and
/// rank-local DOF whose interpolation row this is; the row finds its way
/// back there once fully resolved, possibly via forwarding hops.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct WireRowHdr {
    pub origin_rank_le: u32,
    pub nterms_le: u32,
    pub origin_dof_le: u64,
}

impl WireRowHdr {
    pub fn new(origin_rank: u32, origin_dof: u64, nterms: usize) -> Self {
        Self {
            origin_rank_le: origin_rank.to_le(),
            nterms_le: (nterms as u32).to_le(),
            origin_dof_le: origin_dof.to_le(),
        }
    }
    pub fn origin_rank(&self) -> u32 {
        u32::from_le(self.origin_rank_le)
    }
    pub fn origin_dof(&self) -> u64 {
        u64::from_le(self.origin_dof_le)
    }
    pub fn nterms(&self) -> usize {
        u32::from_le(self.nterms_le) as usize
    }
}

/// One term of a (possibly partially resolved) interpolation row.
/// `resolved == 1`: `dof` is a global true-DOF index. `resolved == 0`:
/// `dof` is a rank-local DOF id on `rank`, still awaiting expansion there.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct WireRowTerm {
    pub resolved_le: u32,
    pub rank_le: u32,
    pub dof_le: u64,
    pub coef_bits_le: u64,
}

impl WireRowTerm {
    pub fn resolved(gtdof: u64, coef: f64) -> Self {
        Self {
            resolved_le: 1u32.to_le(),
            rank_le: 0,
            dof_le: gtdof.to_le(),
            coef_bits_le: coef.to_bits().to_le(),
        }
    }
    pub fn unresolved(rank: u32, dof: u64, coef: f64) -> Self {
        Self {
            resolved_le: 0,
            rank_le: rank.to_le(),
            dof_le: dof.to_le(),
            coef_bits_le: coef.to_bits().to_le(),
        }
    }
    pub fn is_resolved(&self) -> bool {
        u32::from_le(self.resolved_le) != 0
    }
    pub fn rank(&self) -> u32 {
        u32::from_le(self.rank_le)
    }
    pub fn dof(&self) -> u64 {
        u64::from_le(self.dof_le)
    }
    pub fn coef(&self) -> f64 {
        f64::from_bits(u64::from_le(self.coef_bits_le))
    }
}

/// A global DOF id on the wire (column-plan requests).
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct WireDofId {
    pub id_le: u64,
}

impl WireDofId {
    pub fn of(id: u64) -> Self {
        Self { id_le: id.to_le() }
    }
    pub fn get(&self) -> u64 {
        u64::from_le(self.id_le)
    }
}

/// An `f64` value carried as its bit pattern (ghost and column exchanges).
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct WireValue {
    pub bits_le: u64,
}

impl WireValue {
    pub fn of(v: f64) -> Self {
        Self {
            bits_le: v.to_bits().to_le(),
        }
    }
    pub fn get(&self) -> f64 {
        f64::from_bits(u64::from_le(self.bits_le))
    }
}

// Pod/Zeroable ensures no padding contains uninit when cast to bytes.
const_assert_eq!(std::mem::size_of::<WireCount>(), 4);
const_assert_eq!(std::mem::size_of::<WireGroupBlock>(), 8);
const_assert_eq!(std::mem::size_of::<WireTrueDof>(), 16);
const_assert_eq!(std::mem::size_of::<WireRowHdr>(), 16);
const_assert_eq!(std::mem::size_of::<WireRowTerm>(), 24);
const_assert_eq!(std::mem::size_of::<WireDofId>(), 8);
const_assert_eq!(std::mem::size_of::<WireValue>(), 8);
const_assert_eq!(std::mem::align_of::<WireRowTerm>(), 8);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_true_dof() {
        let v = vec![WireTrueDof::new(3, -1), WireTrueDof::new(7, 1)];
        let bytes: Vec<u8> = cast_slice(&v).to_vec();
        let mut out = vec![WireTrueDof::zeroed(); v.len()];
        cast_slice_mut(&mut out).copy_from_slice(&bytes);
        assert_eq!(out[0].ltdof(), 3);
        assert_eq!(out[0].sign(), -1);
        assert_eq!(out[1].ltdof(), 7);
        assert_eq!(out[1].sign(), 1);
    }

    #[test]
    fn roundtrip_row_term() {
        let t = WireRowTerm::unresolved(2, 17, -0.25);
        let bytes: Vec<u8> = cast_slice(std::slice::from_ref(&t)).to_vec();
        let mut out = [WireRowTerm::zeroed()];
        cast_slice_mut(&mut out).copy_from_slice(&bytes);
        assert!(!out[0].is_resolved());
        assert_eq!(out[0].rank(), 2);
        assert_eq!(out[0].dof(), 17);
        assert_eq!(out[0].coef(), -0.25);

        let r = WireRowTerm::resolved(101, 1.0);
        assert!(r.is_resolved());
        assert_eq!(r.dof(), 101);
        assert_eq!(r.coef(), 1.0);
    }

    #[test]
    fn value_bits_are_exact() {
        let x = 0.1f64 + 0.2f64;
        assert_eq!(WireValue::of(x).get().to_bits(), x.to_bits());
    }
}
