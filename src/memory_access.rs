//! Recorded memory accesses and the shadow-slot tag-pairing discipline used
//! to surface them to instrumentation callbacks.
//!
//! Grounded on QBDI's `MemoryAccess`/`MemoryAccessType`
//! (`original_source/include/QBDI/Callback.h`) for the record shape, and on
//! the teacher crate's `MemoryRange`/`MemoryStorage` access-recording
//! conventions for how a fixed-size scratch area is threaded through a
//! tight execution loop without allocating per access.

use alloc::vec::Vec;

use crate::{consts, range::GuestAddr};

bitflags::bitflags! {
    /// What kind of access a [`MemoryAccess`] record describes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemoryAccessType: u8 {
        /// A load.
        const READ = 1 << 0;
        /// A store.
        const WRITE = 1 << 1;
        /// Shorthand for `READ | WRITE`, e.g. a read-modify-write idiom.
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
    }
}

/// Flags qualifying how a [`MemoryAccess`] was recorded, when the recording
/// instrumentation couldn't fully resolve it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryAccessFlags {
    /// The access came from a REP-prefixed (or equivalent) string
    /// instruction whose repeat count wasn't known until runtime.
    pub from_rep_prefix: bool,
    /// The access touched a floating-point or vector register wider than
    /// a guest word; `value` was not recorded.
    pub value_not_recorded: bool,
    /// This record's `size` does not yet reflect the real access size: set
    /// on the PRE record of a REP-prefixed access (whose repeat count is
    /// only known at runtime) and cleared on the POST record carrying the
    /// total byte count.
    pub unknown_size: bool,
}

/// One recorded guest memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryAccess {
    /// Guest address accessed.
    pub address: GuestAddr,
    /// Value read or written, if recorded (see
    /// [`MemoryAccessFlags::value_not_recorded`]).
    pub value: u64,
    /// Size of the access, in bytes.
    pub size: u8,
    /// Read, write, or both.
    pub access_type: MemoryAccessType,
    /// Address of the instruction that performed the access.
    pub inst_address: GuestAddr,
    /// Qualifiers on how this record was produced.
    pub flags: MemoryAccessFlags,
}

/// A fixed-capacity scratch area the shadow-recording instrumentation
/// writes tagged address/value pairs into during block execution, and the
/// engine drains into [`MemoryAccess`] records once the block yields.
///
/// The two-tag scheme (an address tag immediately followed by its value
/// tag) lets recording instrumentation for an instruction that both reads
/// and writes emit two independent untagged writes without needing to know
/// at codegen time whether the paired value has been written yet;
/// `drain` simply walks tag pairs in emission order.
#[derive(Debug, Clone)]
pub struct ShadowSpace {
    slots: Vec<u64>,
    len: usize,
}

impl ShadowSpace {
    /// A shadow space with room for `slots` tagged entries (two per
    /// access: one address tag, one value tag).
    pub fn new(slots: usize) -> Self {
        Self {
            slots: alloc::vec![0; slots.max(1) * 2],
            len: 0,
        }
    }

    /// The default-sized shadow space, per
    /// [`consts::DEFAULT_SHADOW_SLOTS`].
    pub fn with_default_capacity() -> Self {
        Self::new(consts::DEFAULT_SHADOW_SLOTS)
    }

    /// Reset for reuse by the next block execution, without reallocating.
    pub fn reset(&mut self) {
        self.len = 0;
    }

    fn push_raw(&mut self, tag: u64, value: u64) {
        if self.len + 2 > self.slots.len() {
            tracing::warn!("shadow space exhausted, dropping memory access record");
            return;
        }
        self.slots[self.len] = tag;
        self.slots[self.len + 1] = value;
        self.len += 2;
    }

    /// Record the raw accesses queued for one instruction, producing the
    /// paired [`MemoryAccess`] record(s). This is the entry point the
    /// engine calls after a block yields, given the per-instruction access
    /// shape decided at translation time (so it is not itself dependent on
    /// tag bytes written by codegen, only on the values).
    ///
    /// `size` and `flags` are packed into the address-tag slot's upper
    /// bits (the tag proper only ever needs the low 16) rather than
    /// spending a third slot per access: the shadow table stays a plain
    /// two-slots-per-access append log, matching the spec's tag-pair
    /// shape, while `drain` still recovers both.
    pub fn record(
        &mut self,
        inst_address: GuestAddr,
        address: GuestAddr,
        read_value: Option<u64>,
        write_value: Option<u64>,
        size: u8,
        flags: MemoryAccessFlags,
    ) {
        let _ = inst_address;
        let packed_flags = (flags.from_rep_prefix as u64)
            | ((flags.value_not_recorded as u64) << 1)
            | ((flags.unknown_size as u64) << 2);
        let meta = (u64::from(size) << 16) | (packed_flags << 24);
        if let Some(value) = read_value {
            self.push_raw(consts::MEM_READ_ADDRESS_TAG as u64 | meta, address);
            self.push_raw(consts::MEM_VALUE_TAG as u64, value);
        }
        if let Some(value) = write_value {
            self.push_raw(consts::MEM_WRITE_ADDRESS_TAG as u64 | meta, address);
            self.push_raw(consts::MEM_VALUE_TAG as u64, value);
        }
    }

    /// Drain every recorded access for `inst_address`, in recording order.
    ///
    /// Walks tag pairs written via [`Self::record`] (the only producer),
    /// matching each address tag with the value tag immediately following
    /// it; an address tag with no following value tag (the space filled
    /// exactly at an access boundary) is dropped and logged as a bug,
    /// since every access this engine records carries a value.
    pub fn drain(&mut self, inst_address: GuestAddr) -> Vec<MemoryAccess> {
        let mut out = Vec::new();
        let mut i = 0;
        while i + 3 < self.len {
            let addr_tag = self.slots[i] & 0xffff;
            let size = ((self.slots[i] >> 16) & 0xff) as u8;
            let packed_flags = (self.slots[i] >> 24) & 0xff;
            let addr = self.slots[i + 1];
            let value_tag = self.slots[i + 2] & 0xffff;
            let value = self.slots[i + 3];

            if value_tag != u64::from(consts::MEM_VALUE_TAG) {
                tracing::warn!(inst_address, "unpaired shadow record, dropping");
                i += 2;
                continue;
            }

            let access_type = if addr_tag == u64::from(consts::MEM_WRITE_ADDRESS_TAG) {
                MemoryAccessType::WRITE
            } else {
                MemoryAccessType::READ
            };
            out.push(MemoryAccess {
                address: addr,
                value,
                size,
                access_type,
                inst_address,
                flags: MemoryAccessFlags {
                    from_rep_prefix: packed_flags & 0b1 != 0,
                    value_not_recorded: packed_flags & 0b10 != 0,
                    unknown_size: packed_flags & 0b100 != 0,
                },
            });
            i += 4;
        }
        self.reset();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_pairs_read_and_write_records_in_order() {
        let mut shadow = ShadowSpace::new(4);
        shadow.record(0x10, 0x1000, Some(0xaa), None, 4, MemoryAccessFlags::default());
        shadow.record(0x10, 0x1000, None, Some(0xbb), 8, MemoryAccessFlags {
            from_rep_prefix: true,
            value_not_recorded: false,
            unknown_size: false,
        });

        let accesses = shadow.drain(0x10);
        assert_eq!(accesses.len(), 2);
        assert_eq!(accesses[0].access_type, MemoryAccessType::READ);
        assert_eq!(accesses[0].value, 0xaa);
        assert_eq!(accesses[0].size, 4);
        assert!(!accesses[0].flags.from_rep_prefix);

        assert_eq!(accesses[1].access_type, MemoryAccessType::WRITE);
        assert_eq!(accesses[1].value, 0xbb);
        assert_eq!(accesses[1].size, 8);
        assert!(accesses[1].flags.from_rep_prefix);
    }

    #[test]
    fn value_not_recorded_flag_survives_drain() {
        let mut shadow = ShadowSpace::new(2);
        shadow.record(
            0x20,
            0x2000,
            Some(0),
            None,
            16,
            MemoryAccessFlags {
                from_rep_prefix: false,
                value_not_recorded: true,
                unknown_size: false,
            },
        );
        let accesses = shadow.drain(0x20);
        assert_eq!(accesses.len(), 1);
        assert!(accesses[0].flags.value_not_recorded);
        assert_eq!(accesses[0].size, 16);
    }
}
