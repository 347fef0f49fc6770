use serde::{Deserialize, Serialize};

/// The index of a virtual CPU.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct VcpuId(pub u16);

impl From<u16> for VcpuId {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl From<VcpuId> for u16 {
    fn from(value: VcpuId) -> u16 {
        value.0
    }
}

impl std::fmt::Display for VcpuId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A set of virtual CPUs, one bit per vCPU index.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VcpuSet(u64);

impl VcpuSet {
    /// An empty set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// A set containing every vCPU index representable in the bitset.
    pub const fn all() -> Self {
        Self(u64::MAX)
    }

    /// A set containing a single vCPU.
    pub fn single(vcpu: VcpuId) -> Self {
        let mut set = Self::empty();
        set.insert(vcpu);
        set
    }

    /// Adds a vCPU to the set.
    pub fn insert(&mut self, vcpu: VcpuId) {
        self.0 |= 1 << vcpu.0;
    }

    /// Removes a vCPU from the set.
    pub fn remove(&mut self, vcpu: VcpuId) {
        self.0 &= !(1 << vcpu.0);
    }

    /// Checks whether the set contains a vCPU.
    pub fn contains(&self, vcpu: VcpuId) -> bool {
        self.0 & (1 << vcpu.0) != 0
    }

    /// Checks whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Iterates over the vCPUs in the set, bounded by `num_vcpus`.
    pub fn iter(&self, num_vcpus: u16) -> impl Iterator<Item = VcpuId> + '_ {
        (0..num_vcpus.min(64)).filter(|i| self.0 & (1 << i) != 0).map(VcpuId)
    }
}
