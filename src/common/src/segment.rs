use bitflags::bitflags;

bitflags! {
    /// Permissions declared by an ELF program header (`p_flags`).
    ///
    /// Bit values match `PF_X`, `PF_W` and `PF_R`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct SegmentFlags: u32 {
        const EXECUTE = 1 << 0;
        const WRITE   = 1 << 1;
        const READ    = 1 << 2;
    }
}

impl SegmentFlags {
    /// Whether pages of this segment stay writable after loading.
    pub fn is_writable(self) -> bool {
        self.contains(SegmentFlags::WRITE)
    }
}
