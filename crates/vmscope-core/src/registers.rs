/// The unified register namespace.
///
/// Every backend translates these identifiers into its own CPU save-record
/// layout; a register outside a backend's supported subset fails with
/// [`Error::UnsupportedRegister`] rather than reading as zero.
///
/// [`Error::UnsupportedRegister`]: crate::Error::UnsupportedRegister
#[expect(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterId {
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rbp,
    Rsi,
    Rdi,
    Rsp,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    Rip,
    Rflags,

    Cr0,
    Cr2,
    Cr3,
    Cr4,

    Dr0,
    Dr1,
    Dr2,
    Dr3,
    Dr6,
    Dr7,

    CsSel,
    DsSel,
    EsSel,
    FsSel,
    GsSel,
    SsSel,
    TrSel,
    LdtrSel,

    CsLimit,
    DsLimit,
    EsLimit,
    FsLimit,
    GsLimit,
    SsLimit,
    TrLimit,
    LdtrLimit,
    IdtrLimit,
    GdtrLimit,

    CsBase,
    DsBase,
    EsBase,
    FsBase,
    GsBase,
    SsBase,
    TrBase,
    LdtrBase,
    IdtrBase,
    GdtrBase,

    CsArbytes,
    DsArbytes,
    EsArbytes,
    FsArbytes,
    GsArbytes,
    SsArbytes,
    TrArbytes,
    LdtrArbytes,

    SysenterCs,
    SysenterEsp,
    SysenterEip,
    ShadowGs,

    MsrFlags,
    MsrLstar,
    MsrStar,
    MsrCstar,
    MsrSyscallMask,
    MsrEfer,
    MsrTscAux,

    Tsc,
}
