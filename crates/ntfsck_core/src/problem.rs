//! Problem table and repair policy.
//!
//! Every distinct inconsistency the passes can find is one code in a closed
//! enumeration with a stable numeric id. A problem's message template uses
//! `@X<c>` placeholders that are expanded from a typed context at print
//! time, and [`ProblemEngine::fix`] resolves the global repair mode into
//! the boolean "apply this fix now".

use crate::types::RepairMode;
use std::io::Write;

/// Don't print the message when auto-repairing.
pub const PR_PREEN_NOMSG: u8 = 1 << 0;
/// Don't print the message in no-repair mode.
pub const PR_NO_NOMSG: u8 = 1 << 1;

/// Stable problem identifiers. The discriminants are persistent between
/// versions; new codes are appended, never renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ProblemCode {
    PreScanMft = 0x000001,
    ResetLogFile,
    MftFlagMismatch,
    DirNonzeroSize,
    MftReparseTagMismatch,
    MftAllocatedSizeMismatch,
    MftDataSizeMismatch,
    DirFlagMismatchIdxFn,
    DirFlagMismatchMftFn,
    DirIrNotExist,
    MftFlagMismatchIdxFn,
    FileHaveIr,
    AttrLowestVcnIsNotZero,
    AttrNonResidentSizesMismatch,
    AttrValueOffsetBadlyAligned,
    AttrValueOffsetCorrupted,
    AttrNameOffsetCorrupted,
    AttrLengthCorrupted,
    AttrFnFlagMismatch,
    AttrIrSizeMismatch,
    IaMagicCorrupted,
    MftMagicCorrupted,
    MftSizeCorrupted,
    MftAttrOffsetCorrupted,
    MftBiuCorrupted,
    IeZeroLength,
    BootSectorInvalid,
    MountLoadMftFailure,
    MountLoadMftmirrFailure,
    MountRepairedMftmirrCorrupted,
    IeFlagSubNodeCorrupted,
    MountMftMftmirrMismatch,
    IeEndFlagCorrupted,
    LogApplyRunlistToDisk,
    DirHaveResidentIa,
    AttrlistLengthCorrupted,
    IdxEntryCorrupted,
    IdxBitmapSizeMismatch,
    IdxBitmapMismatch,
    ClusterBitmapMismatch,
    OrphanedMftRepair,
    DirIdxInitialize,
    BitmapMftSizeMismatch,
    DirEmptyIeLengthCorrupted,
    ClusterDuplicationFound,
    OrphanedMftOpenFailure,
    OrphanedMftCheckFailure,
}

impl ProblemCode {
    pub fn id(self) -> u32 {
        self as u32
    }

    pub fn flags(self) -> u8 {
        use ProblemCode::*;
        match self {
            PreScanMft | ResetLogFile => PR_PREEN_NOMSG | PR_NO_NOMSG,
            LogApplyRunlistToDisk | OrphanedMftOpenFailure | OrphanedMftCheckFailure => {
                PR_PREEN_NOMSG
            }
            _ => 0,
        }
    }

    /// Message template. `@I<c>` inode, `@A<c>` attribute, `@F<c>` index key
    /// filename, `@P<c>` parent inode, `@a<c>` index block, `@S<c>` specific
    /// data.
    pub fn template(self) -> &'static str {
        use ProblemCode::*;
        match self {
            PreScanMft => "Scan all mft entries and account their cluster runs",
            ResetLogFile => "Reset logfile",
            MftFlagMismatch => "Inode(@In:@IN): MFT flag set as directory, but MFT/$FN is not set.",
            DirNonzeroSize => "Directory(@In:@IN) has non-zero length(@Fs:@Is).",
            MftReparseTagMismatch => {
                "Inode(@In:@IN): Reparse tag is different with IDX/$FN, MFT/$FN."
            }
            MftAllocatedSizeMismatch => {
                "Inode(@In): Allocated size is different with IDX/$FN(@Fs), MFT/$DATA(@Is)."
            }
            MftDataSizeMismatch => {
                "Inode(@In): Data size is different with IDX/$FN(@Fd), MFT/$DATA(@Id)."
            }
            DirFlagMismatchIdxFn => "Directory(@In): MFT flag is set to directory, IDX/$FN is not.",
            DirFlagMismatchMftFn => {
                "Directory(@In): MFT/$FN flag is set to directory, but there's no $IR."
            }
            DirIrNotExist => {
                "Directory(@In): INDEX/$FN flag is set to directory, but there's no $IR."
            }
            MftFlagMismatchIdxFn => {
                "Inode(@In): MFT/$FN is set to file, but IDX/$FN is set to directory."
            }
            FileHaveIr => "Inode(@In): MFT/$FN is set to file, but there's no $DATA, $IR exist.",
            AttrLowestVcnIsNotZero => "Inode(@In:@At): Attribute lowest vcn(@av) is not zero.",
            AttrNonResidentSizesMismatch => "Inode(@In:@At): Size of non resident are corrupted.",
            AttrValueOffsetBadlyAligned => {
                "Inode(@In:@At): Value offset badly aligned in attribute."
            }
            AttrValueOffsetCorrupted => "Inode(@In:@At): Value offset is corrupted in attribute.",
            AttrNameOffsetCorrupted => "Inode(@In:@At): Name offset is corrupted in attribute.",
            AttrLengthCorrupted => "Inode(@In:@At): Attribute length is corrupted in attribute.",
            AttrFnFlagMismatch => "Inode(@In:@At): $FN flag's not matched attribute flag.",
            AttrIrSizeMismatch => "Directory(@In): $IR index block size is corrupted.",
            IaMagicCorrupted => "Directory(@In): Index block(vcn:@av) signature is corrupted.",
            MftMagicCorrupted => "Inode(@In): MFT magic signature is corrupted.",
            MftSizeCorrupted => "Inode(@In:@Is): MFT allocated size is corrupted.",
            MftAttrOffsetCorrupted => "Inode(@In): MFT attribute offset is badly aligned.",
            MftBiuCorrupted => "Inode(@In): MFT byte-in-use field is corrupted.",
            IeZeroLength => {
                "Directory(@In): Index entry length is zero, It should be at least size of IE header."
            }
            BootSectorInvalid => "Invalid boot sector,",
            MountLoadMftFailure => "Failed to load $MFT(0), recover from $MFTMirr",
            MountLoadMftmirrFailure => "Failed to load $MFTMirr(1), recover from $MFTMirr",
            MountRepairedMftmirrCorrupted => "$MFT is corrupted, repair $MFT from $MFTMirr",
            IeFlagSubNodeCorrupted => {
                "Directory(@In): Index entry have sub-node, but flag is not set."
            }
            MountMftMftmirrMismatch => "$MFT/$MFTMirr records do not match. Repair $MFTMirror",
            IeEndFlagCorrupted => "Directory(@In): Index entry is empty, but did not set end flag.",
            LogApplyRunlistToDisk => "Inode(@In): Repaired runlist should be applied to disk",
            DirHaveResidentIa => "Directory(@In) has resident $INDEX_ALLOCATION.",
            AttrlistLengthCorrupted => "Inode(@In:@At): Attribute list length is corrupted.",
            IdxEntryCorrupted => {
                "Inode(@In:@IN): Index entry is corrupted, Remove it from parent(@Pn)"
            }
            IdxBitmapSizeMismatch => "Inode(@In): Bitmap of index allocation size are different.",
            IdxBitmapMismatch => {
                "Inode(@In): Checked index bitmap and on disk index bitmap are different."
            }
            ClusterBitmapMismatch => {
                "Inode(@In:@At): Cluster bitmap of fsck and disk are different. Apply to disk"
            }
            OrphanedMftRepair => "Found an orphaned file(@In), try to add index entry",
            DirIdxInitialize => "Initialize all index structure of directory(@In).",
            BitmapMftSizeMismatch => "$Bitmap size(@Ad) is smaller than expected(@Sd).",
            DirEmptyIeLengthCorrupted => {
                "Directory(@In): Length of empty entry of $INDEX_ROOT is not valid."
            }
            ClusterDuplicationFound => "Inode(@In:@At): Found cluster duplication.",
            OrphanedMftOpenFailure => "Inode(@In) open failed. Clear MFT bitmap of inode",
            OrphanedMftCheckFailure => "Inode(@In) check failed. Delete orphaned MFT candidates",
        }
    }
}

/// Inode-side facts available to a message.
#[derive(Debug, Clone, Default)]
pub struct InodeCtx {
    pub mft_no: u64,
    pub name: Option<String>,
    pub allocated_size: i64,
    pub data_size: i64,
}

impl InodeCtx {
    pub fn num(mft_no: u64) -> Self {
        Self {
            mft_no,
            ..Default::default()
        }
    }
}

/// Attribute-side facts: the inode plus the attribute under inspection.
#[derive(Debug, Clone, Default)]
pub struct AttrCtx {
    pub inode: InodeCtx,
    pub attr_type: u32,
    pub allocated_size: i64,
    pub data_size: i64,
    pub vcn: i64,
    /// `@Sd` payload: an expected size, a block count, whatever the
    /// template calls "specific data".
    pub specific: i64,
}

/// Index-side facts: the inode, its parent directory, and the index key.
#[derive(Debug, Clone, Default)]
pub struct IndexCtx {
    pub inode: InodeCtx,
    pub parent_mft_no: u64,
    pub vcn: i64,
    pub fn_allocated_size: i64,
    pub fn_data_size: i64,
}

#[derive(Debug, Clone)]
pub enum ProblemCtx {
    None,
    Inode(InodeCtx),
    Attr(AttrCtx),
    Index(IndexCtx),
}

impl ProblemCtx {
    fn inode(&self) -> Option<&InodeCtx> {
        match self {
            ProblemCtx::None => None,
            ProblemCtx::Inode(i) => Some(i),
            ProblemCtx::Attr(a) => Some(&a.inode),
            ProblemCtx::Index(i) => Some(&i.inode),
        }
    }

    fn expand(&self, class: char, field: char, out: &mut String) {
        use std::fmt::Write as _;
        match (class, field) {
            ('I', 'n') => {
                if let Some(i) = self.inode() {
                    let _ = write!(out, "{}", i.mft_no);
                }
            }
            ('I', 'N') => {
                if let Some(name) = self.inode().and_then(|i| i.name.as_deref()) {
                    out.push_str(name);
                }
            }
            ('I', 's') => {
                if let Some(i) = self.inode() {
                    let _ = write!(out, "{}", i.allocated_size);
                }
            }
            ('I', 'd') => {
                if let Some(i) = self.inode() {
                    let _ = write!(out, "{}", i.data_size);
                }
            }
            ('A', 't') => {
                if let ProblemCtx::Attr(a) = self {
                    let _ = write!(out, "{:02x}", a.attr_type);
                }
            }
            ('A', 's') => {
                if let ProblemCtx::Attr(a) = self {
                    let _ = write!(out, "{}", a.allocated_size);
                }
            }
            ('A', 'd') => {
                if let ProblemCtx::Attr(a) = self {
                    let _ = write!(out, "{}", a.data_size);
                }
            }
            ('F', 's') => {
                if let ProblemCtx::Index(i) = self {
                    let _ = write!(out, "{}", i.fn_allocated_size);
                }
            }
            ('F', 'd') => {
                if let ProblemCtx::Index(i) = self {
                    let _ = write!(out, "{}", i.fn_data_size);
                }
            }
            ('P', 'n') => {
                if let ProblemCtx::Index(i) = self {
                    let _ = write!(out, "{}", i.parent_mft_no);
                }
            }
            ('a', 'v') => match self {
                ProblemCtx::Index(i) => {
                    let _ = write!(out, "{}", i.vcn);
                }
                ProblemCtx::Attr(a) => {
                    let _ = write!(out, "{}", a.vcn);
                }
                _ => {}
            },
            ('S', 'd') => {
                if let ProblemCtx::Attr(a) = self {
                    let _ = write!(out, "{}", a.specific);
                }
            }
            _ => {}
        }
    }

    /// Expands a template's `@X<c>` placeholders from this context.
    pub fn render(&self, template: &str) -> String {
        let mut out = String::with_capacity(template.len());
        let mut chars = template.chars().peekable();
        while let Some(c) = chars.next() {
            if c != '@' {
                out.push(c);
                continue;
            }
            let class = chars.next().unwrap_or('@');
            let field = chars.next().unwrap_or('@');
            self.expand(class, field, &mut out);
        }
        out
    }
}

/// Resolves problems against the global repair mode and keeps the error
/// accounting used for the exit code.
pub struct ProblemEngine {
    mode: RepairMode,
    errors: u64,
    fixes: u64,
    quiet: bool,
}

impl ProblemEngine {
    pub fn new(mode: RepairMode) -> Self {
        Self {
            mode,
            errors: 0,
            fixes: 0,
            quiet: false,
        }
    }

    /// A throwaway engine that neither prints nor fixes. Used when a
    /// repair path re-runs analysis it already reported once, e.g. rolling
    /// accumulated bitmap bits back off a rejected inode.
    pub fn silent() -> Self {
        Self {
            mode: RepairMode::No,
            errors: 0,
            fixes: 0,
            quiet: true,
        }
    }

    #[inline]
    pub fn mode(&self) -> RepairMode {
        self.mode
    }

    pub fn error_found(&mut self) {
        self.errors += 1;
    }

    pub fn error_fixed(&mut self) {
        self.fixes += 1;
    }

    pub fn errors(&self) -> u64 {
        self.errors
    }

    pub fn fixes(&self) -> u64 {
        self.fixes
    }

    pub fn errors_left(&self) -> u64 {
        self.errors.saturating_sub(self.fixes)
    }

    fn suppressed(&self, code: ProblemCode) -> Option<bool> {
        let flags = code.flags();
        if flags & PR_PREEN_NOMSG != 0 && self.mode == RepairMode::Auto {
            return Some(true);
        }
        if flags & PR_NO_NOMSG != 0 && self.mode == RepairMode::No {
            return Some(false);
        }
        None
    }

    /// Prints a problem without offering a fix.
    pub fn print(&self, code: ProblemCode, ctx: &ProblemCtx) {
        if self.quiet || self.suppressed(code).is_some() {
            return;
        }
        eprintln!("{}", ctx.render(code.template()));
    }

    /// Prints the problem and resolves whether to apply the fix now.
    /// Idempotent: asking about the same code twice re-evaluates the mode.
    pub fn fix(&mut self, code: ProblemCode, ctx: &ProblemCtx) -> bool {
        if self.quiet {
            return false;
        }
        if let Some(repair) = self.suppressed(code) {
            return repair;
        }

        eprint!("{} Fix it? ", ctx.render(code.template()));
        let _ = std::io::stderr().flush();
        self.ask_repair()
    }

    fn ask_repair(&self) -> bool {
        match self.mode {
            RepairMode::No => {
                eprintln!("No");
                false
            }
            RepairMode::Yes | RepairMode::Auto => {
                eprintln!("Yes");
                true
            }
            RepairMode::Ask => loop {
                eprint!(" (y/N) ");
                let _ = std::io::stderr().flush();
                let mut answer = String::new();
                if std::io::stdin().read_line(&mut answer).is_err() {
                    return false;
                }
                match answer.trim() {
                    "y" | "Y" => return true,
                    "" | "n" | "N" => return false,
                    _ => continue,
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_ids() {
        assert_eq!(ProblemCode::PreScanMft.id(), 0x000001);
        assert_eq!(ProblemCode::ResetLogFile.id(), 0x000002);
        assert_eq!(ProblemCode::ClusterDuplicationFound.id(), 0x00002d);
        assert_eq!(ProblemCode::OrphanedMftCheckFailure.id(), 0x00002f);
    }

    #[test]
    fn test_render_inode_ctx() {
        let ctx = ProblemCtx::Inode(InodeCtx {
            mft_no: 42,
            name: Some("a.txt".into()),
            allocated_size: 4096,
            data_size: 100,
        });
        let msg = ctx.render(ProblemCode::DirNonzeroSize.template());
        assert!(msg.contains("Directory(42:a.txt)"));
    }

    #[test]
    fn test_render_attr_ctx() {
        let ctx = ProblemCtx::Attr(AttrCtx {
            inode: InodeCtx::num(7),
            attr_type: 0x80,
            ..Default::default()
        });
        let msg = ctx.render(ProblemCode::AttrLengthCorrupted.template());
        assert!(msg.contains("Inode(7:80)"));
    }

    #[test]
    fn test_render_missing_fields_are_empty() {
        let msg = ProblemCtx::None.render(ProblemCode::MftMagicCorrupted.template());
        assert!(msg.contains("Inode()"));
    }

    #[test]
    fn test_fix_modes() {
        let mut yes = ProblemEngine::new(RepairMode::Yes);
        assert!(yes.fix(ProblemCode::MftMagicCorrupted, &ProblemCtx::None));

        let mut no = ProblemEngine::new(RepairMode::No);
        assert!(!no.fix(ProblemCode::MftMagicCorrupted, &ProblemCtx::None));

        // preen-suppressed codes auto-apply without output in Auto mode
        let mut auto = ProblemEngine::new(RepairMode::Auto);
        assert!(auto.fix(ProblemCode::ResetLogFile, &ProblemCtx::None));

        // and resolve to "no fix" silently in No mode
        let mut no2 = ProblemEngine::new(RepairMode::No);
        assert!(!no2.fix(ProblemCode::PreScanMft, &ProblemCtx::None));
    }

    #[test]
    fn test_error_accounting() {
        let mut e = ProblemEngine::new(RepairMode::Yes);
        e.error_found();
        e.error_found();
        e.error_fixed();
        assert_eq!(e.errors_left(), 1);
    }
}
