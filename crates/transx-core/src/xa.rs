//! XA vocabulary: branch identifiers, flags, return codes and the
//! resource-manager contract.
//!
//! Flag and return-code values are the X/Open XA ones, so an external
//! transaction manager can drive a pooled connection without knowing
//! anything about pooling.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use async_trait::async_trait;
use thiserror::Error;

/// Result type alias for XA operations.
pub type XaResult<T> = Result<T, XaError>;

// ── Return codes ────────────────────────────────────────────────────

/// `prepare` vote: the branch is prepared and must be committed or rolled back.
pub const XA_OK: i32 = 0;
/// `prepare` vote: the branch was read-only and has already been released.
pub const XA_RDONLY: i32 = 3;

pub const XA_RETRY: i32 = 4;
pub const XA_HEURMIX: i32 = 5;
pub const XA_HEURRB: i32 = 6;
pub const XA_HEURCOM: i32 = 7;
pub const XA_HEURHAZ: i32 = 8;
pub const XA_NOMIGRATE: i32 = 9;

pub const XA_RBBASE: i32 = 100;
pub const XA_RBROLLBACK: i32 = XA_RBBASE;
pub const XA_RBCOMMFAIL: i32 = XA_RBBASE + 1;
pub const XA_RBDEADLOCK: i32 = XA_RBBASE + 2;
pub const XA_RBINTEGRITY: i32 = XA_RBBASE + 3;
pub const XA_RBOTHER: i32 = XA_RBBASE + 4;
pub const XA_RBPROTO: i32 = XA_RBBASE + 5;
pub const XA_RBTIMEOUT: i32 = XA_RBBASE + 6;
pub const XA_RBTRANSIENT: i32 = XA_RBBASE + 7;
pub const XA_RBEND: i32 = XA_RBTRANSIENT;

pub const XAER_ASYNC: i32 = -2;
pub const XAER_RMERR: i32 = -3;
pub const XAER_NOTA: i32 = -4;
pub const XAER_INVAL: i32 = -5;
pub const XAER_PROTO: i32 = -6;
pub const XAER_RMFAIL: i32 = -7;
pub const XAER_DUPID: i32 = -8;
pub const XAER_OUTSIDE: i32 = -9;

// ── Flags ───────────────────────────────────────────────────────────

/// Bit flags passed to `start`, `end` and `recover`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct XaFlags(u32);

impl XaFlags {
    pub const TMNOFLAGS: XaFlags = XaFlags(0);
    pub const TMJOIN: XaFlags = XaFlags(0x0020_0000);
    pub const TMENDRSCAN: XaFlags = XaFlags(0x0080_0000);
    pub const TMSTARTRSCAN: XaFlags = XaFlags(0x0100_0000);
    pub const TMSUSPEND: XaFlags = XaFlags(0x0200_0000);
    pub const TMSUCCESS: XaFlags = XaFlags(0x0400_0000);
    pub const TMRESUME: XaFlags = XaFlags(0x0800_0000);
    pub const TMFAIL: XaFlags = XaFlags(0x2000_0000);
    pub const TMONEPHASE: XaFlags = XaFlags(0x4000_0000);

    pub const fn from_bits(bits: u32) -> Self {
        XaFlags(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Whether every bit of `other` is set in `self`.
    ///
    /// `TMNOFLAGS` has no bits, so use `== XaFlags::TMNOFLAGS` to test for it.
    pub const fn contains(self, other: XaFlags) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }
}

impl BitOr for XaFlags {
    type Output = XaFlags;

    fn bitor(self, rhs: XaFlags) -> XaFlags {
        XaFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for XaFlags {
    fn bitor_assign(&mut self, rhs: XaFlags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for XaFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "XaFlags({:#010x})", self.0)
    }
}

// ── Xid ─────────────────────────────────────────────────────────────

/// Global transaction identifier plus branch qualifier.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Xid {
    format_id: i32,
    global_transaction_id: Vec<u8>,
    branch_qualifier: Vec<u8>,
}

impl Xid {
    /// Maximum size in bytes of a global transaction id.
    pub const MAX_GTRID_SIZE: usize = 64;
    /// Maximum size in bytes of a branch qualifier.
    pub const MAX_BQUAL_SIZE: usize = 64;

    /// Build an identifier, rejecting oversized components with `XAER_INVAL`.
    pub fn new(
        format_id: i32,
        global_transaction_id: impl Into<Vec<u8>>,
        branch_qualifier: impl Into<Vec<u8>>,
    ) -> XaResult<Self> {
        let gtrid = global_transaction_id.into();
        let bqual = branch_qualifier.into();
        if gtrid.len() > Self::MAX_GTRID_SIZE {
            return Err(XaError::new(
                XAER_INVAL,
                format!("global transaction id is {} bytes (max {})", gtrid.len(), Self::MAX_GTRID_SIZE),
            ));
        }
        if bqual.len() > Self::MAX_BQUAL_SIZE {
            return Err(XaError::new(
                XAER_INVAL,
                format!("branch qualifier is {} bytes (max {})", bqual.len(), Self::MAX_BQUAL_SIZE),
            ));
        }
        Ok(Self {
            format_id,
            global_transaction_id: gtrid,
            branch_qualifier: bqual,
        })
    }

    pub fn format_id(&self) -> i32 {
        self.format_id
    }

    pub fn global_transaction_id(&self) -> &[u8] {
        &self.global_transaction_id
    }

    pub fn branch_qualifier(&self) -> &[u8] {
        &self.branch_qualifier
    }
}

impl fmt::Debug for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Xid({self})")
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.format_id,
            hex::encode(&self.global_transaction_id),
            hex::encode(&self.branch_qualifier)
        )
    }
}

// ── XaError ─────────────────────────────────────────────────────────

/// Failure of an XA call, carrying the standard XA error code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} (xa error {code})")]
pub struct XaError {
    code: i32,
    message: String,
}

impl XaError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> i32 {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// The branch was rolled back (`XA_RB*` range).
    pub fn is_rollback(&self) -> bool {
        (XA_RBBASE..=XA_RBEND).contains(&self.code)
    }

    /// A heuristic decision was taken by the resource manager.
    pub fn is_heuristic(&self) -> bool {
        matches!(self.code, XA_HEURMIX | XA_HEURRB | XA_HEURCOM | XA_HEURHAZ)
    }
}

// ── XaResource ──────────────────────────────────────────────────────

/// Two-phase-commit branch interface of one resource manager connection.
///
/// Mirrors the XA resource-manager contract: `start`/`end` delimit the work
/// of a branch on this connection, `prepare`/`commit`/`rollback` complete it,
/// `recover` lists in-doubt branches.
#[async_trait]
pub trait XaResource: Send + Sync {
    async fn start(&self, xid: &Xid, flags: XaFlags) -> XaResult<()>;

    async fn end(&self, xid: &Xid, flags: XaFlags) -> XaResult<()>;

    /// Returns [`XA_OK`] or [`XA_RDONLY`].
    async fn prepare(&self, xid: &Xid) -> XaResult<i32>;

    async fn commit(&self, xid: &Xid, one_phase: bool) -> XaResult<()>;

    async fn rollback(&self, xid: &Xid) -> XaResult<()>;

    async fn forget(&self, xid: &Xid) -> XaResult<()>;

    async fn recover(&self, flags: XaFlags) -> XaResult<Vec<Xid>>;

    /// Identity of the resource manager behind this branch interface.
    fn resource_manager_name(&self) -> &str;

    fn is_same_rm(&self, other: &dyn XaResource) -> XaResult<bool> {
        Ok(self.resource_manager_name() == other.resource_manager_name())
    }

    /// Transaction timeout in seconds (0 means the resource default).
    async fn transaction_timeout(&self) -> XaResult<u32>;

    /// Returns `false` if the resource does not support setting a timeout.
    async fn set_transaction_timeout(&self, seconds: u32) -> XaResult<bool>;
}
