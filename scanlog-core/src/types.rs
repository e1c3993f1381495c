//! Core domain types for scanlog
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Scan event** | A single decode of a barcode or tag by the capture hardware |
//! | **ScanRecord** | The durable local copy of one scan event and its sync state |
//! | **Idempotency key** | The record `id`; resubmitting it has the same effect as submitting once |
//! | **Fingerprint** | Digest of symbology and content; equal fingerprints mean the same logical scan |
//! | **Batch** | Pending records submitted together in one sync attempt |
//!
//! Status lifecycle:
//!
//! ```text
//! Pending ──► Syncing ──► Confirmed (terminal)
//!    ▲           │
//!    └───────────┼──► Conflicted ──► Pending | Confirmed   (manual)
//!                └──► Failed     ──► Pending               (manual)
//! ```

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ============================================
// Status
// ============================================

/// Sync state of a scan record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    /// Captured, waiting for a sync attempt
    Pending,
    /// Part of the batch currently in flight
    Syncing,
    /// Accepted by the server
    Confirmed,
    /// Server reported conflicting content; needs an explicit decision
    Conflicted,
    /// Server rejected the record; needs manual intervention
    Failed,
}

impl ScanStatus {
    pub const ALL: [ScanStatus; 5] = [
        ScanStatus::Pending,
        ScanStatus::Syncing,
        ScanStatus::Confirmed,
        ScanStatus::Conflicted,
        ScanStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Pending => "pending",
            ScanStatus::Syncing => "syncing",
            ScanStatus::Confirmed => "confirmed",
            ScanStatus::Conflicted => "conflicted",
            ScanStatus::Failed => "failed",
        }
    }

    /// Confirmed records never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ScanStatus::Confirmed)
    }

    /// Records the user has to look at before anything else happens to them.
    pub fn needs_attention(&self) -> bool {
        matches!(self, ScanStatus::Conflicted | ScanStatus::Failed)
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: ScanStatus) -> bool {
        use ScanStatus::*;
        matches!(
            (self, next),
            (Pending, Syncing)
                | (Syncing, Pending)
                | (Syncing, Confirmed)
                | (Syncing, Conflicted)
                | (Syncing, Failed)
                | (Conflicted, Pending)
                | (Conflicted, Confirmed)
                | (Failed, Pending)
        )
    }
}

impl std::fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ScanStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ScanStatus::Pending),
            "syncing" => Ok(ScanStatus::Syncing),
            "confirmed" => Ok(ScanStatus::Confirmed),
            "conflicted" => Ok(ScanStatus::Conflicted),
            "failed" => Ok(ScanStatus::Failed),
            _ => Err(format!("unknown scan status: {}", s)),
        }
    }
}

// ============================================
// Symbology
// ============================================

/// Barcode symbologies the decoder reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Symbology {
    Ean8,
    Ean13,
    UpcA,
    UpcE,
    Code39,
    Code128,
    Itf,
    Codabar,
    DataMatrix,
    Pdf417,
    Qr,
}

impl Symbology {
    pub fn as_str(&self) -> &'static str {
        match self {
            Symbology::Ean8 => "ean_8",
            Symbology::Ean13 => "ean_13",
            Symbology::UpcA => "upc_a",
            Symbology::UpcE => "upc_e",
            Symbology::Code39 => "code_39",
            Symbology::Code128 => "code_128",
            Symbology::Itf => "itf",
            Symbology::Codabar => "codabar",
            Symbology::DataMatrix => "data_matrix",
            Symbology::Pdf417 => "pdf417",
            Symbology::Qr => "qr_code",
        }
    }
}

impl std::str::FromStr for Symbology {
    type Err = String;

    /// Accepts the canonical names plus the spellings browser barcode
    /// detectors and common decoders emit (`ean13`, `EAN-13`, `qr`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect();

        match normalized.as_str() {
            "ean8" => Ok(Symbology::Ean8),
            "ean13" => Ok(Symbology::Ean13),
            "upca" => Ok(Symbology::UpcA),
            "upce" => Ok(Symbology::UpcE),
            "code39" => Ok(Symbology::Code39),
            "code128" => Ok(Symbology::Code128),
            "itf" => Ok(Symbology::Itf),
            "codabar" => Ok(Symbology::Codabar),
            "datamatrix" => Ok(Symbology::DataMatrix),
            "pdf417" => Ok(Symbology::Pdf417),
            "qr" | "qrcode" => Ok(Symbology::Qr),
            _ => Err(format!("unknown symbology: {}", s)),
        }
    }
}

impl std::fmt::Display for Symbology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================
// Capture input
// ============================================

/// What the decoder hands to the capture pipeline
#[derive(Debug, Clone, Default)]
pub struct RawDecode {
    /// Decoded text as reported by the decoder
    pub content: String,
    /// Symbology name as reported by the decoder, if any
    pub symbology: Option<String>,
    /// Capture session (e.g. a picking round), if the host tracks one
    pub session_id: Option<String>,
    /// When the decoder saw the code; defaults to capture time
    pub decoded_at: Option<DateTime<Utc>>,
}

impl RawDecode {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_symbology(mut self, symbology: impl Into<String>) -> Self {
        self.symbology = Some(symbology.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

// ============================================
// Scan record
// ============================================

/// Decoded content plus capture metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanPayload {
    /// Validated, trimmed barcode content
    pub content: String,
    pub symbology: Option<Symbology>,
    /// Device that captured the scan
    pub device_id: String,
    pub session_id: Option<String>,
    pub captured_at: DateTime<Utc>,
}

impl ScanPayload {
    /// Content digest used to recognise the same logical scan.
    ///
    /// Covers symbology and content only, so two devices scanning the same
    /// label produce the same fingerprint.
    pub fn fingerprint(&self) -> String {
        compute_fingerprint(self.symbology, &self.content)
    }
}

/// Compute the 64-char hex fingerprint of a scan's logical content.
pub fn compute_fingerprint(symbology: Option<Symbology>, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(symbology.map(|s| s.as_str()).unwrap_or("").as_bytes());
    hasher.update([0u8]);
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// Scan record identifier (UUID string)
pub type RecordId = String;

/// One captured scan event and its sync state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanRecord {
    /// Locally generated UUID; also the idempotency key sent to the server
    pub id: String,
    /// Store-assigned insertion sequence (0 until appended)
    pub seq: i64,
    pub payload: ScanPayload,
    pub fingerprint: String,
    pub status: ScanStatus,
    /// Number of network submissions made for this record
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScanRecord {
    /// Create a fresh `Pending` record with a new id.
    ///
    /// Timestamps are truncated to microseconds, the precision the store keeps.
    pub fn new(mut payload: ScanPayload) -> Self {
        let now = Utc::now().trunc_subsecs(6);
        payload.captured_at = payload.captured_at.trunc_subsecs(6);
        let fingerprint = payload.fingerprint();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            seq: 0,
            payload,
            fingerprint,
            status: ScanStatus::Pending,
            attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(content: &str, device: &str) -> ScanPayload {
        ScanPayload {
            content: content.to_string(),
            symbology: Some(Symbology::Ean13),
            device_id: device.to_string(),
            session_id: None,
            captured_at: Utc::now(),
        }
    }

    #[test]
    fn test_status_roundtrip() {
        for status in ScanStatus::ALL {
            assert_eq!(status.as_str().parse::<ScanStatus>().unwrap(), status);
        }
        assert!("archived".parse::<ScanStatus>().is_err());
    }

    #[test]
    fn test_lifecycle_transitions() {
        use ScanStatus::*;
        assert!(Pending.can_transition_to(Syncing));
        assert!(Syncing.can_transition_to(Confirmed));
        assert!(Syncing.can_transition_to(Pending));
        assert!(Conflicted.can_transition_to(Pending));
        assert!(Failed.can_transition_to(Pending));

        // Only the sync engine moves records out of Pending
        assert!(!Pending.can_transition_to(Confirmed));
        assert!(!Pending.can_transition_to(Failed));
        // Terminal
        for next in ScanStatus::ALL {
            assert!(!Confirmed.can_transition_to(next));
        }
        assert!(!Failed.can_transition_to(Confirmed));
    }

    #[test]
    fn test_symbology_aliases() {
        assert_eq!("ean13".parse::<Symbology>().unwrap(), Symbology::Ean13);
        assert_eq!("EAN-13".parse::<Symbology>().unwrap(), Symbology::Ean13);
        assert_eq!("qr".parse::<Symbology>().unwrap(), Symbology::Qr);
        assert_eq!("qr_code".parse::<Symbology>().unwrap(), Symbology::Qr);
        assert_eq!("Code 128".parse::<Symbology>().unwrap(), Symbology::Code128);
        assert!("aztec-ish".parse::<Symbology>().is_err());
    }

    #[test]
    fn test_fingerprint_ignores_device() {
        let a = payload("3017620422003", "dock-1");
        let b = payload("3017620422003", "dock-2");
        let c = payload("3017620422004", "dock-1");
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);
    }

    #[test]
    fn test_fingerprint_includes_symbology() {
        assert_ne!(
            compute_fingerprint(Some(Symbology::Code128), "ABC"),
            compute_fingerprint(Some(Symbology::Code39), "ABC")
        );
    }

    #[test]
    fn test_new_record_is_pending_with_unique_id() {
        let a = ScanRecord::new(payload("1", "d"));
        let b = ScanRecord::new(payload("1", "d"));
        assert_eq!(a.status, ScanStatus::Pending);
        assert_eq!(a.attempts, 0);
        assert_ne!(a.id, b.id);
    }
}
