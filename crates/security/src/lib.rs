//! Input validation and outbound privacy filtering.
//!
//! Two halves, both deterministic and safe to call from any task:
//!
//! * [`validate`] — pure checks applied to everything that came from a
//!   chat event before it can name a file, become a path, or land in
//!   note frontmatter.
//! * [`privacy`] — the redaction stage every note body passes through
//!   before it leaves the process (to the git vault or to an AI
//!   provider).

pub mod privacy;
pub mod validate;

pub use privacy::{
    FilterOutcome, Masking, PrivacyError, PrivacyFilter, PrivacyLevel, PrivacyRule, RuleMatch,
    SecurityEvent, builtin_rules,
};
pub use validate::{
    ContentScan, ValidationError, validate_filename, validate_frontmatter, validate_path,
};
